use std::collections::HashMap;
use std::env;
use std::io::{self, Read};
use std::str::FromStr;

use tokio::runtime::Builder;

use crate::config::{validate_ifname, NetConf};
use crate::error::{Error, Result};
use crate::ipam::ExecDelegate;
use crate::netlink::IpRoute2;
use crate::netns::ThreadNetns;
use crate::plugin::{NetPlugin, Topology};
use crate::types::{CmdArgs, ContainerId};

/// Which plugin binary is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginKind {
    Bridge,
    Veth,
}

/// Command verbs understood by the plugins. Anything else fails closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Add,
    Del,
}

impl FromStr for Verb {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ADD" => Ok(Verb::Add),
            "DEL" => Ok(Verb::Del),
            other => Err(Error::config(format!("unknown CNI_COMMAND: {:?}", other))),
        }
    }
}

fn required(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<String> {
    lookup(key)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::config(format!("{} not found in environment", key)))
}

/// Build command arguments from an environment lookup and stdin bytes
pub fn parse_args_from(
    lookup: impl Fn(&str) -> Option<String>,
    stdin_data: Vec<u8>,
) -> Result<CmdArgs> {
    let container_id = required(&lookup, "CNI_CONTAINERID")?;
    let netns = required(&lookup, "CNI_NETNS")?;
    let ifname = required(&lookup, "CNI_IFNAME")?;

    let container_id = ContainerId::parse(&container_id)?;
    validate_ifname("CNI_IFNAME", &ifname)?;

    if stdin_data.iter().all(u8::is_ascii_whitespace) {
        return Err(Error::config("network configuration missing on stdin"));
    }

    let path = lookup("CNI_PATH").unwrap_or_default();
    let args = parse_cni_args(&lookup("CNI_ARGS").unwrap_or_default());

    Ok(CmdArgs {
        container_id,
        netns,
        ifname,
        args,
        path,
        stdin_data,
    })
}

/// Parse command arguments from environment
pub fn parse_args() -> Result<CmdArgs> {
    let mut stdin_data = Vec::new();
    io::stdin()
        .read_to_end(&mut stdin_data)
        .map_err(|e| Error::config(format!("failed to read from stdin: {}", e)))?;

    parse_args_from(|key| env::var(key).ok(), stdin_data)
}

/// Parse CNI_ARGS string into key-value pairs
fn parse_cni_args(args_str: &str) -> HashMap<String, String> {
    args_str
        .split(';')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn topology(kind: PluginKind, conf: &NetConf) -> Topology {
    match kind {
        PluginKind::Bridge => Topology::Bridge {
            name: conf.bridge_name().to_string(),
        },
        PluginKind::Veth => Topology::PointToPoint,
    }
}

fn plugin(
    kind: PluginKind,
    args: CmdArgs,
) -> Result<NetPlugin<IpRoute2, ThreadNetns, ExecDelegate>> {
    let conf = NetConf::parse(&args.stdin_data)?;
    let topology = topology(kind, &conf);
    let ipam = ExecDelegate::new(args.clone());
    Ok(NetPlugin::new(
        conf,
        args,
        topology,
        IpRoute2::default(),
        ThreadNetns,
        ipam,
    ))
}

/// Namespace membership is per kernel thread, so everything runs on this
/// thread under a current-thread runtime; work is never migrated.
fn block_on<F: std::future::Future>(fut: F) -> Result<F::Output> {
    let runtime = Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::config(format!("failed to create tokio runtime: {}", e)))?;
    Ok(runtime.block_on(fut))
}

/// Execute the add command
pub fn cmd_add(kind: PluginKind, args: CmdArgs) -> Result<()> {
    let plugin = plugin(kind, args)?;
    let ifconfig = block_on(plugin.add_network())??;

    ifconfig
        .print()
        .map_err(|e| Error::config(format!("failed to write result: {}", e)))
}

/// Execute the delete command
pub fn cmd_del(kind: PluginKind, args: CmdArgs) -> Result<()> {
    let plugin = plugin(kind, args)?;
    block_on(plugin.del_network())?
}

/// Main entry point for the CNI plugin
pub fn run_cni(kind: PluginKind) -> Result<()> {
    let verb: Verb = required(&|key: &str| env::var(key).ok(), "CNI_COMMAND")?.parse()?;
    let args = parse_args()?;

    match verb {
        Verb::Add => cmd_add(kind, args),
        Verb::Del => cmd_del(kind, args),
    }
}
