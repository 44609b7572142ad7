use std::net::IpAddr;
use std::path::Path;

use ipnetwork::IpNetwork;
use itertools::Itertools;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use super::{Link, Netlink, NetlinkError};

/// [`Netlink`] implemented on top of the iproute2 `ip` tool.
///
/// Children inherit the namespace of the spawning thread, so commands land
/// in whichever namespace the caller has entered.
#[derive(Debug, Clone)]
pub struct IpRoute2 {
    program: String,
}

impl Default for IpRoute2 {
    fn default() -> Self {
        Self {
            program: "ip".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct LinkJson {
    ifindex: u32,
    ifname: String,
    #[serde(default)]
    flags: Vec<String>,
    #[serde(default)]
    master: Option<String>,
    #[serde(default)]
    linkinfo: Option<LinkInfoJson>,
}

#[derive(Debug, Deserialize)]
struct LinkInfoJson {
    #[serde(default)]
    info_kind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AddrJson {
    #[serde(default)]
    addr_info: Vec<AddrInfoJson>,
}

#[derive(Debug, Deserialize)]
struct AddrInfoJson {
    #[serde(default)]
    family: String,
    #[serde(default)]
    local: Option<IpAddr>,
    #[serde(default)]
    prefixlen: Option<u8>,
}

impl IpRoute2 {
    async fn run(&self, args: &[&str]) -> Result<String, NetlinkError> {
        let command = format!("{} {}", self.program, args.iter().join(" "));
        debug!(%command, "running iproute2");

        let output = Command::new(&self.program)
            .args(args)
            .output()
            .await
            .map_err(|source| NetlinkError::Io {
                command: command.clone(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify(command, stderr.trim()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Map iproute2 diagnostics onto the errors the engine distinguishes.
fn classify(command: String, stderr: &str) -> NetlinkError {
    if stderr.contains("File exists") {
        return NetlinkError::Exists;
    }
    if stderr.contains("Cannot find device") || stderr.contains("does not exist") {
        let device = stderr
            .split('"')
            .nth(1)
            .map(str::to_string)
            .unwrap_or_default();
        return NetlinkError::NoDevice(device);
    }
    NetlinkError::Command {
        command,
        stderr: stderr.to_string(),
    }
}

fn parse_links(command: &str, stdout: &str) -> Result<Vec<Link>, NetlinkError> {
    let links: Vec<LinkJson> = serde_json::from_str(stdout).map_err(|e| NetlinkError::Parse {
        command: command.to_string(),
        reason: e.to_string(),
    })?;

    Ok(links
        .into_iter()
        .map(|l| Link {
            index: l.ifindex,
            up: l.flags.iter().any(|f| f == "UP"),
            name: l.ifname,
            kind: l.linkinfo.and_then(|i| i.info_kind),
            master: l.master,
        })
        .collect())
}

fn parse_addrs(command: &str, stdout: &str) -> Result<Vec<IpNetwork>, NetlinkError> {
    let parse_err = |reason: String| NetlinkError::Parse {
        command: command.to_string(),
        reason,
    };

    let entries: Vec<AddrJson> =
        serde_json::from_str(stdout).map_err(|e| parse_err(e.to_string()))?;

    entries
        .into_iter()
        .flat_map(|e| e.addr_info)
        .filter(|a| a.family == "inet" || a.family == "inet6")
        .map(|a| match (a.local, a.prefixlen) {
            (Some(ip), Some(prefix)) => {
                IpNetwork::new(ip, prefix).map_err(|e| parse_err(e.to_string()))
            }
            _ => Err(parse_err("address entry without local/prefixlen".to_string())),
        })
        .collect()
}

impl Netlink for IpRoute2 {
    async fn link(&self, name: &str) -> Result<Option<Link>, NetlinkError> {
        let args = ["-j", "-d", "link", "show", "dev", name];
        match self.run(&args).await {
            Ok(stdout) => Ok(parse_links("ip link show", &stdout)?.into_iter().next()),
            Err(NetlinkError::NoDevice(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn add_bridge(&self, name: &str) -> Result<(), NetlinkError> {
        self.run(&["link", "add", "name", name, "type", "bridge"])
            .await
            .map(drop)
    }

    async fn set_up(&self, name: &str) -> Result<(), NetlinkError> {
        self.run(&["link", "set", "dev", name, "up"]).await.map(drop)
    }

    async fn set_master(&self, name: &str, master: &str) -> Result<(), NetlinkError> {
        self.run(&["link", "set", "dev", name, "master", master])
            .await
            .map(drop)
    }

    async fn addrs(&self, name: &str) -> Result<Vec<IpNetwork>, NetlinkError> {
        let stdout = self.run(&["-j", "addr", "show", "dev", name]).await?;
        parse_addrs("ip addr show", &stdout)
    }

    async fn add_addr(&self, name: &str, addr: IpNetwork) -> Result<(), NetlinkError> {
        let cidr = addr.to_string();
        self.run(&["addr", "add", &cidr, "dev", name]).await.map(drop)
    }

    async fn add_veth(
        &self,
        name: &str,
        peer: &str,
        mtu: Option<u32>,
    ) -> Result<(), NetlinkError> {
        let mtu = mtu.map(|m| m.to_string());
        let mut args = vec!["link", "add", "name", name];
        if let Some(m) = &mtu {
            args.extend(["mtu", m.as_str()]);
        }
        args.extend(["type", "veth", "peer", "name", peer]);
        if let Some(m) = &mtu {
            args.extend(["mtu", m.as_str()]);
        }
        self.run(&args).await.map(drop)
    }

    async fn set_netns(&self, name: &str, netns: &Path) -> Result<(), NetlinkError> {
        let netns = netns.to_string_lossy();
        self.run(&["link", "set", "dev", name, "netns", &netns])
            .await
            .map(drop)
    }

    async fn add_route(
        &self,
        dst: IpNetwork,
        gw: Option<IpAddr>,
        dev: &str,
    ) -> Result<(), NetlinkError> {
        let dst = dst.to_string();
        let gw = gw.map(|g| g.to_string());
        let mut args = vec!["route", "add", dst.as_str()];
        if let Some(gw) = &gw {
            args.extend(["via", gw.as_str()]);
        }
        args.extend(["dev", dev]);
        self.run(&args).await.map(drop)
    }

    async fn del_link(&self, name: &str) -> Result<(), NetlinkError> {
        self.run(&["link", "del", "dev", name]).await.map(drop)
    }
}
