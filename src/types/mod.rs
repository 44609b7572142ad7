use std::collections::HashMap;
use std::fmt;
use std::io::{self, Write};
use std::net::IpAddr;

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result as EngineResult};

const MAX_CONTAINER_ID_LEN: usize = 256;

/// Validated container identifier.
///
/// Only used as an entropy source for host-side interface names, so it is
/// normalised: anything that parses as a UUID is rendered in its canonical
/// lowercase hyphenated form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerId(String);

impl ContainerId {
    pub fn parse(raw: &str) -> EngineResult<Self> {
        if raw.is_empty() || raw.len() > MAX_CONTAINER_ID_LEN {
            return Err(Error::config(format!(
                "container ID must be 1-{} characters, got {}",
                MAX_CONTAINER_ID_LEN,
                raw.len()
            )));
        }

        if let Ok(uuid) = Uuid::parse_str(raw) {
            return Ok(Self(uuid.hyphenated().to_string()));
        }

        if let Some(bad) = raw
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        {
            return Err(Error::config(format!(
                "container ID {:?} contains invalid character {:?}",
                raw, bad
            )));
        }

        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// CNI command arguments
#[derive(Debug, Clone)]
pub struct CmdArgs {
    /// Container ID
    pub container_id: ContainerId,
    /// Network namespace path
    pub netns: String,
    /// Interface name
    pub ifname: String,
    /// Arguments
    pub args: HashMap<String, String>,
    /// Path
    pub path: String,
    /// Standard input data
    pub stdin_data: Vec<u8>,
}

/// Result document printed by an IPAM plugin (CNI 0.4.0 / 1.0.0 shape)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Result {
    /// CNI specification version
    #[serde(rename = "cniVersion", default)]
    pub cni_version: String,
    /// Interfaces created
    #[serde(default)]
    pub interfaces: Option<Vec<Interface>>,
    /// IP configurations
    #[serde(default)]
    pub ips: Option<Vec<IPConfig>>,
    /// DNS configuration
    #[serde(default)]
    pub dns: Option<DNS>,
    /// Routes to configure
    #[serde(default)]
    pub routes: Option<Vec<Route>>,
}

/// Interface information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interface {
    pub name: String,
    pub mac: Option<String>,
    pub sandbox: Option<String>,
}

/// IP configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IPConfig {
    /// Interface index this IP is assigned to
    #[serde(default)]
    pub interface: Option<usize>,
    /// IP address with prefix length
    pub address: String,
    #[serde(default)]
    pub gateway: Option<String>,
}

/// DNS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DNS {
    pub nameservers: Option<Vec<String>>,
    pub search: Option<Vec<String>>,
    pub options: Option<Vec<String>>,
}

/// Route configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    /// Destination CIDR
    pub dst: String,
    /// Gateway for this route
    #[serde(default)]
    pub gw: Option<String>,
}

/// Error document a failing CNI plugin prints on stdout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResult {
    #[serde(rename = "cniVersion", default)]
    pub cni_version: String,
    pub code: u32,
    pub msg: String,
    #[serde(default)]
    pub details: String,
}

/// A route to install inside the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteSpec {
    pub dst: IpNetwork,
    pub gw: Option<IpAddr>,
}

/// Address handed out by the IPAM plugin for one attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressAssignment {
    /// Container address with its prefix length
    pub ip: IpNetwork,
    pub gateway: Option<IpAddr>,
    pub routes: Vec<RouteSpec>,
}

impl AddressAssignment {
    pub fn new(ip: IpNetwork) -> Self {
        Self {
            ip,
            gateway: None,
            routes: Vec::new(),
        }
    }

    /// Convert an IPAM result document, taking the first IP entry.
    pub fn from_result(result: Result) -> std::result::Result<Self, String> {
        let ipc = result
            .ips
            .and_then(|ips| ips.into_iter().next())
            .ok_or_else(|| "result contains no IP configuration".to_string())?;

        let ip: IpNetwork = ipc
            .address
            .parse()
            .map_err(|e| format!("invalid address {:?}: {}", ipc.address, e))?;

        let gateway = ipc
            .gateway
            .as_deref()
            .map(|gw| {
                gw.parse::<IpAddr>()
                    .map_err(|e| format!("invalid gateway {:?}: {}", gw, e))
            })
            .transpose()?;

        let routes = result
            .routes
            .unwrap_or_default()
            .into_iter()
            .map(|r| {
                let dst = r
                    .dst
                    .parse::<IpNetwork>()
                    .map_err(|e| format!("invalid route destination {:?}: {}", r.dst, e))?;
                let gw = r
                    .gw
                    .as_deref()
                    .map(|gw| {
                        gw.parse::<IpAddr>()
                            .map_err(|e| format!("invalid route gateway {:?}: {}", gw, e))
                    })
                    .transpose()?;
                Ok(RouteSpec { dst, gw })
            })
            .collect::<std::result::Result<Vec<_>, String>>()?;

        Ok(Self {
            ip,
            gateway,
            routes,
        })
    }
}

/// Interface configuration reported back to the runtime after ADD.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IfConfig {
    pub ip: IpAddr,
}

impl IfConfig {
    /// Print result as JSON
    pub fn print(&self) -> anyhow::Result<()> {
        self.write_to(io::stdout().lock())
    }

    pub fn write_to(&self, mut out: impl Write) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        writeln!(out, "{}", json)?;
        out.flush()?;
        Ok(())
    }
}
