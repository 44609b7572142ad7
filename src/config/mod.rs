use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Bridge used when the descriptor does not name one.
pub const DEFAULT_BRIDGE_NAME: &str = "rkt0";

/// Longest interface name the kernel accepts (IFNAMSIZ minus the NUL).
pub const MAX_IFNAME_LEN: usize = 15;

fn default_cni_version() -> String {
    "0.4.0".to_string()
}

/// Network configuration shared by the bridge and veth plugins
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetConf {
    /// CNI specification version
    #[serde(rename = "cniVersion", default = "default_cni_version")]
    pub cni_version: String,
    /// Name of the network
    pub name: String,
    /// Type of CNI plugin
    #[serde(rename = "type")]
    pub plugin_type: String,
    /// Bridge to attach host veth ends to (bridge plugin only)
    #[serde(rename = "brName", default, skip_serializing_if = "Option::is_none")]
    pub br_name: Option<String>,
    /// Whether this host is the network's default gateway
    #[serde(rename = "isGW", default)]
    pub is_gw: bool,
    /// Interface MTU
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
    /// IPAM configuration
    pub ipam: IPAMConfig,
}

/// IPAM (IP Address Management) configuration
///
/// Only the plugin type is interpreted here; everything else is for the
/// plugin itself, which receives the whole descriptor on stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IPAMConfig {
    /// Type of IPAM plugin
    #[serde(rename = "type")]
    pub ipam_type: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl NetConf {
    /// Parse NetConf from bytes
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let conf: NetConf = serde_json::from_slice(bytes)
            .map_err(|e| Error::config(format!("failed to parse network configuration: {}", e)))?;

        if conf.name.is_empty() {
            return Err(Error::config("network name is required"));
        }

        if conf.ipam.ipam_type.is_empty() {
            return Err(Error::config("IPAM plugin type is required"));
        }

        if let Some(br) = &conf.br_name {
            validate_ifname("brName", br)?;
        }

        if conf.mtu == Some(0) {
            return Err(Error::config("mtu must be greater than zero"));
        }

        Ok(conf)
    }

    /// Bridge name, falling back to [`DEFAULT_BRIDGE_NAME`]
    pub fn bridge_name(&self) -> &str {
        self.br_name.as_deref().unwrap_or(DEFAULT_BRIDGE_NAME)
    }
}

/// Check that `name` is usable as a kernel interface name.
pub fn validate_ifname(field: &str, name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_IFNAME_LEN {
        return Err(Error::config(format!(
            "{} {:?} must be 1-{} bytes long",
            field, name, MAX_IFNAME_LEN
        )));
    }
    if name == "." || name == ".." || name.contains(|c: char| c == '/' || c.is_whitespace()) {
        return Err(Error::config(format!(
            "{} {:?} is not a valid interface name",
            field, name
        )));
    }
    Ok(())
}
