//! Kernel link, address and route primitives.
//!
//! Every method acts on the network namespace of the calling thread at the
//! time it is invoked.

use std::net::IpAddr;
use std::path::Path;

use ipnetwork::IpNetwork;
use thiserror::Error;

mod iproute2;

pub use iproute2::IpRoute2;

/// Failures reported by the kernel interface.
#[derive(Debug, Error)]
pub enum NetlinkError {
    /// The object being created already exists (EEXIST).
    #[error("object already exists")]
    Exists,

    /// The named device does not exist in the current namespace.
    #[error("device {0:?} does not exist")]
    NoDevice(String),

    #[error("`{command}` failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("failed to run `{command}`: {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unexpected output from `{command}`: {reason}")]
    Parse { command: String, reason: String },
}

/// A network device as seen from the current namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub index: u32,
    pub name: String,
    /// Link type, e.g. `bridge` or `veth`. `None` for plain devices.
    pub kind: Option<String>,
    pub master: Option<String>,
    pub up: bool,
}

impl Link {
    pub fn is_bridge(&self) -> bool {
        self.kind.as_deref() == Some("bridge")
    }
}

/// Kernel networking operations used by the attachment engine.
#[allow(async_fn_in_trait)]
pub trait Netlink {
    /// Look up a link by name; `Ok(None)` when it does not exist.
    async fn link(&self, name: &str) -> Result<Option<Link>, NetlinkError>;

    async fn add_bridge(&self, name: &str) -> Result<(), NetlinkError>;

    async fn set_up(&self, name: &str) -> Result<(), NetlinkError>;

    async fn set_master(&self, name: &str, master: &str) -> Result<(), NetlinkError>;

    /// Addresses currently assigned to `name`, all families.
    async fn addrs(&self, name: &str) -> Result<Vec<IpNetwork>, NetlinkError>;

    async fn add_addr(&self, name: &str, addr: IpNetwork) -> Result<(), NetlinkError>;

    /// Create a veth pair `name` <-> `peer` in the current namespace.
    async fn add_veth(&self, name: &str, peer: &str, mtu: Option<u32>)
        -> Result<(), NetlinkError>;

    /// Move `name` into the namespace referred to by `netns`.
    async fn set_netns(&self, name: &str, netns: &Path) -> Result<(), NetlinkError>;

    async fn add_route(
        &self,
        dst: IpNetwork,
        gw: Option<IpAddr>,
        dev: &str,
    ) -> Result<(), NetlinkError>;

    /// Delete a link. Deleting one end of a veth pair removes both.
    async fn del_link(&self, name: &str) -> Result<(), NetlinkError>;
}
