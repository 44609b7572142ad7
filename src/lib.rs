//! Container network attachment plugins.
//!
//! This crate wires a container's network namespace into host networking:
//! - Creates a veth pair inside the container namespace
//! - Moves the host end back out to the host namespace
//! - Either enslaves the host end to a shared bridge, or gives it a
//!   point-to-point address and a host route to the container
//! - Delegates address assignment to an external IPAM plugin
//!
//! The `bridge` and `veth` binaries are thin wrappers around [`run_cni`].

pub mod commands;
pub mod config;
pub mod error;
pub mod ipam;
pub mod netlink;
pub mod netns;
pub mod plugin;
pub mod types;

// Re-export commonly used items
pub use commands::{cmd_add, cmd_del, run_cni, PluginKind, Verb};
pub use config::NetConf;
pub use error::{Error, Result};
pub use plugin::{NetPlugin, Topology};
