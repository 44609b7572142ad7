use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::netlink::NetlinkError;

/// Errors produced while attaching or detaching a container.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or missing configuration. Raised before any kernel mutation.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The address-management plugin could not be run or gave no usable answer.
    #[error("IPAM plugin {plugin:?} failed: {reason}")]
    Delegate { plugin: String, reason: String },

    /// A host network object exists in a state incompatible with the request.
    #[error("{0}")]
    Conflict(String),

    /// A kernel networking operation failed.
    #[error("{op}: {source}")]
    Kernel {
        op: String,
        #[source]
        source: NetlinkError,
    },

    /// Entering a network namespace failed.
    #[error("network namespace {}: {source}", .path.display())]
    Namespace {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl Error {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub(crate) fn delegate(plugin: &str, reason: impl Into<String>) -> Self {
        Error::Delegate {
            plugin: plugin.to_string(),
            reason: reason.into(),
        }
    }

    /// Wraps a kernel failure with the step that produced it.
    pub fn kernel(op: impl Into<String>, source: NetlinkError) -> Self {
        Error::Kernel {
            op: op.into(),
            source,
        }
    }

    /// True when `target` could not be entered because its path is gone.
    /// Failures on any other namespace path, such as the caller's own, do
    /// not count.
    pub fn is_missing_namespace(&self, target: &Path) -> bool {
        matches!(
            self,
            Error::Namespace { path, source }
                if path == target && source.kind() == io::ErrorKind::NotFound
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
