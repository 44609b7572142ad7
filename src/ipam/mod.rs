//! Address assignment through an external IPAM plugin.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use itertools::Itertools;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::NetConf;
use crate::error::{Error, Result};
use crate::types::{AddressAssignment, CmdArgs, ErrorResult, Result as CniResult};

/// Default plugin search path when `CNI_PATH` is empty.
pub const DEFAULT_CNI_PATH: &str = "/opt/cni/bin";

/// Hands out addresses for a new attachment.
#[allow(async_fn_in_trait)]
pub trait AddressDelegate {
    async fn assign(&self, conf: &NetConf) -> Result<AddressAssignment>;
}

/// Runs the configured IPAM plugin as a subprocess.
///
/// The plugin gets the same CNI environment this plugin was invoked with
/// and the raw network descriptor on stdin, and prints a CNI result.
#[derive(Debug, Clone)]
pub struct ExecDelegate {
    args: CmdArgs,
}

impl ExecDelegate {
    pub fn new(args: CmdArgs) -> Self {
        Self { args }
    }

    /// The plugin search path actually in effect.
    pub fn search_path(&self) -> &str {
        if self.args.path.is_empty() {
            DEFAULT_CNI_PATH
        } else {
            self.args.path.as_str()
        }
    }

    fn search_dirs(&self) -> Vec<PathBuf> {
        std::env::split_paths(self.search_path()).collect()
    }

    /// Locate `plugin` in the search path.
    pub fn find_plugin(&self, plugin: &str) -> Result<PathBuf> {
        if plugin.contains('/') || plugin == "." || plugin == ".." {
            return Err(Error::delegate(plugin, "plugin type must be a bare name"));
        }

        let dirs = self.search_dirs();
        dirs.iter()
            .map(|dir| dir.join(plugin))
            .find(|candidate| is_executable(candidate))
            .ok_or_else(|| {
                Error::delegate(
                    plugin,
                    format!(
                        "not found in {}",
                        dirs.iter().map(|d| d.display()).join(":")
                    ),
                )
            })
    }

    fn cni_args(&self) -> String {
        self.args
            .args
            .iter()
            .sorted()
            .map(|(k, v)| format!("{}={}", k, v))
            .join(";")
    }
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

impl AddressDelegate for ExecDelegate {
    async fn assign(&self, conf: &NetConf) -> Result<AddressAssignment> {
        let plugin = conf.ipam.ipam_type.as_str();
        let exe = self.find_plugin(plugin)?;
        info!(plugin, path = %exe.display(), "running IPAM plugin");

        let mut child = Command::new(&exe)
            .env("CNI_COMMAND", "ADD")
            .env("CNI_CONTAINERID", self.args.container_id.as_str())
            .env("CNI_NETNS", &self.args.netns)
            .env("CNI_IFNAME", &self.args.ifname)
            .env("CNI_PATH", self.search_path())
            .env("CNI_ARGS", self.cni_args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::delegate(plugin, format!("failed to execute: {}", e)))?;

        // Plugins that read their config elsewhere may exit without
        // draining stdin; their exit status and output still decide.
        if let Some(mut stdin) = child.stdin.take() {
            match stdin.write_all(&self.args.stdin_data).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                    debug!(plugin, "IPAM plugin closed stdin early");
                }
                Err(e) => {
                    return Err(Error::delegate(
                        plugin,
                        format!("failed to write config: {}", e),
                    ))
                }
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| Error::delegate(plugin, format!("failed to wait: {}", e)))?;

        if !output.status.success() {
            return Err(Error::delegate(
                plugin,
                failure_reason(output.status, &output.stdout, &output.stderr),
            ));
        }

        parse_response(plugin, &output.stdout)
    }
}

fn failure_reason(status: std::process::ExitStatus, stdout: &[u8], stderr: &[u8]) -> String {
    if let Ok(err) = serde_json::from_slice::<ErrorResult>(stdout) {
        return format!("{} (code {})", err.msg, err.code);
    }
    let stderr = String::from_utf8_lossy(stderr);
    let stderr = stderr.trim();
    if stderr.is_empty() {
        status.to_string()
    } else {
        format!("{}: {}", status, stderr)
    }
}

/// Parse the stdout of a successful IPAM run.
pub fn parse_response(plugin: &str, stdout: &[u8]) -> Result<AddressAssignment> {
    let result: CniResult = serde_json::from_slice(stdout)
        .map_err(|e| Error::delegate(plugin, format!("unparseable response: {}", e)))?;
    let assignment = AddressAssignment::from_result(result).map_err(|e| Error::delegate(plugin, e))?;
    debug!(plugin, ip = %assignment.ip, "IPAM assigned address");
    Ok(assignment)
}
