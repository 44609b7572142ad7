//! Scoped network namespace switching.
//!
//! Namespace membership belongs to a kernel thread, not to the process.
//! Callers must run everything between [`Namespaces::enter`] and the guard's
//! drop on the thread that entered; the dispatcher guarantees this by
//! driving all work from a current-thread tokio runtime.

use std::fs::File;
use std::future::Future;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use nix::sched::{setns, CloneFlags};
use tracing::{debug, error};

use crate::error::{Error, Result};

/// The calling thread's own namespace. `/proc/self` would name the
/// thread-group leader's instead.
const THREAD_NETNS: &str = "/proc/thread-self/ns/net";

/// Something that can move the calling thread into another namespace.
pub trait Namespaces {
    type Guard: NamespaceGuard;

    /// Switch into `target`. Dropping the guard switches back.
    fn enter(&self, target: &Path) -> Result<Self::Guard>;
}

pub trait NamespaceGuard {
    /// Path naming the namespace that was current before entry. Only valid
    /// while the guard is alive.
    fn origin(&self) -> PathBuf;
}

/// [`Namespaces`] backed by `setns(2)` on the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadNetns;

/// Restores the original namespace when dropped.
#[derive(Debug)]
pub struct NetnsGuard {
    origin: File,
    target: PathBuf,
}

impl Namespaces for ThreadNetns {
    type Guard = NetnsGuard;

    fn enter(&self, target: &Path) -> Result<NetnsGuard> {
        let ns_err = |path: &Path, source: io::Error| Error::Namespace {
            path: path.to_path_buf(),
            source,
        };

        let origin = File::open(THREAD_NETNS).map_err(|e| ns_err(Path::new(THREAD_NETNS), e))?;
        let netns = File::open(target).map_err(|e| ns_err(target, e))?;

        setns(netns.as_raw_fd(), CloneFlags::CLONE_NEWNET)
            .map_err(|errno| ns_err(target, io::Error::from(errno)))?;

        debug!(netns = %target.display(), "entered network namespace");

        Ok(NetnsGuard {
            origin,
            target: target.to_path_buf(),
        })
    }
}

impl NamespaceGuard for NetnsGuard {
    fn origin(&self) -> PathBuf {
        // Child processes cannot see our descriptors (O_CLOEXEC), but they
        // can reach them through our /proc entry.
        PathBuf::from(format!(
            "/proc/{}/fd/{}",
            std::process::id(),
            self.origin.as_raw_fd()
        ))
    }
}

impl Drop for NetnsGuard {
    fn drop(&mut self) {
        if let Err(errno) = setns(self.origin.as_raw_fd(), CloneFlags::CLONE_NEWNET) {
            // Anything run after this point would hit the wrong namespace.
            error!(
                netns = %self.target.display(),
                error = %errno,
                "failed to restore original network namespace, aborting"
            );
            std::process::abort();
        }
        debug!(netns = %self.target.display(), "left network namespace");
    }
}

/// Run `f` inside `target`, restoring the original namespace afterwards
/// whether or not `f` succeeds. `f` receives the origin path so it can
/// move links back out.
pub async fn with_netns<S, F, Fut, T>(namespaces: &S, target: &Path, f: F) -> Result<T>
where
    S: Namespaces,
    F: FnOnce(PathBuf) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let guard = namespaces.enter(target)?;
    let result = f(guard.origin()).await;
    drop(guard);
    result
}

/// Identity (device, inode) of the calling thread's network namespace.
pub fn current_netns_id() -> io::Result<(u64, u64)> {
    let meta = std::fs::metadata(THREAD_NETNS)?;
    Ok((meta.dev(), meta.ino()))
}
