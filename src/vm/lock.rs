// Host Network Lock
//
// The FIRECRACKER-NAT and FIRECRACKER-FORWARD chains, the POSTROUTING and
// FORWARD jumps into them and the forwarding flag are shared by every fcctl
// instance on the host, whatever TAP it uses. Network setup and cleanup
// therefore take one exclusive, non-blocking flock on
// `<state_dir>/firecracker-network.lock`, so a concurrent invocation fails
// fast instead of interleaving iptables edits. The lock is released when the
// guard drops or the process exits.

use crate::error::{LifecycleError, Result};
use crate::vm::state_dir;
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Lock guarding the host-wide firewall chains
pub const NETWORK_LOCK: &str = "firecracker-network";

/// Exclusive advisory lock guard
#[derive(Debug)]
pub struct HostLock {
    _lock: Flock<File>,
    path: PathBuf,
}

impl HostLock {
    /// Take the lock for `name`, failing immediately if it is held
    pub fn acquire(state_dir: &Path, name: &str) -> Result<Self> {
        state_dir::ensure(state_dir)?;
        let path = state_dir.join(format!("{}.lock", name));

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .mode(0o600)
            .custom_flags(nix::libc::O_NOFOLLOW)
            .open(&path)?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => {
                debug!("Acquired host lock {:?}", path);
                Ok(Self { _lock: lock, path })
            }
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => Err(LifecycleError::Lock(path)),
            Err((_, errno)) => Err(LifecycleError::Io(errno.into())),
        }
    }

    /// Take the lock shared by all network setup and cleanup
    pub fn network(state_dir: &Path) -> Result<Self> {
        Self::acquire(state_dir, NETWORK_LOCK)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for HostLock {
    fn drop(&mut self) {
        debug!("Released host lock {:?}", self.path);
    }
}
