// Firecracker Process Registry
//
// Remembers which pid was launched for which API socket so that `stop` from a
// later invocation can find the VM without scraping the process table. The
// registry is a small JSON map in `<state_dir>/registry.json`, written on
// start and pruned on clean exit or stop. Writes go through
// `state_dir::write_private`, so the file is replaced atomically and never
// written through a planted symlink.

use crate::error::{LifecycleError, Result};
use crate::vm::state_dir;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const REGISTRY_FILE: &str = "registry.json";

/// One launched VM
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    /// API socket the VM was bound to
    pub socket_path: PathBuf,

    pub pid: u32,

    /// Config file handed to Firecracker
    pub config_file: PathBuf,

    pub started_at: DateTime<Utc>,
}

impl RegistryEntry {
    pub fn new(socket_path: &Path, pid: u32, config_file: &Path) -> Self {
        Self {
            socket_path: socket_path.to_path_buf(),
            pid,
            config_file: config_file.to_path_buf(),
            started_at: Utc::now(),
        }
    }
}

/// Persisted map of API socket path to VM process
#[derive(Debug, Clone)]
pub struct ProcessRegistry {
    dir: PathBuf,
    path: PathBuf,
}

impl ProcessRegistry {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            dir: state_dir.to_path_buf(),
            path: state_dir.join(REGISTRY_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record the VM bound to `entry.socket_path`, replacing any older entry
    pub fn record(&self, entry: RegistryEntry) -> Result<()> {
        let mut entries = self.read_all();
        debug!(
            "Registering Firecracker PID {} for {:?}",
            entry.pid, entry.socket_path
        );
        entries.insert(key(&entry.socket_path), entry);
        self.write_all(&entries)
    }

    /// Entry for a socket, if one was recorded
    pub fn lookup(&self, socket_path: &Path) -> Option<RegistryEntry> {
        self.read_all().remove(&key(socket_path))
    }

    /// Drop the entry for a socket, returning it
    pub fn remove(&self, socket_path: &Path) -> Result<Option<RegistryEntry>> {
        let mut entries = self.read_all();
        let removed = entries.remove(&key(socket_path));
        if removed.is_some() {
            self.write_all(&entries)?;
        }
        Ok(removed)
    }

    /// Read every entry
    ///
    /// A missing or unreadable registry counts as empty so that teardown
    /// can still fall back to the process scan.
    fn read_all(&self) -> BTreeMap<String, RegistryEntry> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(_) => return BTreeMap::new(),
        };

        match serde_json::from_str(&content) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Ignoring unreadable registry {:?}: {}", self.path, e);
                BTreeMap::new()
            }
        }
    }

    fn write_all(&self, entries: &BTreeMap<String, RegistryEntry>) -> Result<()> {
        let json = serde_json::to_string_pretty(entries).map_err(|e| LifecycleError::Registry {
            path: self.path.clone(),
            message: e.to_string(),
        })?;
        state_dir::write_private(&self.dir, &self.path, json.as_bytes())
    }
}

fn key(socket_path: &Path) -> String {
    socket_path.to_string_lossy().into_owned()
}
