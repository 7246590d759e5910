// Firecracker VM Configuration File
//
// The VM config is owned by the caller and only checked for being valid JSON.
// The single field this crate touches is `network-interfaces[*].host_dev_name`,
// and only in memory: a config written for the default TAP is retargeted to
// the runtime TAP before launch.

use crate::error::{LifecycleError, Result};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

/// Key of the network interface list in a Firecracker config
const NETWORK_INTERFACES_KEY: &str = "network-interfaces";

/// Key of the host TAP name inside one network interface entry
const HOST_DEV_NAME_KEY: &str = "host_dev_name";

/// A parsed Firecracker configuration file
#[derive(Debug, Clone)]
pub struct VmConfigFile {
    path: PathBuf,
    document: Value,
    patched: bool,
}

impl VmConfigFile {
    /// Read and parse a config file
    ///
    /// Fails with [`LifecycleError::Config`] if the file is missing or is not
    /// valid JSON.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(LifecycleError::config(format!(
                "Config file {} not found",
                path.display()
            )));
        }

        let content = fs::read_to_string(path).map_err(|e| {
            LifecycleError::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let document: Value = serde_json::from_str(&content).map_err(|e| {
            LifecycleError::config(format!("Invalid JSON in config file {}: {}", path.display(), e))
        })?;

        Ok(Self {
            path: path.to_path_buf(),
            document,
            patched: false,
        })
    }

    /// Path the config was read from
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The (possibly patched) JSON document
    pub fn document(&self) -> &Value {
        &self.document
    }

    /// Whether the in-memory document differs from the file on disk
    pub fn is_patched(&self) -> bool {
        self.patched
    }

    /// Host TAP names referenced by the network interface entries
    pub fn host_dev_names(&self) -> Vec<&str> {
        self.document
            .get(NETWORK_INTERFACES_KEY)
            .and_then(Value::as_array)
            .map(|ifaces| {
                ifaces
                    .iter()
                    .filter_map(|iface| iface.get(HOST_DEV_NAME_KEY).and_then(Value::as_str))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Rebind interfaces from TAP `from` to TAP `to`
    ///
    /// Returns the number of entries rewritten. A no-op when the names match.
    pub fn retarget_tap(&mut self, from: &str, to: &str) -> usize {
        if from == to {
            return 0;
        }

        let Some(ifaces) = self
            .document
            .get_mut(NETWORK_INTERFACES_KEY)
            .and_then(Value::as_array_mut)
        else {
            return 0;
        };

        let mut rewritten = 0;
        for iface in ifaces.iter_mut() {
            if let Some(name) = iface.get_mut(HOST_DEV_NAME_KEY) {
                if name.as_str() == Some(from) {
                    *name = Value::String(to.to_string());
                    rewritten += 1;
                }
            }
        }

        if rewritten > 0 {
            tracing::info!(
                "Retargeted {} network interface(s) from {} to {} (in memory only)",
                rewritten,
                from,
                to
            );
            self.patched = true;
        }
        rewritten
    }

    /// Serialize the document for handing to Firecracker
    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.document)
            .map_err(|e| LifecycleError::config(format!("Failed to serialize config: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = r#"{
        "boot-source": {
            "kernel_image_path": "vmlinux",
            "boot_args": "console=ttyS0 reboot=k panic=1 pci=off"
        },
        "machine-config": { "vcpu_count": 2, "mem_size_mib": 1024 },
        "network-interfaces": [
            { "iface_id": "eth0", "guest_mac": "AA:FC:00:00:00:01", "host_dev_name": "tap0" },
            { "iface_id": "eth1", "host_dev_name": "tap-other" }
        ]
    }"#;

    fn write_config(content: &str) -> NamedTempFile {
        let file = NamedTempFile::new().unwrap();
        fs::write(file.path(), content).unwrap();
        file
    }

    #[test]
    fn test_load_valid_config() {
        let file = write_config(SAMPLE);
        let config = VmConfigFile::load(file.path()).unwrap();
        assert_eq!(config.path(), file.path());
        assert_eq!(config.host_dev_names(), vec!["tap0", "tap-other"]);
        assert!(!config.is_patched());
    }

    #[test]
    fn test_load_missing_file() {
        let err = VmConfigFile::load("/nonexistent/vm-config.json").unwrap_err();
        assert!(matches!(err, LifecycleError::Config(_)));
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_load_invalid_json() {
        let file = write_config("{ \"boot-source\": ");
        let err = VmConfigFile::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("Invalid JSON"));
    }

    #[test]
    fn test_retarget_only_default_tap() {
        let file = write_config(SAMPLE);
        let mut config = VmConfigFile::load(file.path()).unwrap();

        assert_eq!(config.retarget_tap("tap0", "fc-tap3"), 1);
        assert!(config.is_patched());
        assert_eq!(config.host_dev_names(), vec!["fc-tap3", "tap-other"]);

        // The file on disk is untouched
        assert_eq!(fs::read_to_string(file.path()).unwrap(), SAMPLE);
    }

    #[test]
    fn test_retarget_same_name_is_noop() {
        let file = write_config(SAMPLE);
        let mut config = VmConfigFile::load(file.path()).unwrap();
        assert_eq!(config.retarget_tap("tap0", "tap0"), 0);
        assert!(!config.is_patched());
    }

    #[test]
    fn test_retarget_without_interfaces() {
        let file = write_config(r#"{ "machine-config": { "vcpu_count": 1 } }"#);
        let mut config = VmConfigFile::load(file.path()).unwrap();
        assert_eq!(config.retarget_tap("tap0", "tap1"), 0);
        assert!(config.host_dev_names().is_empty());
    }

    #[test]
    fn test_serialized_document_is_valid_json() {
        let file = write_config(SAMPLE);
        let mut config = VmConfigFile::load(file.path()).unwrap();
        config.retarget_tap("tap0", "tap5");

        let json = config.to_json_pretty().unwrap();
        let reparsed: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(reparsed["network-interfaces"][0]["host_dev_name"], "tap5");
        assert_eq!(reparsed["machine-config"]["mem_size_mib"], 1024);
    }
}
