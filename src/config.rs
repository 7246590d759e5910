// Runtime Configuration
//
// Runtime settings for one fcctl invocation. Values are layered:
// built-in defaults, then the TOML file (~/.config/fcctl/config.toml or
// --config), then FCCTL_* environment variables, then command-line flags.
// The result is frozen before any lifecycle step runs.

use crate::error::{LifecycleError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default TAP device name; VM config files written for it get patched
pub const DEFAULT_TAP_NAME: &str = "tap0";

/// Default Firecracker API socket path
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/firecracker.socket";

/// Default state directory; root-owned tmpfs, unlike the shared /tmp
pub const DEFAULT_STATE_DIR: &str = "/run/fcctl";

/// Linux IFNAMSIZ minus the trailing NUL
const MAX_IFNAME_LEN: usize = 15;

/// Runtime configuration for the lifecycle commands
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Control channel (named pipe) path handed to Firecracker as --api-sock
    pub socket_path: PathBuf,

    /// Host TAP interface name
    pub tap_name: String,

    /// Host-side address of the TAP interface
    pub host_ip: Ipv4Addr,

    /// Prefix length of the TAP subnet
    pub prefix_len: u8,

    /// Static address assigned inside the guest
    pub guest_ip: Ipv4Addr,

    /// Firecracker executable (name on PATH or absolute path)
    pub firecracker_bin: PathBuf,

    /// Private (0700, owner-only) directory for the process registry, the
    /// network lock and retargeted VM configs
    pub state_dir: PathBuf,

    /// Time to wait after spawning before the liveness check
    pub settle_delay_ms: u64,

    /// Time a stopping VM gets between SIGTERM and SIGKILL
    pub grace_period_secs: u64,

    /// Echo every host command before running it
    pub verbose: bool,

    /// Report host commands instead of running them
    pub dry_run: bool,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            tap_name: DEFAULT_TAP_NAME.to_string(),
            host_ip: Ipv4Addr::new(192, 168, 1, 1),
            prefix_len: 24,
            guest_ip: Ipv4Addr::new(192, 168, 1, 2),
            firecracker_bin: PathBuf::from("firecracker"),
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            settle_delay_ms: 1000,
            grace_period_secs: 5,
            verbose: false,
            dry_run: false,
            logging: LoggingConfig::default(),
        }
    }
}

/// Command-line overrides, applied last
///
/// `None` leaves the lower layer's value untouched.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub socket_path: Option<PathBuf>,
    pub tap_name: Option<String>,
    pub host_ip: Option<Ipv4Addr>,
    pub prefix_len: Option<u8>,
    pub guest_ip: Option<Ipv4Addr>,
    pub firecracker_bin: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
    pub verbose: bool,
    pub dry_run: bool,
}

impl RuntimeConfig {
    /// Build the configuration for one invocation
    ///
    /// Reads `path` if given, otherwise the default config location. A missing
    /// file is not an error; a malformed one is.
    pub fn resolve(path: Option<&Path>, overrides: Overrides) -> Result<Self> {
        let config = match path {
            Some(p) => Self::load_from_path(p)?,
            None => Self::load_from_path(Self::config_path())?,
        };

        let config = config.apply_env_overrides().apply_overrides(overrides);
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific TOML file
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).map_err(|e| {
            LifecycleError::config(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        let config: RuntimeConfig = toml::from_str(&content).map_err(|e| {
            LifecycleError::config(format!("Failed to parse config file {:?}: {}", path, e))
        })?;

        tracing::debug!("Loaded runtime configuration from {:?}", path);
        Ok(config)
    }

    /// Get the default configuration file path
    ///
    /// Returns `~/.config/fcctl/config.toml` on Linux
    pub fn config_path() -> PathBuf {
        if let Some(proj_dirs) = directories::ProjectDirs::from("com", "fcctl", "fcctl") {
            proj_dirs.config_dir().join("config.toml")
        } else {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home)
                .join(".config")
                .join("fcctl")
                .join("config.toml")
        }
    }

    /// Apply FCCTL_* environment variable overrides
    ///
    /// Unparseable values are ignored and the previous value kept.
    fn apply_env_overrides(mut self) -> Self {
        if let Ok(socket) = std::env::var("FCCTL_SOCKET") {
            self.socket_path = PathBuf::from(socket);
        }
        if let Ok(tap) = std::env::var("FCCTL_TAP") {
            self.tap_name = tap;
        }
        if let Ok(ip) = std::env::var("FCCTL_HOST_IP") {
            if let Ok(ip) = ip.parse() {
                self.host_ip = ip;
            }
        }
        if let Ok(prefix) = std::env::var("FCCTL_PREFIX_LEN") {
            if let Ok(prefix) = prefix.parse() {
                self.prefix_len = prefix;
            }
        }
        if let Ok(ip) = std::env::var("FCCTL_GUEST_IP") {
            if let Ok(ip) = ip.parse() {
                self.guest_ip = ip;
            }
        }
        if let Ok(bin) = std::env::var("FCCTL_FIRECRACKER_BIN") {
            self.firecracker_bin = PathBuf::from(bin);
        }
        if let Ok(dir) = std::env::var("FCCTL_STATE_DIR") {
            self.state_dir = PathBuf::from(dir);
        }
        if let Ok(level) = std::env::var("FCCTL_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("FCCTL_LOG_FORMAT") {
            self.logging.format = format;
        }

        self
    }

    /// Apply command-line overrides
    pub fn apply_overrides(mut self, overrides: Overrides) -> Self {
        if let Some(socket) = overrides.socket_path {
            self.socket_path = socket;
        }
        if let Some(tap) = overrides.tap_name {
            self.tap_name = tap;
        }
        if let Some(ip) = overrides.host_ip {
            self.host_ip = ip;
        }
        if let Some(prefix) = overrides.prefix_len {
            self.prefix_len = prefix;
        }
        if let Some(ip) = overrides.guest_ip {
            self.guest_ip = ip;
        }
        if let Some(bin) = overrides.firecracker_bin {
            self.firecracker_bin = bin;
        }
        if let Some(dir) = overrides.state_dir {
            self.state_dir = dir;
        }
        // Flags can only switch these on
        self.verbose |= overrides.verbose;
        self.dry_run |= overrides.dry_run;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.socket_path.as_os_str().is_empty() {
            return Err(LifecycleError::config("Socket path cannot be empty"));
        }

        if self.tap_name.is_empty() {
            return Err(LifecycleError::config("TAP name cannot be empty"));
        }
        if self.tap_name.len() > MAX_IFNAME_LEN {
            return Err(LifecycleError::config(format!(
                "TAP name '{}' exceeds {} characters",
                self.tap_name, MAX_IFNAME_LEN
            )));
        }
        if self
            .tap_name
            .chars()
            .any(|c| c.is_whitespace() || c == '/' || c == ':')
        {
            return Err(LifecycleError::config(format!(
                "TAP name '{}' contains invalid characters",
                self.tap_name
            )));
        }

        if self.prefix_len == 0 || self.prefix_len > 32 {
            return Err(LifecycleError::config(format!(
                "Prefix length must be between 1 and 32, got {}",
                self.prefix_len
            )));
        }
        if self.host_ip == self.guest_ip {
            return Err(LifecycleError::config(format!(
                "Host and guest addresses must differ (both {})",
                self.host_ip
            )));
        }

        if self.firecracker_bin.as_os_str().is_empty() {
            return Err(LifecycleError::config("Firecracker binary cannot be empty"));
        }

        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(LifecycleError::config(format!(
                    "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                    self.logging.level
                )))
            }
        }
        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" | "compact" => {}
            _ => {
                return Err(LifecycleError::config(format!(
                    "Invalid log format: {}. Must be one of: json, pretty, compact",
                    self.logging.format
                )))
            }
        }

        Ok(())
    }

    /// Host address in CIDR form, e.g. `192.168.1.1/24`
    pub fn host_cidr(&self) -> String {
        format!("{}/{}", self.host_ip, self.prefix_len)
    }

    /// Guest address in CIDR form, e.g. `192.168.1.2/24`
    pub fn guest_cidr(&self) -> String {
        format!("{}/{}", self.guest_ip, self.prefix_len)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    /// Convert log level string to tracing::Level
    pub fn log_level(&self) -> Result<tracing::Level> {
        self.logging
            .level
            .to_lowercase()
            .parse()
            .map_err(|e| LifecycleError::config(format!("Failed to parse log level: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();
        assert_eq!(config.socket_path, PathBuf::from("/tmp/firecracker.socket"));
        assert_eq!(config.tap_name, "tap0");
        assert_eq!(config.host_cidr(), "192.168.1.1/24");
        assert_eq!(config.guest_ip, Ipv4Addr::new(192, 168, 1, 2));
        assert_eq!(config.grace_period(), Duration::from_secs(5));
        assert_eq!(config.settle_delay(), Duration::from_secs(1));
        assert!(!config.dry_run);
        assert_eq!(config.state_dir, PathBuf::from("/run/fcctl"));
        assert!(!config.state_dir.starts_with("/tmp"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_nonexistent_file() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().with_extension("nonexistent");
        let config = RuntimeConfig::load_from_path(&path).unwrap();
        assert_eq!(config, RuntimeConfig::default());
    }

    #[test]
    fn test_load_partial_toml() {
        let temp_file = NamedTempFile::new().unwrap();
        let toml_content = r#"
tap_name = "fc-tap1"
host_ip = "10.0.0.1"
prefix_len = 30
guest_ip = "10.0.0.2"

[logging]
level = "debug"
"#;
        fs::write(temp_file.path(), toml_content).unwrap();

        let config = RuntimeConfig::load_from_path(temp_file.path()).unwrap();
        assert_eq!(config.tap_name, "fc-tap1");
        assert_eq!(config.host_cidr(), "10.0.0.1/30");
        assert_eq!(config.guest_cidr(), "10.0.0.2/30");
        assert_eq!(config.logging.level, "debug");
        // Untouched fields keep defaults
        assert_eq!(config.socket_path, PathBuf::from(DEFAULT_SOCKET_PATH));
        assert_eq!(config.logging.format, "compact");
    }

    #[test]
    fn test_load_invalid_toml() {
        let temp_file = NamedTempFile::new().unwrap();
        fs::write(temp_file.path(), "tap_name = [unterminated").unwrap();

        let err = RuntimeConfig::load_from_path(temp_file.path()).unwrap_err();
        assert!(matches!(err, LifecycleError::Config(_)));
    }

    #[test]
    fn test_cli_overrides_win() {
        let overrides = Overrides {
            tap_name: Some("tap9".to_string()),
            socket_path: Some(PathBuf::from("/run/fc.sock")),
            dry_run: true,
            ..Default::default()
        };
        let config = RuntimeConfig::default().apply_overrides(overrides);
        assert_eq!(config.tap_name, "tap9");
        assert_eq!(config.socket_path, PathBuf::from("/run/fc.sock"));
        assert!(config.dry_run);
        assert!(!config.verbose);
    }

    #[test]
    fn test_env_overrides() {
        std::env::set_var("FCCTL_TAP", "envtap");
        std::env::set_var("FCCTL_PREFIX_LEN", "not-a-number");

        let config = RuntimeConfig::default().apply_env_overrides();
        assert_eq!(config.tap_name, "envtap");
        // Invalid value keeps the default
        assert_eq!(config.prefix_len, 24);

        std::env::remove_var("FCCTL_TAP");
        std::env::remove_var("FCCTL_PREFIX_LEN");
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = RuntimeConfig::default();
        config.tap_name = "a-very-long-tap-name".to_string();
        assert!(config.validate().is_err());

        let mut config = RuntimeConfig::default();
        config.tap_name = String::new();
        assert!(config.validate().is_err());

        let mut config = RuntimeConfig::default();
        config.prefix_len = 33;
        assert!(config.validate().is_err());

        let mut config = RuntimeConfig::default();
        config.guest_ip = config.host_ip;
        assert!(config.validate().is_err());

        let mut config = RuntimeConfig::default();
        config.logging.format = "xml".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_log_level_parsing() {
        let mut config = RuntimeConfig::default();
        config.logging.level = "debug".to_string();
        assert_eq!(config.log_level().unwrap(), tracing::Level::DEBUG);

        config.logging.level = "loud".to_string();
        assert!(config.log_level().is_err());
    }
}
