//! Lifecycle Error Types
//!
//! Every fatal condition of the lifecycle commands maps onto one of these
//! variants. Tolerant (cleanup) steps never produce `Command`.

use std::path::PathBuf;

/// Result type alias for lifecycle operations
pub type Result<T> = std::result::Result<T, LifecycleError>;

/// Error types for lifecycle operations
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    /// Elevated rights are required but not held
    #[error("{0} requires root privileges. Please run with sudo.")]
    Privilege(String),

    /// Missing or malformed configuration (runtime or VM config file)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A required host command exited non-zero
    #[error("Command `{command}` failed with exit code {code:?}{}", format_stderr(.stderr))]
    Command {
        command: String,
        code: Option<i32>,
        stderr: Option<String>,
    },

    /// The executable could not be started at all
    #[error("Failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// No default-route egress interface could be found
    #[error("Could not determine default interface")]
    Discovery,

    /// The VM process exited during the settling delay
    #[error("Firecracker failed to start (exit code {code:?})\nStdout: {stdout}\nStderr: {stderr}")]
    ProcessStart {
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    /// No VM is bound to the API socket
    #[error("Firecracker is not running on {0:?}. Start the VM first.")]
    NotRunning(PathBuf),

    /// Another invocation holds the host lock for this interface
    #[error("Another fcctl invocation holds the lock at {0:?}")]
    Lock(PathBuf),

    /// The state directory is not private to the invoking user
    #[error("Refusing to use state directory {path:?}: {reason}")]
    UnsafeStateDir { path: PathBuf, reason: String },

    /// Process registry could not be read or written
    #[error("Registry error at {path:?}: {message}")]
    Registry { path: PathBuf, message: String },

    /// Filesystem or process I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn format_stderr(stderr: &Option<String>) -> String {
    match stderr {
        Some(s) if !s.trim().is_empty() => format!("\nError output: {}", s.trim()),
        _ => String::new(),
    }
}

impl LifecycleError {
    /// Shorthand for configuration errors
    pub fn config(message: impl Into<String>) -> Self {
        LifecycleError::Config(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_error_includes_stderr() {
        let err = LifecycleError::Command {
            command: "ip link set tap0 up".to_string(),
            code: Some(1),
            stderr: Some("Cannot find device \"tap0\"\n".to_string()),
        };
        let msg = err.to_string();
        assert!(msg.contains("exit code Some(1)"));
        assert!(msg.contains("Cannot find device"));
    }

    #[test]
    fn test_command_error_without_stderr() {
        let err = LifecycleError::Command {
            command: "sysctl -w net.ipv4.ip_forward=1".to_string(),
            code: Some(255),
            stderr: None,
        };
        assert!(!err.to_string().contains("Error output"));
    }

    #[test]
    fn test_process_start_error_shows_output() {
        let err = LifecycleError::ProcessStart {
            code: Some(1),
            stdout: String::new(),
            stderr: "bad kernel path".to_string(),
        };
        assert!(err.to_string().contains("Stderr: bad kernel path"));
    }
}
