//! fcctl Library
//!
//! Host-side lifecycle management for a single Firecracker microVM: the API
//! channel, TAP networking with NAT, and supervision of the VM process.

pub mod config;
pub mod error;
pub mod tools;
#[cfg(target_os = "linux")]
pub mod vm;

pub use error::{LifecycleError, Result};

#[cfg(not(target_os = "linux"))]
pub mod vm {
    use crate::config::RuntimeConfig;
    use crate::error::{LifecycleError, Result};

    /// Firecracker only runs on Linux hosts
    #[derive(Debug)]
    pub struct Lifecycle {
        config: RuntimeConfig,
    }

    impl Lifecycle {
        pub fn new(config: RuntimeConfig) -> Self {
            Self { config }
        }

        pub fn config(&self) -> &RuntimeConfig {
            &self.config
        }

        pub async fn tear_down(&self) -> Result<()> {
            Err(LifecycleError::config(
                "Firecracker lifecycle management is only supported on Linux",
            ))
        }
    }
}
