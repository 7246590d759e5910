// Firecracker API Channel
//
// The API channel is a named pipe at the configured socket path. fcctl only
// creates and removes it; Firecracker and API clients rendezvous on it.

use crate::config::RuntimeConfig;
use crate::error::Result;
use crate::tools::{CommandRunner, HostCommand};
use std::path::Path;
use tracing::info;

/// Owner and group read/write
const CHANNEL_MODE: &str = "660";

/// Creates and removes the API channel
#[derive(Debug)]
pub struct ChannelManager<'a> {
    config: &'a RuntimeConfig,
    runner: &'a CommandRunner,
}

impl<'a> ChannelManager<'a> {
    pub fn new(config: &'a RuntimeConfig, runner: &'a CommandRunner) -> Self {
        Self { config, runner }
    }

    pub fn path(&self) -> &Path {
        &self.config.socket_path
    }

    /// Whether a file currently exists at the channel path
    pub fn is_present(&self) -> bool {
        // symlink_metadata so a dangling link still counts as stale
        self.path().symlink_metadata().is_ok()
    }

    /// Create the channel, replacing any stale file at the path
    pub async fn activate(&self) -> Result<()> {
        info!("Creating and activating the Firecracker API socket...");
        let path = self.path().to_string_lossy().into_owned();

        self.runner
            .run_tolerant(&HostCommand::new("rm").args(["-f", path.as_str()]))
            .await?;
        self.runner
            .run_required(&HostCommand::new("mkfifo").arg(path.as_str()))
            .await?;
        self.runner
            .run_required(&HostCommand::new("chmod").args([CHANNEL_MODE, path.as_str()]))
            .await?;

        info!("Firecracker API socket activated at {}", path);
        Ok(())
    }

    /// Remove the channel; succeeds if it is already gone
    pub async fn deactivate(&self) -> Result<()> {
        info!("Deactivating and cleaning up the Firecracker API socket...");
        self.remove().await?;
        info!("Firecracker API socket deactivated and cleaned up.");
        Ok(())
    }

    /// Remove the channel file without the lifecycle log lines
    pub(crate) async fn remove(&self) -> Result<()> {
        let path = self.path().to_string_lossy().into_owned();
        self.runner
            .run_tolerant(&HostCommand::new("rm").args(["-f", path.as_str()]))
            .await?;
        Ok(())
    }
}
