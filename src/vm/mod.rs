// Firecracker MicroVM Lifecycle
//
// This module brings a single Firecracker microVM up and down on the host:
// - channel: the API named pipe
// - network: TAP device, IP forwarding and the NAT/forward iptables chains
// - firecracker: launching, supervising and stopping the VM process
//
// Key invariants:
// - Bring-up order: network -> channel -> process
// - Tear-down order is the exact reverse: process -> network -> channel
// - Tear-down tolerates partial state; bring-up never rolls back

pub mod channel;
pub mod config;
pub mod firecracker;
pub mod guest_script;
pub mod lock;
pub mod network;
pub mod registry;
pub mod state_dir;


use crate::config::RuntimeConfig;
use crate::error::{LifecycleError, Result};
use crate::tools::{CommandRunner, HostCommand};
use std::future::Future;
use std::path::Path;
use tracing::{info, warn};

pub use channel::ChannelManager;
pub use firecracker::{
    FirecrackerProcess, Liveness, ShutdownOutcome, SupervisionOutcome, Supervisor, VmState,
};
pub use network::NetworkProvisioner;

/// Serial console the guest exposes
const SERIAL_DEVICE: &str = "/dev/ttyS0";
const SERIAL_BAUD: &str = "115200";

/// Composes channel, network and process management for one VM
#[derive(Debug)]
pub struct Lifecycle {
    config: RuntimeConfig,
    runner: CommandRunner,
}

impl Lifecycle {
    /// Build a lifecycle with the execution strategy the config asks for
    pub fn new(config: RuntimeConfig) -> Self {
        let runner = CommandRunner::from_config(&config);
        Self { config, runner }
    }

    /// Build a lifecycle around an existing runner
    pub fn with_runner(config: RuntimeConfig, runner: CommandRunner) -> Self {
        Self { config, runner }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn channel(&self) -> ChannelManager<'_> {
        ChannelManager::new(&self.config, &self.runner)
    }

    pub fn network(&self) -> NetworkProvisioner<'_> {
        NetworkProvisioner::new(&self.config, &self.runner)
    }

    pub fn supervisor(&self) -> Supervisor<'_> {
        Supervisor::new(&self.config, &self.runner)
    }

    /// Activate the API channel unless one is already present
    pub async fn ensure_channel(&self) -> Result<()> {
        let channel = self.channel();
        if channel.is_present() {
            info!("Firecracker API socket already present at {:?}", channel.path());
            return Ok(());
        }
        warn!("Firecracker API socket not found. Activating...");
        channel.activate().await
    }

    /// Launch the VM and supervise it until it exits or `interrupt` fires
    ///
    /// Returns `None` in dry-run, where nothing is launched. A bad config
    /// file fails before the channel is touched.
    pub async fn start<F>(&self, config_file: &Path, interrupt: F) -> Result<Option<SupervisionOutcome>>
    where
        F: Future<Output = ()>,
    {
        self.supervisor().prepare(config_file)?;
        self.ensure_channel().await?;

        let Some(mut vm) = self.supervisor().start(config_file).await? else {
            return Ok(None);
        };

        info!("Firecracker is running. Press Ctrl+C to stop.");
        let outcome = vm.supervise(interrupt, self.config.grace_period()).await?;
        Ok(Some(outcome))
    }

    /// Full bring-up: network, then channel, then the VM
    ///
    /// The config file is checked before any host change. After that a
    /// failing step aborts the rest; completed steps are left in place for
    /// [`Lifecycle::tear_down`] to clean.
    pub async fn bring_up<F>(&self, config_file: &Path, interrupt: F) -> Result<Option<SupervisionOutcome>>
    where
        F: Future<Output = ()>,
    {
        self.supervisor().prepare(config_file)?;
        self.network().setup().await?;
        self.start(config_file, interrupt).await
    }

    /// Full tear-down: VM, then network, then channel
    pub async fn tear_down(&self) -> Result<()> {
        self.supervisor().stop().await?;
        self.network().cleanup().await?;
        self.channel().deactivate().await?;
        Ok(())
    }

    /// Attach to the guest serial console
    ///
    /// The console command inherits the terminal and runs until the operator
    /// detaches.
    pub async fn login(&self) -> Result<()> {
        info!("Attempting to log into the running MicroVM...");

        if !self.supervisor().is_running().await? {
            if !self.runner.is_dry_run() {
                return Err(LifecycleError::NotRunning(self.config.socket_path.clone()));
            }
            warn!("No Firecracker process found; continuing because of dry-run");
        }

        info!("Connecting to the MicroVM via serial console...");
        let console = HostCommand::new("screen").args([SERIAL_DEVICE, SERIAL_BAUD]);
        let result = self.runner.run_tolerant(&console).await?;
        if !result.success() {
            warn!("Failed to connect to serial console");
        }

        info!("Login attempt complete.");
        Ok(())
    }

    /// Render the guest-side network script
    pub fn guest_script(&self) -> String {
        guest_script::render(&self.config)
    }
}
