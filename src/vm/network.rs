// Host Networking for the MicroVM
//
// Provides the guest's network path: a TAP device with the host address,
// IPv4 forwarding, and two dedicated iptables chains:
// - FIRECRACKER-NAT (nat table), hooked from POSTROUTING, masquerades
//   traffic leaving through the default-route interface
// - FIRECRACKER-FORWARD (filter table), hooked from FORWARD, accepts
//   traffic in and out of the TAP
//
// Key invariants:
// - Both chain names belong to fcctl; cleanup flushes and deletes them
//   unconditionally without touching any other rule
// - Setup is strict: a required step failing aborts, nothing is rolled back
// - Setup is idempotent: each rule is checked with `-C` and only appended
//   when missing, so running it twice leaves one copy of every rule
// - Cleanup is tolerant: every step may fail, so a partial setup can always
//   be unwound
// - The chains are host-wide, so setup and cleanup hold one network lock
//   regardless of the TAP name

use crate::config::RuntimeConfig;
use crate::error::{LifecycleError, Result};
use crate::tools::{CommandRunner, HostCommand};
use crate::vm::lock::HostLock;
use tracing::{debug, info, warn};

/// NAT chain owned by fcctl
pub const NAT_CHAIN: &str = "FIRECRACKER-NAT";

/// Forward chain owned by fcctl
pub const FORWARD_CHAIN: &str = "FIRECRACKER-FORWARD";

/// Egress name used in dry-run, where `ip route` is not really consulted
const DRY_RUN_EGRESS: &str = "<default-egress>";

/// Sets up and tears down host networking for one TAP device
#[derive(Debug)]
pub struct NetworkProvisioner<'a> {
    config: &'a RuntimeConfig,
    runner: &'a CommandRunner,
}

impl<'a> NetworkProvisioner<'a> {
    pub fn new(config: &'a RuntimeConfig, runner: &'a CommandRunner) -> Self {
        Self { config, runner }
    }

    /// Create the TAP, enable forwarding and install the NAT/forward chains
    ///
    /// Requires root. Fails with [`LifecycleError::Discovery`] when no
    /// default route exists, since masquerading needs an egress interface.
    pub async fn setup(&self) -> Result<()> {
        self.ensure_privileged("Network setup")?;
        let _lock = self.lock()?;

        info!("Setting up networking for Firecracker MicroVM...");
        let tap = self.config.tap_name.as_str();

        info!("Creating {} device...", tap);
        self.runner
            .run_tolerant(&ip(["tuntap", "add", tap, "mode", "tap"]))
            .await?;
        self.runner
            .run_required(&ip(["link", "set", tap, "up"]))
            .await?;

        info!("Assigning IP address to {}...", tap);
        let cidr = self.config.host_cidr();
        self.runner
            .run_tolerant(&ip(["addr", "add", cidr.as_str(), "dev", tap]))
            .await?;

        info!("Enabling IP forwarding...");
        self.runner
            .run_required(&HostCommand::new("sysctl").args(["-w", "net.ipv4.ip_forward=1"]))
            .await?;

        info!("Setting up NAT with iptables...");
        let egress = self.default_interface().await?;
        self.install_nat_chain(&egress).await?;
        self.install_forward_chain().await?;

        info!(
            "Networking setup complete. Firecracker is ready to use the {} device.",
            tap
        );
        Ok(())
    }

    /// Remove the TAP and both chains
    ///
    /// Every step is tolerant, so this is safe to run after a partial setup
    /// and safe to run twice.
    pub async fn cleanup(&self) -> Result<()> {
        self.ensure_privileged("Network cleanup")?;
        let _lock = self.lock()?;

        info!("Cleaning up networking...");
        let tap = self.config.tap_name.as_str();
        self.runner
            .run_tolerant(&ip(["link", "delete", tap]))
            .await?;

        info!("Removing Firecracker-specific iptables rules...");
        self.unlink_flush_delete(Some("nat"), "POSTROUTING", NAT_CHAIN)
            .await?;
        self.unlink_flush_delete(None, "FORWARD", FORWARD_CHAIN)
            .await?;

        info!("Networking cleanup complete.");
        Ok(())
    }

    /// Find the interface carrying the default route
    async fn default_interface(&self) -> Result<String> {
        let routes = self
            .runner
            .capture(&HostCommand::new("ip").arg("route"))
            .await?;

        match parse_default_interface(routes.stdout_str()) {
            Some(iface) => {
                info!("Default egress interface: {}", iface);
                Ok(iface)
            }
            None if self.runner.is_dry_run() => {
                warn!(
                    "No routing table in dry-run; using {} as egress interface",
                    DRY_RUN_EGRESS
                );
                Ok(DRY_RUN_EGRESS.to_string())
            }
            None => Err(LifecycleError::Discovery),
        }
    }

    async fn install_nat_chain(&self, egress: &str) -> Result<()> {
        self.runner
            .run_tolerant(&iptables(Some("nat"), ["-N", NAT_CHAIN]))
            .await?;
        self.ensure_rule(Some("nat"), NAT_CHAIN, &["-o", egress, "-j", "MASQUERADE"])
            .await?;
        self.ensure_rule(Some("nat"), "POSTROUTING", &["-j", NAT_CHAIN])
            .await?;
        Ok(())
    }

    async fn install_forward_chain(&self) -> Result<()> {
        let tap = self.config.tap_name.as_str();
        self.runner
            .run_tolerant(&iptables(None, ["-N", FORWARD_CHAIN]))
            .await?;
        self.ensure_rule(None, FORWARD_CHAIN, &["-i", tap, "-j", "ACCEPT"])
            .await?;
        self.ensure_rule(None, FORWARD_CHAIN, &["-o", tap, "-j", "ACCEPT"])
            .await?;
        self.ensure_rule(None, "FORWARD", &["-j", FORWARD_CHAIN])
            .await?;
        Ok(())
    }

    /// Append a rule unless `iptables -C` finds it already installed
    ///
    /// In dry-run the check is reported but the append is always shown.
    async fn ensure_rule(&self, table: Option<&str>, chain: &str, spec: &[&str]) -> Result<()> {
        let check = iptables_rule(table, "-C", chain, spec);
        let present = self.runner.run_tolerant(&check).await?.success();
        if present && !self.runner.is_dry_run() {
            debug!("Rule already installed: {}", check);
            return Ok(());
        }
        self.runner
            .run_required(&iptables_rule(table, "-A", chain, spec))
            .await?;
        Ok(())
    }

    /// Unhook a chain from its builtin parent, then flush and delete it
    async fn unlink_flush_delete(
        &self,
        table: Option<&str>,
        parent: &str,
        chain: &str,
    ) -> Result<()> {
        // Repeat the unhook so duplicated jumps cannot keep the chain alive
        let unhook = iptables(table, ["-D", parent, "-j", chain]);
        while self.runner.run_tolerant(&unhook).await?.success() {
            if self.runner.is_dry_run() {
                break;
            }
        }
        self.runner
            .run_tolerant(&iptables(table, ["-F", chain]))
            .await?;
        self.runner
            .run_tolerant(&iptables(table, ["-X", chain]))
            .await?;
        Ok(())
    }

    fn ensure_privileged(&self, operation: &str) -> Result<()> {
        if self.runner.is_privileged() {
            return Ok(());
        }
        if self.runner.is_dry_run() {
            warn!("{} requires root privileges; continuing because of dry-run", operation);
            return Ok(());
        }
        Err(LifecycleError::Privilege(operation.to_string()))
    }

    fn lock(&self) -> Result<Option<HostLock>> {
        if self.runner.is_dry_run() {
            return Ok(None);
        }
        HostLock::network(&self.config.state_dir).map(Some)
    }
}

/// Extract the egress device from `ip route` output
///
/// Uses the first `default` line that names a device.
pub fn parse_default_interface(routes: &str) -> Option<String> {
    routes
        .lines()
        .filter(|line| line.contains("default"))
        .find_map(|line| {
            let mut parts = line.split_whitespace();
            parts.find(|p| *p == "dev")?;
            parts.next().map(str::to_string)
        })
}

fn ip<const N: usize>(args: [&str; N]) -> HostCommand {
    HostCommand::new("ip").args(args)
}

fn iptables<const N: usize>(table: Option<&str>, args: [&str; N]) -> HostCommand {
    let cmd = HostCommand::new("iptables");
    let cmd = match table {
        Some(table) => cmd.args(["-t", table]),
        None => cmd,
    };
    cmd.args(args)
}

fn iptables_rule(table: Option<&str>, op: &str, chain: &str, spec: &[&str]) -> HostCommand {
    iptables(table, [op, chain]).args(spec.iter().copied())
}
