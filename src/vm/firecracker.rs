// Firecracker Process Supervision
//
// Launches `firecracker --api-sock <socket> --config-file <config>`, checks it
// survives a short settling delay, and supervises it in the foreground until
// it exits or the caller interrupts. Shutdown is SIGTERM, a bounded grace
// period, then SIGKILL.
//
// A handle exists only once the VM survived the settling delay:
//   Running -> { Stopping -> Stopped | Crashed }
// Launch failures never produce a handle; they surface as Spawn or
// ProcessStart errors instead.
//
// A VM started by an earlier invocation has no handle here; `stop` finds it
// through the process registry, falling back to a process-table scan.

use crate::config::{RuntimeConfig, DEFAULT_TAP_NAME};
use crate::error::{LifecycleError, Result};
use crate::tools::{CommandRunner, HostCommand};
use crate::vm::channel::ChannelManager;
use crate::vm::config::VmConfigFile;
use crate::vm::registry::{ProcessRegistry, RegistryEntry};
use crate::vm::state_dir;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Supervisor-side state of one VM instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Running,
    Stopping,
    Stopped,
    Crashed,
}

/// Observed liveness of the VM process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Running,
    ExitedCleanly,
    /// Exit code, or None when killed by a signal
    ExitedWithError(Option<i32>),
}

impl Liveness {
    fn from_status(status: ExitStatus) -> Self {
        if status.success() {
            Liveness::ExitedCleanly
        } else {
            Liveness::ExitedWithError(status.code())
        }
    }
}

/// How an interrupted VM went down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Exited within the grace period after SIGTERM
    Graceful,
    /// Grace period expired; SIGKILL was sent
    ForceKilled,
}

/// How foreground supervision ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisionOutcome {
    /// The VM exited on its own
    Exited(Liveness),
    /// The supervisor was interrupted and shut the VM down
    Interrupted(ShutdownOutcome),
}

/// Everything needed to launch one VM
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    /// Command line handed to the OS
    pub command: HostCommand,

    /// Parsed (possibly retargeted) VM configuration
    pub config: VmConfigFile,

    /// Path passed as --config-file
    pub config_path: PathBuf,
}

impl LaunchPlan {
    /// Whether a patched copy of the config must be written before launch
    pub fn needs_materialized_config(&self) -> bool {
        self.config.is_patched()
    }
}

/// A running Firecracker process owned by this invocation
#[derive(Debug)]
pub struct FirecrackerProcess {
    pid: u32,
    child: Child,
    state: VmState,
    socket_path: PathBuf,
    registry: ProcessRegistry,
    materialized_config: Option<PathBuf>,
}

impl FirecrackerProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn state(&self) -> VmState {
        self.state
    }

    /// Poll the process without blocking
    pub fn liveness(&mut self) -> Result<Liveness> {
        Ok(match self.child.try_wait()? {
            None => Liveness::Running,
            Some(status) => Liveness::from_status(status),
        })
    }

    /// Block until the VM exits or `interrupt` resolves
    ///
    /// On interruption the VM gets SIGTERM and `grace` to exit before it is
    /// killed, so this never blocks indefinitely once interrupted.
    pub async fn supervise<F>(&mut self, interrupt: F, grace: Duration) -> Result<SupervisionOutcome>
    where
        F: Future<Output = ()>,
    {
        let exited = tokio::select! {
            status = self.child.wait() => Some(status?),
            _ = interrupt => None,
        };

        match exited {
            Some(status) => {
                let liveness = Liveness::from_status(status);
                match liveness {
                    Liveness::ExitedCleanly => {
                        info!("Firecracker (PID {}) exited cleanly", self.pid);
                        self.state = VmState::Stopped;
                    }
                    _ => {
                        warn!("Firecracker (PID {}) exited with {}", self.pid, status);
                        self.state = VmState::Crashed;
                    }
                }
                self.release();
                Ok(SupervisionOutcome::Exited(liveness))
            }
            None => {
                warn!("Received interrupt, shutting down...");
                let outcome = self.shutdown(grace).await?;
                Ok(SupervisionOutcome::Interrupted(outcome))
            }
        }
    }

    /// SIGTERM, wait up to `grace`, then SIGKILL
    pub async fn shutdown(&mut self, grace: Duration) -> Result<ShutdownOutcome> {
        // Never signal a reaped pid; it may already belong to someone else
        if let Some(status) = self.child.try_wait()? {
            debug!("Firecracker (PID {}) already exited: {}", self.pid, status);
            self.state = VmState::Stopped;
            self.release();
            return Ok(ShutdownOutcome::Graceful);
        }

        self.state = VmState::Stopping;
        info!("Sending SIGTERM to Firecracker (PID {})", self.pid);

        if let Err(e) = kill(Pid::from_raw(self.pid as i32), Signal::SIGTERM) {
            warn!("Failed to send SIGTERM to {}: {}", self.pid, e);
        }

        let outcome = match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => {
                let status = status?;
                info!("Firecracker (PID {}) terminated: {}", self.pid, status);
                ShutdownOutcome::Graceful
            }
            Err(_) => {
                warn!("Firecracker didn't terminate gracefully, forcing shutdown...");
                // kill() sends SIGKILL once and reaps the child
                if let Err(e) = self.child.kill().await {
                    warn!("Failed to kill Firecracker (PID {}): {}", self.pid, e);
                }
                ShutdownOutcome::ForceKilled
            }
        };

        self.state = VmState::Stopped;
        self.release();
        Ok(outcome)
    }

    /// Forget the process in the registry and drop the patched config copy
    fn release(&mut self) {
        if let Err(e) = self.registry.remove(&self.socket_path) {
            warn!("Failed to update process registry: {}", e);
        }
        discard_materialized(self.materialized_config.take());
    }
}

/// Starts, supervises and stops Firecracker for one API socket
#[derive(Debug)]
pub struct Supervisor<'a> {
    config: &'a RuntimeConfig,
    runner: &'a CommandRunner,
    registry: ProcessRegistry,
}

impl<'a> Supervisor<'a> {
    pub fn new(config: &'a RuntimeConfig, runner: &'a CommandRunner) -> Self {
        Self {
            config,
            runner,
            registry: ProcessRegistry::new(&config.state_dir),
        }
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    /// Validate the config file and build the launch command
    ///
    /// Nothing is spawned or written here.
    pub fn prepare(&self, config_file: &Path) -> Result<LaunchPlan> {
        let mut config = VmConfigFile::load(config_file)?;
        config.retarget_tap(DEFAULT_TAP_NAME, &self.config.tap_name);

        let config_path = if config.is_patched() {
            self.materialized_config_path()
        } else {
            config_file.to_path_buf()
        };

        let command = HostCommand::new(self.config.firecracker_bin.to_string_lossy())
            .arg("--api-sock")
            .arg(self.config.socket_path.to_string_lossy())
            .arg("--config-file")
            .arg(config_path.to_string_lossy());

        Ok(LaunchPlan {
            command,
            config,
            config_path,
        })
    }

    /// Launch Firecracker and wait out the settling delay
    ///
    /// Returns `None` in dry-run, after reporting the launch command. A VM
    /// that dies during the settling delay is a
    /// [`LifecycleError::ProcessStart`] carrying its output. A VM that dies
    /// just after it is still reported as started.
    pub async fn start(&self, config_file: &Path) -> Result<Option<FirecrackerProcess>> {
        info!("Starting Firecracker MicroVM...");
        let plan = self.prepare(config_file)?;

        if self.runner.is_dry_run() {
            self.runner.run_tolerant(&plan.command).await?;
            return Ok(None);
        }

        let materialized_config = if plan.needs_materialized_config() {
            state_dir::write_private(
                &self.config.state_dir,
                &plan.config_path,
                plan.config.to_json_pretty()?.as_bytes(),
            )?;
            debug!("Wrote retargeted config to {:?}", plan.config_path);
            Some(plan.config_path.clone())
        } else {
            None
        };

        info!("Launching Firecracker...");
        debug!("Running: {}", plan.command);
        let spawned = Command::new(plan.command.program())
            .args(plan.command.arguments())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(source) => {
                discard_materialized(materialized_config);
                return Err(LifecycleError::Spawn {
                    command: plan.command.to_string(),
                    source,
                });
            }
        };

        let pid = child.id().unwrap_or(0);
        debug!("Firecracker spawned (PID {}), waiting {:?}", pid, self.config.settle_delay());

        tokio::time::sleep(self.config.settle_delay()).await;

        if child.try_wait()?.is_some() {
            let output = child.wait_with_output().await?;
            discard_materialized(materialized_config);
            return Err(LifecycleError::ProcessStart {
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        if let Some(stdout) = child.stdout.take() {
            forward_output(stdout, "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(stderr, "stderr");
        }

        if let Err(e) = self.registry.record(RegistryEntry::new(
            &self.config.socket_path,
            pid,
            &plan.config_path,
        )) {
            warn!("Failed to record Firecracker PID {}: {}", pid, e);
        }

        info!("Firecracker MicroVM started successfully (PID {})", pid);
        Ok(Some(FirecrackerProcess {
            pid,
            child,
            state: VmState::Running,
            socket_path: self.config.socket_path.clone(),
            registry: self.registry.clone(),
            materialized_config,
        }))
    }

    /// Kill the VM bound to this socket without holding its handle
    ///
    /// The registry is consulted first; the process-table scan only runs
    /// when it has no live entry. Removes the API socket afterwards.
    /// Returns the pids that were killed.
    pub async fn stop(&self) -> Result<Vec<u32>> {
        info!("Stopping all Firecracker instances...");
        let mut killed = Vec::new();

        if let Some(entry) = self.registry.lookup(&self.config.socket_path) {
            if self.is_registered_process_alive(&entry) {
                self.kill_pid(entry.pid).await?;
                killed.push(entry.pid);
            } else {
                debug!("Registry entry for PID {} is stale", entry.pid);
            }
            if !self.runner.is_dry_run() {
                self.registry.remove(&self.config.socket_path)?;
            }
        }

        if killed.is_empty() {
            for pid in self.find_matching().await? {
                self.kill_pid(pid).await?;
                killed.push(pid);
            }
        }

        info!("Cleaning up socket files...");
        ChannelManager::new(self.config, self.runner).remove().await?;

        info!("Firecracker cleanup complete.");
        Ok(killed)
    }

    /// Whether a VM bound to this socket appears to be running
    pub async fn is_running(&self) -> Result<bool> {
        if let Some(entry) = self.registry.lookup(&self.config.socket_path) {
            if self.is_registered_process_alive(&entry) {
                return Ok(true);
            }
        }
        Ok(!self.find_matching().await?.is_empty())
    }

    /// Pids from the process table whose command line names both the
    /// Firecracker executable and this socket
    pub async fn find_matching(&self) -> Result<Vec<u32>> {
        let listing = self
            .runner
            .capture(&HostCommand::new("ps").args(["-eo", "pid=,args="]))
            .await?;

        let own_pid = std::process::id();
        Ok(
            parse_process_table(listing.stdout_str(), &self.executable_name(), &self.socket_str())
                .into_iter()
                .filter(|pid| *pid != own_pid)
                .collect(),
        )
    }

    async fn kill_pid(&self, pid: u32) -> Result<()> {
        info!("Killing Firecracker process with PID {}", pid);
        self.runner
            .run_tolerant(&HostCommand::new("kill").args(["-9".to_string(), pid.to_string()]))
            .await?;
        Ok(())
    }

    fn is_registered_process_alive(&self, entry: &RegistryEntry) -> bool {
        match std::fs::read(format!("/proc/{}/cmdline", entry.pid)) {
            Ok(raw) => {
                let cmdline = String::from_utf8_lossy(&raw).replace('\0', " ");
                matches_instance(&cmdline, &self.executable_name(), &self.socket_str())
            }
            Err(_) => false,
        }
    }

    fn executable_name(&self) -> String {
        self.config
            .firecracker_bin
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.config.firecracker_bin.to_string_lossy().into_owned())
    }

    fn socket_str(&self) -> String {
        self.config.socket_path.to_string_lossy().into_owned()
    }

    fn materialized_config_path(&self) -> PathBuf {
        let socket_name = self
            .config
            .socket_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "firecracker".to_string());
        self.config
            .state_dir
            .join(format!("{}.config.json", socket_name))
    }
}

/// Loose instance match: both substrings anywhere in the command line
pub fn matches_instance(cmdline: &str, executable: &str, socket: &str) -> bool {
    cmdline.contains(executable) && cmdline.contains(socket)
}

/// Parse `ps -eo pid=,args=` output into matching pids
pub fn parse_process_table(listing: &str, executable: &str, socket: &str) -> Vec<u32> {
    listing
        .lines()
        .filter_map(|line| {
            let (pid, args) = line.trim_start().split_once(char::is_whitespace)?;
            let pid = pid.parse::<u32>().ok()?;
            matches_instance(args, executable, socket).then_some(pid)
        })
        .collect()
}

/// Remove a retargeted config copy that is no longer needed
fn discard_materialized(path: Option<PathBuf>) {
    if let Some(path) = path {
        if let Err(e) = std::fs::remove_file(&path) {
            debug!("Could not remove {:?}: {}", path, e);
        }
    }
}

/// Drain a child pipe into the log so the VM never blocks on a full pipe
fn forward_output<R>(reader: R, stream: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(stream, "firecracker: {}", line);
        }
    });
}
