//! Host Command Runner
//!
//! Every host-side mutation (ip, sysctl, iptables, mkfifo, kill, ...) goes
//! through [`CommandRunner`]. The runner decides whether a failure aborts the
//! operation; the injected [`Executor`] decides whether anything actually runs.
//!
//! Two execution strategies exist:
//! - [`SystemExecutor`] spawns real processes with `tokio::process::Command`
//! - [`RecordingExecutor`] spawns nothing, records each command in order and
//!   answers with canned or synthetic successful results (dry-run, tests)

use crate::config::RuntimeConfig;
use crate::error::{LifecycleError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::process::Command as TokioCommand;
use tracing::{debug, error, info};

/// A host command as an argument vector, never passed through a shell
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostCommand {
    program: String,
    args: Vec<String>,
}

impl HostCommand {
    /// Create a command for `program` with no arguments
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Append one argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    fn to_tokio(&self) -> TokioCommand {
        let mut cmd = TokioCommand::new(&self.program);
        cmd.args(&self.args);
        cmd
    }
}

impl fmt::Display for HostCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Result of one host command
///
/// `stdout`/`stderr` are `None` unless capture was requested.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    /// Exit code (None if the process was killed by a signal)
    pub exit_code: Option<i32>,

    pub stdout: Option<String>,

    pub stderr: Option<String>,
}

impl CommandResult {
    /// Synthetic success used by dry-run
    pub fn ok() -> Self {
        Self {
            exit_code: Some(0),
            stdout: None,
            stderr: None,
        }
    }

    /// Successful result with the given standard output
    pub fn with_stdout(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            stdout: Some(stdout.into()),
            stderr: None,
        }
    }

    /// Failed result with the given exit code and standard error
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(code),
            stdout: None,
            stderr: Some(stderr.into()),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Captured stdout, empty if none was captured
    pub fn stdout_str(&self) -> &str {
        self.stdout.as_deref().unwrap_or("")
    }
}

/// Execution strategy for host commands
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run `command` to completion
    async fn execute(&self, command: &HostCommand, capture_output: bool) -> Result<CommandResult>;

    /// True when commands are recorded instead of run
    fn is_dry_run(&self) -> bool;

    /// Whether commands run with root rights
    fn is_privileged(&self) -> bool {
        nix::unistd::geteuid().is_root()
    }
}

/// Runs commands on the host
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemExecutor;

#[async_trait]
impl Executor for SystemExecutor {
    async fn execute(&self, command: &HostCommand, capture_output: bool) -> Result<CommandResult> {
        let mut process = command.to_tokio();
        let spawn_err = |source| LifecycleError::Spawn {
            command: command.to_string(),
            source,
        };

        if capture_output {
            process.stdout(Stdio::piped());
            process.stderr(Stdio::piped());
            let output = process.output().await.map_err(spawn_err)?;
            Ok(CommandResult {
                exit_code: output.status.code(),
                stdout: Some(String::from_utf8_lossy(&output.stdout).into_owned()),
                stderr: Some(String::from_utf8_lossy(&output.stderr).into_owned()),
            })
        } else {
            let status = process.status().await.map_err(spawn_err)?;
            Ok(CommandResult {
                exit_code: status.code(),
                stdout: None,
                stderr: None,
            })
        }
    }

    fn is_dry_run(&self) -> bool {
        false
    }
}

/// Records commands instead of running them
///
/// Commands whose rendered form starts with a registered prefix get the
/// matching canned result; everything else gets [`CommandResult::ok`].
#[derive(Debug, Default)]
pub struct RecordingExecutor {
    commands: Mutex<Vec<HostCommand>>,
    responses: Mutex<Vec<(String, CommandResult)>>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer commands starting with `prefix` with `result`
    pub fn with_response(self, prefix: impl Into<String>, result: CommandResult) -> Self {
        if let Ok(mut responses) = self.responses.lock() {
            responses.push((prefix.into(), result));
        }
        self
    }

    /// Commands recorded so far, in order
    pub fn recorded(&self) -> Vec<HostCommand> {
        self.commands
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    /// Recorded commands rendered as command lines
    pub fn recorded_lines(&self) -> Vec<String> {
        self.recorded().iter().map(ToString::to_string).collect()
    }
}

#[async_trait]
impl Executor for RecordingExecutor {
    async fn execute(&self, command: &HostCommand, _capture_output: bool) -> Result<CommandResult> {
        let line = command.to_string();
        if let Ok(mut commands) = self.commands.lock() {
            commands.push(command.clone());
        }

        let canned = self.responses.lock().ok().and_then(|responses| {
            responses
                .iter()
                .find(|(prefix, _)| line.starts_with(prefix.as_str()))
                .map(|(_, result)| result.clone())
        });

        Ok(canned.unwrap_or_else(CommandResult::ok))
    }

    fn is_dry_run(&self) -> bool {
        true
    }
}

/// Runs host commands through an [`Executor`] and applies the failure policy
#[derive(Clone)]
pub struct CommandRunner {
    executor: Arc<dyn Executor>,
    verbose: bool,
}

impl fmt::Debug for CommandRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRunner")
            .field("dry_run", &self.executor.is_dry_run())
            .field("verbose", &self.verbose)
            .finish()
    }
}

impl CommandRunner {
    /// Build the runner for a runtime configuration
    pub fn from_config(config: &RuntimeConfig) -> Self {
        let executor: Arc<dyn Executor> = if config.dry_run {
            Arc::new(RecordingExecutor::new())
        } else {
            Arc::new(SystemExecutor)
        };
        Self::with_executor(executor, config.verbose)
    }

    /// Build a runner around a specific execution strategy
    pub fn with_executor(executor: Arc<dyn Executor>, verbose: bool) -> Self {
        Self { executor, verbose }
    }

    pub fn is_dry_run(&self) -> bool {
        self.executor.is_dry_run()
    }

    pub fn is_privileged(&self) -> bool {
        self.executor.is_privileged()
    }

    /// Run a command
    ///
    /// With `require_success` a non-zero exit becomes
    /// [`LifecycleError::Command`]; without it the result is returned for the
    /// caller to inspect.
    pub async fn run(
        &self,
        command: &HostCommand,
        require_success: bool,
        capture_output: bool,
    ) -> Result<CommandResult> {
        if self.executor.is_dry_run() {
            info!("[dry-run] Would run: {}", command);
        } else if self.verbose {
            info!("Running: {}", command);
        } else {
            debug!("Running: {}", command);
        }

        let result = self.executor.execute(command, capture_output).await?;

        if !result.success() {
            if require_success {
                error!(
                    "Command failed with exit code {:?}: {}",
                    result.exit_code, command
                );
                return Err(LifecycleError::Command {
                    command: command.to_string(),
                    code: result.exit_code,
                    stderr: result.stderr.clone(),
                });
            }
            debug!(
                "Command failed with exit code {:?} (ignored): {}",
                result.exit_code, command
            );
        }

        Ok(result)
    }

    /// Run a step that must succeed
    pub async fn run_required(&self, command: &HostCommand) -> Result<CommandResult> {
        self.run(command, true, false).await
    }

    /// Run a step that may fail (already exists / already gone)
    pub async fn run_tolerant(&self, command: &HostCommand) -> Result<CommandResult> {
        self.run(command, false, false).await
    }

    /// Run a step that must succeed and capture its output
    pub async fn capture(&self, command: &HostCommand) -> Result<CommandResult> {
        self.run(command, true, true).await
    }
}
