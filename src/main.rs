// fcctl - Firecracker MicroVM Lifecycle CLI
//
// Thin command-line surface over the lifecycle library:
// - API channel activation and removal
// - Host networking (TAP, forwarding, NAT chains)
// - Foreground VM supervision and out-of-band stop
//
// Most commands need root; --dry-run reports what would run instead.

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use fcctl::config::{Overrides, RuntimeConfig};
use std::io::IsTerminal;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

#[cfg(target_os = "linux")]
use fcctl::vm::{Lifecycle, Liveness, ShutdownOutcome, SupervisionOutcome};

const DEFAULT_VM_CONFIG: &str = "vm-config.json";

/// fcctl: Firecracker MicroVM lifecycle manager
#[derive(Parser, Debug)]
#[command(name = "fcctl")]
#[command(version)]
#[command(about = "Set up, start and tear down a Firecracker MicroVM", long_about = None)]
#[command(after_help = "Examples:\n  \
    sudo fcctl net-up\n  \
    sudo fcctl start --config-file my-config.json\n  \
    sudo fcctl teardown")]
struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Report host commands instead of running them
    #[arg(long, global = true)]
    dry_run: bool,

    /// Runtime configuration file (TOML)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Firecracker API socket path
    #[arg(long, global = true, value_name = "PATH")]
    socket: Option<PathBuf>,

    /// TAP device name
    #[arg(long, global = true, value_name = "NAME")]
    tap: Option<String>,

    /// Host-side address of the TAP device
    #[arg(long, global = true, value_name = "ADDR")]
    host_ip: Option<Ipv4Addr>,

    /// Prefix length shared by host and guest addresses
    #[arg(long, global = true, value_name = "LEN")]
    prefix_len: Option<u8>,

    /// Guest address
    #[arg(long, global = true, value_name = "ADDR")]
    guest_ip: Option<Ipv4Addr>,

    /// Firecracker executable
    #[arg(long, global = true, value_name = "PATH")]
    firecracker_bin: Option<PathBuf>,

    /// Directory for the process registry, locks and patched configs
    #[arg(long, global = true, value_name = "PATH")]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create and activate the Firecracker API socket
    Activate,
    /// Deactivate and clean up the Firecracker API socket
    Deactivate,
    /// Set up networking for the Firecracker MicroVM
    NetUp,
    /// Clean up networking resources
    NetDown,
    /// Start the Firecracker MicroVM and supervise it until it exits
    Start {
        /// Path to the VM configuration file
        #[arg(long, default_value = DEFAULT_VM_CONFIG)]
        config_file: PathBuf,
    },
    /// Stop Firecracker instances bound to the API socket
    Stop,
    /// Attach to the running MicroVM's serial console
    Login,
    /// Set up everything and start the MicroVM (net-up + activate + start)
    Setup {
        /// Path to the VM configuration file
        #[arg(long, default_value = DEFAULT_VM_CONFIG)]
        config_file: PathBuf,
    },
    /// Stop the MicroVM and clean up all resources (stop + net-down + deactivate)
    Teardown,
    /// Print the guest-side network setup script
    GuestScript {
        /// Write the script to this file instead of stdout
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            socket_path: self.socket.clone(),
            tap_name: self.tap.clone(),
            host_ip: self.host_ip,
            prefix_len: self.prefix_len,
            guest_ip: self.guest_ip,
            firecracker_bin: self.firecracker_bin.clone(),
            state_dir: self.state_dir.clone(),
            verbose: self.verbose,
            dry_run: self.dry_run,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = RuntimeConfig::resolve(args.config.as_deref(), args.overrides())
        .context("Failed to load runtime configuration")?;

    init_tracing(&config)?;

    let Some(command) = args.command else {
        Args::command().print_help()?;
        return Ok(());
    };

    run(command, config).await
}

/// Initialize tracing on stderr so stdout stays clean for script output
fn init_tracing(config: &RuntimeConfig) -> Result<()> {
    let level = if config.verbose {
        Level::DEBUG
    } else {
        config.log_level()?
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_target(false);

    match config.logging.format.to_lowercase().as_str() {
        "json" => builder.json().init(),
        "pretty" => builder.pretty().init(),
        _ => builder.compact().init(),
    }
    Ok(())
}

#[cfg(target_os = "linux")]
async fn run(command: Commands, config: RuntimeConfig) -> Result<()> {
    if config.dry_run {
        info!("Dry-run: no host commands will be executed");
    }
    let lifecycle = Lifecycle::new(config);

    match command {
        Commands::Activate => lifecycle
            .channel()
            .activate()
            .await
            .context("Failed to activate API socket")?,
        Commands::Deactivate => lifecycle
            .channel()
            .deactivate()
            .await
            .context("Failed to deactivate API socket")?,
        Commands::NetUp => lifecycle
            .network()
            .setup()
            .await
            .context("Network setup failed")?,
        Commands::NetDown => lifecycle
            .network()
            .cleanup()
            .await
            .context("Network cleanup failed")?,
        Commands::Start { config_file } => {
            let outcome = lifecycle
                .start(&config_file, shutdown_signal())
                .await
                .with_context(|| format!("Failed to start MicroVM from {:?}", config_file))?;
            report(outcome);
        }
        Commands::Stop => {
            lifecycle
                .supervisor()
                .stop()
                .await
                .context("Failed to stop Firecracker")?;
        }
        Commands::Login => lifecycle.login().await.context("Login failed")?,
        Commands::Setup { config_file } => {
            let outcome = lifecycle
                .bring_up(&config_file, shutdown_signal())
                .await
                .context("Setup failed")?;
            report(outcome);
        }
        Commands::Teardown => lifecycle.tear_down().await.context("Teardown failed")?,
        Commands::GuestScript { output } => write_guest_script(&lifecycle.guest_script(), output.as_deref())?,
    }

    Ok(())
}

#[cfg(not(target_os = "linux"))]
async fn run(command: Commands, config: RuntimeConfig) -> Result<()> {
    let _ = (command, config);
    anyhow::bail!("fcctl manages Firecracker, which only runs on Linux")
}

#[cfg(target_os = "linux")]
fn report(outcome: Option<SupervisionOutcome>) {
    match outcome {
        None => {}
        Some(SupervisionOutcome::Exited(Liveness::ExitedWithError(code))) => {
            warn!("Firecracker exited with code {:?}", code)
        }
        Some(SupervisionOutcome::Exited(_)) => info!("Firecracker exited"),
        Some(SupervisionOutcome::Interrupted(ShutdownOutcome::Graceful)) => {
            info!("Firecracker shut down")
        }
        Some(SupervisionOutcome::Interrupted(ShutdownOutcome::ForceKilled)) => {
            warn!("Firecracker was killed after the grace period")
        }
    }
}

fn write_guest_script(script: &str, output: Option<&Path>) -> Result<()> {
    match output {
        Some(path) => {
            std::fs::write(path, script)
                .with_context(|| format!("Failed to write guest script to {:?}", path))?;
            set_executable(path)?;
            info!("Guest network script written to {:?}", path);
        }
        None => print!("{}", script),
    }
    Ok(())
}

#[cfg(unix)]
fn set_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .with_context(|| format!("Failed to mark {:?} executable", path))
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> Result<()> {
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
