//! Host Command Execution
//!
//! Lifecycle steps never call `std::process::Command` directly; they describe
//! a [`HostCommand`] and hand it to a [`CommandRunner`].
//!
//! # Example
//!
//! ```no_run
//! use fcctl::tools::{CommandRunner, HostCommand, SystemExecutor};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> fcctl::Result<()> {
//!     let runner = CommandRunner::with_executor(Arc::new(SystemExecutor), true);
//!
//!     let routes = runner.capture(&HostCommand::new("ip").arg("route")).await?;
//!     println!("{}", routes.stdout_str());
//!
//!     Ok(())
//! }
//! ```

mod executor;

pub use executor::{
    CommandResult, CommandRunner, Executor, HostCommand, RecordingExecutor, SystemExecutor,
};
