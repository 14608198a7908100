// CLI subcommand dispatch.

use std::future::Future;

use anyhow::{Context, Result};
use clap::Subcommand;

use crate::output::OutputFormat;

pub mod activation;
pub mod open;
pub mod rekey;
pub mod release;
pub mod status;
pub mod tasks;

#[derive(Subcommand)]
pub enum Command {
    /// Show agent runtimes, claims and armed tasks
    Status(status::StatusArgs),
    /// Open a session in a tab, starting its agent runtime if needed
    Open(open::OpenArgs),
    /// Drop an owner's claim on a session
    Release(release::ReleaseArgs),
    /// Show where a session is currently open
    Activation(activation::ActivationArgs),
    /// Move a placeholder session to its confirmed id
    Rekey(rekey::RekeyArgs),
    /// Manage recurring scheduled tasks
    #[command(subcommand)]
    Tasks(tasks::TasksCommand),
}

pub fn run(cmd: Command, format: OutputFormat) -> Result<()> {
    match cmd {
        Command::Status(args) => status::run(args, format),
        Command::Open(args) => open::run(args, format),
        Command::Release(args) => release::run(args, format),
        Command::Activation(args) => activation::run(args, format),
        Command::Rekey(args) => rekey::run(args, format),
        Command::Tasks(command) => tasks::run(command, format),
    }
}

/// Drive one async command body on a fresh current-thread runtime.
pub(crate) fn block_on<F: Future>(future: F) -> Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    Ok(runtime.block_on(future))
}
