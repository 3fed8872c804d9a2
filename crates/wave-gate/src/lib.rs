//! `wave-gate` command-line front end
//!
//! Thin layer over the `coordination` crate: clap parses the invocation,
//! [`config::Context`] resolves paths and limits, and each verb in
//! [`commands`] returns an [`commands::Output`] that `main` renders.

pub mod cli;
pub mod commands;
pub mod config;

use cli::{Cli, Command};
use commands::Output;
use config::Context;

/// Execute one parsed invocation
pub async fn run(cli: Cli) -> anyhow::Result<Output> {
    let ctx = Context::resolve(&cli.global)?;
    match cli.command {
        Command::Validate { target } => commands::validate(&ctx, target),
        Command::Dispatch => commands::dispatch(&ctx),
        Command::Gate { command } => commands::gate(&ctx, command).await,
        Command::Snapshot { command } => commands::snapshot(&ctx, command),
        Command::Restore {
            selector,
            no_backup,
        } => commands::restore(&ctx, &selector, no_backup),
        Command::Report => commands::report(&ctx),
        Command::Kill { reason } => commands::kill(&ctx, &reason),
        Command::Resume => commands::resume(&ctx),
        Command::Retry { target } => commands::retry(&ctx, &target),
        Command::Signal { command } => commands::signal(&ctx, command).await,
    }
}
