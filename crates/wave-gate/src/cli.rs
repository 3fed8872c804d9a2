//! Command-line definitions

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Gate validation, dispatch and recovery for multi-participant waves
#[derive(Parser, Debug)]
#[command(name = "wave-gate")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// Project root (default: current directory)
    #[arg(long, global = true, env = "WAVE_PROJECT_ROOT", value_name = "DIR")]
    pub project: Option<PathBuf>,

    /// Shared signals directory (overrides WAVE_SIGNALS_DIR and the config file)
    #[arg(long, global = true, value_name = "DIR")]
    pub signals_dir: Option<PathBuf>,

    /// Wave number
    #[arg(long, short = 'w', global = true, default_value_t = 1)]
    pub wave: u32,

    /// Participant name
    #[arg(long, short = 'p', global = true)]
    pub participant: Option<String>,

    /// Report what would happen without writing signals, locks or files
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Machine-readable output on stdout
    #[arg(long, global = true)]
    pub json: bool,

    /// Retry limit per story or gate (overrides WAVE_RETRY_LIMIT)
    #[arg(long, global = true)]
    pub retry_limit: Option<u32>,

    /// Budget limit (overrides WAVE_BUDGET_LIMIT)
    #[arg(long, global = true, value_name = "AMOUNT")]
    pub budget_limit: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a validator
    Validate {
        #[command(subcommand)]
        target: ValidateTarget,
    },

    /// Assign the wave's work items to participants
    Dispatch,

    /// Gate status and waiting
    Gate {
        #[command(subcommand)]
        command: GateCommand,
    },

    /// Project-state snapshots
    Snapshot {
        #[command(subcommand)]
        command: SnapshotCommand,
    },

    /// Restore the project state from a snapshot
    Restore {
        /// `latest`, a checkpoint label, or a snapshot file
        #[arg(default_value = "latest")]
        selector: String,

        /// Skip the backup of the current state
        #[arg(long)]
        no_backup: bool,
    },

    /// Wave summary: gates, budget, retries, violations, work items
    Report,

    /// Trip the kill switch (global unless --participant is given)
    Kill {
        #[arg(long, default_value = "manual stop")]
        reason: String,
    },

    /// Clear the kill switch (global unless --participant is given)
    Resume,

    /// Record a retry for a story id or `gate:N`
    Retry {
        target: String,
    },

    /// Publish, await or list raw signals
    Signal {
        #[command(subcommand)]
        command: SignalCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum ValidateTarget {
    /// Pre-flight checks before dispatch (GO / CONDITIONAL-GO / NO-GO)
    Preflight {
        /// Story directory (default: configured per-wave stories dir)
        #[arg(long, value_name = "DIR")]
        stories: Option<PathBuf>,

        /// Reference document for requirement coverage
        #[arg(long, value_name = "FILE")]
        reference: Option<PathBuf>,

        /// Only compare the stored decision lock with the current work items
        #[arg(long)]
        verify_lock: bool,
    },

    /// Wave completion checks before merge (APPROVED / REJECTED)
    Premerge {
        /// Build/test log directory (default: configured per-wave logs dir)
        #[arg(long, value_name = "DIR")]
        logs: Option<PathBuf>,

        #[arg(long)]
        min_completions: Option<usize>,
    },

    /// Domain boundary check for one participant (or every worker)
    Boundary {
        /// Check every worker in the roster
        #[arg(long, conflicts_with = "files")]
        all: bool,

        /// Git ref to diff the workspace against
        #[arg(long, default_value = "HEAD")]
        baseline: String,

        /// Compare against a baseline directory instead of git
        #[arg(long, value_name = "DIR")]
        baseline_dir: Option<PathBuf>,

        /// Explicit changed files instead of computing a diff
        #[arg(long, num_args = 1..)]
        files: Vec<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum GateCommand {
    /// Status of every gate
    Status,

    /// Wait until a gate is ready
    Await {
        /// Gate number or name
        gate: String,

        /// Seconds before giving up (default: configured await timeout)
        #[arg(long)]
        timeout: Option<u64>,
    },
}

#[derive(Subcommand, Debug)]
pub enum SnapshotCommand {
    /// Snapshot the current project state
    Create { checkpoint: String },

    /// List snapshots for the wave, newest first
    List,

    /// Delete all but the newest snapshots
    Prune {
        #[arg(long)]
        keep: Option<usize>,
    },
}

#[derive(Subcommand, Debug)]
pub enum SignalCommand {
    /// Publish a signal as --participant
    Publish {
        event: String,

        /// JSON payload
        #[arg(long, default_value = "{}")]
        payload: String,
    },

    /// Wait for a signal matching a pattern
    Await {
        /// Glob over `participant.event`
        pattern: String,

        #[arg(long)]
        timeout: Option<u64>,
    },

    /// List signals matching a pattern
    List {
        #[arg(default_value = "*")]
        pattern: String,
    },
}
