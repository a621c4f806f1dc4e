// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

/// Command-line arguments for `bidstrack`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "bidstrack",
    version,
    about = "Track processing status of BIDS datasets and build pipeline invocations.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the dataset config file (TOML).
    ///
    /// Default: `bidstrack.toml` in the current working directory.
    #[arg(
        long,
        global = true,
        value_name = "PATH",
        default_value_os_t = crate::config::default_config_path()
    )]
    pub config: PathBuf,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `BIDSTRACK_LOG` or a default level will be used.
    #[arg(long, global = true, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Recompute the status table from the manifest and the files on disk.
    Status {
        /// Compute and report, but write nothing.
        #[arg(long)]
        dry_run: bool,
    },

    /// Build invocations for one pipeline.
    Build(BuildArgs),

    /// Record and inspect run attempts.
    #[command(subcommand)]
    Runs(RunsCommand),

    /// Load the config, register every pipeline and print the registry.
    Check,
}

#[derive(Debug, Clone, Args)]
pub struct PipelineSelector {
    /// Pipeline name.
    #[arg(long, value_name = "NAME")]
    pub pipeline: String,

    /// Pipeline version. Defaults to the highest registered version.
    #[arg(long = "pipeline-version", id = "pipeline_version", value_name = "VERSION")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Args)]
pub struct BuildArgs {
    #[command(flatten)]
    pub pipeline: PipelineSelector,

    /// Restrict to these participants (repeatable).
    #[arg(long, value_name = "LABEL")]
    pub participant: Vec<String>,

    /// Restrict to these sessions (repeatable).
    #[arg(long, value_name = "LABEL")]
    pub session: Vec<String>,

    /// Parameter override `key=value`; the value is parsed as JSON if it can be.
    #[arg(long = "set", value_name = "KEY=VALUE")]
    pub overrides: Vec<String>,

    /// Build every manifest unit, not only those in BIDS and not yet processed.
    #[arg(long)]
    pub all: bool,

    /// Print invocations as JSON instead of command lines.
    #[arg(long)]
    pub json: bool,
}

/// Identifies one unit for one pipeline.
#[derive(Debug, Clone, Args)]
pub struct UnitSelector {
    #[command(flatten)]
    pub pipeline: PipelineSelector,

    #[arg(long, value_name = "LABEL")]
    pub participant: String,

    #[arg(long, value_name = "LABEL")]
    pub session: String,
}

/// Identifies one attempt; the latest one when `--attempt` is omitted.
#[derive(Debug, Clone, Args)]
pub struct AttemptSelector {
    #[command(flatten)]
    pub unit: UnitSelector,

    #[arg(long, value_name = "N")]
    pub attempt: Option<u32>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum RunsCommand {
    /// Queue a new attempt unless one already succeeded or is in flight.
    Dispatch {
        #[command(flatten)]
        unit: UnitSelector,

        /// Queue a new attempt even if the latest one succeeded.
        #[arg(long)]
        force: bool,

        #[arg(long = "set", value_name = "KEY=VALUE")]
        overrides: Vec<String>,
    },

    /// Mark a queued attempt as running.
    Start(AttemptSelector),

    /// Record the exit code of a running attempt.
    Complete {
        #[command(flatten)]
        attempt: AttemptSelector,

        #[arg(long, value_name = "CODE")]
        exit_code: i32,
    },

    /// Record a dispatcher error for a queued or running attempt.
    Fail {
        #[command(flatten)]
        attempt: AttemptSelector,

        #[arg(long, value_name = "TEXT")]
        message: String,
    },

    /// Reclassify running attempts older than the threshold as failed.
    Reconcile {
        /// Overrides `[runs] stale_after`, e.g. `6h`.
        #[arg(long, value_name = "DURATION")]
        stale_after: Option<String>,
    },

    /// List run attempts.
    List {
        #[arg(long, value_name = "NAME")]
        pipeline: Option<String>,
    },
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
