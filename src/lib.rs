// src/lib.rs

pub mod cli;
pub mod commands;
pub mod config;
pub mod errors;
pub mod fs;
pub mod index;
pub mod invocation;
pub mod logging;
pub mod manifest;
pub mod pipeline;
pub mod runs;
pub mod status;
pub mod types;

use anyhow::Result;
use tracing::debug;

use crate::cli::{CliArgs, Command};
use crate::commands::Workspace;
use crate::fs::RealFileSystem;

/// High-level entry point used by `main.rs`.
///
/// Loads the config, registers every pipeline, then runs one subcommand.
pub fn run(args: CliArgs) -> Result<()> {
    let fs = RealFileSystem;
    let ws = Workspace::load(&fs, &args.config)?;
    debug!(config = %args.config.display(), pipelines = ws.registry.len(), "workspace loaded");

    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    match &args.command {
        Command::Status { dry_run } => commands::status(&ws, *dry_run, &mut out),
        Command::Build(build) => commands::build(&ws, build, &mut out),
        Command::Runs(runs) => commands::runs(&ws, runs, &mut out),
        Command::Check => commands::check(&ws, &mut out),
    }
}
