// src/commands.rs

//! Subcommand implementations. Each prints results to stdout; diagnostics
//! go through `tracing` to stderr.

use std::collections::BTreeMap;
use std::io::Write;

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info};

use crate::cli::{AttemptSelector, BuildArgs, PipelineSelector, RunsCommand, UnitSelector};
use crate::config::ConfigFile;
use crate::fs::FileSystem;
use crate::invocation::{parse_overrides, InvocationBuilder, InvocationSpec};
use crate::pipeline::{PipelineConfig, PipelineRegistry};
use crate::runs::{DispatchOutcome, RunKey, RunRecord, RunStore, RunTracker};
use crate::status::{compute, PassReport, PipelineColumn, Stage, StatusTracker};
use crate::types::{parse_duration, ParticipantId, SessionId, UnitId};

/// Everything a command needs: filesystem, validated config and registry.
pub struct Workspace<'a> {
    pub fs: &'a dyn FileSystem,
    pub config: ConfigFile,
    pub registry: PipelineRegistry,
}

impl<'a> Workspace<'a> {
    pub fn load(fs: &'a dyn FileSystem, config_path: &std::path::Path) -> Result<Self> {
        let config = crate::config::load_and_validate(fs, config_path)
            .with_context(|| format!("loading config {}", config_path.display()))?;
        let registry = PipelineRegistry::from_config(fs, &config)?;
        Ok(Self {
            fs,
            config,
            registry,
        })
    }

    fn pipeline(&self, selector: &PipelineSelector) -> Result<&PipelineConfig> {
        Ok(self
            .registry
            .resolve(&selector.pipeline, selector.version.as_deref())?)
    }

    fn status_tracker(&self) -> Result<StatusTracker<'_>> {
        Ok(StatusTracker::from_config(self.fs, &self.config, &self.registry)?)
    }

    fn run_tracker(&self) -> RunTracker<'_> {
        RunTracker::new(RunStore::new(self.fs, self.config.layout().runs_dir))
    }

    fn builder(&self) -> InvocationBuilder<'_> {
        InvocationBuilder::from_config(self.fs, &self.config)
    }
}

pub fn status(ws: &Workspace<'_>, dry_run: bool, out: &mut dyn Write) -> Result<()> {
    let report = ws.status_tracker()?.run_pass(Utc::now(), !dry_run)?;
    write_pass_report(&report, out)?;
    Ok(())
}

pub fn write_pass_report(report: &PassReport, out: &mut dyn Write) -> Result<()> {
    let table = &report.table;
    writeln!(out, "units: {}", table.len())?;
    for stage in table.columns() {
        writeln!(out, "  {:<40} {}", stage.column_name(), table.count(&stage))?;
    }

    if !report.manifest_diff.is_empty() {
        writeln!(
            out,
            "manifest: {} added, {} removed",
            report.manifest_diff.added.len(),
            report.manifest_diff.removed.len()
        )?;
    }
    for unit in &report.retired {
        writeln!(out, "retired with derivatives: {unit}")?;
    }
    for regression in &report.regressions {
        writeln!(out, "regression: {regression}")?;
    }
    for inconsistency in &report.inconsistencies {
        writeln!(out, "inconsistency: {inconsistency}")?;
    }
    for stale in &report.stale_runs {
        if report.persisted {
            writeln!(out, "stale: {stale}")?;
        } else {
            writeln!(
                out,
                "would mark stale: run {} running for {}s since {}",
                stale.key,
                stale.age.as_secs(),
                stale.started_at.to_rfc3339()
            )?;
        }
    }
    if !report.incomplete.is_empty() {
        writeln!(out, "incomplete unit directories: {}", report.incomplete.len())?;
    }
    if !report.persisted {
        writeln!(out, "(dry run: status table not written)")?;
    }
    Ok(())
}

/// Units to build: explicit filters, then either every manifest unit or
/// only those in BIDS and not yet processed by `config`.
fn select_units(ws: &Workspace<'_>, config: &PipelineConfig, args: &BuildArgs) -> Result<Vec<UnitId>> {
    let participants = args
        .participant
        .iter()
        .map(|p| p.parse::<ParticipantId>().map_err(|e| anyhow!(e)))
        .collect::<Result<Vec<_>>>()?;
    let sessions = args
        .session
        .iter()
        .map(|s| s.parse::<SessionId>().map_err(|e| anyhow!(e)))
        .collect::<Result<Vec<_>>>()?;

    let snapshot = ws.status_tracker()?.snapshot()?;
    let table = compute(&snapshot, &PipelineColumn::from_registry(&ws.registry));
    let processed = Stage::Processed(config.key().clone());

    let units: Vec<UnitId> = table
        .records()
        .iter()
        .filter(|r| participants.is_empty() || participants.contains(&r.unit.participant))
        .filter(|r| sessions.is_empty() || sessions.contains(&r.unit.session))
        .filter(|r| args.all || (r.in_bids && !r.flag(&processed)))
        .map(|r| r.unit.clone())
        .collect();

    debug!(pipeline = %config.key(), units = units.len(), all = args.all, "selected units");
    Ok(units)
}

pub fn build(ws: &Workspace<'_>, args: &BuildArgs, out: &mut dyn Write) -> Result<()> {
    let config = ws.pipeline(&args.pipeline)?;
    let overrides = parse_overrides(&args.overrides)?;
    let units = select_units(ws, config, args)?;

    let report = ws.builder().build_batch(&units, config, &overrides)?;

    if args.json {
        writeln!(out, "{}", serde_json::to_string_pretty(&report.specs)?)?;
    } else {
        for spec in &report.specs {
            writeln!(out, "{}", render_spec(spec))?;
        }
    }

    if !report.is_success() {
        eprintln!("{}", report.summary());
        bail!("{} unit(s) failed to build", report.failures.len());
    }
    info!(pipeline = %config.key(), built = report.specs.len(), "build finished");
    Ok(())
}

fn render_spec(spec: &InvocationSpec) -> String {
    format!("{}\t{}", spec.unit(), spec.command_line())
}

fn unit_of(selector: &UnitSelector) -> Result<UnitId> {
    UnitId::parse(&selector.participant, &selector.session).map_err(|e| anyhow!(e))
}

fn attempt_key(ws: &Workspace<'_>, selector: &AttemptSelector) -> Result<RunKey> {
    let config = ws.pipeline(&selector.unit.pipeline)?;
    let unit = unit_of(&selector.unit)?;
    let attempt = match selector.attempt {
        Some(n) => n,
        None => ws
            .run_tracker()
            .latest(&unit, config.key())?
            .map(|r| r.attempt)
            .ok_or_else(|| anyhow!("no attempts recorded for {unit} {}", config.key()))?,
    };
    Ok(RunKey::new(unit, config.key().clone(), attempt))
}

pub fn runs(ws: &Workspace<'_>, command: &RunsCommand, out: &mut dyn Write) -> Result<()> {
    let tracker = ws.run_tracker();
    let now = Utc::now();

    match command {
        RunsCommand::Dispatch {
            unit,
            force,
            overrides,
        } => {
            let config = ws.pipeline(&unit.pipeline)?;
            let unit_id = unit_of(unit)?;
            let overrides: BTreeMap<String, Value> = parse_overrides(overrides)?;
            let spec = ws
                .builder()
                .build(&unit_id, config, &overrides)
                .map_err(crate::errors::TrackerError::from)?;

            match tracker.dispatch(&unit_id, config.key(), Some(spec.fingerprint()), *force, now)? {
                DispatchOutcome::Queued(record) => {
                    writeln!(out, "queued {}", record.key())?;
                    writeln!(out, "{}", spec.command_line())?;
                }
                DispatchOutcome::AlreadySucceeded(record) => {
                    writeln!(out, "already succeeded: {} (use --force to re-run)", record.key())?;
                }
                DispatchOutcome::InFlight(record) => {
                    writeln!(out, "in flight: {} is {}", record.key(), record.status)?;
                }
            }
        }
        RunsCommand::Start(selector) => {
            let record = tracker.start(&attempt_key(ws, selector)?, now)?;
            write_record(&record, out)?;
        }
        RunsCommand::Complete { attempt, exit_code } => {
            let record = tracker.complete(&attempt_key(ws, attempt)?, *exit_code, now)?;
            write_record(&record, out)?;
        }
        RunsCommand::Fail { attempt, message } => {
            let record = tracker.fail(&attempt_key(ws, attempt)?, message, now)?;
            write_record(&record, out)?;
        }
        RunsCommand::Reconcile { stale_after } => {
            let threshold = match stale_after {
                Some(raw) => parse_duration(raw).map_err(|e| anyhow!(e))?,
                None => ws.config.runs.stale_after,
            };
            let warnings = tracker.reconcile_stale(now, threshold)?;
            for warning in &warnings {
                writeln!(out, "stale: {warning}")?;
            }
            writeln!(out, "{} stale run(s) reclassified", warnings.len())?;
        }
        RunsCommand::List { pipeline } => {
            for record in tracker.list(pipeline.as_deref())? {
                write_record(&record, out)?;
            }
        }
    }
    Ok(())
}

fn write_record(record: &RunRecord, out: &mut dyn Write) -> Result<()> {
    let mut line = format!("{}\t{}", record.key(), record.status);
    if let Some(reason) = record.failure {
        line.push_str(&format!("\t{reason}"));
    }
    if let Some(code) = record.exit_code {
        line.push_str(&format!("\texit={code}"));
    }
    writeln!(out, "{line}")?;
    Ok(())
}

pub fn check(ws: &Workspace<'_>, out: &mut dyn Write) -> Result<()> {
    let layout = ws.config.layout();
    writeln!(out, "dataset root: {}", layout.root.display())?;
    writeln!(out, "pipelines ({}):", ws.registry.len())?;
    for pipeline in ws.registry.iter() {
        writeln!(out, "  - {}", pipeline.key())?;
        writeln!(out, "      container: {}", pipeline.container().display())?;
        writeln!(out, "      parameters: {}", pipeline.descriptor().params().len())?;
        if let Some(dep) = pipeline.depends_on() {
            writeln!(out, "      depends_on: {dep}")?;
        }
    }
    Ok(())
}
