// src/status/tracker.rs

//! One full tracker pass: manifest + disk scan -> status table.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::config::{ConfigFile, DatasetLayout};
use crate::errors::Result;
use crate::fs::FileSystem;
use crate::index::{DatasetSnapshot, ScanOptions};
use crate::manifest::{Manifest, ManifestDiff};
use crate::pipeline::PipelineRegistry;
use crate::runs::{RunStatus, RunStore, RunTracker, StaleRunWarning};
use crate::status::compute::{compute, detect_regressions, PipelineColumn, Regression};
use crate::status::store::StatusStore;
use crate::status::table::StatusTable;
use crate::types::{Layer, PipelineKey, UnitId};

/// The latest attempt succeeded but no derivatives are on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inconsistency {
    pub unit: UnitId,
    pub pipeline: PipelineKey,
    pub attempt: u32,
}

impl fmt::Display for Inconsistency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: run {} attempt {} succeeded but no complete derivatives were found",
            self.unit, self.pipeline, self.attempt
        )
    }
}

/// Everything a pass found. Warnings are values; none of them abort a pass.
#[derive(Debug, Clone)]
pub struct PassReport {
    pub table: StatusTable,
    pub regressions: Vec<Regression>,
    pub inconsistencies: Vec<Inconsistency>,
    pub manifest_diff: ManifestDiff,
    /// Units removed from the manifest whose derivatives are still on disk.
    pub retired: Vec<UnitId>,
    /// Unit directories without a completion marker, per layer.
    pub incomplete: Vec<(Layer, UnitId)>,
    pub stale_runs: Vec<StaleRunWarning>,
    pub persisted: bool,
}

impl PassReport {
    pub fn has_warnings(&self) -> bool {
        !self.regressions.is_empty()
            || !self.inconsistencies.is_empty()
            || !self.retired.is_empty()
            || !self.stale_runs.is_empty()
    }
}

pub struct StatusTracker<'a> {
    fs: &'a dyn FileSystem,
    layout: DatasetLayout,
    options: ScanOptions,
    registry: &'a PipelineRegistry,
    stale_after: Duration,
}

impl<'a> StatusTracker<'a> {
    pub fn new(
        fs: &'a dyn FileSystem,
        layout: DatasetLayout,
        options: ScanOptions,
        registry: &'a PipelineRegistry,
        stale_after: Duration,
    ) -> Self {
        Self {
            fs,
            layout,
            options,
            registry,
            stale_after,
        }
    }

    pub fn from_config(
        fs: &'a dyn FileSystem,
        cfg: &ConfigFile,
        registry: &'a PipelineRegistry,
    ) -> Result<Self> {
        Ok(Self::new(
            fs,
            cfg.layout(),
            ScanOptions::from_config(&cfg.index)?,
            registry,
            cfg.runs.stale_after,
        ))
    }

    pub fn store(&self) -> StatusStore<'a> {
        StatusStore::new(self.fs, self.layout.status_file.clone())
    }

    fn runs(&self) -> RunTracker<'a> {
        RunTracker::new(RunStore::new(self.fs, self.layout.runs_dir.clone()))
    }

    /// Load the manifest and scan every layer.
    pub fn snapshot(&self) -> Result<DatasetSnapshot> {
        let manifest = Manifest::load(self.fs, &self.layout.manifest)?;
        DatasetSnapshot::capture(
            self.fs,
            &self.layout,
            &self.options,
            manifest,
            &self.registry.keys(),
        )
    }

    /// Recompute the status table from disk.
    ///
    /// A malformed manifest or status file aborts before anything is
    /// written. With `persist = false` nothing is written at all: stale runs
    /// are reported but keep their `running` status.
    pub fn run_pass(&self, now: DateTime<Utc>, persist: bool) -> Result<PassReport> {
        let snapshot = self.snapshot()?;
        let store = self.store();
        let previous = store.load()?;

        let table = compute(&snapshot, &PipelineColumn::from_registry(self.registry));

        let (regressions, manifest_diff) = match &previous {
            Some(prev) => (
                detect_regressions(prev, &table),
                Manifest::diff(&prev.units_as_manifest()?, &snapshot.manifest),
            ),
            None => (Vec::new(), ManifestDiff::default()),
        };
        let retired = manifest_diff.retired_with_derivatives(&snapshot);

        let runs = self.runs();
        let stale_runs = if persist {
            runs.reconcile_stale(now, self.stale_after)?
        } else {
            runs.stale_candidates(now, self.stale_after)?
        };
        let inconsistencies = self.find_inconsistencies(&runs, &snapshot)?;
        let incomplete = incomplete_units(&snapshot);

        if persist {
            store.save(&table)?;
        }

        info!(
            units = table.len(),
            pipelines = table.pipelines().len(),
            added = manifest_diff.added.len(),
            removed = manifest_diff.removed.len(),
            regressions = regressions.len(),
            inconsistencies = inconsistencies.len(),
            stale_runs = stale_runs.len(),
            persisted = persist,
            "status pass finished"
        );

        Ok(PassReport {
            table,
            regressions,
            inconsistencies,
            manifest_diff,
            retired,
            incomplete,
            stale_runs,
            persisted: persist,
        })
    }

    fn find_inconsistencies(
        &self,
        runs: &RunTracker<'_>,
        snapshot: &DatasetSnapshot,
    ) -> Result<Vec<Inconsistency>> {
        let mut found = Vec::new();
        for ((unit, pipeline), record) in runs.latest_attempts()? {
            if record.status != RunStatus::Succeeded || snapshot.manifest.get(&unit).is_none() {
                continue;
            }
            let Some(index) = snapshot.derivative(&pipeline) else {
                continue;
            };
            if !index.is_complete(&unit) {
                warn!(
                    unit = %unit,
                    pipeline = %pipeline,
                    attempt = record.attempt,
                    "run succeeded but derivatives are missing"
                );
                found.push(Inconsistency {
                    unit,
                    pipeline,
                    attempt: record.attempt,
                });
            }
        }
        Ok(found)
    }
}

fn incomplete_units(snapshot: &DatasetSnapshot) -> Vec<(Layer, UnitId)> {
    std::iter::once(&snapshot.source)
        .chain(std::iter::once(&snapshot.bids))
        .chain(snapshot.derivatives.values())
        .flat_map(|index| {
            index
                .incomplete_units()
                .map(move |unit| (index.layer().clone(), unit.clone()))
        })
        .collect()
}
