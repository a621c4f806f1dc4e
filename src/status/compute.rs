// src/status/compute.rs

//! Pure status computation from a [`DatasetSnapshot`].

use std::collections::BTreeMap;
use std::fmt;

use tracing::{debug, warn};

use crate::index::DatasetSnapshot;
use crate::manifest::ManifestEntry;
use crate::pipeline::PipelineRegistry;
use crate::status::table::{Stage, StatusRecord, StatusTable};
use crate::types::{PipelineKey, UnitId};

/// A pipeline column: which pipeline, and which upstream it waits for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineColumn {
    pub key: PipelineKey,
    pub depends_on: Option<PipelineKey>,
}

impl PipelineColumn {
    pub fn new(key: PipelineKey) -> Self {
        Self {
            key,
            depends_on: None,
        }
    }

    pub fn depends_on(mut self, upstream: PipelineKey) -> Self {
        self.depends_on = Some(upstream);
        self
    }

    /// Registry pipelines, dependencies first.
    pub fn from_registry(registry: &PipelineRegistry) -> Vec<Self> {
        registry
            .iter()
            .map(|p| Self {
                key: p.key().clone(),
                depends_on: p.depends_on().cloned(),
            })
            .collect()
    }
}

/// Compute the status table for every manifest unit.
///
/// Stage predicates are evaluated in order and evaluation stops at the first
/// false one, so a flag can only be true when the flag before it is.
/// `pipelines` must list upstream pipelines before their dependents.
pub fn compute(snapshot: &DatasetSnapshot, pipelines: &[PipelineColumn]) -> StatusTable {
    let records = snapshot
        .manifest
        .entries()
        .iter()
        .map(|entry| compute_record(snapshot, entry, pipelines))
        .collect();

    StatusTable::new(pipelines.iter().map(|p| p.key.clone()).collect(), records)
}

fn compute_record(
    snapshot: &DatasetSnapshot,
    entry: &ManifestEntry,
    pipelines: &[PipelineColumn],
) -> StatusRecord {
    let unit = &entry.unit;
    let mut record = StatusRecord::unknown(unit.clone());
    for column in pipelines {
        record.processed.insert(column.key.clone(), false);
    }

    record.in_manifest = true;

    record.in_raw = snapshot.source.is_complete(unit);
    if !record.in_raw {
        return record;
    }

    record.in_bids = bids_ready(snapshot, entry);
    if !record.in_bids {
        return record;
    }

    for column in pipelines {
        let upstream_ok = column
            .depends_on
            .as_ref()
            .is_none_or(|up| record.processed.get(up).copied().unwrap_or(false));
        let done = upstream_ok
            && snapshot
                .derivative(&column.key)
                .is_some_and(|index| index.is_complete(unit));
        record.processed.insert(column.key.clone(), done);
    }

    record
}

/// Complete in the BIDS layer and every manifest modality present.
fn bids_ready(snapshot: &DatasetSnapshot, entry: &ManifestEntry) -> bool {
    let Some(facts) = snapshot.bids.get(&entry.unit) else {
        return false;
    };
    if !facts.complete {
        return false;
    }
    let missing: Vec<&String> = entry
        .modalities
        .iter()
        .filter(|m| !facts.groups.contains(*m))
        .collect();
    if !missing.is_empty() {
        debug!(unit = %entry.unit, ?missing, "BIDS data present but modalities missing");
        return false;
    }
    true
}

/// A flag that was true in the previous table and is false now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Regression {
    pub unit: UnitId,
    pub stage: Stage,
}

impl fmt::Display for Regression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} was true, is now false", self.unit, self.stage)
    }
}

/// Compare two tables. Only units and columns present in both are
/// compared; units leaving the manifest are a manifest-diff concern.
pub fn detect_regressions(previous: &StatusTable, current: &StatusTable) -> Vec<Regression> {
    let previous_by_unit: BTreeMap<&UnitId, &StatusRecord> =
        previous.records().iter().map(|r| (&r.unit, r)).collect();
    let previous_columns = previous.columns();
    let shared: Vec<Stage> = current
        .columns()
        .into_iter()
        .filter(|c| previous_columns.contains(c))
        .collect();

    let mut regressions = Vec::new();
    for record in current.records() {
        let Some(before) = previous_by_unit.get(&record.unit) else {
            continue;
        };
        for stage in &shared {
            if before.flag(stage) && !record.flag(stage) {
                warn!(unit = %record.unit, column = %stage, "status regression");
                regressions.push(Regression {
                    unit: record.unit.clone(),
                    stage: stage.clone(),
                });
            }
        }
    }
    regressions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{DatasetIndex, UnitFacts};
    use crate::manifest::Manifest;
    use crate::types::Layer;
    use std::collections::BTreeSet;
    use std::path::PathBuf;

    fn unit(p: &str) -> UnitId {
        UnitId::parse(p, "01").unwrap()
    }

    fn facts(complete: bool, groups: &[&str]) -> UnitFacts {
        UnitFacts {
            dir: PathBuf::from("/x"),
            complete,
            groups: groups.iter().map(|g| g.to_string()).collect::<BTreeSet<_>>(),
        }
    }

    fn snapshot(entries: Vec<ManifestEntry>) -> DatasetSnapshot {
        DatasetSnapshot {
            manifest: Manifest::from_entries(entries).unwrap(),
            source: DatasetIndex::empty(Layer::Source, "/raw"),
            bids: DatasetIndex::empty(Layer::Bids, "/bids"),
            derivatives: BTreeMap::new(),
        }
    }

    #[test]
    fn incomplete_source_stops_evaluation() {
        let mut snap = snapshot(vec![ManifestEntry::new(unit("01"), Vec::<String>::new())]);
        snap.source.insert(unit("01"), facts(false, &[]));
        snap.bids.insert(unit("01"), facts(true, &[]));

        let table = compute(&snap, &[]);
        let r = table.get(&unit("01")).unwrap();
        assert!(r.in_manifest);
        assert!(!r.in_raw);
        assert!(!r.in_bids, "in_bids must not be evaluated when in_raw is false");
    }

    #[test]
    fn bids_requires_every_manifest_modality() {
        let mut snap = snapshot(vec![ManifestEntry::new(unit("01"), ["T1w", "bold"])]);
        snap.source.insert(unit("01"), facts(true, &[]));
        snap.bids.insert(unit("01"), facts(true, &["anat", "T1w"]));
        assert!(!compute(&snap, &[]).records()[0].in_bids);

        snap.bids.insert(unit("01"), facts(true, &["anat", "T1w", "func", "bold"]));
        assert!(compute(&snap, &[]).records()[0].in_bids);
    }

    #[test]
    fn dependent_pipeline_waits_for_upstream() {
        let up = PipelineKey::new("fmriprep", "23.1.3");
        let down = PipelineKey::new("extract", "0.1.0");
        let columns = vec![
            PipelineColumn::new(up.clone()),
            PipelineColumn::new(down.clone()).depends_on(up.clone()),
        ];

        let mut snap = snapshot(vec![ManifestEntry::new(unit("01"), Vec::<String>::new())]);
        snap.source.insert(unit("01"), facts(true, &[]));
        snap.bids.insert(unit("01"), facts(true, &[]));
        let mut down_index = DatasetIndex::empty(Layer::Derivative(down.clone()), "/d");
        down_index.insert(unit("01"), facts(true, &[]));
        snap.derivatives.insert(down.clone(), down_index);
        snap.derivatives
            .insert(up.clone(), DatasetIndex::empty(Layer::Derivative(up.clone()), "/u"));

        let table = compute(&snap, &columns);
        let r = &table.records()[0];
        assert!(!r.flag(&Stage::Processed(up.clone())));
        assert!(!r.flag(&Stage::Processed(down.clone())));

        let mut up_index = DatasetIndex::empty(Layer::Derivative(up.clone()), "/u");
        up_index.insert(unit("01"), facts(true, &[]));
        snap.derivatives.insert(up.clone(), up_index);
        let table = compute(&snap, &columns);
        assert!(table.records()[0].flag(&Stage::Processed(down)));
    }

    #[test]
    fn regressions_ignore_new_units_and_dropped_columns() {
        let key = PipelineKey::new("mriqc", "1");
        let mut before = StatusRecord::unknown(unit("01"));
        before.in_manifest = true;
        before.in_raw = true;
        before.in_bids = true;
        before.processed.insert(key.clone(), true);
        let previous = StatusTable::new(vec![key], vec![before]);

        let mut now = StatusRecord::unknown(unit("01"));
        now.in_manifest = true;
        now.in_raw = true;
        let fresh = StatusRecord::unknown(unit("02"));
        let current = StatusTable::new(vec![], vec![now, fresh]);

        let regressions = detect_regressions(&previous, &current);
        assert_eq!(
            regressions,
            vec![Regression {
                unit: unit("01"),
                stage: Stage::InBids
            }]
        );
    }
}
