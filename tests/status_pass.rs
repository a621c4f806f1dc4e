// tests/status_pass.rs

mod common;

use bidstrack::errors::TrackerError;
use bidstrack::fs::FileSystem;
use bidstrack::status::{Stage, StatusTracker};
use bidstrack::types::{Layer, PipelineKey, UnitId};
use chrono::{TimeZone, Utc};
use common::builders::{DatasetFixture, ManifestBuilder};
use common::{init_tracing, two_unit_dataset, MRIQC};

fn unit(p: &str, s: &str) -> UnitId {
    UnitId::parse(p, s).unwrap()
}

fn mriqc() -> PipelineKey {
    PipelineKey::new(MRIQC.0, MRIQC.1)
}

fn now() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

fn status_file(ds: &DatasetFixture) -> std::path::PathBuf {
    ds.layout().status_file
}

#[test]
fn test_status_pass_reports_each_stage_per_unit() {
    init_tracing();
    let ds = two_unit_dataset();
    let cfg = ds.config();
    let registry = ds.registry();
    let tracker = StatusTracker::from_config(&ds.fs, &cfg, &registry).unwrap();

    let report = tracker.run_pass(now(), true).unwrap();
    let table = &report.table;
    assert_eq!(table.len(), 2);

    let first = table.get(&unit("01", "01")).unwrap();
    assert!(first.in_manifest);
    assert!(first.in_raw);
    assert!(first.in_bids);
    assert!(first.flag(&Stage::Processed(mriqc())));

    let second = table.get(&unit("02", "01")).unwrap();
    assert!(second.in_manifest);
    assert!(second.in_raw);
    assert!(!second.in_bids);
    assert!(!second.flag(&Stage::Processed(mriqc())));

    assert!(report.persisted);
    assert!(report.regressions.is_empty());
    assert!(ds.fs.is_file(&status_file(&ds)));
}

#[test]
fn test_status_pass_is_idempotent() {
    init_tracing();
    let ds = two_unit_dataset();
    let cfg = ds.config();
    let registry = ds.registry();
    let tracker = StatusTracker::from_config(&ds.fs, &cfg, &registry).unwrap();

    tracker.run_pass(now(), true).unwrap();
    let first = ds.fs.read_to_string(&status_file(&ds)).unwrap();

    let report = tracker.run_pass(now(), true).unwrap();
    let second = ds.fs.read_to_string(&status_file(&ds)).unwrap();

    assert_eq!(first, second);
    assert!(report.regressions.is_empty());
    assert!(report.manifest_diff.is_empty());
}

#[test]
fn test_dry_run_writes_nothing() {
    init_tracing();
    let ds = two_unit_dataset();
    let cfg = ds.config();
    let registry = ds.registry();
    let tracker = StatusTracker::from_config(&ds.fs, &cfg, &registry).unwrap();

    let report = tracker.run_pass(now(), false).unwrap();
    assert!(!report.persisted);
    assert_eq!(report.table.len(), 2);
    assert!(!ds.fs.exists(&status_file(&ds)));
}

#[test]
fn test_removed_bids_data_is_reported_as_regression() {
    init_tracing();
    let ds = two_unit_dataset();
    let cfg = ds.config();
    let registry = ds.registry();
    let tracker = StatusTracker::from_config(&ds.fs, &cfg, &registry).unwrap();
    tracker.run_pass(now(), true).unwrap();

    ds.remove_bids("01", "01");
    let report = tracker.run_pass(now(), true).unwrap();

    let record = report.table.get(&unit("01", "01")).unwrap();
    assert!(!record.in_bids);
    // Processing is gated on BIDS, so the pipeline column regresses too.
    assert!(!record.flag(&Stage::Processed(mriqc())));

    let stages: Vec<&Stage> = report
        .regressions
        .iter()
        .filter(|r| r.unit == unit("01", "01"))
        .map(|r| &r.stage)
        .collect();
    assert!(stages.contains(&&Stage::InBids));
    assert!(stages.contains(&&Stage::Processed(mriqc())));
}

#[test]
fn test_malformed_manifest_leaves_status_table_untouched() {
    init_tracing();
    let ds = two_unit_dataset();
    let cfg = ds.config();
    let registry = ds.registry();
    let tracker = StatusTracker::from_config(&ds.fs, &cfg, &registry).unwrap();
    tracker.run_pass(now(), true).unwrap();
    let before = ds.fs.read_to_string(&status_file(&ds)).unwrap();

    ds.write_manifest_text("participant_id\tsession_id\n01\t01\n01\t01\n");
    let err = tracker.run_pass(now(), true).unwrap_err();
    match err {
        TrackerError::Format { message, .. } => assert!(message.contains("duplicate unit")),
        other => panic!("Expected Format error, got: {:?}", other),
    }

    let after = ds.fs.read_to_string(&status_file(&ds)).unwrap();
    assert_eq!(before, after);
}

#[test]
fn test_unit_without_completion_marker_is_not_in_bids() {
    init_tracing();
    let mut ds = DatasetFixture::new();
    ds.write_manifest(ManifestBuilder::new().unit("01", "01", &["anat"]));
    ds.add_raw("01", "01");
    ds.add_partial_bids("01", "01", &["anat/sub-01_ses-01_T1w.nii.gz"]);
    ds.add_pipeline(
        MRIQC.0,
        MRIQC.1,
        &common::mriqc_descriptor(),
        common::mriqc_template(),
    );
    let cfg = ds.config();
    let registry = ds.registry();
    let tracker = StatusTracker::from_config(&ds.fs, &cfg, &registry).unwrap();

    let report = tracker.run_pass(now(), false).unwrap();
    assert!(!report.table.get(&unit("01", "01")).unwrap().in_bids);
    assert_eq!(report.incomplete, vec![(Layer::Bids, unit("01", "01"))]);
}

#[test]
fn test_missing_modality_keeps_unit_out_of_bids() {
    init_tracing();
    let mut ds = DatasetFixture::new();
    ds.write_manifest(ManifestBuilder::new().unit("01", "01", &["anat", "func"]));
    ds.add_raw("01", "01");
    ds.add_bids("01", "01", &["anat/sub-01_ses-01_T1w.nii.gz"]);
    ds.add_pipeline(
        MRIQC.0,
        MRIQC.1,
        &common::mriqc_descriptor(),
        common::mriqc_template(),
    );
    let cfg = ds.config();
    let registry = ds.registry();
    let tracker = StatusTracker::from_config(&ds.fs, &cfg, &registry).unwrap();

    let report = tracker.run_pass(now(), false).unwrap();
    assert!(!report.table.get(&unit("01", "01")).unwrap().in_bids);
}

#[test]
fn test_manifest_removal_with_derivatives_is_reported() {
    init_tracing();
    let ds = two_unit_dataset();
    let cfg = ds.config();
    let registry = ds.registry();
    let tracker = StatusTracker::from_config(&ds.fs, &cfg, &registry).unwrap();
    tracker.run_pass(now(), true).unwrap();

    ds.write_manifest(ManifestBuilder::new().unit("02", "01", &["anat"]));
    let report = tracker.run_pass(now(), true).unwrap();

    assert_eq!(report.manifest_diff.removed, vec![unit("01", "01")]);
    assert!(report.manifest_diff.added.is_empty());
    assert_eq!(report.retired, vec![unit("01", "01")]);
    assert!(report.table.get(&unit("01", "01")).is_none());
}
