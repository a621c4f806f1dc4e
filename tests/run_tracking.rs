// tests/run_tracking.rs

mod common;

use bidstrack::commands;
use bidstrack::errors::TrackerError;
use bidstrack::runs::{DispatchOutcome, FailureReason, RunKey, RunStatus, RunStore, RunTracker};
use bidstrack::status::StatusTracker;
use bidstrack::types::{PipelineKey, UnitId};
use chrono::{DateTime, Duration, TimeZone, Utc};
use common::{init_tracing, two_unit_dataset, MRIQC};

fn unit(p: &str, s: &str) -> UnitId {
    UnitId::parse(p, s).unwrap()
}

fn mriqc() -> PipelineKey {
    PipelineKey::new(MRIQC.0, MRIQC.1)
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap()
}

#[test]
fn test_dispatch_lifecycle() {
    init_tracing();
    let ds = two_unit_dataset();
    let layout = ds.layout();
    let tracker = RunTracker::new(RunStore::new(&ds.fs, layout.runs_dir));
    let u = unit("01", "01");

    let queued = tracker.dispatch(&u, &mriqc(), Some("abc"), false, t0()).unwrap();
    let DispatchOutcome::Queued(record) = queued else {
        panic!("expected a queued attempt, got {queued:?}");
    };
    assert_eq!(record.attempt, 1);
    assert_eq!(record.fingerprint.as_deref(), Some("abc"));

    let again = tracker.dispatch(&u, &mriqc(), Some("abc"), false, t0()).unwrap();
    assert!(matches!(again, DispatchOutcome::InFlight(ref r) if r.attempt == 1));

    let key = RunKey::new(u.clone(), mriqc(), 1);
    tracker.start(&key, t0()).unwrap();
    let done = tracker
        .complete(&key, 0, t0() + Duration::minutes(30))
        .unwrap();
    assert_eq!(done.status, RunStatus::Succeeded);
    assert_eq!(done.exit_code, Some(0));

    let skipped = tracker.dispatch(&u, &mriqc(), Some("abc"), false, t0()).unwrap();
    assert!(matches!(skipped, DispatchOutcome::AlreadySucceeded(_)));

    let forced = tracker.dispatch(&u, &mriqc(), Some("abc"), true, t0()).unwrap();
    assert_eq!(forced.record().attempt, 2);
    assert_eq!(forced.record().status, RunStatus::Queued);

    let attempts = tracker.store().attempts(&u, &mriqc()).unwrap();
    assert_eq!(attempts.len(), 2);
}

#[test]
fn test_failed_attempt_allows_redispatch() {
    init_tracing();
    let ds = two_unit_dataset();
    let tracker = RunTracker::new(RunStore::new(&ds.fs, ds.layout().runs_dir));
    let u = unit("02", "01");

    tracker.dispatch(&u, &mriqc(), None, false, t0()).unwrap();
    let key = RunKey::new(u.clone(), mriqc(), 1);
    tracker.start(&key, t0()).unwrap();
    let failed = tracker.complete(&key, 137, t0()).unwrap();
    assert_eq!(failed.status, RunStatus::Failed);
    assert_eq!(failed.failure, Some(FailureReason::Exit));

    let next = tracker.dispatch(&u, &mriqc(), None, false, t0()).unwrap();
    assert!(matches!(next, DispatchOutcome::Queued(ref r) if r.attempt == 2));
}

#[test]
fn test_completing_a_queued_attempt_is_rejected() {
    init_tracing();
    let ds = two_unit_dataset();
    let tracker = RunTracker::new(RunStore::new(&ds.fs, ds.layout().runs_dir));
    let u = unit("01", "01");

    tracker.dispatch(&u, &mriqc(), None, false, t0()).unwrap();
    let key = RunKey::new(u, mriqc(), 1);
    let err = tracker.complete(&key, 0, t0()).unwrap_err();
    match err {
        TrackerError::InvalidTransition { from, to, .. } => {
            assert_eq!(from, "queued");
            assert_eq!(to, "succeeded");
        }
        other => panic!("Expected InvalidTransition, got: {:?}", other),
    }
    assert_eq!(tracker.store().load(&key).unwrap().status, RunStatus::Queued);
}

#[test]
fn test_status_pass_reclassifies_stale_runs() {
    init_tracing();
    let ds = two_unit_dataset();
    let cfg = ds.config();
    let registry = ds.registry();
    let runs = RunTracker::new(RunStore::new(&ds.fs, cfg.layout().runs_dir));
    let u = unit("02", "01");
    let key = RunKey::new(u.clone(), mriqc(), 1);

    runs.dispatch(&u, &mriqc(), None, false, t0()).unwrap();
    runs.start(&key, t0()).unwrap();

    let status = StatusTracker::from_config(&ds.fs, &cfg, &registry).unwrap();

    // Within the default 24h threshold nothing changes.
    let report = status.run_pass(t0() + Duration::hours(23), true).unwrap();
    assert!(report.stale_runs.is_empty());

    // A dry run reports the stale run but leaves it running.
    let report = status.run_pass(t0() + Duration::hours(25), false).unwrap();
    assert_eq!(report.stale_runs.len(), 1);
    assert_eq!(report.stale_runs[0].key, key);
    assert_eq!(runs.store().load(&key).unwrap().status, RunStatus::Running);

    let mut out = Vec::new();
    commands::write_pass_report(&report, &mut out).unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(
        text.contains(&format!("would mark stale: run {key} running for 90000s")),
        "got:\n{text}"
    );

    let report = status.run_pass(t0() + Duration::hours(25), true).unwrap();
    assert_eq!(report.stale_runs.len(), 1);
    assert_eq!(report.stale_runs[0].key, key);

    let record = runs.store().load(&key).unwrap();
    assert_eq!(record.status, RunStatus::Failed);
    assert_eq!(record.failure, Some(FailureReason::Stale));
}

#[test]
fn test_succeeded_run_without_derivatives_is_inconsistent() {
    init_tracing();
    let ds = two_unit_dataset();
    let cfg = ds.config();
    let registry = ds.registry();
    let runs = RunTracker::new(RunStore::new(&ds.fs, cfg.layout().runs_dir));

    // sub-01 has derivatives on disk, sub-02 does not.
    for u in [unit("01", "01"), unit("02", "01")] {
        runs.dispatch(&u, &mriqc(), None, false, t0()).unwrap();
        let key = RunKey::new(u, mriqc(), 1);
        runs.start(&key, t0()).unwrap();
        runs.complete(&key, 0, t0()).unwrap();
    }

    let status = StatusTracker::from_config(&ds.fs, &cfg, &registry).unwrap();
    let report = status.run_pass(t0(), false).unwrap();

    assert_eq!(report.inconsistencies.len(), 1);
    assert_eq!(report.inconsistencies[0].unit, unit("02", "01"));
    assert_eq!(report.inconsistencies[0].pipeline, mriqc());
    assert!(report.has_warnings());
}
