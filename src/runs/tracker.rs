// src/runs/tracker.rs

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use anyhow::anyhow;
use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, info, warn};

use crate::errors::{Result, TrackerError};
use crate::runs::record::{FailureReason, RunKey, RunRecord, RunStatus};
use crate::runs::store::RunStore;
use crate::types::{PipelineKey, UnitId};

/// Result of [`RunTracker::dispatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A new attempt was written as `queued`.
    Queued(RunRecord),
    /// The latest attempt succeeded; nothing was written.
    AlreadySucceeded(RunRecord),
    /// The latest attempt is queued or running; nothing was written.
    InFlight(RunRecord),
}

impl DispatchOutcome {
    pub fn record(&self) -> &RunRecord {
        match self {
            DispatchOutcome::Queued(r)
            | DispatchOutcome::AlreadySucceeded(r)
            | DispatchOutcome::InFlight(r) => r,
        }
    }
}

/// A `running` attempt that was reclassified as `failed(stale)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleRunWarning {
    pub key: RunKey,
    pub started_at: DateTime<Utc>,
    pub age: Duration,
}

impl fmt::Display for StaleRunWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "run {} was running for {}s since {}; marked failed (stale)",
            self.key,
            self.age.as_secs(),
            self.started_at.to_rfc3339()
        )
    }
}

/// Drives run records through their state machine.
#[derive(Debug, Clone)]
pub struct RunTracker<'a> {
    store: RunStore<'a>,
}

impl<'a> RunTracker<'a> {
    pub fn new(store: RunStore<'a>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &RunStore<'a> {
        &self.store
    }

    /// Queue a new attempt unless the latest one succeeded or is in flight.
    ///
    /// `force` always creates a new attempt. If another dispatcher creates
    /// the same attempt number first, its attempt is what we report.
    pub fn dispatch(
        &self,
        unit: &UnitId,
        pipeline: &PipelineKey,
        fingerprint: Option<&str>,
        force: bool,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome> {
        loop {
            let latest = self.store.latest(unit, pipeline)?;

            if !force {
                match &latest {
                    Some(r) if r.status == RunStatus::Succeeded => {
                        info!(unit = %unit, pipeline = %pipeline, attempt = r.attempt, "already succeeded, not dispatching");
                        return Ok(DispatchOutcome::AlreadySucceeded(r.clone()));
                    }
                    Some(r) if !r.status.is_terminal() => {
                        info!(unit = %unit, pipeline = %pipeline, attempt = r.attempt, status = %r.status, "attempt in flight, not dispatching");
                        return Ok(DispatchOutcome::InFlight(r.clone()));
                    }
                    _ => {}
                }
            }

            let attempt = latest.as_ref().map_or(1, |r| r.attempt + 1);
            let key = RunKey::new(unit.clone(), pipeline.clone(), attempt);
            let record = RunRecord::queued(key, fingerprint.map(str::to_string), now);

            if self.store.create(&record)? {
                info!(unit = %unit, pipeline = %pipeline, attempt, forced = force, "queued run");
                return Ok(DispatchOutcome::Queued(record));
            }
            debug!(unit = %unit, pipeline = %pipeline, attempt, "attempt created concurrently, re-reading");
        }
    }

    pub fn start(&self, key: &RunKey, now: DateTime<Utc>) -> Result<RunRecord> {
        let mut record = self.store.load(key)?;
        record.start(now)?;
        self.store.save(&record)?;
        info!(run = %key, "run started");
        Ok(record)
    }

    pub fn complete(&self, key: &RunKey, exit_code: i32, now: DateTime<Utc>) -> Result<RunRecord> {
        let mut record = self.store.load(key)?;
        record.complete(exit_code, now)?;
        self.store.save(&record)?;
        if record.status == RunStatus::Succeeded {
            info!(run = %key, "run succeeded");
        } else {
            warn!(run = %key, exit_code, "run failed");
        }
        Ok(record)
    }

    /// Record a dispatcher-side error for a queued or running attempt.
    pub fn fail(&self, key: &RunKey, message: &str, now: DateTime<Utc>) -> Result<RunRecord> {
        let mut record = self.store.load(key)?;
        record.fail(FailureReason::Error, message, now)?;
        self.store.save(&record)?;
        warn!(run = %key, reason = message, "run failed");
        Ok(record)
    }

    /// Attempts `running` for longer than `threshold`, without touching
    /// the store.
    pub fn stale_candidates(
        &self,
        now: DateTime<Utc>,
        threshold: Duration,
    ) -> Result<Vec<StaleRunWarning>> {
        let limit = TimeDelta::from_std(threshold)
            .map_err(|e| anyhow!("staleness threshold {threshold:?} out of range: {e}"))?;

        let mut candidates = Vec::new();
        for record in self.store.all()? {
            if record.status != RunStatus::Running {
                continue;
            }
            let Some(started_at) = record.started_at else {
                continue;
            };
            let elapsed = now - started_at;
            if elapsed <= limit {
                continue;
            }
            candidates.push(StaleRunWarning {
                key: record.key(),
                started_at,
                age: elapsed.to_std().unwrap_or_default(),
            });
        }
        Ok(candidates)
    }

    /// Mark every attempt `running` for longer than `threshold` as
    /// `failed(stale)`.
    ///
    /// Each candidate is re-read right before it is rewritten; a record that
    /// moved on since the scan (or restarted) is left alone.
    pub fn reconcile_stale(
        &self,
        now: DateTime<Utc>,
        threshold: Duration,
    ) -> Result<Vec<StaleRunWarning>> {
        let mut warnings = Vec::new();
        for candidate in self.stale_candidates(now, threshold)? {
            let mut record = match self.store.load(&candidate.key) {
                Ok(record) => record,
                Err(TrackerError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            if record.status != RunStatus::Running
                || record.started_at != Some(candidate.started_at)
            {
                debug!(
                    run = %candidate.key,
                    status = %record.status,
                    "run changed since the stale scan; skipping"
                );
                continue;
            }

            record.fail(
                FailureReason::Stale,
                format!("no completion reported after {}s", candidate.age.as_secs()),
                now,
            )?;
            self.store.save(&record)?;

            warn!(
                unit = %candidate.key.unit,
                pipeline = %candidate.key.pipeline,
                attempt = candidate.key.attempt,
                age_secs = candidate.age.as_secs(),
                "stale run reclassified as failed"
            );
            warnings.push(candidate);
        }
        Ok(warnings)
    }

    pub fn latest(&self, unit: &UnitId, pipeline: &PipelineKey) -> Result<Option<RunRecord>> {
        self.store.latest(unit, pipeline)
    }

    /// All records, optionally restricted to one pipeline name.
    pub fn list(&self, pipeline: Option<&str>) -> Result<Vec<RunRecord>> {
        let mut records = self.store.all()?;
        if let Some(name) = pipeline {
            records.retain(|r| r.pipeline.name == name);
        }
        Ok(records)
    }

    /// Latest attempt per `(unit, pipeline)`.
    pub fn latest_attempts(&self) -> Result<BTreeMap<(UnitId, PipelineKey), RunRecord>> {
        let mut latest: BTreeMap<(UnitId, PipelineKey), RunRecord> = BTreeMap::new();
        for record in self.store.all()? {
            let slot = (record.unit.clone(), record.pipeline.clone());
            match latest.get(&slot) {
                Some(existing) if existing.attempt >= record.attempt => {}
                _ => {
                    latest.insert(slot, record);
                }
            }
        }
        Ok(latest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::mock::MockFileSystem;
    use crate::fs::FileSystem;
    use chrono::TimeZone;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn t(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, hour, 0, 0).unwrap()
    }

    fn unit() -> UnitId {
        UnitId::parse("01", "01").unwrap()
    }

    fn pipeline() -> PipelineKey {
        PipelineKey::new("fmriprep", "23.1.3")
    }

    #[test]
    fn dispatch_is_idempotent_until_forced() {
        let fs = MockFileSystem::new();
        let tracker = RunTracker::new(RunStore::new(&fs, "/runs"));

        let first = tracker.dispatch(&unit(), &pipeline(), Some("fp"), false, t(0)).unwrap();
        let DispatchOutcome::Queued(first) = first else {
            panic!("expected a queued attempt");
        };
        assert_eq!(first.attempt, 1);

        let again = tracker.dispatch(&unit(), &pipeline(), Some("fp"), false, t(0)).unwrap();
        assert!(matches!(again, DispatchOutcome::InFlight(ref r) if r.attempt == 1));

        tracker.start(&first.key(), t(1)).unwrap();
        tracker.complete(&first.key(), 0, t(2)).unwrap();
        let done = tracker.dispatch(&unit(), &pipeline(), Some("fp"), false, t(3)).unwrap();
        assert!(matches!(done, DispatchOutcome::AlreadySucceeded(_)));

        let forced = tracker.dispatch(&unit(), &pipeline(), Some("fp"), true, t(3)).unwrap();
        assert!(matches!(forced, DispatchOutcome::Queued(ref r) if r.attempt == 2));
        assert_eq!(tracker.list(None).unwrap().len(), 2);
    }

    #[test]
    fn failed_attempt_allows_redispatch() {
        let fs = MockFileSystem::new();
        let tracker = RunTracker::new(RunStore::new(&fs, "/runs"));
        let first = tracker.dispatch(&unit(), &pipeline(), None, false, t(0)).unwrap();
        tracker.fail(&first.record().key(), "sbatch rejected job", t(0)).unwrap();

        let second = tracker.dispatch(&unit(), &pipeline(), None, false, t(1)).unwrap();
        assert!(matches!(second, DispatchOutcome::Queued(ref r) if r.attempt == 2));
    }

    #[test]
    fn stale_running_attempts_fail_but_succeeded_ones_never_move() {
        let fs = MockFileSystem::new();
        let tracker = RunTracker::new(RunStore::new(&fs, "/runs"));
        let other = UnitId::parse("02", "01").unwrap();

        let stale = tracker.dispatch(&unit(), &pipeline(), None, false, t(0)).unwrap();
        tracker.start(&stale.record().key(), t(0)).unwrap();

        let done = tracker.dispatch(&other, &pipeline(), None, false, t(0)).unwrap();
        tracker.start(&done.record().key(), t(0)).unwrap();
        tracker.complete(&done.record().key(), 0, t(1)).unwrap();

        let warnings = tracker
            .reconcile_stale(t(10), Duration::from_secs(6 * 3600))
            .unwrap();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].key, stale.record().key());
        assert_eq!(warnings[0].age, Duration::from_secs(10 * 3600));

        let reloaded = tracker.latest(&unit(), &pipeline()).unwrap().unwrap();
        assert_eq!(reloaded.status, RunStatus::Failed);
        assert_eq!(reloaded.failure, Some(FailureReason::Stale));

        let untouched = tracker.latest(&other, &pipeline()).unwrap().unwrap();
        assert_eq!(untouched.status, RunStatus::Succeeded);

        assert!(tracker.reconcile_stale(t(20), Duration::from_secs(1)).unwrap().is_empty());
    }

    /// Marks one run record succeeded right after it is first read, the way
    /// a dispatcher finishing a job mid-scan would.
    #[derive(Debug)]
    struct CompletesAfterFirstRead {
        inner: MockFileSystem,
        target: PathBuf,
        finished_at: DateTime<Utc>,
        fired: AtomicBool,
    }

    impl FileSystem for CompletesAfterFirstRead {
        fn read_to_string(&self, path: &Path) -> anyhow::Result<String> {
            let contents = self.inner.read_to_string(path)?;
            if path == self.target && !self.fired.swap(true, Ordering::SeqCst) {
                let mut record: RunRecord = serde_json::from_str(&contents)?;
                record.complete(0, self.finished_at)?;
                self.inner.write(path, &serde_json::to_vec_pretty(&record)?)?;
            }
            Ok(contents)
        }

        fn write(&self, path: &Path, contents: &[u8]) -> anyhow::Result<()> {
            self.inner.write(path, contents)
        }

        fn create_new(&self, path: &Path, contents: &[u8]) -> anyhow::Result<bool> {
            self.inner.create_new(path, contents)
        }

        fn exists(&self, path: &Path) -> bool {
            self.inner.exists(path)
        }

        fn is_file(&self, path: &Path) -> bool {
            self.inner.is_file(path)
        }

        fn is_dir(&self, path: &Path) -> bool {
            self.inner.is_dir(path)
        }

        fn read_dir(&self, path: &Path) -> anyhow::Result<Vec<PathBuf>> {
            self.inner.read_dir(path)
        }
    }

    #[test]
    fn run_completed_during_stale_scan_keeps_its_success() {
        let inner = MockFileSystem::new();
        let setup = RunTracker::new(RunStore::new(&inner, "/runs"));
        let run = setup.dispatch(&unit(), &pipeline(), None, false, t(0)).unwrap();
        let key = run.record().key();
        setup.start(&key, t(0)).unwrap();

        let racing = CompletesAfterFirstRead {
            inner: inner.clone(),
            target: setup.store().path_for(&key),
            finished_at: t(9),
            fired: AtomicBool::new(false),
        };
        let tracker = RunTracker::new(RunStore::new(&racing, "/runs"));
        let warnings = tracker
            .reconcile_stale(t(10), Duration::from_secs(6 * 3600))
            .unwrap();
        assert!(warnings.is_empty());
        assert!(racing.fired.load(Ordering::SeqCst));

        let record = tracker.store().load(&key).unwrap();
        assert_eq!(record.status, RunStatus::Succeeded);
        assert_eq!(record.failure, None);
        assert_eq!(record.exit_code, Some(0));
    }

    #[test]
    fn stale_candidates_leave_records_untouched() {
        let fs = MockFileSystem::new();
        let tracker = RunTracker::new(RunStore::new(&fs, "/runs"));
        let run = tracker.dispatch(&unit(), &pipeline(), None, false, t(0)).unwrap();
        tracker.start(&run.record().key(), t(0)).unwrap();

        let threshold = Duration::from_secs(6 * 3600);
        let candidates = tracker.stale_candidates(t(10), threshold).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].key, run.record().key());

        let reloaded = tracker.latest(&unit(), &pipeline()).unwrap().unwrap();
        assert_eq!(reloaded.status, RunStatus::Running);
        assert_eq!(tracker.reconcile_stale(t(10), threshold).unwrap(), candidates);
    }

    #[test]
    fn recent_running_attempt_is_not_stale() {
        let fs = MockFileSystem::new();
        let tracker = RunTracker::new(RunStore::new(&fs, "/runs"));
        let run = tracker.dispatch(&unit(), &pipeline(), None, false, t(0)).unwrap();
        tracker.start(&run.record().key(), t(5)).unwrap();
        assert!(tracker
            .reconcile_stale(t(6), Duration::from_secs(2 * 3600))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn transitions_on_unknown_attempt_are_not_found() {
        let fs = MockFileSystem::new();
        let tracker = RunTracker::new(RunStore::new(&fs, "/runs"));
        let key = RunKey::new(unit(), pipeline(), 7);
        assert!(matches!(tracker.start(&key, t(0)), Err(TrackerError::NotFound(_))));
    }
}
