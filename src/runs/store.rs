// src/runs/store.rs

//! One JSON file per attempt:
//!
//! `<runs_dir>/<pipeline>/<version>/sub-<p>_ses-<s>_attempt-<n>.json`
//!
//! New attempts are created no-clobber so two dispatchers can never write
//! the same attempt; updates replace the whole file atomically.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::errors::{Result, TrackerError};
use crate::fs::FileSystem;
use crate::runs::record::{RunKey, RunRecord};
use crate::types::{PipelineKey, UnitId};

#[derive(Debug, Clone)]
pub struct RunStore<'a> {
    fs: &'a dyn FileSystem,
    root: PathBuf,
}

impl<'a> RunStore<'a> {
    pub fn new(fs: &'a dyn FileSystem, root: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            root: root.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn pipeline_dir(&self, pipeline: &PipelineKey) -> PathBuf {
        self.root.join(&pipeline.name).join(&pipeline.version)
    }

    fn file_prefix(unit: &UnitId) -> String {
        format!(
            "{}_{}_attempt-",
            unit.participant.dir_name(),
            unit.session.dir_name()
        )
    }

    pub fn path_for(&self, key: &RunKey) -> PathBuf {
        self.pipeline_dir(&key.pipeline).join(format!(
            "{}{}.json",
            Self::file_prefix(&key.unit),
            key.attempt
        ))
    }

    /// Write a brand-new attempt. Returns `false` if it already exists.
    pub fn create(&self, record: &RunRecord) -> Result<bool> {
        let path = self.path_for(&record.key());
        let created = self.fs.create_new(&path, &serde_json::to_vec_pretty(record)?)?;
        debug!(run = %record.key(), created, path = %path.display(), "create run record");
        Ok(created)
    }

    /// Replace an existing attempt.
    pub fn save(&self, record: &RunRecord) -> Result<()> {
        let path = self.path_for(&record.key());
        self.fs.write(&path, &serde_json::to_vec_pretty(record)?)?;
        debug!(run = %record.key(), status = %record.status, "saved run record");
        Ok(())
    }

    pub fn load(&self, key: &RunKey) -> Result<RunRecord> {
        let path = self.path_for(key);
        if !self.fs.is_file(&path) {
            return Err(TrackerError::NotFound(format!("run {key}")));
        }
        self.read(&path)
    }

    fn read(&self, path: &Path) -> Result<RunRecord> {
        let contents = self.fs.read_to_string(path)?;
        serde_json::from_str(&contents)
            .map_err(|e| TrackerError::format(path.display().to_string(), e.to_string()))
    }

    /// Every attempt for one unit and pipeline, ordered by attempt number.
    pub fn attempts(&self, unit: &UnitId, pipeline: &PipelineKey) -> Result<Vec<RunRecord>> {
        let dir = self.pipeline_dir(pipeline);
        if !self.fs.is_dir(&dir) {
            return Ok(Vec::new());
        }
        let prefix = Self::file_prefix(unit);

        let mut records = Vec::new();
        for path in self.fs.read_dir(&dir)? {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let is_attempt = name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(".json"))
                .is_some_and(|n| n.parse::<u32>().is_ok());
            if is_attempt {
                records.push(self.read(&path)?);
            }
        }
        records.sort_by_key(|r| r.attempt);
        Ok(records)
    }

    pub fn latest(&self, unit: &UnitId, pipeline: &PipelineKey) -> Result<Option<RunRecord>> {
        Ok(self.attempts(unit, pipeline)?.pop())
    }

    /// Every record in the store, ordered by pipeline, unit and attempt.
    pub fn all(&self) -> Result<Vec<RunRecord>> {
        let mut records = Vec::new();
        for name_dir in self.subdirs(&self.root)? {
            for version_dir in self.subdirs(&name_dir)? {
                let mut files = self.fs.read_dir(&version_dir)?;
                files.sort();
                for path in files {
                    if path.extension().is_some_and(|e| e == "json") && self.fs.is_file(&path) {
                        records.push(self.read(&path)?);
                    }
                }
            }
        }
        records.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok(records)
    }

    fn subdirs(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        if !self.fs.is_dir(dir) {
            return Ok(Vec::new());
        }
        let mut dirs: Vec<PathBuf> = self
            .fs
            .read_dir(dir)?
            .into_iter()
            .filter(|p| self.fs.is_dir(p))
            .collect();
        dirs.sort();
        Ok(dirs)
    }
}
