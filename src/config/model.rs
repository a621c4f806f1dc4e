// src/config/model.rs

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::types::PipelineKey;

/// Top-level configuration as read from `bidstrack.toml`.
///
/// ```toml
/// [dataset]
/// root = "."
/// manifest = "manifest.tsv"
///
/// [runs]
/// stale_after = "24h"
///
/// [[pipeline]]
/// name = "mriqc"
/// version = "23.1.0"
/// container = "containers/mriqc_23.1.0.sif"
/// descriptor = "pipelines/mriqc/descriptor.json"
/// invocation = "pipelines/mriqc/invocation.json"
/// ```
///
/// Everything except `[[pipeline]]` has defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfigFile {
    #[serde(default)]
    pub dataset: DatasetSection,

    #[serde(default)]
    pub index: IndexSection,

    #[serde(default)]
    pub runs: RawRunsSection,

    /// Extra `[[NAME]]` placeholders available to invocation templates.
    #[serde(default)]
    pub substitutions: BTreeMap<String, String>,

    #[serde(default)]
    pub pipeline: Vec<PipelineEntry>,
}

/// Validated configuration. Construct via `ConfigFile::try_from(raw)` or
/// [`crate::config::load_and_validate`].
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub dataset: DatasetSection,
    pub index: IndexSection,
    pub runs: RunsSection,
    pub substitutions: BTreeMap<String, String>,
    pub pipeline: Vec<PipelineEntry>,
    /// Directory the config was loaded from; relative paths resolve here.
    base_dir: PathBuf,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(
        dataset: DatasetSection,
        index: IndexSection,
        runs: RunsSection,
        substitutions: BTreeMap<String, String>,
        pipeline: Vec<PipelineEntry>,
    ) -> Self {
        Self {
            dataset,
            index,
            runs,
            substitutions,
            pipeline,
            base_dir: PathBuf::from("."),
        }
    }

    pub fn with_base_dir(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.base_dir = base_dir.into();
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Resolve a path from the config file relative to its directory.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else if path == Path::new(".") {
            self.base_dir.clone()
        } else {
            self.base_dir.join(path)
        }
    }

    pub fn layout(&self) -> DatasetLayout {
        let root = self.resolve(&self.dataset.root);
        DatasetLayout {
            manifest: root.join(&self.dataset.manifest),
            raw: root.join(&self.dataset.raw_dir),
            bids: root.join(&self.dataset.bids_dir),
            derivatives: root.join(&self.dataset.derivatives_dir),
            work: root.join(&self.dataset.work_dir),
            status_file: root.join(&self.dataset.status_file),
            runs_dir: root.join(&self.dataset.runs_dir),
            root,
        }
    }
}

/// `[dataset]` section: where each layer lives, relative to `root`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DatasetSection {
    pub root: PathBuf,
    pub manifest: PathBuf,
    pub raw_dir: PathBuf,
    pub bids_dir: PathBuf,
    pub derivatives_dir: PathBuf,
    pub work_dir: PathBuf,
    pub status_file: PathBuf,
    pub runs_dir: PathBuf,
}

impl Default for DatasetSection {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            manifest: PathBuf::from("manifest.tsv"),
            raw_dir: PathBuf::from("sourcedata"),
            bids_dir: PathBuf::from("bids"),
            derivatives_dir: PathBuf::from("derivatives"),
            work_dir: PathBuf::from("work"),
            status_file: PathBuf::from("status.tsv"),
            runs_dir: PathBuf::from(".bidstrack/runs"),
        }
    }
}

pub const DEFAULT_COMPLETION_MARKER: &str = ".bidstrack_complete";

/// `[index]` section: how directory scans decide a unit is present.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct IndexSection {
    /// File that an ingestion process writes last into a unit directory.
    pub completion_marker: String,

    /// If false, any existing unit directory counts as complete.
    pub require_completion_marker: bool,

    /// Globs (matched against file names) excluded from file-group detection.
    pub ignore: Vec<String>,
}

impl Default for IndexSection {
    fn default() -> Self {
        Self {
            completion_marker: DEFAULT_COMPLETION_MARKER.to_string(),
            require_completion_marker: true,
            ignore: vec!["*.part".to_string(), "*.tmp".to_string(), ".*".to_string()],
        }
    }
}

/// `[runs]` section as written in TOML.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawRunsSection {
    /// Duration string, e.g. `"24h"`.
    #[serde(default = "default_stale_after")]
    pub stale_after: String,
}

fn default_stale_after() -> String {
    "24h".to_string()
}

impl Default for RawRunsSection {
    fn default() -> Self {
        Self {
            stale_after: default_stale_after(),
        }
    }
}

/// Validated `[runs]` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunsSection {
    /// A `running` attempt older than this is reclassified as failed.
    pub stale_after: Duration,
}

/// `[[pipeline]]` entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineEntry {
    pub name: String,
    pub version: String,

    /// Container image path, relative to the config file unless absolute.
    pub container: PathBuf,

    /// Descriptor JSON path.
    pub descriptor: PathBuf,

    /// Invocation template JSON path.
    pub invocation: PathBuf,

    /// Upstream pipeline whose outputs this one consumes.
    #[serde(default)]
    pub depends_on: Option<PipelineKey>,
}

impl PipelineEntry {
    pub fn key(&self) -> PipelineKey {
        PipelineKey::new(&self.name, &self.version)
    }
}

/// Absolute locations of every dataset layer and store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetLayout {
    pub root: PathBuf,
    pub manifest: PathBuf,
    pub raw: PathBuf,
    pub bids: PathBuf,
    pub derivatives: PathBuf,
    pub work: PathBuf,
    pub status_file: PathBuf,
    pub runs_dir: PathBuf,
}

impl DatasetLayout {
    /// Everything under `derivatives/<name>/<version>`.
    pub fn pipeline_dir(&self, key: &PipelineKey) -> PathBuf {
        self.derivatives.join(&key.name).join(&key.version)
    }

    /// Per-unit outputs are scanned under `derivatives/<name>/<version>/output`.
    pub fn output_dir(&self, key: &PipelineKey) -> PathBuf {
        self.pipeline_dir(key).join("output")
    }

    /// Scratch directory for one pipeline version.
    pub fn work_dir(&self, key: &PipelineKey) -> PathBuf {
        self.work.join(&key.name).join(&key.version)
    }
}
