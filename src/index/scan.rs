// src/index/scan.rs

//! Read-only directory scans that discover which units are present in a
//! dataset layer.
//!
//! Expected layout under a layer root:
//!
//! ```text
//! <root>/sub-<label>/ses-<label>/<datatype>/<files>
//! ```
//!
//! A unit directory only counts as complete when it contains the completion
//! marker written last by the ingestion process. This avoids reporting a unit
//! as available while an external process is still copying files into it.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Context;
use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::{debug, info};

use crate::config::IndexSection;
use crate::errors::{Result, TrackerError};
use crate::fs::FileSystem;
use crate::types::{Layer, ParticipantId, SessionId, UnitId};

/// Compiled scan settings derived from `[index]`.
#[derive(Clone)]
pub struct ScanOptions {
    marker: String,
    require_marker: bool,
    ignore: GlobSet,
}

impl fmt::Debug for ScanOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanOptions")
            .field("marker", &self.marker)
            .field("require_marker", &self.require_marker)
            .finish_non_exhaustive()
    }
}

impl ScanOptions {
    pub fn from_config(section: &IndexSection) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &section.ignore {
            let glob = Glob::new(pattern).map_err(|e| {
                TrackerError::format("config", format!("[index].ignore pattern '{pattern}': {e}"))
            })?;
            builder.add(glob);
        }
        let ignore = builder
            .build()
            .context("building ignore glob set")?;

        Ok(Self {
            marker: section.completion_marker.clone(),
            require_marker: section.require_completion_marker,
            ignore,
        })
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }

    fn is_ignored(&self, file_name: &str) -> bool {
        file_name == self.marker || self.ignore.is_match(file_name)
    }
}

impl Default for ScanOptions {
    fn default() -> Self {
        // The default ignore globs are known-valid.
        Self::from_config(&IndexSection::default()).unwrap_or_else(|_| Self {
            marker: crate::config::model::DEFAULT_COMPLETION_MARKER.to_string(),
            require_marker: true,
            ignore: GlobSet::empty(),
        })
    }
}

/// Facts about one unit directory in one layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitFacts {
    pub dir: PathBuf,
    /// True when the unit may be treated as fully written.
    pub complete: bool,
    /// Datatype directory names and BIDS suffixes of the files present.
    pub groups: BTreeSet<String>,
}

/// Mapping from unit to facts for one layer. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetIndex {
    layer: Layer,
    root: PathBuf,
    units: BTreeMap<UnitId, UnitFacts>,
}

impl DatasetIndex {
    pub fn empty(layer: Layer, root: impl Into<PathBuf>) -> Self {
        Self {
            layer,
            root: root.into(),
            units: BTreeMap::new(),
        }
    }

    pub fn layer(&self) -> &Layer {
        &self.layer
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn insert(&mut self, unit: UnitId, facts: UnitFacts) {
        self.units.insert(unit, facts);
    }

    pub fn get(&self, unit: &UnitId) -> Option<&UnitFacts> {
        self.units.get(unit)
    }

    /// True when the unit directory exists and is complete.
    pub fn is_complete(&self, unit: &UnitId) -> bool {
        self.units.get(unit).is_some_and(|f| f.complete)
    }

    /// True when any directory exists for the unit, complete or not.
    pub fn has_data(&self, unit: &UnitId) -> bool {
        self.units.contains_key(unit)
    }

    /// Units whose directory exists but has no completion marker.
    pub fn incomplete_units(&self) -> impl Iterator<Item = &UnitId> {
        self.units
            .iter()
            .filter(|(_, f)| !f.complete)
            .map(|(u, _)| u)
    }

    pub fn units(&self) -> impl Iterator<Item = (&UnitId, &UnitFacts)> {
        self.units.iter()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

/// Scan one layer rooted at `root`. A missing root yields an empty index.
pub fn scan(
    fs: &dyn FileSystem,
    root: &Path,
    layer: Layer,
    options: &ScanOptions,
) -> Result<DatasetIndex> {
    let mut index = DatasetIndex::empty(layer, root);

    if !fs.is_dir(root) {
        debug!(layer = %index.layer, root = %root.display(), "layer root missing; empty index");
        return Ok(index);
    }

    for sub_dir in sorted_dirs(fs, root)? {
        let Some(participant) = parse_dir_label::<ParticipantId>(&sub_dir, "sub-") else {
            continue;
        };
        for ses_dir in sorted_dirs(fs, &sub_dir)? {
            let Some(session) = parse_dir_label::<SessionId>(&ses_dir, "ses-") else {
                continue;
            };
            let unit = UnitId::new(participant.clone(), session);
            let facts = inspect_unit(fs, &ses_dir, options)?;
            if !facts.complete {
                debug!(
                    layer = %index.layer,
                    unit = %unit,
                    marker = %options.marker,
                    "unit directory has no completion marker; treating as incomplete"
                );
            }
            index.insert(unit, facts);
        }
    }

    info!(
        layer = %index.layer,
        units = index.len(),
        incomplete = index.incomplete_units().count(),
        "scanned dataset layer"
    );
    Ok(index)
}

fn sorted_dirs(fs: &dyn FileSystem, dir: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs: Vec<PathBuf> = fs
        .read_dir(dir)?
        .into_iter()
        .filter(|p| fs.is_dir(p))
        .collect();
    dirs.sort();
    Ok(dirs)
}

fn parse_dir_label<T: std::str::FromStr>(dir: &Path, prefix: &str) -> Option<T> {
    let name = dir.file_name()?.to_str()?;
    if !name.starts_with(prefix) {
        return None;
    }
    match name.parse::<T>() {
        Ok(id) => Some(id),
        Err(_) => {
            debug!(dir = %dir.display(), "skipping directory with invalid label");
            None
        }
    }
}

fn inspect_unit(fs: &dyn FileSystem, unit_dir: &Path, options: &ScanOptions) -> Result<UnitFacts> {
    let complete = !options.require_marker || fs.is_file(&unit_dir.join(&options.marker));
    let mut groups = BTreeSet::new();

    // (path, datatype directory directly under the unit dir)
    let mut stack: Vec<(PathBuf, Option<String>)> = vec![(unit_dir.to_path_buf(), None)];
    while let Some((dir, datatype)) = stack.pop() {
        for entry in fs.read_dir(&dir)? {
            let Some(name) = entry.file_name().and_then(|n| n.to_str()).map(str::to_string)
            else {
                continue;
            };
            if options.is_ignored(&name) {
                continue;
            }
            if fs.is_dir(&entry) {
                let group = datatype.clone().or_else(|| Some(name.clone()));
                stack.push((entry, group));
            } else {
                if let Some(dt) = &datatype {
                    groups.insert(dt.clone());
                }
                if let Some(suffix) = bids_suffix(&name) {
                    groups.insert(suffix.to_string());
                }
            }
        }
    }

    Ok(UnitFacts {
        dir: unit_dir.to_path_buf(),
        complete,
        groups,
    })
}

/// BIDS suffix of a file name: `sub-01_ses-01_T1w.nii.gz` -> `T1w`.
///
/// Files without `key-value_` entities (e.g. raw DICOMs) have no suffix.
pub fn bids_suffix(file_name: &str) -> Option<&str> {
    let stem = file_name.split('.').next()?;
    let (entities, suffix) = stem.rsplit_once('_')?;
    if suffix.is_empty() || !entities.contains('-') {
        return None;
    }
    suffix
        .chars()
        .all(|c| c.is_ascii_alphanumeric())
        .then_some(suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::mock::MockFileSystem;

    fn unit(p: &str, s: &str) -> UnitId {
        UnitId::parse(p, s).unwrap()
    }

    #[test]
    fn suffix_extraction() {
        assert_eq!(bids_suffix("sub-01_ses-01_T1w.nii.gz"), Some("T1w"));
        assert_eq!(bids_suffix("sub-01_task-rest_bold.json"), Some("bold"));
        assert_eq!(bids_suffix("IM0001.dcm"), None);
        assert_eq!(bids_suffix("dataset_description.json"), None);
    }

    #[test]
    fn scan_reports_groups_and_completion() {
        let fs = MockFileSystem::new();
        let root = Path::new("/ds/bids");
        fs.add_file(root.join("sub-01/ses-01/anat/sub-01_ses-01_T1w.nii.gz"), "x");
        fs.add_file(root.join("sub-01/ses-01/func/sub-01_ses-01_task-rest_bold.nii.gz"), "x");
        fs.add_file(root.join("sub-01/ses-01/.bidstrack_complete"), "");
        fs.add_file(root.join("sub-02/ses-01/anat/sub-02_ses-01_T1w.nii.gz.part"), "x");
        fs.add_file(root.join("dataset_description.json"), "{}");

        let index = scan(&fs, root, Layer::Bids, &ScanOptions::default()).unwrap();

        assert_eq!(index.len(), 2);
        assert!(index.is_complete(&unit("01", "01")));
        assert!(!index.is_complete(&unit("02", "01")));
        assert!(index.has_data(&unit("02", "01")));

        let groups = &index.get(&unit("01", "01")).unwrap().groups;
        let expected: BTreeSet<String> = ["T1w", "anat", "bold", "func"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(groups, &expected);

        // The partially written file is ignored, so no group is detected.
        assert!(index.get(&unit("02", "01")).unwrap().groups.is_empty());
    }

    #[test]
    fn marker_requirement_can_be_disabled() {
        let fs = MockFileSystem::new();
        let root = Path::new("/ds/raw");
        fs.add_file(root.join("sub-03/ses-02/IM0001.dcm"), "x");

        let section = IndexSection {
            require_completion_marker: false,
            ..IndexSection::default()
        };
        let options = ScanOptions::from_config(&section).unwrap();
        let index = scan(&fs, root, Layer::Source, &options).unwrap();
        assert!(index.is_complete(&unit("03", "02")));
    }

    #[test]
    fn missing_root_is_empty_and_junk_dirs_are_skipped() {
        let fs = MockFileSystem::new();
        let index = scan(&fs, Path::new("/nope"), Layer::Source, &ScanOptions::default()).unwrap();
        assert!(index.is_empty());

        fs.add_dir("/ds/raw/code");
        fs.add_dir("/ds/raw/sub-bad_label/ses-01");
        fs.add_dir("/ds/raw/sub-04/notes");
        let index = scan(&fs, Path::new("/ds/raw"), Layer::Source, &ScanOptions::default()).unwrap();
        assert!(index.is_empty());
    }
}
