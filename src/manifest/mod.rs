// src/manifest/mod.rs

//! The manifest: the authoritative, ordered list of expected units.
//!
//! The on-disk format is a tab-separated file with a header row:
//!
//! ```text
//! participant_id	session_id	modalities
//! sub-01	ses-01	T1w,bold
//! sub-02	ses-01
//! ```
//!
//! `modalities` (alias `datatype`) is optional and may also be written as a
//! list literal such as `['anat', 'func']`.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;

use tracing::{debug, info, warn};

use crate::errors::{Result, TrackerError};
use crate::fs::FileSystem;
use crate::index::DatasetSnapshot;
use crate::types::UnitId;

pub const PARTICIPANT_COLUMN: &str = "participant_id";
pub const SESSION_COLUMN: &str = "session_id";
const MODALITY_COLUMNS: [&str; 2] = ["modalities", "datatype"];

/// One expected unit and the raw modalities known to exist for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub unit: UnitId,
    pub modalities: BTreeSet<String>,
}

impl ManifestEntry {
    pub fn new<I, S>(unit: UnitId, modalities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            unit,
            modalities: modalities.into_iter().map(Into::into).collect(),
        }
    }
}

/// Ordered manifest. Order is file order and drives status table order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    entries: Vec<ManifestEntry>,
}

/// Units added and removed between two manifest snapshots, in manifest order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestDiff {
    pub added: Vec<UnitId>,
    pub removed: Vec<UnitId>,
}

impl ManifestDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    /// Removed units that still have derivative data on disk.
    ///
    /// These are only reported; nothing is ever deleted.
    pub fn retired_with_derivatives(&self, snapshot: &DatasetSnapshot) -> Vec<UnitId> {
        let retired: Vec<UnitId> = self
            .removed
            .iter()
            .filter(|unit| snapshot.has_derivatives(unit))
            .cloned()
            .collect();
        for unit in &retired {
            warn!(unit = %unit, "unit removed from manifest but derivatives are still present on disk");
        }
        retired
    }
}

impl Manifest {
    /// Build a manifest from entries, rejecting duplicate units.
    pub fn from_entries(entries: Vec<ManifestEntry>) -> Result<Self> {
        let mut seen: HashSet<&UnitId> = HashSet::new();
        for entry in &entries {
            if !seen.insert(&entry.unit) {
                return Err(TrackerError::format(
                    "manifest",
                    format!("duplicate unit {}", entry.unit),
                ));
            }
        }
        Ok(Self { entries })
    }

    /// Load and validate a manifest TSV.
    pub fn load(fs: &dyn FileSystem, path: &Path) -> Result<Self> {
        let contents = fs.read_to_string(path)?;
        let manifest = Self::parse(&contents, &path.display().to_string())?;
        info!(
            path = %path.display(),
            units = manifest.len(),
            "loaded manifest"
        );
        Ok(manifest)
    }

    /// Parse manifest TSV text. `source_name` is used in error messages.
    pub fn parse(contents: &str, source_name: &str) -> Result<Self> {
        let mut lines = contents
            .lines()
            .enumerate()
            .map(|(idx, line)| (idx + 1, line.trim_end_matches('\r')))
            .filter(|(_, line)| !line.trim().is_empty() && !line.starts_with('#'));

        let Some((_, header)) = lines.next() else {
            return Err(TrackerError::format(source_name, "manifest is empty"));
        };
        let columns: Vec<&str> = header.split('\t').map(str::trim).collect();
        let column_of = |name: &str| columns.iter().position(|c| *c == name);

        let participant_col = column_of(PARTICIPANT_COLUMN).ok_or_else(|| {
            TrackerError::format(
                source_name,
                format!("missing required column '{PARTICIPANT_COLUMN}'"),
            )
        })?;
        let session_col = column_of(SESSION_COLUMN).ok_or_else(|| {
            TrackerError::format(
                source_name,
                format!("missing required column '{SESSION_COLUMN}'"),
            )
        })?;
        let modality_col = MODALITY_COLUMNS.iter().find_map(|name| column_of(*name));

        let mut entries = Vec::new();
        let mut first_seen: HashMap<UnitId, usize> = HashMap::new();

        for (line_no, line) in lines {
            let fields: Vec<&str> = line.split('\t').collect();
            let field = |col: usize| fields.get(col).map(|f| f.trim()).unwrap_or("");

            if fields.len() <= participant_col.max(session_col) {
                return Err(TrackerError::format(
                    source_name,
                    format!(
                        "line {line_no}: expected at least {} fields, found {}",
                        participant_col.max(session_col) + 1,
                        fields.len()
                    ),
                ));
            }

            let unit = UnitId::parse(field(participant_col), field(session_col))
                .map_err(|e| TrackerError::format(source_name, format!("line {line_no}: {e}")))?;

            if let Some(prev) = first_seen.insert(unit.clone(), line_no) {
                return Err(TrackerError::format(
                    source_name,
                    format!("line {line_no}: duplicate unit {unit} (first seen on line {prev})"),
                ));
            }

            let modalities = modality_col
                .map(|col| parse_modalities(field(col)))
                .unwrap_or_default();

            debug!(unit = %unit, ?modalities, "manifest entry");
            entries.push(ManifestEntry { unit, modalities });
        }

        Ok(Self { entries })
    }

    /// Render the manifest back to TSV (always with a `modalities` column).
    pub fn to_tsv(&self) -> String {
        let mut out = format!("{PARTICIPANT_COLUMN}\t{SESSION_COLUMN}\tmodalities\n");
        for entry in &self.entries {
            let modalities: Vec<&str> = entry.modalities.iter().map(String::as_str).collect();
            out.push_str(&format!(
                "{}\t{}\t{}\n",
                entry.unit.participant,
                entry.unit.session,
                modalities.join(",")
            ));
        }
        out
    }

    /// Compare two manifest snapshots.
    pub fn diff(old: &Manifest, new: &Manifest) -> ManifestDiff {
        let old_units: HashSet<&UnitId> = old.units().collect();
        let new_units: HashSet<&UnitId> = new.units().collect();

        ManifestDiff {
            added: new
                .units()
                .filter(|u| !old_units.contains(u))
                .cloned()
                .collect(),
            removed: old
                .units()
                .filter(|u| !new_units.contains(u))
                .cloned()
                .collect(),
        }
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn units(&self) -> impl Iterator<Item = &UnitId> {
        self.entries.iter().map(|e| &e.unit)
    }

    pub fn get(&self, unit: &UnitId) -> Option<&ManifestEntry> {
        self.entries.iter().find(|e| &e.unit == unit)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Parse `T1w,bold`, `T1w bold` or `['anat', 'func']` into a set.
fn parse_modalities(raw: &str) -> BTreeSet<String> {
    raw.trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .split([',', ' '])
        .map(|item| item.trim().trim_matches(|c| c == '\'' || c == '"'))
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(p: &str, s: &str) -> UnitId {
        UnitId::parse(p, s).unwrap()
    }

    #[test]
    fn parses_rows_in_file_order() {
        let src = "participant_id\tsession_id\tmodalities\n\
                   sub-02\tses-01\tT1w,bold\n\
                   # retired later\n\
                   sub-01\tses-01\t\n";
        let manifest = Manifest::parse(src, "test").unwrap();
        let units: Vec<String> = manifest.units().map(|u| u.to_string()).collect();
        assert_eq!(units, vec!["sub-02/ses-01", "sub-01/ses-01"]);
        assert_eq!(
            manifest.entries()[0].modalities,
            BTreeSet::from(["T1w".to_string(), "bold".to_string()])
        );
        assert!(manifest.entries()[1].modalities.is_empty());
    }

    #[test]
    fn accepts_list_literal_and_datatype_alias() {
        let src = "session_id\tparticipant_id\tdatatype\nses-1\t01\t['anat', 'func']\n";
        let manifest = Manifest::parse(src, "test").unwrap();
        let entry = &manifest.entries()[0];
        assert_eq!(entry.unit, unit("sub-01", "ses-1"));
        assert_eq!(
            entry.modalities,
            BTreeSet::from(["anat".to_string(), "func".to_string()])
        );
    }

    #[test]
    fn missing_required_column_is_a_format_error() {
        let err = Manifest::parse("participant_id\tvisit\nsub-01\tV01\n", "m.tsv").unwrap_err();
        match err {
            TrackerError::Format { source_name, message } => {
                assert_eq!(source_name, "m.tsv");
                assert!(message.contains("session_id"));
            }
            other => panic!("expected Format error, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_units_are_rejected_with_line_numbers() {
        let src = "participant_id\tsession_id\nsub-01\tses-01\n01\t01\n";
        let err = Manifest::parse(src, "m.tsv").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("duplicate unit sub-01/ses-01"), "{msg}");
        assert!(msg.contains("line 3"), "{msg}");
    }

    #[test]
    fn invalid_labels_are_rejected() {
        let src = "participant_id\tsession_id\nsub-01_a\tses-01\n";
        assert!(Manifest::parse(src, "m.tsv").is_err());
    }

    #[test]
    fn diff_reports_added_and_removed_in_order() {
        let old = Manifest::from_entries(vec![
            ManifestEntry::new(unit("01", "1"), Vec::<String>::new()),
            ManifestEntry::new(unit("02", "1"), Vec::<String>::new()),
        ])
        .unwrap();
        let new = Manifest::from_entries(vec![
            ManifestEntry::new(unit("02", "1"), Vec::<String>::new()),
            ManifestEntry::new(unit("03", "1"), Vec::<String>::new()),
            ManifestEntry::new(unit("03", "2"), Vec::<String>::new()),
        ])
        .unwrap();

        let diff = Manifest::diff(&old, &new);
        assert_eq!(diff.added, vec![unit("03", "1"), unit("03", "2")]);
        assert_eq!(diff.removed, vec![unit("01", "1")]);
        assert!(Manifest::diff(&new, &new).is_empty());
    }

    #[test]
    fn tsv_rendering_parses_back() {
        let manifest = Manifest::from_entries(vec![ManifestEntry::new(
            unit("01", "1"),
            ["T1w", "bold"],
        )])
        .unwrap();
        let reparsed = Manifest::parse(&manifest.to_tsv(), "rendered").unwrap();
        assert_eq!(reparsed, manifest);
    }
}
