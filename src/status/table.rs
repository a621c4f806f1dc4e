// src/status/table.rs

//! Status records and the TSV they persist as.
//!
//! ```text
//! participant_id  session_id  in_manifest  in_raw  in_bids  processed:mriqc:23.1.0
//! sub-01          ses-01      1            1       1        0
//! ```

use std::collections::BTreeMap;
use std::fmt;

use crate::errors::{Result, TrackerError};
use crate::manifest::{Manifest, ManifestEntry, PARTICIPANT_COLUMN, SESSION_COLUMN};
use crate::types::{PipelineKey, UnitId};

/// One column of the status table, in the fixed stage order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    InManifest,
    InRaw,
    InBids,
    Processed(PipelineKey),
}

impl Stage {
    pub fn column_name(&self) -> String {
        match self {
            Stage::InManifest => "in_manifest".to_string(),
            Stage::InRaw => "in_raw".to_string(),
            Stage::InBids => "in_bids".to_string(),
            Stage::Processed(key) => key.column_name(),
        }
    }

    fn parse_column(name: &str) -> Option<Self> {
        match name {
            "in_manifest" => Some(Stage::InManifest),
            "in_raw" => Some(Stage::InRaw),
            "in_bids" => Some(Stage::InBids),
            other => {
                let rest = other.strip_prefix("processed:")?;
                let (name, version) = rest.split_once(':')?;
                Some(Stage::Processed(PipelineKey::new(name, version)))
            }
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.column_name())
    }
}

/// Stage flags for one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRecord {
    pub unit: UnitId,
    pub in_manifest: bool,
    pub in_raw: bool,
    pub in_bids: bool,
    pub processed: BTreeMap<PipelineKey, bool>,
}

impl StatusRecord {
    /// A record with every flag false.
    pub fn unknown(unit: UnitId) -> Self {
        Self {
            unit,
            in_manifest: false,
            in_raw: false,
            in_bids: false,
            processed: BTreeMap::new(),
        }
    }

    pub fn flag(&self, stage: &Stage) -> bool {
        match stage {
            Stage::InManifest => self.in_manifest,
            Stage::InRaw => self.in_raw,
            Stage::InBids => self.in_bids,
            Stage::Processed(key) => self.processed.get(key).copied().unwrap_or(false),
        }
    }

    fn set(&mut self, stage: &Stage, value: bool) {
        match stage {
            Stage::InManifest => self.in_manifest = value,
            Stage::InRaw => self.in_raw = value,
            Stage::InBids => self.in_bids = value,
            Stage::Processed(key) => {
                self.processed.insert(key.clone(), value);
            }
        }
    }
}

/// The full table, in manifest order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusTable {
    pipelines: Vec<PipelineKey>,
    records: Vec<StatusRecord>,
}

impl StatusTable {
    pub fn new(pipelines: Vec<PipelineKey>, records: Vec<StatusRecord>) -> Self {
        Self { pipelines, records }
    }

    /// Pipeline columns in evaluation order.
    pub fn pipelines(&self) -> &[PipelineKey] {
        &self.pipelines
    }

    pub fn records(&self) -> &[StatusRecord] {
        &self.records
    }

    pub fn get(&self, unit: &UnitId) -> Option<&StatusRecord> {
        self.records.iter().find(|r| &r.unit == unit)
    }

    pub fn columns(&self) -> Vec<Stage> {
        let mut columns = vec![Stage::InManifest, Stage::InRaw, Stage::InBids];
        columns.extend(self.pipelines.iter().cloned().map(Stage::Processed));
        columns
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of units with `stage` set.
    pub fn count(&self, stage: &Stage) -> usize {
        self.records.iter().filter(|r| r.flag(stage)).count()
    }

    /// Units this table was computed for, as a manifest without modalities.
    pub fn units_as_manifest(&self) -> Result<Manifest> {
        Manifest::from_entries(
            self.records
                .iter()
                .map(|r| ManifestEntry::new(r.unit.clone(), Vec::<String>::new()))
                .collect(),
        )
    }

    pub fn to_tsv(&self) -> String {
        let columns = self.columns();
        let mut out = format!("{PARTICIPANT_COLUMN}\t{SESSION_COLUMN}");
        for column in &columns {
            out.push('\t');
            out.push_str(&column.column_name());
        }
        out.push('\n');

        for record in &self.records {
            out.push_str(&format!("{}\t{}", record.unit.participant, record.unit.session));
            for column in &columns {
                out.push('\t');
                out.push(if record.flag(column) { '1' } else { '0' });
            }
            out.push('\n');
        }
        out
    }

    pub fn parse_tsv(contents: &str, source_name: &str) -> Result<Self> {
        let mut lines = contents
            .lines()
            .enumerate()
            .map(|(idx, line)| (idx + 1, line.trim_end_matches('\r')))
            .filter(|(_, line)| !line.trim().is_empty());

        let Some((_, header)) = lines.next() else {
            return Ok(Self::default());
        };
        let names: Vec<&str> = header.split('\t').collect();
        if names.len() < 2 || names[0] != PARTICIPANT_COLUMN || names[1] != SESSION_COLUMN {
            return Err(TrackerError::format(
                source_name,
                format!("status header must start with {PARTICIPANT_COLUMN}, {SESSION_COLUMN}"),
            ));
        }

        let columns = names[2..]
            .iter()
            .map(|name| {
                Stage::parse_column(name).ok_or_else(|| {
                    TrackerError::format(source_name, format!("unknown status column '{name}'"))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let pipelines = columns
            .iter()
            .filter_map(|c| match c {
                Stage::Processed(key) => Some(key.clone()),
                _ => None,
            })
            .collect();

        let mut records = Vec::new();
        for (line_no, line) in lines {
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() != names.len() {
                return Err(TrackerError::format(
                    source_name,
                    format!(
                        "line {line_no}: expected {} fields, found {}",
                        names.len(),
                        fields.len()
                    ),
                ));
            }
            let unit = UnitId::parse(fields[0], fields[1])
                .map_err(|e| TrackerError::format(source_name, format!("line {line_no}: {e}")))?;

            let mut record = StatusRecord::unknown(unit);
            for (column, raw) in columns.iter().zip(&fields[2..]) {
                let value = match raw.trim() {
                    "1" | "true" | "True" => true,
                    "0" | "false" | "False" | "" => false,
                    other => {
                        return Err(TrackerError::format(
                            source_name,
                            format!("line {line_no}: invalid flag '{other}' in column {column}"),
                        ))
                    }
                };
                record.set(column, value);
            }
            records.push(record);
        }

        Ok(Self { pipelines, records })
    }
}
