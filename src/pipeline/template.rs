// src/pipeline/template.rs

//! Invocation templates and `[[PLACEHOLDER]]` substitution.
//!
//! A template is a JSON object mapping parameter ids to literal values.
//! String values (including strings nested in lists) may contain placeholder
//! tokens that are filled in per unit by the invocation builder:
//!
//! ```json
//! {
//!   "bids_dir": "[[BIDS_DIR]]",
//!   "output_dir": "[[OUTPUT_DIR]]",
//!   "participant_label": ["[[PARTICIPANT_LABEL]]"],
//!   "fs_license": "[[FS_LICENSE]]"
//! }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::Value;

use crate::errors::{Result, TrackerError};
use crate::fs::FileSystem;

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[\[([A-Za-z0-9_]+)\]\]").expect("valid placeholder regex"));

static PLACEHOLDER_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z0-9_]+$").expect("valid placeholder name regex"));

/// Placeholders the invocation builder always provides.
pub const BUILTIN_PLACEHOLDERS: &[&str] = &[
    "PARTICIPANT_ID",
    "SESSION_ID",
    "PARTICIPANT_LABEL",
    "SESSION_LABEL",
    "DATASET_ROOT",
    "RAW_DIR",
    "BIDS_DIR",
    "DERIVATIVES_DIR",
    "OUTPUT_DIR",
    "WORK_DIR",
    "PIPELINE_NAME",
    "PIPELINE_VERSION",
    "CONTAINER",
];

pub fn is_placeholder_name(name: &str) -> bool {
    PLACEHOLDER_NAME_RE.is_match(name)
}

/// Every placeholder name referenced anywhere inside `value`.
pub fn placeholders_in(value: &Value) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    collect_placeholders(value, &mut names);
    names
}

fn collect_placeholders(value: &Value, names: &mut BTreeSet<String>) {
    match value {
        Value::String(s) => {
            for caps in PLACEHOLDER_RE.captures_iter(s) {
                names.insert(caps[1].to_string());
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_placeholders(v, names)),
        Value::Object(map) => map.values().for_each(|v| collect_placeholders(v, names)),
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
}

/// Replace every placeholder in `value` using `vars`.
///
/// Returns the name of the first unknown placeholder on failure.
pub fn substitute(
    value: &Value,
    vars: &BTreeMap<String, String>,
) -> std::result::Result<Value, String> {
    match value {
        Value::String(s) => substitute_str(s, vars).map(Value::String),
        Value::Array(items) => items
            .iter()
            .map(|v| substitute(v, vars))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                out.insert(k.clone(), substitute(v, vars)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn substitute_str(s: &str, vars: &BTreeMap<String, String>) -> std::result::Result<String, String> {
    let mut unknown: Option<String> = None;
    let replaced = PLACEHOLDER_RE.replace_all(s, |caps: &Captures<'_>| {
        let name = &caps[1];
        match vars.get(name) {
            Some(v) => v.clone(),
            None => {
                unknown.get_or_insert_with(|| name.to_string());
                String::new()
            }
        }
    });
    match unknown {
        Some(name) => Err(name),
        None => Ok(replaced.into_owned()),
    }
}

/// A parsed invocation template: parameter id -> templated value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InvocationTemplate {
    values: BTreeMap<String, Value>,
}

impl InvocationTemplate {
    pub fn new(values: BTreeMap<String, Value>) -> Self {
        Self { values }
    }

    pub fn load(fs: &dyn FileSystem, path: &Path) -> Result<Self> {
        let contents = fs.read_to_string(path)?;
        Self::parse(&contents, &path.display().to_string())
    }

    pub fn parse(json: &str, source_name: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(json)
            .map_err(|e| TrackerError::format(source_name, e.to_string()))?;
        match value {
            Value::Object(map) => Ok(Self {
                values: map.into_iter().collect(),
            }),
            other => Err(TrackerError::format(
                source_name,
                format!(
                    "invocation template must be a JSON object, found {}",
                    crate::pipeline::descriptor::describe_value(&other)
                ),
            )),
        }
    }

    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    pub fn get(&self, id: &str) -> Option<&Value> {
        self.values.get(id)
    }

    /// All placeholder names used by any value.
    pub fn placeholders(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        for value in self.values.values() {
            collect_placeholders(value, &mut names);
        }
        names
    }
}
