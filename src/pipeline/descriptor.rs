// src/pipeline/descriptor.rs

//! Boutiques-style tool descriptors.
//!
//! Only the subset needed to validate and render invocations is modelled:
//!
//! ```json
//! {
//!   "name": "mriqc",
//!   "tool-version": "23.1.0",
//!   "command-line": "mriqc [BIDS_DIR] [OUTPUT_DIR] participant [PARTICIPANT_LABEL]",
//!   "inputs": [
//!     { "id": "bids_dir", "type": "File", "value-key": "[BIDS_DIR]" },
//!     { "id": "output_dir", "type": "File", "value-key": "[OUTPUT_DIR]", "output": true },
//!     { "id": "participant_label", "type": "String", "list": true,
//!       "value-key": "[PARTICIPANT_LABEL]", "command-line-flag": "--participant-label" }
//!   ]
//! }
//! ```

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::errors::{Result, TrackerError};
use crate::fs::FileSystem;

static PARAM_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_]+$").expect("valid id regex"));

/// `[KEY]` tokens in a command line. Template placeholders use `[[KEY]]` and
/// never appear in a descriptor command line.
static VALUE_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[[A-Za-z0-9_]+\]").expect("valid value-key regex"));

static VALUE_KEY_FULL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[[A-Za-z0-9_]+\]$").expect("valid value-key regex"));

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RawDescriptor {
    pub name: String,
    #[serde(default)]
    pub tool_version: Option<String>,
    #[serde(default)]
    pub command_line: String,
    #[serde(default)]
    pub inputs: Vec<RawParam>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RawParam {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    /// Boutiques-compatible way of declaring a list of `kind`.
    #[serde(default)]
    pub list: bool,
    #[serde(default)]
    pub item_type: Option<String>,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub default_value: Option<Value>,
    #[serde(default)]
    pub value_key: Option<String>,
    #[serde(default)]
    pub command_line_flag: Option<String>,
    #[serde(default)]
    pub list_separator: Option<String>,
    #[serde(default)]
    pub value_choices: Vec<Value>,
    #[serde(default)]
    pub output: bool,
}

/// Element type of a list parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemType {
    File,
    String,
    Number,
}

/// Declared type of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    File,
    String,
    Number,
    Flag,
    List(ItemType),
}

impl ItemType {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "file" => Some(ItemType::File),
            "string" => Some(ItemType::String),
            "number" => Some(ItemType::Number),
            _ => None,
        }
    }

    pub fn matches(&self, value: &Value) -> bool {
        match self {
            ItemType::File | ItemType::String => value.is_string(),
            ItemType::Number => value.is_number(),
        }
    }
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemType::File => write!(f, "file"),
            ItemType::String => write!(f, "string"),
            ItemType::Number => write!(f, "number"),
        }
    }
}

impl ParamType {
    fn from_raw(raw: &RawParam) -> std::result::Result<Self, String> {
        let kind = raw.kind.trim().to_lowercase();
        let scalar = match kind.as_str() {
            "flag" if raw.list => return Err("a Flag cannot be a list".to_string()),
            "flag" => return Ok(ParamType::Flag),
            "list" => {
                let item = raw.item_type.as_deref().unwrap_or("string");
                return ItemType::parse(item)
                    .map(ParamType::List)
                    .ok_or_else(|| format!("unknown item-type '{item}'"));
            }
            other => ItemType::parse(other).ok_or_else(|| format!("unknown type '{}'", raw.kind))?,
        };
        if raw.list {
            return Ok(ParamType::List(scalar));
        }
        Ok(match scalar {
            ItemType::File => ParamType::File,
            ItemType::String => ParamType::String,
            ItemType::Number => ParamType::Number,
        })
    }

    /// Whether a JSON value has this runtime type.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            ParamType::File | ParamType::String => value.is_string(),
            ParamType::Number => value.is_number(),
            ParamType::Flag => value.is_boolean(),
            ParamType::List(item) => value
                .as_array()
                .is_some_and(|items| items.iter().all(|v| item.matches(v))),
        }
    }

    pub fn is_file_like(&self) -> bool {
        matches!(self, ParamType::File | ParamType::List(ItemType::File))
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamType::File => write!(f, "file"),
            ParamType::String => write!(f, "string"),
            ParamType::Number => write!(f, "number"),
            ParamType::Flag => write!(f, "flag"),
            ParamType::List(item) => write!(f, "list of {item}"),
        }
    }
}

/// Short description of a JSON value's runtime type for error messages.
pub fn describe_value(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => format!("flag ({b})"),
        Value::Number(n) => format!("number ({n})"),
        Value::String(s) => format!("string (\"{s}\")"),
        Value::Array(items) => format!("list of {} item(s)", items.len()),
        Value::Object(_) => "object".to_string(),
    }
}

/// A validated parameter declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub id: String,
    pub name: Option<String>,
    pub kind: ParamType,
    pub required: bool,
    pub default: Option<Value>,
    pub value_key: Option<String>,
    pub flag: Option<String>,
    pub list_separator: String,
    pub choices: Vec<Value>,
    /// Output paths are resolved but never existence-checked.
    pub output: bool,
}

impl ParamSpec {
    /// Whether `value` is one of the declared choices (always true if none).
    pub fn allows(&self, value: &Value) -> bool {
        if self.choices.is_empty() {
            return true;
        }
        match value {
            Value::Array(items) => items.iter().all(|v| self.choices.contains(v)),
            other => self.choices.contains(other),
        }
    }
}

/// A validated descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct Descriptor {
    pub name: String,
    pub tool_version: Option<String>,
    pub command_line: String,
    params: Vec<ParamSpec>,
}

impl Descriptor {
    pub fn load(fs: &dyn FileSystem, path: &Path) -> Result<Self> {
        let contents = fs.read_to_string(path)?;
        Self::parse(&contents, &path.display().to_string())
    }

    pub fn parse(json: &str, source_name: &str) -> Result<Self> {
        let raw: RawDescriptor = serde_json::from_str(json)
            .map_err(|e| TrackerError::format(source_name, e.to_string()))?;
        Self::from_raw(raw, source_name)
    }

    pub fn from_raw(raw: RawDescriptor, source_name: &str) -> Result<Self> {
        let fail = |msg: String| TrackerError::format(source_name, msg);

        if raw.name.trim().is_empty() {
            return Err(fail("descriptor needs a non-empty name".to_string()));
        }

        let mut ids: HashSet<String> = HashSet::new();
        let mut value_keys: HashSet<String> = HashSet::new();
        let mut params = Vec::with_capacity(raw.inputs.len());

        for p in &raw.inputs {
            if !PARAM_ID_RE.is_match(&p.id) {
                return Err(fail(format!(
                    "parameter id '{}' must match [A-Za-z0-9_]+",
                    p.id
                )));
            }
            if !ids.insert(p.id.clone()) {
                return Err(fail(format!("parameter '{}' is declared twice", p.id)));
            }

            let kind = ParamType::from_raw(p).map_err(|e| fail(format!("parameter '{}': {e}", p.id)))?;

            if kind == ParamType::Flag && p.command_line_flag.is_none() {
                return Err(fail(format!(
                    "flag parameter '{}' needs a command-line-flag",
                    p.id
                )));
            }
            if p.output && !kind.is_file_like() {
                return Err(fail(format!(
                    "parameter '{}' is marked as output but is a {kind}",
                    p.id
                )));
            }

            if let Some(key) = &p.value_key {
                if !VALUE_KEY_FULL_RE.is_match(key) {
                    return Err(fail(format!(
                        "parameter '{}': value-key '{key}' must look like [KEY]",
                        p.id
                    )));
                }
                if !value_keys.insert(key.clone()) {
                    return Err(fail(format!("value-key '{key}' is used twice")));
                }
            }

            for choice in &p.value_choices {
                let ok = match kind {
                    ParamType::List(item) => item.matches(choice),
                    other => other.matches(choice),
                };
                if !ok {
                    return Err(fail(format!(
                        "parameter '{}': choice {} is not a {kind}",
                        p.id,
                        describe_value(choice)
                    )));
                }
            }

            let spec = ParamSpec {
                id: p.id.clone(),
                name: p.name.clone(),
                kind,
                required: !p.optional,
                default: p.default_value.clone(),
                value_key: p.value_key.clone(),
                flag: p.command_line_flag.clone(),
                list_separator: p.list_separator.clone().unwrap_or_else(|| " ".to_string()),
                choices: p.value_choices.clone(),
                output: p.output,
            };

            if let Some(default) = &spec.default {
                if !spec.kind.matches(default) {
                    return Err(fail(format!(
                        "parameter '{}': default {} is not a {}",
                        spec.id,
                        describe_value(default),
                        spec.kind
                    )));
                }
                if !spec.allows(default) {
                    return Err(fail(format!(
                        "parameter '{}': default is not one of the value-choices",
                        spec.id
                    )));
                }
            }

            params.push(spec);
        }

        for token in VALUE_KEY_RE.find_iter(&raw.command_line) {
            if !value_keys.contains(token.as_str()) {
                return Err(TrackerError::UnresolvedParameter {
                    pipeline: raw.name.clone(),
                    name: token.as_str().to_string(),
                    context: "command-line token has no matching value-key".to_string(),
                });
            }
        }
        for key in &value_keys {
            if !raw.command_line.contains(key.as_str()) {
                warn!(
                    descriptor = %raw.name,
                    value_key = %key,
                    "value-key is declared but not used in the command line"
                );
            }
        }

        Ok(Self {
            name: raw.name,
            tool_version: raw.tool_version,
            command_line: raw.command_line,
            params,
        })
    }

    /// Parameters in declaration order.
    pub fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    pub fn param(&self, id: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|p| p.id == id)
    }

    pub fn param_by_value_key(&self, key: &str) -> Option<&ParamSpec> {
        self.params
            .iter()
            .find(|p| p.value_key.as_deref() == Some(key))
    }
}
