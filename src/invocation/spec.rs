// src/invocation/spec.rs

//! Fully resolved invocations and command rendering.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use blake3::Hasher;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use crate::pipeline::{Descriptor, ParamSpec, ParamType};
use crate::types::{PipelineKey, UnitId};

static VALUE_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[[A-Za-z0-9_]+\]").expect("valid value-key regex"));

/// One concrete, validated command for a `(unit, pipeline, version)` triple.
///
/// Built by [`crate::invocation::InvocationBuilder`]; never mutated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvocationSpec {
    unit: UnitId,
    pipeline: PipelineKey,
    container: PathBuf,
    params: BTreeMap<String, Value>,
    argv: Vec<String>,
    fingerprint: String,
}

impl InvocationSpec {
    pub(crate) fn new(
        unit: UnitId,
        pipeline: PipelineKey,
        container: PathBuf,
        params: BTreeMap<String, Value>,
        descriptor: &Descriptor,
    ) -> Self {
        let argv = render_command(descriptor, &params);
        let fingerprint = fingerprint(&params);
        Self {
            unit,
            pipeline,
            container,
            params,
            argv,
            fingerprint,
        }
    }

    pub fn unit(&self) -> &UnitId {
        &self.unit
    }

    pub fn pipeline(&self) -> &PipelineKey {
        &self.pipeline
    }

    pub fn container(&self) -> &Path {
        &self.container
    }

    /// Resolved parameter map, keyed by parameter id.
    pub fn params(&self) -> &BTreeMap<String, Value> {
        &self.params
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// blake3 hex digest of the canonical JSON of [`Self::params`].
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// The resolved map as a Boutiques invocation document.
    pub fn invocation_json(&self) -> Value {
        canonical_json(&self.params)
    }

    /// argv joined for display, quoting items that contain whitespace.
    pub fn command_line(&self) -> String {
        self.argv
            .iter()
            .map(|arg| {
                if arg.is_empty() || arg.chars().any(char::is_whitespace) {
                    format!("'{}'", arg.replace('\'', r"'\''"))
                } else {
                    arg.clone()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn canonical_json(params: &BTreeMap<String, Value>) -> Value {
    Value::Object(
        params
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    )
}

/// Hash a resolved parameter map. Keys are visited in sorted order so the
/// digest only depends on the map's contents.
pub fn fingerprint(params: &BTreeMap<String, Value>) -> String {
    let mut hasher = Hasher::new();
    hasher.update(canonical_json(params).to_string().as_bytes());
    hasher.finalize().to_hex().to_string()
}

/// Render the descriptor's `command-line` into argv items.
///
/// Tokens are split on whitespace. A token that is exactly one `[KEY]`
/// expands to zero or more items; a token that embeds keys in other text
/// (`--out=[OUT]`) is rendered as a single item and dropped when any of its
/// keys has no value.
pub fn render_command(descriptor: &Descriptor, params: &BTreeMap<String, Value>) -> Vec<String> {
    let mut argv = Vec::new();

    for token in descriptor.command_line.split_whitespace() {
        let whole_key = VALUE_KEY_RE
            .find(token)
            .filter(|m| m.start() == 0 && m.end() == token.len());

        if let Some(m) = whole_key {
            if let Some(param) = descriptor.param_by_value_key(m.as_str()) {
                argv.extend(render_param(param, params.get(&param.id)));
            }
            continue;
        }

        if !VALUE_KEY_RE.is_match(token) {
            argv.push(token.to_string());
            continue;
        }

        let mut missing = false;
        let rendered = VALUE_KEY_RE.replace_all(token, |caps: &regex::Captures<'_>| {
            let items = descriptor
                .param_by_value_key(&caps[0])
                .map(|param| render_param(param, params.get(&param.id)))
                .unwrap_or_default();
            missing |= items.is_empty();
            items.join(" ")
        });
        if !missing {
            argv.push(rendered.into_owned());
        }
    }

    argv
}

fn render_param(param: &ParamSpec, value: Option<&Value>) -> Vec<String> {
    let Some(value) = value else {
        return Vec::new();
    };

    let values: Vec<String> = match (param.kind, value) {
        (ParamType::Flag, Value::Bool(true)) => {
            return param.flag.iter().cloned().collect();
        }
        (ParamType::Flag, _) => return Vec::new(),
        (ParamType::List(_), Value::Array(items)) => {
            if items.is_empty() {
                return Vec::new();
            }
            let items: Vec<String> = items.iter().map(scalar_to_arg).collect();
            if param.list_separator == " " {
                items
            } else {
                vec![items.join(&param.list_separator)]
            }
        }
        (_, other) => vec![scalar_to_arg(other)],
    };

    let mut out = Vec::with_capacity(values.len() + 1);
    if let Some(flag) = &param.flag {
        out.push(flag.clone());
    }
    out.extend(values);
    out
}

fn scalar_to_arg(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
