// src/invocation/builder.rs

//! Three-layer parameter resolution.
//!
//! For each declared parameter the winning value is taken from, in
//! increasing precedence:
//!
//! 1. the descriptor's `default-value`,
//! 2. the pipeline's invocation template,
//! 3. per-run overrides.
//!
//! A `null` at any layer means "not set here" and falls through to the layer
//! below. The winner then has its `[[PLACEHOLDER]]` tokens substituted, is
//! type-checked against the declaration and, for File parameters, resolved
//! against the dataset root.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{ConfigFile, DatasetLayout};
use crate::errors::{Result, TrackerError};
use crate::fs::FileSystem;
use crate::invocation::spec::InvocationSpec;
use crate::pipeline::template::substitute;
use crate::pipeline::{describe_value, ParamSpec, ParamType, PipelineConfig};
use crate::types::{PipelineKey, UnitId};

/// Per-unit build failure. Reported in a [`BatchReport`] without stopping
/// other units.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("unit {unit}: missing required parameter '{parameter}'")]
    MissingRequiredParameter { unit: UnitId, parameter: String },

    #[error("unit {unit}: input '{parameter}' points to missing path {}", .path.display())]
    MissingInput {
        unit: UnitId,
        parameter: String,
        path: PathBuf,
    },

    #[error("unit {unit}: parameter '{parameter}' expected {expected}, found {found}")]
    TypeMismatch {
        unit: UnitId,
        parameter: String,
        expected: String,
        found: String,
    },

    #[error("unit {unit}: parameter '{parameter}' of {pipeline} uses unknown placeholder [[{placeholder}]]")]
    UnresolvedPlaceholder {
        unit: UnitId,
        pipeline: PipelineKey,
        parameter: String,
        placeholder: String,
    },

    #[error("unit {unit}: override '{parameter}' is not a parameter of {pipeline}")]
    UnknownParameter {
        unit: UnitId,
        pipeline: PipelineKey,
        parameter: String,
    },
}

impl BuildError {
    pub fn unit(&self) -> &UnitId {
        match self {
            BuildError::MissingRequiredParameter { unit, .. }
            | BuildError::MissingInput { unit, .. }
            | BuildError::TypeMismatch { unit, .. }
            | BuildError::UnresolvedPlaceholder { unit, .. }
            | BuildError::UnknownParameter { unit, .. } => unit,
        }
    }

    pub fn parameter(&self) -> &str {
        match self {
            BuildError::MissingRequiredParameter { parameter, .. }
            | BuildError::MissingInput { parameter, .. }
            | BuildError::TypeMismatch { parameter, .. }
            | BuildError::UnresolvedPlaceholder { parameter, .. }
            | BuildError::UnknownParameter { parameter, .. } => parameter,
        }
    }
}

impl From<BuildError> for TrackerError {
    fn from(err: BuildError) -> Self {
        match err {
            BuildError::MissingRequiredParameter { unit, parameter } => {
                TrackerError::MissingRequiredParameter {
                    unit: unit.to_string(),
                    parameter,
                }
            }
            BuildError::MissingInput {
                unit,
                parameter,
                path,
            } => TrackerError::MissingInput {
                unit: unit.to_string(),
                parameter,
                path: path.display().to_string(),
            },
            BuildError::TypeMismatch {
                unit,
                parameter,
                expected,
                found,
            } => TrackerError::TypeMismatch {
                unit: unit.to_string(),
                parameter,
                expected,
                found,
            },
            BuildError::UnresolvedPlaceholder {
                unit,
                pipeline,
                parameter,
                placeholder,
            } => TrackerError::UnresolvedParameter {
                pipeline: pipeline.to_string(),
                name: format!("[[{placeholder}]]"),
                context: format!("unit {unit}, parameter '{parameter}'"),
            },
            BuildError::UnknownParameter {
                unit,
                pipeline,
                parameter,
            } => TrackerError::UnresolvedParameter {
                pipeline: pipeline.to_string(),
                name: parameter,
                context: format!("override for unit {unit} is not a declared parameter"),
            },
        }
    }
}

/// Outcome of building many units: successes and per-unit failures.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub specs: Vec<InvocationSpec>,
    pub failures: Vec<BuildError>,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// One line per failure, grouped by unit in build order.
    pub fn summary(&self) -> String {
        let mut out = format!(
            "{} built, {} failed",
            self.specs.len(),
            self.failures.len()
        );
        for failure in &self.failures {
            out.push_str("\n  ");
            out.push_str(&failure.to_string());
        }
        out
    }
}

/// Builds [`InvocationSpec`]s for one dataset.
#[derive(Debug, Clone)]
pub struct InvocationBuilder<'a> {
    fs: &'a dyn FileSystem,
    layout: DatasetLayout,
    substitutions: BTreeMap<String, String>,
}

impl<'a> InvocationBuilder<'a> {
    pub fn new(
        fs: &'a dyn FileSystem,
        layout: DatasetLayout,
        substitutions: BTreeMap<String, String>,
    ) -> Self {
        Self {
            fs,
            layout,
            substitutions,
        }
    }

    pub fn from_config(fs: &'a dyn FileSystem, cfg: &ConfigFile) -> Self {
        Self::new(fs, cfg.layout(), cfg.substitutions.clone())
    }

    pub fn layout(&self) -> &DatasetLayout {
        &self.layout
    }

    /// Placeholder values for one `(unit, pipeline)` pair.
    pub fn context(&self, unit: &UnitId, config: &PipelineConfig) -> BTreeMap<String, String> {
        let key = config.key();
        let path = |p: &Path| p.display().to_string();

        let mut vars = self.substitutions.clone();
        let builtins = [
            ("PARTICIPANT_ID", unit.participant.dir_name()),
            ("SESSION_ID", unit.session.dir_name()),
            ("PARTICIPANT_LABEL", unit.participant.label().to_string()),
            ("SESSION_LABEL", unit.session.label().to_string()),
            ("DATASET_ROOT", path(&self.layout.root)),
            ("RAW_DIR", path(&self.layout.raw)),
            ("BIDS_DIR", path(&self.layout.bids)),
            ("DERIVATIVES_DIR", path(&self.layout.derivatives)),
            ("OUTPUT_DIR", path(&self.layout.output_dir(key))),
            ("WORK_DIR", path(&self.layout.work_dir(key))),
            ("PIPELINE_NAME", key.name.clone()),
            ("PIPELINE_VERSION", key.version.clone()),
            ("CONTAINER", path(config.container())),
        ];
        for (name, value) in builtins {
            vars.insert(name.to_string(), value);
        }
        vars
    }

    /// Resolve every parameter of `config` for `unit`.
    ///
    /// Pure apart from the existence check on input paths: identical inputs
    /// give identical maps and fingerprints.
    pub fn build(
        &self,
        unit: &UnitId,
        config: &PipelineConfig,
        overrides: &BTreeMap<String, Value>,
    ) -> std::result::Result<InvocationSpec, BuildError> {
        let descriptor = config.descriptor();
        if let Some(id) = overrides.keys().find(|id| descriptor.param(id).is_none()) {
            return Err(BuildError::UnknownParameter {
                unit: unit.clone(),
                pipeline: config.key().clone(),
                parameter: id.clone(),
            });
        }

        let vars = self.context(unit, config);
        let mut params = BTreeMap::new();

        for spec in descriptor.params() {
            let winner = resolve_layers(spec, config, overrides);
            let Some(raw) = winner else {
                if spec.required {
                    return Err(BuildError::MissingRequiredParameter {
                        unit: unit.clone(),
                        parameter: spec.id.clone(),
                    });
                }
                continue;
            };

            let value = substitute(raw, &vars).map_err(|placeholder| {
                BuildError::UnresolvedPlaceholder {
                    unit: unit.clone(),
                    pipeline: config.key().clone(),
                    parameter: spec.id.clone(),
                    placeholder,
                }
            })?;

            check_type(unit, spec, &value)?;
            let value = self.resolve_paths(unit, spec, value)?;
            params.insert(spec.id.clone(), value);
        }

        let built = InvocationSpec::new(
            unit.clone(),
            config.key().clone(),
            config.container().to_path_buf(),
            params,
            descriptor,
        );
        debug!(
            unit = %unit,
            pipeline = %config.key(),
            fingerprint = %built.fingerprint(),
            "built invocation"
        );
        Ok(built)
    }

    /// Build every unit, collecting per-unit failures.
    ///
    /// Overrides naming undeclared parameters abort before any unit is
    /// built.
    pub fn build_batch(
        &self,
        units: &[UnitId],
        config: &PipelineConfig,
        overrides: &BTreeMap<String, Value>,
    ) -> Result<BatchReport> {
        check_overrides(config, overrides)?;

        let mut report = BatchReport::default();
        for unit in units {
            match self.build(unit, config, overrides) {
                Ok(spec) => report.specs.push(spec),
                Err(err) => {
                    warn!(
                        unit = %unit,
                        pipeline = %config.key(),
                        parameter = %err.parameter(),
                        error = %err,
                        "invocation build failed"
                    );
                    report.failures.push(err);
                }
            }
        }

        info!(
            pipeline = %config.key(),
            built = report.specs.len(),
            failed = report.failures.len(),
            "invocation batch finished"
        );
        Ok(report)
    }

    fn resolve_paths(
        &self,
        unit: &UnitId,
        spec: &ParamSpec,
        value: Value,
    ) -> std::result::Result<Value, BuildError> {
        if !spec.kind.is_file_like() {
            return Ok(value);
        }

        let resolve_one = |v: Value| -> std::result::Result<Value, BuildError> {
            let Value::String(s) = v else {
                return Ok(v);
            };
            let path = self.absolute(Path::new(&s));
            if !spec.output && !self.fs.exists(&path) {
                return Err(BuildError::MissingInput {
                    unit: unit.clone(),
                    parameter: spec.id.clone(),
                    path,
                });
            }
            Ok(Value::String(path.display().to_string()))
        };

        match value {
            Value::Array(items) => items
                .into_iter()
                .map(resolve_one)
                .collect::<std::result::Result<Vec<_>, _>>()
                .map(Value::Array),
            other => resolve_one(other),
        }
    }

    fn absolute(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.layout.root.join(path)
        }
    }
}

/// Pick the highest-precedence non-null value for `spec`.
pub fn resolve_layers<'v>(
    spec: &'v ParamSpec,
    config: &'v PipelineConfig,
    overrides: &'v BTreeMap<String, Value>,
) -> Option<&'v Value> {
    let not_null = |v: &&Value| !v.is_null();
    overrides
        .get(&spec.id)
        .filter(not_null)
        .or_else(|| config.template().get(&spec.id).filter(not_null))
        .or_else(|| spec.default.as_ref().filter(not_null))
}

fn check_type(unit: &UnitId, spec: &ParamSpec, value: &Value) -> std::result::Result<(), BuildError> {
    if !spec.kind.matches(value) {
        return Err(BuildError::TypeMismatch {
            unit: unit.clone(),
            parameter: spec.id.clone(),
            expected: spec.kind.to_string(),
            found: describe_value(value),
        });
    }
    if !spec.allows(value) {
        let choices: Vec<String> = spec.choices.iter().map(Value::to_string).collect();
        return Err(BuildError::TypeMismatch {
            unit: unit.clone(),
            parameter: spec.id.clone(),
            expected: format!("one of [{}]", choices.join(", ")),
            found: describe_value(value),
        });
    }
    if let (ParamType::List(_), Value::Array(items)) = (spec.kind, value) {
        if spec.required && items.is_empty() {
            return Err(BuildError::MissingRequiredParameter {
                unit: unit.clone(),
                parameter: spec.id.clone(),
            });
        }
    }
    Ok(())
}

/// Reject overrides for parameters the pipeline does not declare.
pub fn check_overrides(config: &PipelineConfig, overrides: &BTreeMap<String, Value>) -> Result<()> {
    for id in overrides.keys() {
        if config.descriptor().param(id).is_none() {
            return Err(TrackerError::UnresolvedParameter {
                pipeline: config.key().to_string(),
                name: id.clone(),
                context: "override is not a declared parameter".to_string(),
            });
        }
    }
    Ok(())
}

/// Parse one `key=value` override. The value is read as JSON when it parses
/// (`0.5`, `true`, `["a","b"]`) and taken as a plain string otherwise.
pub fn parse_override(raw: &str) -> Result<(String, Value)> {
    let (key, value) = raw.split_once('=').ok_or_else(|| {
        TrackerError::format("--set", format!("expected key=value, got '{raw}'"))
    })?;
    let key = key.trim();
    if key.is_empty() {
        return Err(TrackerError::format(
            "--set",
            format!("missing parameter id in '{raw}'"),
        ));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

pub fn parse_overrides<I, S>(raw: I) -> Result<BTreeMap<String, Value>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = BTreeMap::new();
    for item in raw {
        let (key, value) = parse_override(item.as_ref())?;
        out.insert(key, value);
    }
    Ok(out)
}
