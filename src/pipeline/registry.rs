// src/pipeline/registry.rs

//! Registry of installed pipeline versions.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use tracing::{debug, info};

use crate::config::ConfigFile;
use crate::errors::{Result, TrackerError};
use crate::fs::FileSystem;
use crate::pipeline::descriptor::Descriptor;
use crate::pipeline::template::{placeholders_in, InvocationTemplate, BUILTIN_PLACEHOLDERS};
use crate::types::PipelineKey;

/// Everything about a pipeline that is not the descriptor or template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineMetadata {
    pub name: String,
    pub version: String,
    pub container: PathBuf,
    pub depends_on: Option<PipelineKey>,
}

/// A validated, immutable pipeline configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    key: PipelineKey,
    container: PathBuf,
    descriptor: Descriptor,
    template: InvocationTemplate,
    depends_on: Option<PipelineKey>,
}

impl PipelineConfig {
    pub fn key(&self) -> &PipelineKey {
        &self.key
    }

    pub fn name(&self) -> &str {
        &self.key.name
    }

    pub fn version(&self) -> &str {
        &self.key.version
    }

    pub fn container(&self) -> &std::path::Path {
        &self.container
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    pub fn template(&self) -> &InvocationTemplate {
        &self.template
    }

    pub fn depends_on(&self) -> Option<&PipelineKey> {
        self.depends_on.as_ref()
    }
}

/// All registered pipelines, keyed by `(name, version)`.
#[derive(Debug, Clone, Default)]
pub struct PipelineRegistry {
    pipelines: BTreeMap<PipelineKey, PipelineConfig>,
    /// Registration order; dependencies always precede dependents.
    order: Vec<PipelineKey>,
    /// Names of `[substitutions]` entries, usable as placeholders.
    substitutions: BTreeSet<String>,
}

impl PipelineRegistry {
    pub fn new<I, S>(substitution_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            pipelines: BTreeMap::new(),
            order: Vec::new(),
            substitutions: substitution_names.into_iter().map(Into::into).collect(),
        }
    }

    /// Load every `[[pipeline]]` from the dataset config.
    pub fn from_config(fs: &dyn FileSystem, cfg: &ConfigFile) -> Result<Self> {
        let mut registry = Self::new(cfg.substitutions.keys().cloned());

        for entry in entries_in_dependency_order(cfg) {
            let descriptor = Descriptor::load(fs, &cfg.resolve(&entry.descriptor))?;
            let template = InvocationTemplate::load(fs, &cfg.resolve(&entry.invocation))?;
            let metadata = PipelineMetadata {
                name: entry.name.clone(),
                version: entry.version.clone(),
                container: cfg.resolve(&entry.container),
                depends_on: entry.depends_on.clone(),
            };
            registry.register(descriptor, template, metadata)?;
        }

        info!(pipelines = registry.len(), "pipeline registry loaded");
        Ok(registry)
    }

    /// Validate and register one pipeline version.
    ///
    /// Every template key must be a declared parameter and every placeholder
    /// must be a built-in or configured substitution; anything else is an
    /// [`TrackerError::UnresolvedParameter`].
    pub fn register(
        &mut self,
        descriptor: Descriptor,
        template: InvocationTemplate,
        metadata: PipelineMetadata,
    ) -> Result<&PipelineConfig> {
        let key = PipelineKey::new(&metadata.name, &metadata.version);

        if self.pipelines.contains_key(&key) {
            return Err(TrackerError::format(
                "pipeline registry",
                format!("pipeline {key} is already registered"),
            ));
        }
        if let Some(dep) = &metadata.depends_on {
            if !self.pipelines.contains_key(dep) {
                return Err(TrackerError::format(
                    "pipeline registry",
                    format!("pipeline {key} depends on {dep}, which is not registered"),
                ));
            }
        }

        for id in template.values().keys() {
            if descriptor.param(id).is_none() {
                return Err(TrackerError::UnresolvedParameter {
                    pipeline: key.to_string(),
                    name: id.clone(),
                    context: "invocation template sets a parameter the descriptor does not declare"
                        .to_string(),
                });
            }
        }

        for name in template.placeholders() {
            if !self.is_known_placeholder(&name) {
                return Err(TrackerError::UnresolvedParameter {
                    pipeline: key.to_string(),
                    name: format!("[[{name}]]"),
                    context: "placeholder is neither built-in nor a configured substitution"
                        .to_string(),
                });
            }
        }

        for spec in descriptor.params() {
            let Some(default) = &spec.default else {
                continue;
            };
            for name in placeholders_in(default) {
                if !self.is_known_placeholder(&name) {
                    return Err(TrackerError::UnresolvedParameter {
                        pipeline: key.to_string(),
                        name: format!("[[{name}]]"),
                        context: format!(
                            "default of '{}' uses a placeholder that is neither built-in nor a configured substitution",
                            spec.id
                        ),
                    });
                }
            }
        }

        debug!(
            pipeline = %key,
            params = descriptor.params().len(),
            template_values = template.values().len(),
            "registered pipeline"
        );

        let config = PipelineConfig {
            key: key.clone(),
            container: metadata.container,
            descriptor,
            template,
            depends_on: metadata.depends_on,
        };
        self.order.push(key.clone());
        Ok(self.pipelines.entry(key).or_insert(config))
    }

    pub fn is_known_placeholder(&self, name: &str) -> bool {
        BUILTIN_PLACEHOLDERS.contains(&name) || self.substitutions.contains(name)
    }

    pub fn lookup(&self, name: &str, version: &str) -> Result<&PipelineConfig> {
        self.pipelines
            .get(&PipelineKey::new(name, version))
            .ok_or_else(|| TrackerError::NotFound(format!("pipeline {name}@{version}")))
    }

    /// The highest registered version of `name`.
    pub fn latest(&self, name: &str) -> Result<&PipelineConfig> {
        self.pipelines
            .values()
            .filter(|p| p.name() == name)
            .max_by(|a, b| compare_versions(a.version(), b.version()))
            .ok_or_else(|| TrackerError::NotFound(format!("pipeline {name}")))
    }

    /// `lookup` when a version is given, `latest` otherwise.
    pub fn resolve(&self, name: &str, version: Option<&str>) -> Result<&PipelineConfig> {
        match version {
            Some(v) => self.lookup(name, v),
            None => self.latest(name),
        }
    }

    /// Pipelines with dependencies before dependents.
    pub fn iter(&self) -> impl Iterator<Item = &PipelineConfig> {
        self.order.iter().filter_map(|k| self.pipelines.get(k))
    }

    pub fn keys(&self) -> Vec<PipelineKey> {
        self.order.clone()
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }
}

/// Order config entries so every `depends_on` target comes first.
///
/// The config has already been checked for cycles; ties keep file order.
fn entries_in_dependency_order(cfg: &ConfigFile) -> Vec<&crate::config::PipelineEntry> {
    let keys: Vec<PipelineKey> = cfg.pipeline.iter().map(|p| p.key()).collect();
    let mut graph: DiGraphMap<usize, ()> = DiGraphMap::new();
    for idx in 0..keys.len() {
        graph.add_node(idx);
    }
    for (idx, entry) in cfg.pipeline.iter().enumerate() {
        if let Some(dep_idx) = entry
            .depends_on
            .as_ref()
            .and_then(|dep| keys.iter().position(|k| k == dep))
        {
            graph.add_edge(dep_idx, idx, ());
        }
    }

    match toposort(&graph, None) {
        Ok(order) => order.into_iter().map(|idx| &cfg.pipeline[idx]).collect(),
        Err(_) => cfg.pipeline.iter().collect(),
    }
}

/// Compare dotted versions numerically where possible (`23.10.0 > 23.9.1`).
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let split = |v: &str| -> Vec<String> {
        v.split(['.', '-', '+'])
            .map(str::to_string)
            .collect()
    };
    let (pa, pb) = (split(a), split(b));
    for (x, y) in pa.iter().zip(pb.iter()) {
        let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
            (Ok(nx), Ok(ny)) => nx.cmp(&ny),
            (Ok(_), Err(_)) => Ordering::Greater,
            (Err(_), Ok(_)) => Ordering::Less,
            (Err(_), Err(_)) => x.cmp(y),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    pa.len().cmp(&pb.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn descriptor() -> Descriptor {
        Descriptor::parse(
            &json!({
                "name": "qc",
                "command-line": "qc [BIDS] [OUT] [THR]",
                "inputs": [
                    {"id": "bids_dir", "type": "File", "value-key": "[BIDS]"},
                    {"id": "out_dir", "type": "File", "value-key": "[OUT]", "output": true},
                    {"id": "threshold", "type": "Number", "value-key": "[THR]"}
                ]
            })
            .to_string(),
            "qc.json",
        )
        .unwrap()
    }

    fn metadata(version: &str) -> PipelineMetadata {
        PipelineMetadata {
            name: "qc".to_string(),
            version: version.to_string(),
            container: PathBuf::from("/containers/qc.sif"),
            depends_on: None,
        }
    }

    fn template(v: serde_json::Value) -> InvocationTemplate {
        InvocationTemplate::parse(&v.to_string(), "inv.json").unwrap()
    }

    #[test]
    fn register_and_lookup_multiple_versions() {
        let mut registry = PipelineRegistry::new(Vec::<String>::new());
        let inv = template(json!({"bids_dir": "[[BIDS_DIR]]", "out_dir": "[[OUTPUT_DIR]]"}));
        registry.register(descriptor(), inv.clone(), metadata("1.9.0")).unwrap();
        registry.register(descriptor(), inv, metadata("1.10.0")).unwrap();

        assert_eq!(registry.lookup("qc", "1.9.0").unwrap().version(), "1.9.0");
        assert_eq!(registry.latest("qc").unwrap().version(), "1.10.0");
        assert!(matches!(
            registry.lookup("qc", "2.0.0"),
            Err(TrackerError::NotFound(_))
        ));
        assert!(matches!(registry.latest("other"), Err(TrackerError::NotFound(_))));
    }

    #[test]
    fn undeclared_template_key_is_unresolved() {
        let mut registry = PipelineRegistry::new(Vec::<String>::new());
        let err = registry
            .register(descriptor(), template(json!({"nthreads": 4})), metadata("1"))
            .unwrap_err();
        match err {
            TrackerError::UnresolvedParameter { name, pipeline, .. } => {
                assert_eq!(name, "nthreads");
                assert_eq!(pipeline, "qc@1");
            }
            other => panic!("expected UnresolvedParameter, got {other:?}"),
        }
    }

    #[test]
    fn unknown_placeholder_is_unresolved_unless_configured() {
        let inv = template(json!({"bids_dir": "[[SCRATCH]]/bids"}));

        let mut strict = PipelineRegistry::new(Vec::<String>::new());
        let err = strict.register(descriptor(), inv.clone(), metadata("1")).unwrap_err();
        assert!(matches!(err, TrackerError::UnresolvedParameter { ref name, .. } if name == "[[SCRATCH]]"));

        let mut lenient = PipelineRegistry::new(["SCRATCH"]);
        assert!(lenient.register(descriptor(), inv, metadata("1")).is_ok());
    }

    #[test]
    fn unknown_placeholder_in_descriptor_default_is_unresolved() {
        let with_default = |default: &str| {
            Descriptor::parse(
                &json!({
                    "name": "qc",
                    "command-line": "qc [LICENSE]",
                    "inputs": [
                        {"id": "license", "type": "String", "value-key": "[LICENSE]",
                         "default-value": default}
                    ]
                })
                .to_string(),
                "qc.json",
            )
            .unwrap()
        };

        let mut registry = PipelineRegistry::new(Vec::<String>::new());
        let err = registry
            .register(
                with_default("[[FS_LICENCE_TYPO]]"),
                InvocationTemplate::default(),
                metadata("1"),
            )
            .unwrap_err();
        match err {
            TrackerError::UnresolvedParameter { name, context, .. } => {
                assert_eq!(name, "[[FS_LICENCE_TYPO]]");
                assert!(context.contains("'license'"), "got: {context}");
            }
            other => panic!("expected UnresolvedParameter, got {other:?}"),
        }

        let mut configured = PipelineRegistry::new(["FS_LICENSE"]);
        assert!(configured
            .register(
                with_default("[[FS_LICENSE]]/license.txt"),
                InvocationTemplate::default(),
                metadata("1"),
            )
            .is_ok());
    }

    #[test]
    fn duplicate_registration_and_missing_dependency_fail() {
        let mut registry = PipelineRegistry::new(Vec::<String>::new());
        registry
            .register(descriptor(), InvocationTemplate::default(), metadata("1"))
            .unwrap();
        assert!(registry
            .register(descriptor(), InvocationTemplate::default(), metadata("1"))
            .is_err());

        let mut dependent = metadata("2");
        dependent.depends_on = Some(PipelineKey::new("fmriprep", "23.1.3"));
        let err = registry
            .register(descriptor(), InvocationTemplate::default(), dependent)
            .unwrap_err();
        assert!(err.to_string().contains("not registered"));
    }

    #[test]
    fn version_ordering() {
        assert_eq!(compare_versions("23.10.0", "23.9.1"), Ordering::Greater);
        assert_eq!(compare_versions("1.0", "1.0.1"), Ordering::Less);
        assert_eq!(compare_versions("2.0.0", "2.0.0"), Ordering::Equal);
        assert_eq!(compare_versions("1.0.0", "1.0.0rc1"), Ordering::Greater);
    }
}
