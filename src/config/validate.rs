// src/config/validate.rs

use std::collections::HashSet;

use globset::Glob;
use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::config::model::{ConfigFile, RawConfigFile, RunsSection};
use crate::errors::{Result, TrackerError};
use crate::pipeline::template::{is_placeholder_name, BUILTIN_PLACEHOLDERS};
use crate::types::{parse_duration, PipelineKey};

const SOURCE: &str = "config";

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = TrackerError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        let runs = validate_raw_config(&raw)?;
        Ok(ConfigFile::new_unchecked(
            raw.dataset,
            raw.index,
            runs,
            raw.substitutions,
            raw.pipeline,
        ))
    }
}

fn validate_raw_config(cfg: &RawConfigFile) -> Result<RunsSection> {
    ensure_has_pipelines(cfg)?;
    let runs = validate_runs(cfg)?;
    validate_index(cfg)?;
    validate_substitutions(cfg)?;
    validate_pipeline_entries(cfg)?;
    validate_pipeline_dependencies(cfg)?;
    validate_dag(cfg)?;
    Ok(runs)
}

fn ensure_has_pipelines(cfg: &RawConfigFile) -> Result<()> {
    if cfg.pipeline.is_empty() {
        return Err(TrackerError::format(
            SOURCE,
            "config must contain at least one [[pipeline]] section",
        ));
    }
    Ok(())
}

fn validate_runs(cfg: &RawConfigFile) -> Result<RunsSection> {
    let stale_after = parse_duration(&cfg.runs.stale_after).map_err(|e| {
        TrackerError::format(SOURCE, format!("[runs].stale_after: {e}"))
    })?;
    if stale_after.is_zero() {
        return Err(TrackerError::format(
            SOURCE,
            "[runs].stale_after must be greater than zero",
        ));
    }
    Ok(RunsSection { stale_after })
}

fn validate_index(cfg: &RawConfigFile) -> Result<()> {
    let marker = cfg.index.completion_marker.trim();
    if marker.is_empty() || marker.contains('/') {
        return Err(TrackerError::format(
            SOURCE,
            format!(
                "[index].completion_marker must be a plain file name (got '{}')",
                cfg.index.completion_marker
            ),
        ));
    }
    for pattern in &cfg.index.ignore {
        Glob::new(pattern).map_err(|e| {
            TrackerError::format(SOURCE, format!("[index].ignore pattern '{pattern}': {e}"))
        })?;
    }
    Ok(())
}

fn validate_substitutions(cfg: &RawConfigFile) -> Result<()> {
    for name in cfg.substitutions.keys() {
        if !is_placeholder_name(name) {
            return Err(TrackerError::format(
                SOURCE,
                format!("[substitutions].{name}: names must match [A-Z0-9_]+"),
            ));
        }
        if BUILTIN_PLACEHOLDERS.contains(&name.as_str()) {
            return Err(TrackerError::format(
                SOURCE,
                format!("[substitutions].{name} shadows a built-in placeholder"),
            ));
        }
    }
    Ok(())
}

fn validate_pipeline_entries(cfg: &RawConfigFile) -> Result<()> {
    let mut seen: HashSet<PipelineKey> = HashSet::new();
    for entry in &cfg.pipeline {
        if entry.name.trim().is_empty() || entry.version.trim().is_empty() {
            return Err(TrackerError::format(
                SOURCE,
                "every [[pipeline]] needs a non-empty name and version",
            ));
        }
        if entry.name.contains(['/', ':']) || entry.version.contains(['/', ':']) {
            return Err(TrackerError::format(
                SOURCE,
                format!(
                    "pipeline {}: name and version may not contain '/' or ':'",
                    entry.key()
                ),
            ));
        }
        if !seen.insert(entry.key()) {
            return Err(TrackerError::format(
                SOURCE,
                format!("pipeline {} is declared more than once", entry.key()),
            ));
        }
    }
    Ok(())
}

fn validate_pipeline_dependencies(cfg: &RawConfigFile) -> Result<()> {
    let keys: HashSet<PipelineKey> = cfg.pipeline.iter().map(|p| p.key()).collect();
    for entry in &cfg.pipeline {
        if let Some(dep) = &entry.depends_on {
            if !keys.contains(dep) {
                return Err(TrackerError::format(
                    SOURCE,
                    format!(
                        "pipeline {} has unknown dependency {} in `depends_on`",
                        entry.key(),
                        dep
                    ),
                ));
            }
            if *dep == entry.key() {
                return Err(TrackerError::format(
                    SOURCE,
                    format!("pipeline {} cannot depend on itself", entry.key()),
                ));
            }
        }
    }
    Ok(())
}

fn validate_dag(cfg: &RawConfigFile) -> Result<()> {
    // Edge direction: upstream -> dependent.
    let keys: Vec<PipelineKey> = cfg.pipeline.iter().map(|p| p.key()).collect();
    let mut graph: DiGraphMap<usize, ()> = DiGraphMap::new();
    for idx in 0..keys.len() {
        graph.add_node(idx);
    }
    for (idx, entry) in cfg.pipeline.iter().enumerate() {
        if let Some(dep) = &entry.depends_on {
            if let Some(dep_idx) = keys.iter().position(|k| k == dep) {
                graph.add_edge(dep_idx, idx, ());
            }
        }
    }

    match toposort(&graph, None) {
        Ok(_order) => Ok(()),
        Err(cycle) => Err(TrackerError::format(
            SOURCE,
            format!(
                "cycle detected in pipeline dependencies involving {}",
                keys[cycle.node_id()]
            ),
        )),
    }
}
