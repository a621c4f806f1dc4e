// src/config/mod.rs

//! Dataset configuration (`bidstrack.toml`).
//!
//! Responsibilities:
//! - Define the TOML-backed data model (`model.rs`).
//! - Load a config file from disk (`loader.rs`).
//! - Validate invariants like the pipeline dependency DAG (`validate.rs`).

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{default_config_path, load_and_validate, load_from_path};
pub use model::{
    ConfigFile, DatasetLayout, DatasetSection, IndexSection, PipelineEntry, RawConfigFile,
    RawRunsSection, RunsSection,
};
