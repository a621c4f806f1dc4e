// src/errors.rs

//! Crate-wide error taxonomy.
//!
//! Structural errors (`Format`, `UnresolvedParameter`) abort a whole pass.
//! Per-unit build errors live in [`crate::invocation::BuildError`] and are
//! converted into this type only when a single unit is built on its own.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("format error in {source_name}: {message}")]
    Format {
        source_name: String,
        message: String,
    },

    #[error("unit {unit}: missing required parameter '{parameter}'")]
    MissingRequiredParameter { unit: String, parameter: String },

    #[error("unit {unit}: input '{parameter}' points to missing path {path}")]
    MissingInput {
        unit: String,
        parameter: String,
        path: String,
    },

    #[error("unit {unit}: parameter '{parameter}' expected {expected}, found {found}")]
    TypeMismatch {
        unit: String,
        parameter: String,
        expected: String,
        found: String,
    },

    #[error("pipeline {pipeline}: unresolved parameter '{name}' ({context})")]
    UnresolvedParameter {
        pipeline: String,
        name: String,
        context: String,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("run {key}: invalid transition {from} -> {to}")]
    InvalidTransition {
        key: String,
        from: String,
        to: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TrackerError {
    /// Shorthand for a [`TrackerError::Format`] error.
    pub fn format(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        TrackerError::Format {
            source_name: source_name.into(),
            message: message.into(),
        }
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, TrackerError>;
