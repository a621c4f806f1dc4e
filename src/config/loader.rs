// src/config/loader.rs

use std::path::{Path, PathBuf};

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::errors::{Result, TrackerError};
use crate::fs::FileSystem;

/// Load a configuration file and return the raw `RawConfigFile`.
///
/// This only performs TOML deserialization; it does **not** perform semantic
/// validation. Use [`load_and_validate`] for that.
pub fn load_from_path(fs: &dyn FileSystem, path: impl AsRef<Path>) -> Result<RawConfigFile> {
    let path = path.as_ref();
    let contents = fs.read_to_string(path)?;

    let config: RawConfigFile = toml::from_str(&contents).map_err(|e| {
        TrackerError::format(path.display().to_string(), e.to_string())
    })?;

    Ok(config)
}

/// Load a configuration file from path and validate it.
///
/// - Reads TOML.
/// - Applies defaults (handled by `serde` + `Default` impls).
/// - Checks durations, substitution names, ignore globs, pipeline keys and
///   the pipeline dependency graph.
/// - Records the config directory so relative paths resolve against it.
pub fn load_and_validate(fs: &dyn FileSystem, path: impl AsRef<Path>) -> Result<ConfigFile> {
    let path = path.as_ref();
    let raw_config = load_from_path(fs, path)?;
    let config = ConfigFile::try_from(raw_config)?;
    Ok(config.with_base_dir(config_root_dir(path)))
}

/// Default config location: `bidstrack.toml` in the working directory.
pub fn default_config_path() -> PathBuf {
    PathBuf::from("bidstrack.toml")
}

/// Figure out the directory relative paths in the config resolve against.
///
/// - `configs/bidstrack.toml` resolves against `configs`.
/// - A bare `bidstrack.toml` resolves against the current directory.
fn config_root_dir(config_path: &Path) -> PathBuf {
    let parent = match config_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    if parent.is_absolute() {
        parent
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(&parent))
            .unwrap_or(parent)
    }
}
