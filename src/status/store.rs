// src/status/store.rs

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::errors::Result;
use crate::fs::FileSystem;
use crate::status::table::StatusTable;

/// The persisted status table. Every save replaces the whole file
/// atomically, so readers see either the previous table or the new one.
#[derive(Debug, Clone)]
pub struct StatusStore<'a> {
    fs: &'a dyn FileSystem,
    path: PathBuf,
}

impl<'a> StatusStore<'a> {
    pub fn new(fs: &'a dyn FileSystem, path: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The last persisted table, or `None` before the first pass.
    pub fn load(&self) -> Result<Option<StatusTable>> {
        if !self.fs.is_file(&self.path) {
            debug!(path = %self.path.display(), "no previous status table");
            return Ok(None);
        }
        let contents = self.fs.read_to_string(&self.path)?;
        let table = StatusTable::parse_tsv(&contents, &self.path.display().to_string())?;
        Ok(Some(table))
    }

    pub fn save(&self, table: &StatusTable) -> Result<()> {
        self.fs.write(&self.path, table.to_tsv().as_bytes())?;
        info!(path = %self.path.display(), units = table.len(), "status table written");
        Ok(())
    }
}
