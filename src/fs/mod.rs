// src/fs/mod.rs

use std::fmt::Debug;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tempfile::NamedTempFile;

pub mod mock;

/// Abstract filesystem interface.
///
/// Writes are whole-file replacements: readers observe either the previous
/// contents or the new contents, never a partial file.
pub trait FileSystem: Send + Sync + Debug {
    fn read_to_string(&self, path: &Path) -> Result<String>;

    /// Atomically replace `path` with `contents`, creating parent directories.
    fn write(&self, path: &Path, contents: &[u8]) -> Result<()>;

    /// Atomically create `path` only if it does not exist yet.
    ///
    /// Returns `Ok(false)` when another writer got there first.
    fn create_new(&self, path: &Path, contents: &[u8]) -> Result<bool>;

    fn exists(&self, path: &Path) -> bool;
    fn is_file(&self, path: &Path) -> bool;
    fn is_dir(&self, path: &Path) -> bool;

    /// Return a list of entries in a directory.
    /// Returns full paths.
    fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>>;
}

/// Implementation that uses `std::fs`.
#[derive(Debug, Clone, Default)]
pub struct RealFileSystem;

impl RealFileSystem {
    /// Write `contents` to a temp file next to `path` so the final rename
    /// stays on the same filesystem.
    fn staged(path: &Path, contents: &[u8]) -> Result<NamedTempFile> {
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).with_context(|| format!("creating dir {:?}", parent))?;

        let mut tmp = NamedTempFile::new_in(&parent)
            .with_context(|| format!("creating temp file in {:?}", parent))?;
        tmp.write_all(contents)
            .with_context(|| format!("writing temp file for {:?}", path))?;
        tmp.as_file()
            .sync_all()
            .with_context(|| format!("syncing temp file for {:?}", path))?;
        Ok(tmp)
    }
}

impl FileSystem for RealFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String> {
        fs::read_to_string(path).with_context(|| format!("reading file {:?}", path))
    }

    fn write(&self, path: &Path, contents: &[u8]) -> Result<()> {
        let tmp = Self::staged(path, contents)?;
        tmp.persist(path)
            .map_err(|e| e.error)
            .with_context(|| format!("replacing file {:?}", path))?;
        Ok(())
    }

    fn create_new(&self, path: &Path, contents: &[u8]) -> Result<bool> {
        let tmp = Self::staged(path, contents)?;
        match tmp.persist_noclobber(path) {
            Ok(_) => Ok(true),
            Err(e) if e.error.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.error).with_context(|| format!("creating file {:?}", path)),
        }
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_file(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(path).with_context(|| format!("reading dir {:?}", path))? {
            let entry = entry?;
            entries.push(entry.path());
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_replaces_and_create_new_refuses_to_clobber() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("record.json");
        let fs = RealFileSystem;

        fs.write(&path, b"one").unwrap();
        fs.write(&path, b"two").unwrap();
        assert_eq!(fs.read_to_string(&path).unwrap(), "two");

        assert!(!fs.create_new(&path, b"three").unwrap());
        assert_eq!(fs.read_to_string(&path).unwrap(), "two");

        let fresh = dir.path().join("nested").join("fresh.json");
        assert!(fs.create_new(&fresh, b"new").unwrap());
        assert_eq!(fs.read_to_string(&fresh).unwrap(), "new");

        // No temp files are left behind next to the targets.
        let mut names: Vec<String> = fs
            .read_dir(&dir.path().join("nested"))
            .unwrap()
            .iter()
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()).map(str::to_string))
            .collect();
        names.sort();
        assert_eq!(names, vec!["fresh.json", "record.json"]);
    }
}
