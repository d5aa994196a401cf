//! Filesystem helpers for the artifact cache

use std::{
    fs::{self, File, OpenOptions},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};

use fs2::FileExt;
use serde::Serialize;
use serde_json::{Map, Value};
use tempfile::NamedTempFile;
use tracing::warn;

use crate::errors::DeployerError;

/// Read a JSON object from `path`.
///
/// A missing file is an empty object. A file that does not parse as a JSON
/// object is also treated as empty, so that a torn write degrades to a cache
/// miss rather than aborting the run.
pub fn read_json_object(path: &Path) -> Map<String, Value> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => return Map::new(),
        Err(e) => {
            warn!(path = %path.display(), cause = %e, "unreadable cache file, treating as empty");
            return Map::new();
        }
    };

    match serde_json::from_str::<Value>(&contents) {
        Ok(Value::Object(map)) => map,
        Ok(_) => {
            warn!(path = %path.display(), "cache file is not a JSON object, treating as empty");
            Map::new()
        }
        Err(e) => {
            warn!(path = %path.display(), cause = %e, "corrupt cache file, treating as empty");
            Map::new()
        }
    }
}

/// An exclusive advisory lock on a cache file, released on drop
#[derive(Debug)]
pub struct FileLock {
    /// The open lock file holding the lock
    file: File,
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// The lock file guarding `path`
fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".lock");
    path.with_file_name(name)
}

/// Block until this handle holds the exclusive lock guarding `path`.
///
/// The lock is taken on a sibling `<file>.lock` rather than on `path`
/// itself, since `path` is replaced by rename on every write.
pub fn lock_file(path: &Path) -> Result<FileLock, DeployerError> {
    let lock_path = lock_path(path);
    if let Some(dir) = lock_path.parent() {
        fs::create_dir_all(dir).map_err(|e| DeployerError::Cache(e.to_string()))?;
    }

    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)
        .map_err(|e| DeployerError::Cache(format!("{}: {}", lock_path.display(), e)))?;
    file.lock_exclusive()
        .map_err(|e| DeployerError::Cache(format!("{}: {}", lock_path.display(), e)))?;

    Ok(FileLock { file })
}

/// Durably write `value` as pretty JSON to `path`.
///
/// The contents go to a temporary file in the same directory, which is
/// fsynced and then renamed over the target, so readers see either the old
/// or the new file in full.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), DeployerError> {
    let dir = path
        .parent()
        .ok_or_else(|| DeployerError::Cache(format!("{} has no parent", path.display())))?;
    fs::create_dir_all(dir).map_err(|e| DeployerError::Cache(e.to_string()))?;

    let contents =
        serde_json::to_string_pretty(value).map_err(|e| DeployerError::Cache(e.to_string()))?;

    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| DeployerError::Cache(e.to_string()))?;
    tmp.write_all(contents.as_bytes())
        .map_err(|e| DeployerError::Cache(e.to_string()))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| DeployerError::Cache(e.to_string()))?;
    tmp.persist(path)
        .map_err(|e| DeployerError::Cache(e.error.to_string()))?;

    // Make the rename itself durable where the platform allows opening directories
    if let Ok(dir) = File::open(dir) {
        let _ = dir.sync_all();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs::OpenOptions;

    use fs2::FileExt;

    use super::{lock_file, lock_path};

    #[test]
    fn test_lock_excludes_other_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mainnet").join("usdc").join("artifacts.json");

        let guard = lock_file(&path).unwrap();
        let other = OpenOptions::new().write(true).open(lock_path(&path)).unwrap();
        assert!(other.try_lock_exclusive().is_err());

        drop(guard);
        assert!(other.try_lock_exclusive().is_ok());
    }
}
