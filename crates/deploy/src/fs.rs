//! File system utils for the artifact registry.

use std::{
    fs::{File, OpenOptions},
    path::Path,
};

use fs2::FileExt;
use serde::{Serialize, de::DeserializeOwned};

use crate::error::{DeployError, Result};

pub struct FsHandler;

impl FsHandler {
    /// Create a registry directory if it doesn't exist.
    pub fn create_dir(path: &Path) -> Result<()> {
        std::fs::create_dir_all(path).map_err(|e| DeployError::io(path, e))?;
        tracing::debug!(path = %path.display(), "Created registry directory");
        Ok(())
    }

    /// Take an exclusive advisory lock on `path`, creating the file if needed.
    ///
    /// The lock is held for as long as the returned file stays open.
    pub fn lock_exclusive(path: &Path) -> Result<File> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|e| DeployError::io(path, e))?;

        file.try_lock_exclusive()
            .map_err(|_| DeployError::RegistryLocked(path.display().to_string()))?;

        Ok(file)
    }

    /// Write `value` as pretty JSON through a sibling temp file renamed over `path`.
    pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(|e| DeployError::serde(path, e))?;
        Self::write_atomic(path, json.as_bytes())
    }

    pub fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, content).map_err(|e| DeployError::io(&tmp, e))?;
        std::fs::rename(&tmp, path).map_err(|e| DeployError::io(path, e))?;
        Ok(())
    }

    pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
        let content = std::fs::read_to_string(path).map_err(|e| DeployError::io(path, e))?;
        serde_json::from_str(&content).map_err(|e| DeployError::serde(path, e))
    }

    pub fn remove(path: &Path) -> Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DeployError::io(path, e)),
        }
    }
}
