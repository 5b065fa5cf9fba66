//! Vault persistence
//!
//! The vault record is a single JSON document. Writes go to a sibling temp
//! file which is fsynced and renamed over the target, so a crash leaves
//! either the old record or the new one, never a torn file.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

use crate::vault::VaultRecord;

/// Errors from storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Write `contents` to `path` atomically (temp file, fsync, rename).
pub fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    {
        let mut file = File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;
    }

    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }

    // Persist the rename itself.
    #[cfg(unix)]
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }

    Ok(())
}

/// Backend holding at most one vault record.
pub trait VaultStorage: Send + Sync {
    fn load(&self) -> Result<Option<VaultRecord>, StorageError>;

    /// Replace the stored record atomically.
    fn store(&self, record: &VaultRecord) -> Result<(), StorageError>;

    fn exists(&self) -> Result<bool, StorageError>;

    fn remove(&self) -> Result<(), StorageError>;
}

/// Vault record stored as a JSON file.
#[derive(Debug, Clone)]
pub struct FileVaultStorage {
    path: PathBuf,
}

impl FileVaultStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl VaultStorage for FileVaultStorage {
    fn load(&self) -> Result<Option<VaultRecord>, StorageError> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn store(&self, record: &VaultRecord) -> Result<(), StorageError> {
        let contents = serde_json::to_vec_pretty(record)?;
        write_atomic(&self.path, &contents)?;
        log::debug!("vault record written to {}", self.path.display());
        Ok(())
    }

    fn exists(&self) -> Result<bool, StorageError> {
        Ok(self.path.try_exists()?)
    }

    fn remove(&self) -> Result<(), StorageError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory backend. The record is kept serialized so loads exercise the
/// same parsing path as the file backend.
#[derive(Debug, Default)]
pub struct MemoryVaultStorage {
    contents: Mutex<Option<String>>,
}

impl MemoryVaultStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw JSON currently stored.
    pub fn raw(&self) -> Option<String> {
        self.contents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl VaultStorage for MemoryVaultStorage {
    fn load(&self) -> Result<Option<VaultRecord>, StorageError> {
        let guard = self.contents.lock().unwrap_or_else(|e| e.into_inner());
        guard
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(StorageError::from)
    }

    fn store(&self, record: &VaultRecord) -> Result<(), StorageError> {
        let json = serde_json::to_string(record)?;
        *self.contents.lock().unwrap_or_else(|e| e.into_inner()) = Some(json);
        Ok(())
    }

    fn exists(&self) -> Result<bool, StorageError> {
        Ok(self
            .contents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some())
    }

    fn remove(&self) -> Result<(), StorageError> {
        *self.contents.lock().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }
}
