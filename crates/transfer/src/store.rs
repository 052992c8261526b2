//! Per-transfer cache files inside one writable directory.
//!
//! Each transfer id maps to `<dir>/<id>.part`. The file is only ever
//! appended to, and its length is the receiver's durable progress. A
//! completed file is sealed by renaming it to `<dir>/<id>.<seq>.done`, which
//! detaches it from the id so the next transfer starts from an empty file.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::{CACHE_FILE_EXTENSION, COMPLETED_FILE_EXTENSION};
use crate::error::{InvalidTransferId, StorageError};
use crate::validation::validate_transfer_id;

/// Directory of append-only cache files keyed by transfer id.
#[derive(Debug, Clone)]
pub struct CacheStore {
    dir: PathBuf,
    seq: Arc<AtomicU64>,
}

impl CacheStore {
    /// Opens (creating if needed) the cache directory.
    ///
    /// Fails if the path is not a directory or is read-only.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| StorageError::io(&dir, e))?;

        let meta = std::fs::metadata(&dir).map_err(|e| StorageError::io(&dir, e))?;
        if !meta.is_dir() {
            return Err(StorageError::NotADirectory(dir));
        }
        if meta.permissions().readonly() {
            return Err(StorageError::ReadOnly(dir));
        }

        debug!(dir = %dir.display(), "cache store ready");
        Ok(Self {
            dir,
            seq: Arc::new(AtomicU64::new(0)),
        })
    }

    /// The cache directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the cache file for `id`.
    pub fn path_for(&self, id: &str) -> Result<PathBuf, InvalidTransferId> {
        validate_transfer_id(id)?;
        Ok(self.dir.join(format!("{id}.{CACHE_FILE_EXTENSION}")))
    }

    /// Bytes persisted for `id`, or `None` if no cache file exists.
    ///
    /// An existing file must allow appending.
    pub async fn progress(&self, id: &str) -> Result<Option<u64>, StorageError> {
        let path = self
            .path_for(id)
            .map_err(|e| StorageError::io(&self.dir, std::io::Error::other(e)))?;
        existing_len(&path).await
    }

    /// Opens the cache file for appending, creating it if missing.
    pub async fn open_append(&self, path: &Path) -> Result<tokio::fs::File, StorageError> {
        tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| StorageError::io(path, e))
    }

    /// Moves the completed cache file for `id` out of the way and returns
    /// its new path. Callers must hold the transfer lock for `id`.
    pub async fn seal(&self, id: &str, part: &Path) -> Result<PathBuf, StorageError> {
        loop {
            let seq = self.seq.fetch_add(1, Ordering::Relaxed);
            let done = self
                .dir
                .join(format!("{id}.{seq}.{COMPLETED_FILE_EXTENSION}"));
            // Leftovers from an earlier run keep their names.
            if tokio::fs::try_exists(&done)
                .await
                .map_err(|e| StorageError::io(&done, e))?
            {
                continue;
            }
            tokio::fs::rename(part, &done)
                .await
                .map_err(|e| StorageError::io(part, e))?;
            debug!(unique_id = id, path = %done.display(), "cache file sealed");
            return Ok(done);
        }
    }

    /// Deletes the cache file for `id`. Returns `false` if none existed.
    pub async fn discard(&self, id: &str) -> Result<bool, StorageError> {
        let path = self
            .path_for(id)
            .map_err(|e| StorageError::io(&self.dir, std::io::Error::other(e)))?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::io(path, e)),
        }
    }
}

/// Length of an existing, appendable cache file.
pub(crate) async fn existing_len(path: &Path) -> Result<Option<u64>, StorageError> {
    let meta = match tokio::fs::metadata(path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StorageError::io(path, e)),
    };
    if !meta.is_file() || meta.permissions().readonly() {
        return Err(StorageError::ReadOnly(path.to_path_buf()));
    }
    Ok(Some(meta.len()))
}
