//! Per-job cleanup manifest.
//!
//! Every temporary artifact a job creates (rendered files on disk, staged
//! and transcoded objects in the bucket) is registered here before the
//! operation that created it hands control back to the orchestrator.
//! [`ResourceTracker::cleanup`] deletes whatever is still registered.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, warn};

use crate::storage::{Storage, StorageError};

/// Where a tracked artifact lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Local,
    Remote,
}

/// A single tracked artifact.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Resource {
    Local(PathBuf),
    Remote(String),
}

/// Artifacts still awaiting deletion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupManifest {
    pub local_paths: BTreeSet<PathBuf>,
    pub remote_keys: BTreeSet<String>,
}

impl CleanupManifest {
    pub fn is_empty(&self) -> bool {
        self.local_paths.is_empty() && self.remote_keys.is_empty()
    }

    pub fn len(&self) -> usize {
        self.local_paths.len() + self.remote_keys.len()
    }
}

/// A deletion that did not go through. Never escalated to a job failure.
#[derive(Debug, Error)]
pub enum CleanupError {
    #[error("failed to delete local file {path}: {source}")]
    Local {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to delete remote object {key}: {source}")]
    Remote {
        key: String,
        #[source]
        source: StorageError,
    },
}

/// Outcome of one cleanup pass.
#[derive(Debug, Default)]
pub struct CleanupReport {
    /// Artifacts this pass actually deleted
    pub removed: Vec<Resource>,
    /// Registered artifacts that no longer existed
    pub already_absent: usize,
    /// Deletions that failed; those entries stay registered
    pub errors: Vec<CleanupError>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Tracks a job's temporary artifacts and deletes them on demand.
pub struct ResourceTracker {
    manifest: Mutex<CleanupManifest>,
    storage: Arc<dyn Storage>,
}

impl ResourceTracker {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            manifest: Mutex::new(CleanupManifest::default()),
            storage,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CleanupManifest> {
        // The manifest is plain data; a panic elsewhere cannot leave it half-updated.
        self.manifest.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register an artifact for later deletion.
    pub fn register(&self, kind: ResourceKind, identifier: impl Into<String>) {
        let identifier = identifier.into();
        match kind {
            ResourceKind::Local => self.register_local(identifier),
            ResourceKind::Remote => self.register_remote(identifier),
        }
    }

    pub fn register_local(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        debug!(path = %path.display(), "Tracking local artifact");
        self.lock().local_paths.insert(path);
    }

    pub fn register_remote(&self, key: impl Into<String>) {
        let key = key.into();
        debug!(key = %key, "Tracking remote artifact");
        self.lock().remote_keys.insert(key);
    }

    /// Snapshot of what is currently registered.
    pub fn manifest(&self) -> CleanupManifest {
        self.lock().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Delete every registered artifact.
    ///
    /// Each entry is visited once. Entries that were deleted or were already
    /// gone leave the manifest; entries whose deletion failed stay for the
    /// next pass. Errors are collected, never raised.
    pub async fn cleanup(&self) -> CleanupReport {
        let snapshot = self.manifest();
        let mut report = CleanupReport::default();

        for path in snapshot.local_paths {
            match remove_local(&path).await {
                Ok(true) => {
                    self.lock().local_paths.remove(&path);
                    report.removed.push(Resource::Local(path));
                }
                Ok(false) => {
                    self.lock().local_paths.remove(&path);
                    report.already_absent += 1;
                }
                Err(source) => {
                    warn!(path = %path.display(), error = %source, "Failed to delete local artifact");
                    report.errors.push(CleanupError::Local { path, source });
                }
            }
        }

        for key in snapshot.remote_keys {
            match self.remove_remote(&key).await {
                Ok(true) => {
                    self.lock().remote_keys.remove(&key);
                    report.removed.push(Resource::Remote(key));
                }
                Ok(false) => {
                    self.lock().remote_keys.remove(&key);
                    report.already_absent += 1;
                }
                Err(source) => {
                    warn!(key = %key, error = %source, "Failed to delete remote artifact");
                    report.errors.push(CleanupError::Remote { key, source });
                }
            }
        }

        report
    }

    /// Returns Ok(false) when the object was already gone.
    async fn remove_remote(&self, key: &str) -> Result<bool, StorageError> {
        if !self.storage.exists(key).await? {
            return Ok(false);
        }
        self.storage.delete(key).await?;
        Ok(true)
    }
}

/// Returns Ok(false) when the file was already gone.
async fn remove_local(path: &Path) -> std::io::Result<bool> {
    if !tokio::fs::try_exists(path).await? {
        return Ok(false);
    }
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
