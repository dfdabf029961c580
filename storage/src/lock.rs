use fs2::FileExt;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::{Result, StorageError};

pub const LOCK_FILE: &str = "dir.lock";

/// In-process registry of locked directories.
///
/// One manager is meant to be shared (cloned) by every component of a process
/// that opens logs; two managers do not see each other's locks, but the OS
/// file lock taken by [`DirectoryLock`] still keeps them apart.
#[derive(Debug, Clone, Default)]
pub struct LockManager {
    held: Arc<Mutex<HashSet<PathBuf>>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the composite lock for `directory`: local registry entry
    /// first, then the OS lock on the lock file.
    pub fn lock(&self, directory: &Path) -> Result<DirectoryLock> {
        let path = directory.canonicalize()?;

        if !self.registry().insert(path.clone()) {
            return Err(StorageError::Locked(format!(
                "{} is already open in this process",
                path.display()
            )));
        }

        match Self::lock_file(&path) {
            Ok(file) => {
                tracing::debug!("Locked directory {}", path.display());
                Ok(DirectoryLock {
                    path,
                    manager: self.clone(),
                    file: Some(file),
                })
            }
            Err(e) => {
                self.registry().remove(&path);
                Err(e)
            }
        }
    }

    pub fn is_locked(&self, directory: &Path) -> bool {
        match directory.canonicalize() {
            Ok(path) => self.registry().contains(&path),
            Err(_) => false,
        }
    }

    fn lock_file(path: &Path) -> Result<File> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path.join(LOCK_FILE))?;

        file.try_lock_exclusive().map_err(|e| {
            StorageError::Locked(format!(
                "{} is locked by another process: {}",
                path.display(),
                e
            ))
        })?;

        Ok(file)
    }

    fn release(&self, path: &Path) {
        self.registry().remove(path);
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, HashSet<PathBuf>> {
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Held for the lifetime of an open log. Dropping it releases the OS lock and
/// then the local registry entry.
#[derive(Debug)]
pub struct DirectoryLock {
    path: PathBuf,
    manager: LockManager,
    file: Option<File>,
}

impl DirectoryLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DirectoryLock {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = FileExt::unlock(&file) {
                tracing::warn!("Failed to release file lock on {}: {}", self.path.display(), e);
            }
        }
        self.manager.release(&self.path);
        tracing::debug!("Unlocked directory {}", self.path.display());
    }
}
