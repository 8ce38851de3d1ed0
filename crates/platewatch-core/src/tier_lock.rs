//! Cross-process tier lock.
//!
//! An advisory lock on `{backup_root}/.platewatch.lock`. A plate in flight
//! holds it shared from backup until its jobs are dispatched; an eviction
//! pass holds it exclusive. Inside one process the tier `RwLock` of
//! [`crate::lifecycle`] already orders this work, and the file extends the
//! same exclusion to other processes such as an on-demand
//! `platewatch retention`.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::plate::{Tier, TierRoots};

/// Lock file name inside the backup root.
pub const LOCK_FILE_NAME: &str = ".platewatch.lock";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Tier writes for one plate.
    Shared,
    /// Evictions.
    Exclusive,
}

/// Location of the lock file for one set of tier roots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierLockFile {
    path: PathBuf,
}

impl TierLockFile {
    #[must_use]
    pub fn new(roots: &TierRoots) -> Self {
        Self::at(roots.root(Tier::Backup).join(LOCK_FILE_NAME))
    }

    #[must_use]
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> io::Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
    }

    /// Take the lock without waiting.
    ///
    /// # Errors
    ///
    /// [`Error::TierBusy`] when a conflicting holder exists, [`Error::Io`]
    /// when the lock file cannot be opened.
    pub fn try_acquire(&self, mode: LockMode) -> Result<TierLockGuard> {
        let file = self.open()?;
        let attempt = match mode {
            LockMode::Shared => FileExt::try_lock_shared(&file),
            LockMode::Exclusive => FileExt::try_lock_exclusive(&file),
        };
        match attempt {
            Ok(()) => Ok(self.guard(file, mode)),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Err(Error::TierBusy {
                path: self.path.display().to_string(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    /// Block the current thread until the lock is granted.
    pub fn acquire_blocking(&self, mode: LockMode) -> Result<TierLockGuard> {
        let file = self.open()?;
        match mode {
            LockMode::Shared => FileExt::lock_shared(&file)?,
            LockMode::Exclusive => FileExt::lock_exclusive(&file)?,
        }
        Ok(self.guard(file, mode))
    }

    /// Wait for the lock on the blocking pool.
    pub async fn acquire(&self, mode: LockMode) -> Result<TierLockGuard> {
        let lock = self.clone();
        tokio::task::spawn_blocking(move || lock.acquire_blocking(mode))
            .await
            .map_err(|e| Error::Runtime(format!("tier lock task failed: {e}")))?
    }

    fn guard(&self, file: File, mode: LockMode) -> TierLockGuard {
        debug!(path = %self.path.display(), ?mode, "Tier lock acquired");
        TierLockGuard {
            file,
            path: self.path.clone(),
            mode,
        }
    }
}

/// Held lock; released on drop.
#[derive(Debug)]
pub struct TierLockGuard {
    file: File,
    path: PathBuf,
    mode: LockMode,
}

impl TierLockGuard {
    #[must_use]
    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Drop for TierLockGuard {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %err, "Failed to release tier lock");
        }
    }
}
