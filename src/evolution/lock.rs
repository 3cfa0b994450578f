//! Job lock - at most one training job per data directory
//!
//! An advisory lock on `training/job.lock`, held from export through
//! promote. The OS drops it when the holder exits, so a crashed job never
//! leaves the lock stuck.

use std::fs::{File, OpenOptions, TryLockError};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{EvolutionError, EvolutionResult};

/// Held job lock; released on drop
#[derive(Debug)]
pub struct JobLock {
    file: File,
    path: PathBuf,
}

impl JobLock {
    /// Take the lock at `path` without waiting
    pub fn try_acquire(path: &Path) -> EvolutionResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)?;

        match file.try_lock() {
            Ok(()) => {
                debug!("Acquired job lock {}", path.display());
                Ok(Self {
                    file,
                    path: path.to_path_buf(),
                })
            }
            Err(TryLockError::WouldBlock) => Err(EvolutionError::JobInProgress(format!(
                "{} is held by another training job",
                path.display()
            ))),
            Err(TryLockError::Error(e)) => Err(e.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for JobLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            debug!("Could not release job lock {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_holder_is_refused_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("training").join("job.lock");

        let held = JobLock::try_acquire(&path).unwrap();
        assert_eq!(held.path(), path);

        let err = JobLock::try_acquire(&path).unwrap_err();
        assert_eq!(err.kind(), "JobInProgress");

        drop(held);
        assert!(JobLock::try_acquire(&path).is_ok());
    }
}
