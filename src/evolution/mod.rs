//! Evolution loop: fine-tune on accumulated dialogue, then promote
//!
//! The trigger decides when, the pipeline produces an adapter, and the
//! version manager merges it into the logical model and bumps the marker.

pub mod artifact;
pub mod job;
pub mod lock;
pub mod pipeline;
pub mod trigger;
pub mod version;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

pub use artifact::{AdapterArtifact, ArtifactFormat};
pub use job::{JobHistory, JobOutcome, JobStatus, TrainingJob};
pub use lock::JobLock;
pub use pipeline::{CommandBackend, FineTuneBackend, FineTuningPipeline, TrainingLayout, TrainingRequest};
pub use trigger::{Debouncer, EvolutionTrigger, TriggerDecision};
pub use version::VersionManager;

use crate::error::{EvolutionError, EvolutionResult};

/// Replace `path` with `bytes` so readers see either the old or the new file
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "state".to_string());
    let tmp = dir.join(format!(".{}.{}.tmp", name, uuid::Uuid::new_v4().simple()));

    let result = (|| {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        std::fs::rename(&tmp, path)
    })();
    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
        return result;
    }

    // Persist the rename itself; not every platform allows opening a directory
    if let Ok(dir) = std::fs::File::open(dir) {
        let _ = dir.sync_all();
    }
    Ok(())
}

/// Runs one training job end to end and records it
pub struct EvolutionRunner {
    pipeline: FineTuningPipeline,
    versions: Arc<VersionManager>,
    history: JobHistory,
    lock_path: PathBuf,
}

impl EvolutionRunner {
    pub fn new(
        pipeline: FineTuningPipeline,
        versions: Arc<VersionManager>,
        history: JobHistory,
        lock_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            pipeline,
            versions,
            history,
            lock_path: lock_path.into(),
        }
    }

    pub fn history(&self) -> &JobHistory {
        &self.history
    }

    pub fn versions(&self) -> &Arc<VersionManager> {
        &self.versions
    }

    /// Fine-tune on the first `source_record_count` records and promote the result
    ///
    /// Never fails: the outcome is recorded on the returned job. If another
    /// job holds the job lock this one fails with `JobInProgress`.
    pub async fn run_job(&self, job: TrainingJob) -> TrainingJob {
        match JobLock::try_acquire(&self.lock_path) {
            Ok(lock) => self.run_locked(job, lock).await,
            Err(e) => {
                let mut job = job;
                job.start();
                warn!(job_id = %job.id, kind = e.kind(), "Training job not started: {}", e);
                job.resolve(JobOutcome::Failed(e));
                self.record(&job);
                job
            }
        }
    }

    async fn run_locked(&self, mut job: TrainingJob, _lock: JobLock) -> TrainingJob {
        job.start();
        info!(
            job_id = %job.id,
            records = job.source_record_count,
            backend = self.pipeline.backend_name(),
            "Training job started"
        );

        let outcome = self.execute(job.source_record_count).await;
        match &outcome {
            JobOutcome::Succeeded { artifact, version } => info!(
                job_id = %job.id,
                version = %version,
                sha256 = %artifact.sha256,
                "Training job succeeded, model promoted"
            ),
            JobOutcome::Failed(e) => error!(
                job_id = %job.id,
                kind = e.kind(),
                "Training job failed, keeping {}: {}",
                self.versions.current(),
                e
            ),
        }
        job.resolve(outcome);

        self.record(&job);
        job
    }

    fn record(&self, job: &TrainingJob) {
        if let Err(e) = self.history.append(job) {
            warn!(job_id = %job.id, "Could not record training job: {:#}", e);
        }
    }

    async fn execute(&self, record_count: u64) -> JobOutcome {
        let artifact = match self.pipeline.run(record_count).await {
            Ok(artifact) => artifact,
            Err(e) => return JobOutcome::Failed(e),
        };
        match self.versions.promote(&artifact).await {
            Ok(version) => JobOutcome::Succeeded { artifact, version },
            Err(e) => JobOutcome::Failed(e),
        }
    }

    /// Run a job now against `record_count` records, if any are new
    ///
    /// Refuses with `JobInProgress` while any other job holds the lock.
    pub async fn evolve_now(&self, record_count: u64) -> EvolutionResult<TrainingJob> {
        let lock = JobLock::try_acquire(&self.lock_path)?;
        let trained = self.history.last_trained_count().unwrap_or_else(|e| {
            warn!("Could not read job history: {:#}", e);
            0
        });
        if record_count == 0 || record_count <= trained {
            return Err(EvolutionError::TrainingInputMissing(format!(
                "{} records, {} already trained on",
                record_count, trained
            )));
        }
        Ok(self.run_locked(TrainingJob::new(record_count), lock).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_atomic_replaces_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("version.txt");

        write_atomic(&path, b"v0.1\n").unwrap();
        write_atomic(&path, b"v0.2\n").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "v0.2\n");
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_write_atomic_missing_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent").join("version.txt");
        assert!(write_atomic(&path, b"v0.1\n").is_err());
        assert!(!path.exists());
    }
}
