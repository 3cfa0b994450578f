//! Training jobs and their on-disk history
//!
//! A job is created Pending by the trigger, moved to Running by the
//! background task and resolved exactly once. Resolved jobs are folded into
//! an append-only JSONL history.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::warn;
use uuid::Uuid;

use super::artifact::AdapterArtifact;
use crate::error::EvolutionError;
use crate::types::VersionTag;

/// Job lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Succeeded => write!(f, "succeeded"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Why a job failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    /// Error kind name (`TrainingBackendFailure`, `BuildFailure`, ...)
    pub kind: String,
    pub reason: String,
}

/// Typed result of one fine-tune + promote run
#[derive(Debug)]
pub enum JobOutcome {
    Succeeded {
        artifact: AdapterArtifact,
        version: VersionTag,
    },
    Failed(EvolutionError),
}

/// A single fine-tune + promote attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingJob {
    pub id: Uuid,
    pub status: JobStatus,
    /// Records in the snapshot this job trains on
    pub source_record_count: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result_artifact: Option<AdapterArtifact>,
    /// Version tag promoted by this job
    pub version: Option<String>,
    pub failure: Option<JobFailure>,
}

impl TrainingJob {
    pub fn new(source_record_count: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: JobStatus::Pending,
            source_record_count,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            result_artifact: None,
            version: None,
            failure: None,
        }
    }

    pub fn start(&mut self) {
        self.status = JobStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn succeed(&mut self, artifact: AdapterArtifact, version: VersionTag) {
        self.status = JobStatus::Succeeded;
        self.finished_at = Some(Utc::now());
        self.result_artifact = Some(artifact);
        self.version = Some(version.to_string());
    }

    pub fn fail(&mut self, error: &EvolutionError) {
        self.fail_with(error.kind(), error.to_string());
    }

    pub fn fail_with(&mut self, kind: &str, reason: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.finished_at = Some(Utc::now());
        self.failure = Some(JobFailure {
            kind: kind.to_string(),
            reason: reason.into(),
        });
    }

    /// Apply the outcome of a run
    pub fn resolve(&mut self, outcome: JobOutcome) {
        match outcome {
            JobOutcome::Succeeded { artifact, version } => self.succeed(artifact, version),
            JobOutcome::Failed(error) => self.fail(&error),
        }
    }

    /// Wall time from start to resolution
    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.finished_at? - self.started_at?)
    }

    /// Short id for log lines
    pub fn short_id(&self) -> String {
        self.id.to_string()[..8].to_string()
    }
}

/// Append-only record of resolved jobs
#[derive(Debug, Clone)]
pub struct JobHistory {
    path: PathBuf,
}

impl JobHistory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fold a resolved job into the history
    pub fn append(&self, job: &TrainingJob) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create job history directory")?;
        }
        let mut line = serde_json::to_string(job).context("Failed to serialize training job")?;
        line.push('\n');

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open job history {}", self.path.display()))?;
        file.write_all(line.as_bytes())?;
        file.sync_data()?;
        Ok(())
    }

    /// All readable jobs, oldest first
    pub fn load(&self) -> Result<Vec<TrainingJob>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = std::fs::File::open(&self.path)
            .with_context(|| format!("Failed to open job history {}", self.path.display()))?;

        let mut jobs = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TrainingJob>(&line) {
                Ok(job) => jobs.push(job),
                Err(e) => warn!("Skipping unreadable job history line: {}", e),
            }
        }
        Ok(jobs)
    }

    pub fn last(&self) -> Result<Option<TrainingJob>> {
        Ok(self.load()?.pop())
    }

    /// Highest record count any job was dispatched for
    pub fn last_dispatched_count(&self) -> Result<u64> {
        Ok(self.load()?.iter().map(|j| j.source_record_count).max().unwrap_or(0))
    }

    /// Highest record count a job successfully trained on
    pub fn last_trained_count(&self) -> Result<u64> {
        Ok(self
            .load()?
            .iter()
            .filter(|j| j.status == JobStatus::Succeeded)
            .map(|j| j.source_record_count)
            .max()
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_lifecycle() {
        let mut job = TrainingJob::new(10);
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.duration().is_none());

        job.start();
        assert_eq!(job.status, JobStatus::Running);

        job.fail(&EvolutionError::TrainingBackendFailure("exit status 1".into()));
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.failure.as_ref().unwrap().kind, "TrainingBackendFailure");
        assert!(job.duration().is_some());
    }

    #[test]
    fn test_history_roundtrip_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        let history = JobHistory::new(dir.path().join("training").join("history.jsonl"));
        assert!(history.last().unwrap().is_none());

        let mut ok = TrainingJob::new(10);
        ok.start();
        ok.succeed(
            AdapterArtifact {
                path: dir.path().join("latest_lora.safetensors"),
                sha256: "00".repeat(32),
                size_bytes: 8,
                source_format: super::super::artifact::ArtifactFormat::Raw,
            },
            VersionTag::parse("v0.2").unwrap(),
        );
        history.append(&ok).unwrap();

        let mut failed = TrainingJob::new(20);
        failed.start();
        failed.fail(&EvolutionError::BuildFailure("ollama create exited 1".into()));
        history.append(&failed).unwrap();

        let jobs = history.load().unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].version.as_deref(), Some("v0.2"));
        assert_eq!(history.last().unwrap().unwrap().id, failed.id);
        assert_eq!(history.last_dispatched_count().unwrap(), 20);
        assert_eq!(history.last_trained_count().unwrap(), 10);
    }
}
