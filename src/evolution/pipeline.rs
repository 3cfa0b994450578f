//! Fine-Tuning Pipeline
//!
//! Exports a fixed prefix of the dialogue log, runs the fine-tuning backend
//! and normalizes whatever adapter it produced into the canonical artifact.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::artifact::{self, AdapterArtifact, RAW_OUTPUT, SAFETENSORS_OUTPUT};
use super::write_atomic;
use crate::config::{PathsConfig, TrainingConfig};
use crate::error::{EvolutionError, EvolutionResult};
use crate::memory::MemoryStore;
use crate::types::DialogueRecord;

/// What the backend is asked to train on
#[derive(Debug, Clone)]
pub struct TrainingRequest {
    /// JSONL file, one `{user, agent, timestamp}` object per line
    pub dataset_path: PathBuf,
    /// Directory the backend writes its adapter into
    pub output_dir: PathBuf,
    pub record_count: u64,
}

/// Produces adapter weights from an exported dataset
#[async_trait]
pub trait FineTuneBackend: Send + Sync {
    /// Train; success means an adapter file is now in `request.output_dir`
    async fn train(&self, request: &TrainingRequest) -> Result<()>;

    fn name(&self) -> &str;
}

/// Runs an external training command
///
/// The dataset, output directory and record count are passed as
/// `EVOLVING_AGENT_DATASET`, `EVOLVING_AGENT_OUTPUT_DIR` and
/// `EVOLVING_AGENT_RECORD_COUNT`.
#[derive(Debug, Clone)]
pub struct CommandBackend {
    program: String,
    args: Vec<String>,
    working_dir: PathBuf,
    timeout: Option<Duration>,
}

impl CommandBackend {
    pub fn new(program: impl Into<String>, args: Vec<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args,
            working_dir: working_dir.into(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn from_config(config: &TrainingConfig, default_dir: &Path) -> Result<Self> {
        let (program, args) = config
            .command
            .split_first()
            .context("training.command must name a program")?;
        let working_dir = config.working_dir.clone().unwrap_or_else(|| default_dir.to_path_buf());

        let backend = Self::new(program.clone(), args.to_vec(), working_dir);
        Ok(match config.timeout_secs {
            Some(secs) => backend.with_timeout(Duration::from_secs(secs)),
            None => backend,
        })
    }
}

#[async_trait]
impl FineTuneBackend for CommandBackend {
    async fn train(&self, request: &TrainingRequest) -> Result<()> {
        tokio::fs::create_dir_all(&self.working_dir)
            .await
            .context("Failed to create training working directory")?;

        let run = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .current_dir(&self.working_dir)
            .env("EVOLVING_AGENT_DATASET", &request.dataset_path)
            .env("EVOLVING_AGENT_OUTPUT_DIR", &request.output_dir)
            .env("EVOLVING_AGENT_RECORD_COUNT", request.record_count.to_string())
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, run)
                .await
                .map_err(|_| anyhow::anyhow!("{} timed out after {:?}", self.program, limit))?,
            None => run.await,
        }
        .with_context(|| format!("Failed to run {}", self.program))?;

        debug!("{} stdout: {}", self.program, String::from_utf8_lossy(&output.stdout).trim());
        if !output.status.success() {
            bail!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                tail(&String::from_utf8_lossy(&output.stderr), 20)
            );
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.program
    }
}

/// Last `lines` lines of process output
fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.trim().lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

/// Well-known training locations
#[derive(Debug, Clone)]
pub struct TrainingLayout {
    pub export_path: PathBuf,
    pub output_dir: PathBuf,
    /// Canonical adapter artifact
    pub adapter_path: PathBuf,
}

impl TrainingLayout {
    pub fn from_paths(paths: &PathsConfig) -> Self {
        Self {
            export_path: paths.training_export(),
            output_dir: paths.training_output_dir(),
            adapter_path: paths.adapter_path(),
        }
    }
}

/// Line of the exported dataset, in the keys the training script reads
#[derive(Serialize)]
struct ExportLine<'a> {
    user: &'a str,
    agent: &'a str,
    timestamp: String,
}

pub struct FineTuningPipeline {
    memory: Arc<MemoryStore>,
    backend: Arc<dyn FineTuneBackend>,
    layout: TrainingLayout,
}

impl FineTuningPipeline {
    pub fn new(memory: Arc<MemoryStore>, backend: Arc<dyn FineTuneBackend>, layout: TrainingLayout) -> Self {
        Self {
            memory,
            backend,
            layout,
        }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn layout(&self) -> &TrainingLayout {
        &self.layout
    }

    /// Train on exactly the first `record_count` records
    pub async fn run(&self, record_count: u64) -> EvolutionResult<AdapterArtifact> {
        let memory = self.memory.clone();
        let records = tokio::task::spawn_blocking(move || memory.snapshot(record_count))
            .await
            .map_err(|e| EvolutionError::TrainingInputMissing(e.to_string()))?
            .map_err(|e| EvolutionError::TrainingInputMissing(format!("{:#}", e)))?;
        if records.is_empty() {
            return Err(EvolutionError::TrainingInputMissing("dialogue log is empty".to_string()));
        }
        if (records.len() as u64) < record_count {
            warn!("Exporting {} of {} requested records", records.len(), record_count);
        }

        self.export(&records)?;
        self.clear_output()?;

        let request = TrainingRequest {
            dataset_path: self.layout.export_path.clone(),
            output_dir: self.layout.output_dir.clone(),
            record_count: records.len() as u64,
        };
        info!(
            "Fine-tuning on {} records with {}",
            request.record_count,
            self.backend.name()
        );
        self.backend
            .train(&request)
            .await
            .map_err(|e| EvolutionError::TrainingBackendFailure(format!("{:#}", e)))?;

        let output_dir = self.layout.output_dir.clone();
        let adapter_path = self.layout.adapter_path.clone();
        tokio::task::spawn_blocking(move || artifact::normalize(&output_dir, &adapter_path))
            .await
            .map_err(|e| EvolutionError::TrainingBackendFailure(e.to_string()))?
    }

    fn export(&self, records: &[DialogueRecord]) -> EvolutionResult<()> {
        let mut dataset = String::new();
        for record in records {
            let line = ExportLine {
                user: &record.user_text,
                agent: &record.agent_text,
                timestamp: record.timestamp.to_rfc3339(),
            };
            let line = serde_json::to_string(&line)
                .map_err(|e| EvolutionError::TrainingInputMissing(e.to_string()))?;
            dataset.push_str(&line);
            dataset.push('\n');
        }

        if let Some(parent) = self.layout.export_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        write_atomic(&self.layout.export_path, dataset.as_bytes())?;
        debug!("Exported {} records to {}", records.len(), self.layout.export_path.display());
        Ok(())
    }

    /// Remove adapter files left by an earlier run
    fn clear_output(&self) -> EvolutionResult<()> {
        std::fs::create_dir_all(&self.layout.output_dir)?;
        for name in [SAFETENSORS_OUTPUT, RAW_OUTPUT] {
            let stale = self.layout.output_dir.join(name);
            if stale.exists() {
                std::fs::remove_file(&stale)?;
            }
        }
        Ok(())
    }
}
