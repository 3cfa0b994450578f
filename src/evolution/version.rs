//! Version Manager
//!
//! Owns the version marker (`models/version.txt`, one tag per file) and the
//! logical model name the inference engine always resolves. A promote builds
//! the new model first and only then replaces the marker.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::artifact::AdapterArtifact;
use super::write_atomic;
use crate::agent::llm::InferenceEngine;
use crate::error::{EvolutionError, EvolutionResult};
use crate::types::{ModelVersion, VersionTag};

pub struct VersionManager {
    marker_path: PathBuf,
    model_name: String,
    base_model: String,
    engine: Arc<dyn InferenceEngine>,
    /// Serializes promotes
    promote_lock: Mutex<()>,
    corrupt_warned: AtomicBool,
}

impl VersionManager {
    /// Open the marker, initializing it to `v0.1` when absent
    pub fn open(
        marker_path: impl Into<PathBuf>,
        model_name: impl Into<String>,
        base_model: impl Into<String>,
        engine: Arc<dyn InferenceEngine>,
    ) -> Result<Self> {
        let marker_path = marker_path.into();
        if !marker_path.exists() {
            if let Some(parent) = marker_path.parent() {
                std::fs::create_dir_all(parent).context("Failed to create models directory")?;
            }
            write_marker(&marker_path, VersionTag::INITIAL)
                .with_context(|| format!("Failed to initialize {}", marker_path.display()))?;
            info!("Initialized model version {}", VersionTag::INITIAL);
        }

        Ok(Self {
            marker_path,
            model_name: model_name.into(),
            base_model: base_model.into(),
            engine,
            promote_lock: Mutex::new(()),
            corrupt_warned: AtomicBool::new(false),
        })
    }

    pub fn from_config(config: &crate::config::Config, engine: Arc<dyn InferenceEngine>) -> Result<Self> {
        Self::open(
            config.paths.version_file(),
            config.ollama.model_name.clone(),
            config.ollama.base_model.clone(),
            engine,
        )
    }

    /// Logical model name; stays the same across promotes
    pub fn model_id(&self) -> &str {
        &self.model_name
    }

    pub fn marker_path(&self) -> &Path {
        &self.marker_path
    }

    /// Parse the marker as it is on disk
    pub fn read_marker(&self) -> EvolutionResult<VersionTag> {
        let contents = std::fs::read_to_string(&self.marker_path).map_err(|e| {
            EvolutionError::VersionStateCorrupt(format!("{}: {}", self.marker_path.display(), e))
        })?;
        contents.parse()
    }

    /// The live version, read from disk on every call
    ///
    /// A corrupt or unreadable marker reads as `v0.1`.
    pub fn current(&self) -> VersionTag {
        match self.read_marker() {
            Ok(tag) => tag,
            Err(e) => {
                if !self.corrupt_warned.swap(true, Ordering::Relaxed) {
                    warn!(kind = e.kind(), "Falling back to {}: {}", VersionTag::INITIAL, e);
                }
                VersionTag::INITIAL
            }
        }
    }

    /// The live version with the time it was recorded
    pub fn model_version(&self) -> ModelVersion {
        let created_at = std::fs::metadata(&self.marker_path)
            .and_then(|m| m.modified())
            .ok()
            .map(DateTime::<Utc>::from);
        ModelVersion {
            version_tag: self.current(),
            created_at,
        }
    }

    /// Build the logical model from the base if the engine does not have it
    ///
    /// Returns whether a build was performed.
    pub async fn ensure_model(&self) -> Result<bool> {
        if self.engine.has_model(&self.model_name).await? {
            return Ok(false);
        }
        info!("Model {} not found, building it from {}", self.model_name, self.base_model);
        self.engine
            .build_model(&self.model_name, &self.base_model, None)
            .await
            .with_context(|| format!("Failed to build {}", self.model_name))?;
        Ok(true)
    }

    /// Merge `artifact` into the logical model and advance the version
    ///
    /// The marker is only replaced after the build succeeds; on any error the
    /// previous version stays current.
    pub async fn promote(&self, artifact: &AdapterArtifact) -> EvolutionResult<VersionTag> {
        let _guard = self.promote_lock.lock().await;

        artifact.verify()?;

        let previous = self.current();
        let next = previous.next()?;
        info!("Promoting {} -> {} with {}", previous, next, artifact.path.display());

        self.engine
            .build_model(&self.model_name, &self.base_model, Some(&artifact.path))
            .await
            .map_err(|e| EvolutionError::BuildFailure(format!("{:#}", e)))?;

        write_marker(&self.marker_path, next)?;
        self.corrupt_warned.store(false, Ordering::Relaxed);
        info!("Model {} is now {}", self.model_name, next);
        Ok(next)
    }
}

fn write_marker(path: &Path, tag: VersionTag) -> std::io::Result<()> {
    write_atomic(path, format!("{}\n", tag).as_bytes())
}
