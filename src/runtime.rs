//! Wires the memory store, inference engine, version manager and trigger
//! together from a `Config`.

use anyhow::{Context, Result};
use std::sync::Arc;

use crate::agent::llm::{InferenceEngine, OllamaClient};
use crate::agent::orchestrator::ChatOrchestrator;
use crate::config::Config;
use crate::evolution::{
    CommandBackend, EvolutionRunner, EvolutionTrigger, FineTuneBackend, FineTuningPipeline, JobHistory,
    TrainingLayout, VersionManager,
};
use crate::memory::{Embedder, EmbeddingConfig, EmbeddingModel, MemoryConfig, MemoryStore};

/// Every long-lived component of a running agent
pub struct AgentRuntime {
    pub config: Config,
    pub memory: Arc<MemoryStore>,
    pub engine: Arc<dyn InferenceEngine>,
    pub versions: Arc<VersionManager>,
    pub runner: Arc<EvolutionRunner>,
    pub trigger: Arc<EvolutionTrigger>,
}

impl AgentRuntime {
    /// Build against Ollama and the configured training command
    pub async fn from_config(config: Config) -> Result<Self> {
        let engine: Arc<dyn InferenceEngine> = Arc::new(OllamaClient::new(
            &config.ollama,
            config.paths.models_dir(),
        )?);
        let embedder: Arc<dyn Embedder> = Arc::new(EmbeddingModel::new(EmbeddingConfig::from_settings(
            &config.embedding,
            &config.ollama.base_url,
        ))?);
        let backend: Arc<dyn FineTuneBackend> = Arc::new(CommandBackend::from_config(
            &config.training,
            &config.paths.training_dir(),
        )?);

        Self::with_components(config, engine, embedder, backend).await
    }

    /// Build with caller-supplied collaborators
    pub async fn with_components(
        config: Config,
        engine: Arc<dyn InferenceEngine>,
        embedder: Arc<dyn Embedder>,
        backend: Arc<dyn FineTuneBackend>,
    ) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.paths.data_dir).with_context(|| {
            format!("Failed to create data directory {}", config.paths.data_dir.display())
        })?;

        let memory = Arc::new(
            MemoryStore::open(MemoryConfig::from_config(&config), embedder)
                .await
                .context("Failed to open memory store")?,
        );
        let versions = Arc::new(VersionManager::from_config(&config, engine.clone())?);

        let pipeline = FineTuningPipeline::new(memory.clone(), backend, TrainingLayout::from_paths(&config.paths));
        let runner = Arc::new(EvolutionRunner::new(
            pipeline,
            versions.clone(),
            JobHistory::new(config.paths.job_history()),
            config.paths.job_lock(),
        ));
        let trigger = Arc::new(EvolutionTrigger::new(config.evolution.batch_size, runner.clone()));

        Ok(Self {
            config,
            memory,
            engine,
            versions,
            runner,
            trigger,
        })
    }

    pub fn orchestrator(&self) -> ChatOrchestrator {
        ChatOrchestrator::new(
            self.memory.clone(),
            self.engine.clone(),
            self.versions.clone(),
            self.trigger.clone(),
            self.config.evolution.retrieval_k,
        )
        .with_wait_on_exit(self.config.evolution.wait_on_exit)
    }
}
