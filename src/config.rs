//! Configuration management
//!
//! Manages runtime paths, evolution thresholds, the local Ollama runtime,
//! embeddings and the fine-tuning command.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Where durable state lives
    #[serde(default)]
    pub paths: PathsConfig,
    /// Threshold and retrieval settings
    #[serde(default)]
    pub evolution: EvolutionConfig,
    /// Local inference runtime
    #[serde(default)]
    pub ollama: OllamaConfig,
    /// Embedding service
    #[serde(default)]
    pub embedding: EmbeddingSettings,
    /// Fine-tuning backend
    #[serde(default)]
    pub training: TrainingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Root for the dialogue log, index, models and training workspace
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_data_dir() -> PathBuf {
    data_dir().unwrap_or_else(|_| PathBuf::from("."))
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl PathsConfig {
    /// Append-only dialogue log
    pub fn dialogue_log(&self) -> PathBuf {
        self.data_dir.join("dialogues.jsonl")
    }

    /// Similarity index directory
    pub fn index_dir(&self) -> PathBuf {
        self.data_dir.join("memory")
    }

    pub fn models_dir(&self) -> PathBuf {
        self.data_dir.join("models")
    }

    /// Version marker holding the current tag
    pub fn version_file(&self) -> PathBuf {
        self.models_dir().join("version.txt")
    }

    /// Canonical adapter artifact
    pub fn adapter_path(&self) -> PathBuf {
        self.models_dir().join("latest_lora.safetensors")
    }

    pub fn training_dir(&self) -> PathBuf {
        self.data_dir.join("training")
    }

    /// Dataset handed to the fine-tuning backend
    pub fn training_export(&self) -> PathBuf {
        self.training_dir().join("dialogues_uploaded.jsonl")
    }

    /// Where the backend writes its raw adapter output
    pub fn training_output_dir(&self) -> PathBuf {
        self.training_dir().join("output")
    }

    pub fn job_history(&self) -> PathBuf {
        self.training_dir().join("history.jsonl")
    }

    /// Held by whichever process is running a training job
    pub fn job_lock(&self) -> PathBuf {
        self.training_dir().join("job.lock")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvolutionConfig {
    /// Records per training batch (N)
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Memories retrieved per turn
    #[serde(default = "default_retrieval_k")]
    pub retrieval_k: usize,
    /// Wait for a running training job before exiting
    #[serde(default = "default_true")]
    pub wait_on_exit: bool,
}

fn default_batch_size() -> usize {
    10
}

fn default_retrieval_k() -> usize {
    3
}

fn default_true() -> bool {
    true
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            retrieval_k: default_retrieval_k(),
            wait_on_exit: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaConfig {
    #[serde(default = "default_ollama_url")]
    pub base_url: String,
    /// Logical model name every turn resolves; only its build changes
    #[serde(default = "default_model_name")]
    pub model_name: String,
    /// Frozen base the adapter is merged onto
    #[serde(default = "default_base_model")]
    pub base_model: String,
    /// `ollama` binary used for `ollama create`
    #[serde(default = "default_ollama_bin")]
    pub ollama_bin: String,
    #[serde(default = "default_generate_timeout")]
    pub generate_timeout_secs: u64,
}

fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_model_name() -> String {
    "phi3:evolving".to_string()
}

fn default_base_model() -> String {
    "phi3:mini".to_string()
}

fn default_ollama_bin() -> String {
    "ollama".to_string()
}

fn default_generate_timeout() -> u64 {
    120
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: default_ollama_url(),
            model_name: default_model_name(),
            base_model: default_base_model(),
            ollama_bin: default_ollama_bin(),
            generate_timeout_secs: default_generate_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingSettings {
    #[serde(default)]
    pub provider: crate::memory::EmbeddingProvider,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_embedding_dim")]
    pub dimension: usize,
    /// Upper bound on a single embed/query call
    #[serde(default = "default_embedding_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
}

fn default_embedding_model() -> String {
    "all-minilm".to_string()
}

fn default_embedding_dim() -> usize {
    384
}

fn default_embedding_timeout() -> u64 {
    10
}

fn default_cache_size() -> usize {
    1000
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            provider: Default::default(),
            model: default_embedding_model(),
            dimension: default_embedding_dim(),
            timeout_secs: default_embedding_timeout(),
            cache_size: default_cache_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Program and arguments of the fine-tuning job
    #[serde(default = "default_training_command")]
    pub command: Vec<String>,
    /// Working directory for the job (defaults to the training dir)
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Optional upper bound on a training run
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

fn default_training_command() -> Vec<String> {
    vec!["python".to_string(), "train_lora.py".to_string()]
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            command: default_training_command(),
            working_dir: None,
            timeout_secs: None,
        }
    }
}

impl Config {
    /// Load configuration from the default file location
    pub fn load() -> Result<Self> {
        Self::load_from(&config_path()?)
    }

    /// Load configuration from a specific file, writing defaults if it is absent
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            let config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save configuration to a specific file
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let parent = path.parent().context("Config path has no parent")?;

        std::fs::create_dir_all(parent).context("Failed to create config directory")?;

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(path, contents).context("Failed to write config file")?;

        Ok(())
    }

    /// Reject settings the evolution loop cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.evolution.batch_size == 0 {
            anyhow::bail!("evolution.batch_size must be at least 1");
        }
        if self.training.command.is_empty() {
            anyhow::bail!("training.command must name a program");
        }
        Ok(())
    }
}

/// Get the configuration file path
pub fn config_path() -> Result<PathBuf> {
    let base = directories::ProjectDirs::from("com", "evolving-agent", "evolving-agent")
        .context("Failed to get project directories")?;
    Ok(base.config_dir().join("config.toml"))
}

/// Get the data directory path
pub fn data_dir() -> Result<PathBuf> {
    let base = directories::ProjectDirs::from("com", "evolving-agent", "evolving-agent")
        .context("Failed to get project directories")?;
    Ok(base.data_dir().to_path_buf())
}

/// Render the effective configuration as TOML
pub fn render(config: &Config) -> String {
    toml::to_string_pretty(config).unwrap_or_else(|_| "# Default configuration\n".to_string())
}
