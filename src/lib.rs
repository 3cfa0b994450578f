//! Evolving Agent - self-evolving local chat agent
//!
//! A chat loop over a local Ollama model with:
//! - Durable dialogue log and semantic memory retrieval
//! - Threshold-triggered LoRA fine-tuning on a background task
//! - Version-gated model promotion (`v0.1`, `v0.2`, ...)
//!
//! # Example
//!
//! ```ignore
//! use evolving_agent::{AgentRuntime, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = AgentRuntime::from_config(Config::load()?).await?;
//!     let report = runtime.orchestrator().handle_turn("Hello!").await;
//!     println!("{}", report.response);
//!     Ok(())
//! }
//! ```

// Core modules (order matters for cross-module dependencies)
pub mod types;
pub mod error;
pub mod config;
pub mod memory; // Must come before agent since agent depends on memory
pub mod agent;
pub mod evolution;
pub mod runtime;
pub mod cli;

pub use agent::{
    llm::{InferenceEngine, OllamaClient},
    orchestrator::{ChatOrchestrator, TurnReport},
};

pub use memory::{Embedder, MemoryConfig, MemoryStore};

pub use evolution::{
    AdapterArtifact, EvolutionRunner, EvolutionTrigger, FineTuneBackend, JobStatus, TrainingJob, TriggerDecision,
    VersionManager,
};

pub use config::Config;
pub use error::{EvolutionError, EvolutionResult};
pub use runtime::AgentRuntime;
pub use types::{DialogueRecord, VersionTag};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
