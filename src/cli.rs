//! CLI interface for evolving-agent

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::{self, Config};
use crate::error::EvolutionError;
use crate::evolution::AdapterArtifact;
use crate::runtime::AgentRuntime;

#[derive(Parser)]
#[command(name = "evolving-agent")]
#[command(about = "Local chat agent that fine-tunes itself on its own conversations", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (default: platform config dir)
    #[arg(long, global = true, env = "EVOLVING_AGENT_CONFIG")]
    config: Option<PathBuf>,

    /// Directory for the dialogue log, index, models and training files
    #[arg(long, global = true, env = "EVOLVING_AGENT_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Records per training batch
    #[arg(long, global = true, env = "EVOLVING_AGENT_BATCH_SIZE")]
    batch_size: Option<usize>,

    /// Memories retrieved per turn
    #[arg(long, global = true, env = "EVOLVING_AGENT_RETRIEVAL_K")]
    retrieval_k: Option<usize>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an interactive chat session (default)
    Chat,
    /// Show model version, record count and the last training job
    Status,
    /// Fine-tune and promote now on all records not yet trained on
    Evolve,
    /// Inspect configuration
    Config {
        /// Print the effective configuration
        #[arg(long)]
        show: bool,
        /// Print the config file location
        #[arg(long)]
        path: bool,
    },
}

impl Cli {
    /// File config with flag/env overrides applied
    fn load_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load_from(path)?,
            None => Config::load()?,
        };
        if let Some(dir) = &self.data_dir {
            config.paths.data_dir = dir.clone();
        }
        if let Some(n) = self.batch_size {
            config.evolution.batch_size = n;
        }
        if let Some(k) = self.retrieval_k {
            config.evolution.retrieval_k = k;
        }
        config.validate()?;
        Ok(config)
    }
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config()?;

    match cli.command.unwrap_or(Commands::Chat) {
        Commands::Chat => {
            let runtime = AgentRuntime::from_config(config).await?;
            crate::agent::start_text_chat(&runtime).await?;
        }
        Commands::Status => {
            let runtime = AgentRuntime::from_config(config).await?;
            show_status(&runtime).await?;
        }
        Commands::Evolve => {
            let runtime = AgentRuntime::from_config(config).await?;
            evolve(&runtime).await?;
        }
        Commands::Config { show, path } => {
            if path {
                match &cli.config {
                    Some(p) => println!("{}", p.display()),
                    None => println!("{}", config::config_path()?.display()),
                }
            } else if show {
                print!("{}", config::render(&config));
            } else {
                println!("Use --show to print the configuration or --path for its location.");
            }
        }
    }

    Ok(())
}

async fn show_status(runtime: &AgentRuntime) -> Result<()> {
    let version = runtime.versions.model_version();
    let records = runtime.memory.count();
    let batch = runtime.config.evolution.batch_size as u64;

    println!("Model:        {} ({})", runtime.versions.model_id(), version.version_tag);
    if let Some(at) = version.created_at {
        println!("Promoted at:  {}", at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    println!("Records:      {}", records);
    println!("Indexed:      {}", runtime.memory.indexed_count().await?);
    println!("Embeddings:   {}", runtime.memory.embedder_name());
    println!("Next trigger: {} records", (records / batch + 1) * batch);
    match AdapterArtifact::open(&runtime.config.paths.adapter_path()) {
        Ok(artifact) => println!(
            "Adapter:      {} ({} bytes, sha256 {})",
            artifact.path.display(),
            artifact.size_bytes,
            artifact.sha256
        ),
        Err(e) => println!("Adapter:      {}", e),
    }
    println!("Data dir:     {}", runtime.config.paths.data_dir.display());

    match runtime.runner.history().last()? {
        Some(job) => {
            println!("Last job:     {} {} ({} records)", job.short_id(), job.status, job.source_record_count);
            if let Some(took) = job.duration() {
                println!("  took        {}s", took.num_seconds());
            }
            if let Some(version) = &job.version {
                println!("  produced    {}", version);
            }
            if let Some(failure) = &job.failure {
                println!("  failed      {}: {}", failure.kind, failure.reason);
            }
        }
        None => println!("Last job:     none"),
    }
    Ok(())
}

async fn evolve(runtime: &AgentRuntime) -> Result<()> {
    let count = runtime.memory.count();
    match runtime.runner.evolve_now(count).await {
        Ok(job) => {
            match &job.version {
                Some(version) => println!("Promoted {} to {} on {} records", runtime.versions.model_id(), version, count),
                None => {
                    let reason = job.failure.as_ref().map(|f| f.reason.as_str()).unwrap_or("unknown");
                    println!("Training job {} failed: {}", job.short_id(), reason);
                }
            }
            Ok(())
        }
        Err(e @ EvolutionError::TrainingInputMissing(_)) => {
            println!("Nothing new to train on ({})", e);
            Ok(())
        }
        Err(e @ EvolutionError::JobInProgress(_)) => {
            println!("Not starting: {}", e);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
