//! Agent module - chat orchestration over the local inference engine

pub mod llm;
pub mod orchestrator;

use anyhow::Result;
use tracing::warn;

use crate::runtime::AgentRuntime;

/// Start an interactive text chat on stdin/stdout
pub async fn start_text_chat(runtime: &AgentRuntime) -> Result<()> {
    match runtime.versions.ensure_model().await {
        Ok(true) => eprintln!("Created model {} from {}", runtime.versions.model_id(), runtime.config.ollama.base_model),
        Ok(false) => {}
        Err(e) => warn!(
            "Could not prepare model {}, replies will use the fallback until it exists: {:#}",
            runtime.versions.model_id(),
            e
        ),
    }

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();
    runtime.orchestrator().run(stdin, stdout).await
}
