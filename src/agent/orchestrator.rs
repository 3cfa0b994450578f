//! Chat Orchestrator
//!
//! One turn at a time: retrieve memories, compose a prompt, generate with
//! the live model, persist the exchange, then let the trigger look at the
//! new record count. No step of a turn can end the loop.

use anyhow::Result;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::llm::InferenceEngine;
use crate::error::EvolutionError;
use crate::evolution::{EvolutionTrigger, TriggerDecision, VersionManager};
use crate::memory::MemoryStore;
use crate::types::{DialogueRecord, VersionTag};

/// Reply used when generation fails
pub const FALLBACK_RESPONSE: &str = "I'm sorry, I couldn't generate a response right now. Please try again.";

/// Where the orchestrator is within a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    AwaitingInput,
    Retrieving,
    Generating,
    Persisting,
    Stopped,
}

/// Everything one turn produced
#[derive(Debug, Clone)]
pub struct TurnReport {
    pub response: String,
    /// None if the exchange could not be logged
    pub record: Option<DialogueRecord>,
    pub trigger: Option<TriggerDecision>,
    /// Version that served the turn
    pub version: VersionTag,
    pub memories_used: usize,
}

/// `quit` / `exit`, any case
pub fn is_quit(input: &str) -> bool {
    let input = input.trim();
    input.eq_ignore_ascii_case("quit") || input.eq_ignore_ascii_case("exit")
}

/// Build the generation prompt, with a memory block when there is anything to recall
pub fn compose_prompt(memories: &[String], input: &str) -> String {
    let conversation = format!("Current conversation:\nUser: {}\nAgent:", input);
    if memories.is_empty() {
        conversation
    } else {
        format!("Memory context (if any):\n{}\n\n{}", memories.join("\n"), conversation)
    }
}

pub struct ChatOrchestrator {
    memory: Arc<MemoryStore>,
    engine: Arc<dyn InferenceEngine>,
    versions: Arc<VersionManager>,
    trigger: Arc<EvolutionTrigger>,
    retrieval_k: usize,
    wait_on_exit: bool,
    state: TurnState,
}

impl ChatOrchestrator {
    pub fn new(
        memory: Arc<MemoryStore>,
        engine: Arc<dyn InferenceEngine>,
        versions: Arc<VersionManager>,
        trigger: Arc<EvolutionTrigger>,
        retrieval_k: usize,
    ) -> Self {
        Self {
            memory,
            engine,
            versions,
            trigger,
            retrieval_k,
            wait_on_exit: true,
            state: TurnState::AwaitingInput,
        }
    }

    pub fn with_wait_on_exit(mut self, wait: bool) -> Self {
        self.wait_on_exit = wait;
        self
    }

    /// Serve one user turn
    pub async fn handle_turn(&mut self, input: &str) -> TurnReport {
        self.state = TurnState::Retrieving;
        let memories = self.memory.retrieve(input, self.retrieval_k).await;
        debug!("Retrieved {} memories", memories.len());
        let prompt = compose_prompt(&memories, input);

        self.state = TurnState::Generating;
        // Read live so a promote takes effect on the next turn
        let version = self.versions.current();
        let response = match self.engine.generate(self.versions.model_id(), &prompt).await {
            Ok(text) => text,
            Err(e) => {
                let e = EvolutionError::InferenceUnavailable(format!("{:#}", e));
                warn!(kind = e.kind(), "Responding with fallback: {}", e);
                FALLBACK_RESPONSE.to_string()
            }
        };

        self.state = TurnState::Persisting;
        let (record, trigger) = match self.memory.append(input, &response).await {
            Ok(record) => {
                let decision = self.trigger.on_new_record(self.memory.count()).await;
                (Some(record), Some(decision))
            }
            Err(e) => {
                warn!("Exchange not logged: {:#}", e);
                (None, None)
            }
        };

        self.state = TurnState::AwaitingInput;
        TurnReport {
            response,
            record,
            trigger,
            version,
            memories_used: memories.len(),
        }
    }

    /// Interactive loop over `input` until quit or end of input
    pub async fn run<R, W>(&mut self, mut input: R, mut output: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        if self.state == TurnState::Stopped {
            anyhow::bail!("Chat session has already ended");
        }

        let banner = format!(
            "Evolving agent ready (model {} {}). Type 'quit' or 'exit' to stop.\n",
            self.versions.model_id(),
            self.versions.current()
        );
        output.write_all(banner.as_bytes()).await?;

        let mut buf = Vec::new();
        loop {
            self.state = TurnState::AwaitingInput;
            output.write_all(b"\nYou: ").await?;
            output.flush().await?;

            buf.clear();
            if input.read_until(b'\n', &mut buf).await? == 0 {
                break;
            }
            // Undecodable bytes are replaced rather than ending the session
            let line = String::from_utf8_lossy(&buf);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if is_quit(line) {
                break;
            }

            let report = self.handle_turn(line).await;
            output
                .write_all(format!("Agent ({}): {}\n", report.version, report.response).as_bytes())
                .await?;
            if let Some(TriggerDecision::Dispatched { .. }) = report.trigger {
                output
                    .write_all(b"[Learning from recent conversations in the background]\n")
                    .await?;
            }
        }

        self.shutdown(&mut output).await
    }

    async fn shutdown<W: AsyncWrite + Unpin>(&mut self, output: &mut W) -> Result<()> {
        if self.wait_on_exit && self.trigger.in_flight().await.is_some() {
            output
                .write_all(b"Waiting for the current training job to finish...\n")
                .await?;
            output.flush().await?;
            if let Some(job) = self.trigger.wait_idle().await {
                info!(job_id = %job.id, status = %job.status, "Training job resolved before exit");
            }
        }

        self.state = TurnState::Stopped;
        output.write_all(b"Goodbye!\n").await?;
        output.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_quit() {
        assert!(is_quit("quit"));
        assert!(is_quit("EXIT"));
        assert!(is_quit("  Quit \n"));
        assert!(!is_quit("quitting"));
        assert!(!is_quit(""));
    }

    #[test]
    fn test_prompt_without_memories() {
        assert_eq!(
            compose_prompt(&[], "hello"),
            "Current conversation:\nUser: hello\nAgent:"
        );
    }

    #[test]
    fn test_prompt_with_memories() {
        let memories = vec![
            "User: my cat is Miso\nAgent: Nice".to_string(),
            "User: I like tea\nAgent: Noted".to_string(),
        ];
        let prompt = compose_prompt(&memories, "what is my cat called?");
        assert!(prompt.starts_with("Memory context (if any):\nUser: my cat is Miso"));
        assert!(prompt.ends_with("\n\nCurrent conversation:\nUser: what is my cat called?\nAgent:"));
    }
}
