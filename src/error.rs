//! Error taxonomy for the evolution loop
//!
//! Chat-path kinds (`RetrievalUnavailable`, `InferenceUnavailable`) are always
//! recovered inside the turn. Training-path kinds are recovered inside the
//! background job and recorded in its history. None of them are fatal.

use thiserror::Error;

/// Errors the evolution loop distinguishes between
#[derive(Debug, Error)]
pub enum EvolutionError {
    /// Embedding or index call failed or timed out
    #[error("retrieval unavailable: {0}")]
    RetrievalUnavailable(String),

    /// Generation call failed
    #[error("inference unavailable: {0}")]
    InferenceUnavailable(String),

    /// No new records to export for training
    #[error("no training input: {0}")]
    TrainingInputMissing(String),

    /// The fine-tuning backend failed or produced no artifact
    #[error("training backend failed: {0}")]
    TrainingBackendFailure(String),

    /// The model build tool failed during promote
    #[error("model build failed: {0}")]
    BuildFailure(String),

    /// Version marker is unreadable or unparseable
    #[error("version state corrupt: {0}")]
    VersionStateCorrupt(String),

    /// Promote was invoked without an adapter artifact on disk
    #[error("adapter artifact missing: {0}")]
    AdapterMissing(String),

    /// Another training job holds the job lock
    #[error("training job already in progress: {0}")]
    JobInProgress(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EvolutionError {
    /// Stable name of the error kind, used as a log field
    pub fn kind(&self) -> &'static str {
        match self {
            EvolutionError::RetrievalUnavailable(_) => "RetrievalUnavailable",
            EvolutionError::InferenceUnavailable(_) => "InferenceUnavailable",
            EvolutionError::TrainingInputMissing(_) => "TrainingInputMissing",
            EvolutionError::TrainingBackendFailure(_) => "TrainingBackendFailure",
            EvolutionError::BuildFailure(_) => "BuildFailure",
            EvolutionError::VersionStateCorrupt(_) => "VersionStateCorrupt",
            EvolutionError::AdapterMissing(_) => "AdapterMissing",
            EvolutionError::JobInProgress(_) => "JobInProgress",
            EvolutionError::Io(_) => "Io",
        }
    }
}

pub type EvolutionResult<T> = std::result::Result<T, EvolutionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names() {
        assert_eq!(EvolutionError::BuildFailure("x".into()).kind(), "BuildFailure");
        assert_eq!(
            EvolutionError::RetrievalUnavailable("timeout".into()).kind(),
            "RetrievalUnavailable"
        );
        assert_eq!(EvolutionError::JobInProgress("training/job.lock".into()).kind(), "JobInProgress");
    }

    #[test]
    fn test_display() {
        let err = EvolutionError::AdapterMissing("models/latest_lora.safetensors".into());
        assert_eq!(
            err.to_string(),
            "adapter artifact missing: models/latest_lora.safetensors"
        );
    }
}
