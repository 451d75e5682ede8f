use crate::platform::SendError;
use thiserror::Error;

/// Failure classes of the ingestion, summarization and reply pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Missing or zero identifiers. Raised before any side effect.
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("store failure: {0:#}")]
    Store(anyhow::Error),
    /// The model answered, but not with the structure we asked for.
    #[error("unparseable model response: {0}")]
    Parse(String),
    #[error("model call failed: {0:#}")]
    Llm(anyhow::Error),
    #[error("delivery failed: {0}")]
    Delivery(#[from] SendError),
}

impl PipelineError {
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Validation(_) => "validation",
            PipelineError::Store(_) => "store",
            PipelineError::Parse(_) => "parse",
            PipelineError::Llm(_) => "llm",
            PipelineError::Delivery(_) => "delivery",
        }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
