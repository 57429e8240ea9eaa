//! Classified pipeline errors.
//!
//! Lower-level failures (`anyhow`, `reqwest`, `serde_json`, io) are converted into a
//! [`PipelineError`] at the stage boundary. The orchestrator and the retry wrapper only ever
//! look at [`PipelineError::kind`].

use chrono::NaiveDate;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::llm::remote::{ApiStatusError, RequestTimeout};
use crate::pipeline::Stage;

/// How a failure is handled by the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network/API/oracle failure: retried, then halts the stage
    Transient,
    /// Malformed or out-of-range data: never retried
    Validation,
    /// Missing model, corrupt artifact, bad config: aborts immediately
    Structural,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Validation => "validation",
            ErrorKind::Structural => "structural",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("service error: {0:#}")]
    Service(anyhow::Error),

    #[error("timed out after {0}s")]
    Timeout(u64),

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("invalid ranking: {0}")]
    InvalidRanking(String),

    #[error("empty batch: {0}")]
    EmptyBatch(String),

    #[error("embedding model unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("artifact {}: {reason}", .path.display())]
    Artifact { path: PathBuf, reason: String },

    #[error("token budget exceeded: {used} of {limit} tokens used")]
    BudgetExceeded { used: usize, limit: usize },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("publish failed: {0}")]
    Publish(String),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Service(_) | PipelineError::Timeout(_) => ErrorKind::Transient,
            PipelineError::Rejected(_)
            | PipelineError::InvalidRanking(_)
            | PipelineError::EmptyBatch(_) => ErrorKind::Validation,
            PipelineError::EmbeddingUnavailable(_)
            | PipelineError::Artifact { .. }
            | PipelineError::BudgetExceeded { .. }
            | PipelineError::Config(_)
            | PipelineError::Publish(_) => ErrorKind::Structural,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Classify a failed LLM call: a refused request is rejected, an elapsed deadline is a
    /// timeout, anything else is a service error.
    pub fn from_llm(err: anyhow::Error) -> Self {
        if let Some(elapsed) = err.downcast_ref::<RequestTimeout>() {
            return PipelineError::Timeout(elapsed.timeout.as_secs());
        }
        match err.downcast_ref::<ApiStatusError>() {
            Some(status) if !status.is_retryable() => PipelineError::Rejected(status.to_string()),
            _ => PipelineError::Service(err),
        }
    }

    pub fn artifact(path: impl Into<PathBuf>, reason: impl fmt::Display) -> Self {
        PipelineError::Artifact {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(e: reqwest::Error) -> Self {
        PipelineError::Service(e.into())
    }
}

/// A stage that did not complete, with the date of the run it belongs to.
#[derive(Error, Debug)]
#[error("stage {stage} failed for {date} ({}): {error}", .error.kind())]
pub struct StageFailure {
    pub stage: Stage,
    pub date: NaiveDate,
    #[source]
    pub error: PipelineError,
}

impl StageFailure {
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
