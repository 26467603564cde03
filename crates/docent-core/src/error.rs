//! Failure taxonomy shared by the pipeline.
//!
//! Most functions return [`anyhow::Result`]; errors that callers need to
//! branch on (retry, isolate, or halt) are raised as a [`PipelineError`]
//! and recovered with `downcast_ref`.

use std::time::Duration;

use thiserror::Error;

/// Classified pipeline failure.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    /// External call failed in a way that may succeed on retry
    /// (rate limiting, 5xx, connection reset, request timeout).
    #[error("transient failure: {0}")]
    Transient(String),
    /// Input rejected: unsupported file type, empty document,
    /// malformed generation response.
    #[error("validation failed: {0}")]
    Validation(String),
    /// The index is in a state it must never be in. Requires operator
    /// intervention; never retried and never ignored.
    #[error("index consistency violated: {0}")]
    Consistency(String),
    /// A bounded operation ran past its deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl PipelineError {
    /// Whether a retry loop should try the operation again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::Transient(_))
    }
}

/// Returns true if `err` (or anything in its cause chain) is a retryable
/// [`PipelineError`].
pub fn is_transient(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|e| e.downcast_ref::<PipelineError>())
        .any(PipelineError::is_retryable)
}

/// Returns true if `err` carries a [`PipelineError::Consistency`].
pub fn is_consistency(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|e| e.downcast_ref::<PipelineError>())
        .any(|e| matches!(e, PipelineError::Consistency(_)))
}
