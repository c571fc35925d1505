//! Error types for the control surface and the planner

use thiserror::Error;

use crate::store::StoreError;
use crate::worker::WorkerError;

/// Cursor / word-count accounting mismatch
///
/// Always a programming error. Never clamped or swallowed: the worker halts
/// the session and surfaces this to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invariant violation in session {session_id}: {detail}")]
pub struct InvariantViolation {
    pub session_id: String,
    pub detail: String,
}

impl InvariantViolation {
    pub fn new(session_id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            detail: detail.into(),
        }
    }
}

/// Errors returned by control operations (start/pause/resume/cancel/status)
#[derive(Debug, Error)]
pub enum DripError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Session {0} changed concurrently, try again")]
    Conflict(String),

    #[error(transparent)]
    Invariant(#[from] InvariantViolation),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl DripError {
    pub fn is_validation(&self) -> bool {
        matches!(self, DripError::Validation(_))
    }
}

impl From<WorkerError> for DripError {
    fn from(err: WorkerError) -> Self {
        match err {
            WorkerError::NotFound(id) => DripError::NotFound(id),
            WorkerError::Invariant(violation) => DripError::Invariant(violation),
            WorkerError::Store(e) => DripError::Store(e),
        }
    }
}

/// Truncate an error summary before it is persisted
pub fn truncate_error(message: &str, max_len: usize) -> String {
    if message.chars().count() <= max_len {
        return message.to_string();
    }
    message.chars().take(max_len).collect()
}
