//! Error types for the progression engine and its stores.

use thiserror::Error;

/// Failures reported by stats/badge/activity stores.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Store unreachable or timed out. Nothing is assumed committed.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Uniqueness constraint hit (row already created by someone else).
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("xp overflow for learner {0}")]
    Overflow(String),
}

/// Errors surfaced by engine operations.
#[derive(Error, Debug)]
pub enum ProgressionError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("unknown badge: {0}")]
    UnknownBadge(String),

    #[error("attempt {0} was never started")]
    UnknownAttempt(String),

    /// Observed state the monotonic-award model cannot produce.
    #[error("data integrity violation for learner {learner_id}: {detail}")]
    DataIntegrity { learner_id: String, detail: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl ProgressionError {
    /// True for transient I/O failures the caller may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProgressionError::Store(StoreError::Unavailable(_)))
    }
}
