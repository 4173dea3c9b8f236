//! Error types for the dedup ledger

use thiserror::Error;

/// Result type for ledger operations
pub type IdempotencyResult<T> = Result<T, IdempotencyError>;

/// Errors that can occur while claiming or releasing an event id
#[derive(Error, Debug)]
pub enum IdempotencyError {
    /// Database operation failed (connection, query execution, etc.)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Non-SQL ledger backend failed (e.g. a wide-column store session)
    #[error("Ledger backend error: {0}")]
    Backend(String),

    /// Our pending claim was taken over by another owner before completion
    #[error("Claim on event {0} was taken over by another owner")]
    ClaimLost(String),

    /// Event ID validation failed (empty, too long)
    #[error("Invalid event ID: {0}")]
    InvalidEventId(String),

    /// Generic error with context
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl IdempotencyError {
    /// Check if error is transient (should retry)
    ///
    /// Store and network faults are retried by the caller; a malformed
    /// event id will fail the same way on every attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, IdempotencyError::InvalidEventId(_))
    }
}
