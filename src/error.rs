//! Error types for the report dispatcher

use thiserror::Error;

/// Result type alias for dispatcher operations
pub type Result<T> = std::result::Result<T, DispatchError>;

#[derive(Error, Debug)]
pub enum DispatchError {

    // =============================
    // Domain Errors
    // =============================

    /// Missing or invalid user configuration. Fatal for that user's tick;
    /// the scheduler skips the user and moves on.
    #[error("Config error: {0}")]
    Config(String),

    /// Token or signature mismatch. Rejected, never retried.
    #[error("Auth error: {0}")]
    Auth(String),

    /// Ledger API failure. Retryable within the per-period attempt bound.
    #[error("Data fetch error: {0}")]
    DataFetch(String),

    /// AI workflow failure. Retryable within the per-period attempt bound.
    #[error("Workflow error: {0}")]
    Workflow(String),

    /// Notification delivery failure. Retryable within the per-period
    /// attempt bound.
    #[error("Delivery error: {0}")]
    Delivery(String),

    /// A concurrent fire attempt already holds the (user, kind) slot.
    /// Skipped silently, never surfaced to the user.
    #[error("Scheduling conflict: {0}")]
    SchedulingConflict(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DispatchError {
    /// Whether the scheduler may retry this failure on a later tick
    /// within the same recurrence period.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DispatchError::DataFetch(_)
                | DispatchError::Workflow(_)
                | DispatchError::Delivery(_)
        )
    }
}
