//! Error types for pool operations

/// Errors from pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The validator could not reach a verdict; nothing was evicted
    #[error("validation transport error: {0}")]
    Transport(String),

    #[error("invalid cron expression {expression:?}: {reason}")]
    InvalidExpression { expression: String, reason: String },

    #[error("unknown job: {0}")]
    UnknownJob(String),

    #[error("job already registered: {0}")]
    DuplicateJob(String),

    #[error("reconciliation partially failed: {0}")]
    PartialReconciliation(String),

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("acquisition failed: {0}")]
    Acquisition(String),

    #[error("pool store error: {0}")]
    Store(String),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
