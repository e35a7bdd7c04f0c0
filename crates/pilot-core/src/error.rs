//! Error types for pilot-core

use thiserror::Error;

use crate::forge::ForgeError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("forge error: {0}")]
    Forge(#[from] ForgeError),

    #[error("PR not found: {0}")]
    PrNotFound(i64),

    #[error("invalid state transition: {0} -> {1}")]
    InvalidStateTransition(String, String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid environment type: {0}")]
    InvalidEnvironmentType(String),

    #[error("unknown environment: {0}")]
    UnknownEnvironment(String),

    #[error("approval manager not configured")]
    ApprovalManagerNotConfigured,

    #[error("approval denied by {0}")]
    ApprovalDenied(String),

    #[error("approval timed out")]
    ApprovalTimedOut,

    #[error("merge conflict with base branch")]
    MergeConflict,

    #[error("CI wait timed out after {0}s")]
    CiTimeout(u64),

    #[error("CI fix iteration limit reached ({0})")]
    CiFixIterationExceeded(u32),

    #[error("CI status changed before merge could complete")]
    CiStatusChangedBeforeMerge,

    #[error("circuit breaker open for PR #{0}")]
    CircuitBreakerOpen(i64),

    #[error("operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether this error represents a definitive, non-retryable outcome for
    /// the PR that produced it (as opposed to a transient forge hiccup).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Error::ApprovalDenied(_)
                | Error::ApprovalTimedOut
                | Error::CiTimeout(_)
                | Error::CiFixIterationExceeded(_)
                | Error::MergeConflict
                | Error::InvalidEnvironmentType(_)
                | Error::UnknownEnvironment(_)
                | Error::ApprovalManagerNotConfigured
        )
    }
}
