//! ReachLoop error types.

use thiserror::Error;

/// Errors surfaced by the pipeline components.
#[derive(Debug, Error)]
pub enum ReachError {
    /// Record store failure (transient: logged, never aborts a batch).
    #[error("store error: {0}")]
    Store(String),

    #[error("record not found: {0}")]
    NotFound(String),

    /// Write rejected because the caller read a stale version.
    #[error("version conflict on '{id}': expected {expected:?}, found {found:?}")]
    Conflict {
        id: String,
        expected: Option<u64>,
        found: Option<u64>,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("executor error: {0}")]
    Executor(String),

    #[error("timed out after {0}s")]
    Timeout(u64),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ReachError {
    /// Whether the error only concerns a single record and the caller should move on.
    pub fn is_per_record(&self) -> bool {
        matches!(
            self,
            ReachError::NotFound(_)
                | ReachError::Conflict { .. }
                | ReachError::Serialization(_)
                | ReachError::InvalidTransition(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ReachError>;
