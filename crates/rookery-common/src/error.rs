//! Error types for the coordination core
//!
//! `CoordinationError` is the full client-facing taxonomy: namespace
//! errors are deterministic and never retried, session errors require
//! the client to re-establish a session, cluster errors are transient
//! and retried against the new leader.

use serde::{Deserialize, Serialize};

/// Client-facing coordination errors
///
/// Serializable because namespace/session errors are produced inside
/// the replicated apply step and travel back through the response
/// queue.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoordinationError {
    #[error("node already exists: {0}")]
    NodeExists(String),

    #[error("node not found: {0}")]
    NotFound(String),

    #[error("node has children: {0}")]
    NotEmpty(String),

    #[error("version mismatch on {path}: expected {expected}, actual {actual}")]
    VersionMismatch {
        path: String,
        expected: i32,
        actual: i32,
    },

    #[error("parent node missing for {0}")]
    NoParent(String),

    #[error("invalid path: {0}")]
    BadPath(String),

    #[error("data payload of {got} bytes exceeds limit of {limit}")]
    DataTooLarge { got: usize, limit: usize },

    #[error("session {0} expired")]
    SessionExpired(u64),

    #[error("not the leader")]
    NotLeader,

    #[error("server is shutting down")]
    ShuttingDown,

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoordinationError {
    /// Deterministic namespace errors - retrying cannot change the outcome
    pub fn is_namespace_error(&self) -> bool {
        matches!(
            self,
            CoordinationError::NodeExists(_)
                | CoordinationError::NotFound(_)
                | CoordinationError::NotEmpty(_)
                | CoordinationError::VersionMismatch { .. }
                | CoordinationError::NoParent(_)
                | CoordinationError::BadPath(_)
                | CoordinationError::DataTooLarge { .. }
        )
    }

    /// Transient cluster errors - the caller retries against the current leader
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoordinationError::NotLeader | CoordinationError::ShuttingDown
        )
    }
}

/// Convenience alias for fallible coordination operations
pub type CoordinationResult<T> = Result<T, CoordinationError>;
