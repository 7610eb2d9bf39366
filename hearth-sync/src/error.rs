//! Error types for the sync layer.

use hearth_types::CollaborationStatus;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Transient network failure. Retried.
    #[error("network error: {0}")]
    Network(String),

    /// A single attempt exceeded its timeout. Retried.
    #[error("operation timed out")]
    Timeout,

    /// The caller lacks access, e.g. it was removed from a collaboration
    /// while a write was in flight. Terminal.
    #[error("authorization denied: {0}")]
    Authorization(String),

    /// The addressed record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The write lost a last-write-wins comparison against the stored copy.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A payload or persisted entry could not be decoded. Terminal.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// Every allowed attempt failed.
    #[error("gave up after {attempts} attempts: {last}")]
    ExhaustedRetries {
        attempts: u32,
        last: Box<SyncError>,
    },

    /// A collaboration change outside the state machine.
    #[error("invalid collaboration transition: {from} -> {to}")]
    InvalidTransition {
        from: CollaborationStatus,
        to: CollaborationStatus,
    },

    /// Local persistence failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Channel closed.
    #[error("channel closed")]
    ChannelClosed,

    /// The component was shut down.
    #[error("sync engine shut down")]
    Shutdown,
}

impl SyncError {
    /// Returns true for transient failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Network(_) | SyncError::Timeout)
    }

    /// Returns true for failures that must be surfaced instead of retried.
    pub fn is_terminal(&self) -> bool {
        !self.is_retryable()
    }

    /// Returns true if this error, or the last error behind an exhausted
    /// retry, is an authorization denial.
    pub fn is_authorization(&self) -> bool {
        match self {
            SyncError::Authorization(_) => true,
            SyncError::ExhaustedRetries { last, .. } => last.is_authorization(),
            _ => false,
        }
    }

    /// Returns the innermost error, unwrapping exhausted retries.
    pub fn root(&self) -> &SyncError {
        match self {
            SyncError::ExhaustedRetries { last, .. } => last.root(),
            other => other,
        }
    }
}

impl From<hearth_types::Error> for SyncError {
    fn from(err: hearth_types::Error) -> Self {
        match err {
            hearth_types::Error::Serialization(e) => SyncError::Serialization(e),
            hearth_types::Error::InvalidTransition { from, to } => {
                SyncError::InvalidTransition { from, to }
            }
            other => SyncError::MalformedPayload(other.to_string()),
        }
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(err: rusqlite::Error) -> Self {
        SyncError::Storage(err.to_string())
    }
}
