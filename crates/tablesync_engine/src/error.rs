//! Error types for the sync engine.

use crate::outcome::TableOutcome;
use tablesync_protocol::ProtocolError;
use tablesync_store::StoreError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
///
/// Inside a table task these propagate with `?`; at the table boundary each
/// is converted to one [`TableOutcome`] via [`SyncError::outcome`].
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// A remote call exceeded its connect or read timeout.
    #[error("operation timed out")]
    Timeout,

    /// The server answered with something the engine cannot interpret.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server rejected the credentials (HTTP 401).
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The push carried a stale table data ETag (HTTP 409).
    #[error("data ETag conflict on table {table_id}")]
    DataEtagConflict {
        /// Table id.
        table_id: String,
    },

    /// The local schema ETag differs from the server's.
    #[error("schema ETag mismatch on table {table_id}: local={local:?}, remote={remote}")]
    SchemaMismatch {
        /// Table id.
        table_id: String,
        /// Local schema ETag.
        local: Option<String>,
        /// Server schema ETag.
        remote: String,
    },

    /// The local store failed.
    #[error("local store error: {0}")]
    Store(#[from] StoreError),

    /// Local row state contradicts what the server reported.
    #[error("local state invariant violated: {0}")]
    InvariantViolation(String),

    /// Every allowed push attempt was answered with 409.
    #[error("gave up after {attempts} push attempts rejected with 409")]
    ConflictRetriesExhausted {
        /// Attempts made.
        attempts: u32,
    },

    /// The data ETag kept moving while paging.
    #[error("changeset did not settle after {restarts} pull restarts")]
    PullDidNotConverge {
        /// Restarts made.
        restarts: u32,
    },

    /// Sync was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// The run was aborted because another table failed authentication.
    #[error("sync run aborted")]
    Aborted,
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if a caller may retry the whole operation later.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout => true,
            SyncError::DataEtagConflict { .. } => true,
            SyncError::PullDidNotConverge { .. } => true,
            _ => false,
        }
    }

    /// Returns true if the error must stop every table in the run.
    pub fn aborts_run(&self) -> bool {
        matches!(self, SyncError::AuthenticationFailed(_))
    }

    /// Maps the error to the table outcome it produces.
    pub fn outcome(&self) -> TableOutcome {
        match self {
            SyncError::Transport { .. }
            | SyncError::Timeout
            | SyncError::Protocol(_)
            | SyncError::PullDidNotConverge { .. } => TableOutcome::TransportFailure,
            SyncError::AuthenticationFailed(_) => TableOutcome::AuthFailure,
            SyncError::DataEtagConflict { .. } | SyncError::ConflictRetriesExhausted { .. } => {
                TableOutcome::ConflictRetriesExhausted
            }
            SyncError::SchemaMismatch { .. } => TableOutcome::TableRequiresAppLevelSync,
            SyncError::Store(_) | SyncError::InvariantViolation(_) => {
                TableOutcome::LocalDatabaseFailure
            }
            SyncError::Cancelled | SyncError::Aborted => TableOutcome::Cancelled,
        }
    }
}

impl From<ProtocolError> for SyncError {
    fn from(err: ProtocolError) -> Self {
        SyncError::Protocol(err.to_string())
    }
}
