//! Error types for local store operations.

use std::io;
use tablesync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in the local stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A value violated the table's type restrictions.
    #[error("type restriction violated: {0}")]
    Protocol(#[from] ProtocolError),

    /// The table is not configured in this store.
    #[error("unknown table: {0}")]
    UnknownTable(String),

    /// The row does not exist.
    #[error("row {row_id} not found in table {table_id}")]
    RowNotFound {
        /// Table id.
        table_id: String,
        /// Row id.
        row_id: String,
    },

    /// A transaction would have left the store in an invalid state.
    #[error("store invariant violated: {0}")]
    InvariantViolation(String),

    /// A local edit is not allowed in the row's current state.
    #[error("invalid edit: {0}")]
    InvalidEdit(String),

    /// An attachment path escapes its row directory.
    #[error("invalid attachment path: {0}")]
    InvalidPath(String),

    /// Persisted cache data could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),
}
