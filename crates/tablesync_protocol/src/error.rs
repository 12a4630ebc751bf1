//! Error types for protocol encoding and validation.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while encoding, decoding or validating protocol values.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// JSON encoding or decoding failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A column value does not match its declared element type.
    #[error("column {column} expects {expected:?}, got {found}")]
    TypeMismatch {
        /// Column key.
        column: String,
        /// Declared element type.
        expected: crate::ElementDataType,
        /// Name of the value variant found.
        found: &'static str,
    },

    /// A column is not part of the table schema.
    #[error("unknown column {column} in table {table}")]
    UnknownColumn {
        /// Table id.
        table: String,
        /// Column key.
        column: String,
    },

    /// A multipart body could not be parsed.
    #[error("malformed multipart body: {0}")]
    Multipart(String),

    /// A message is structurally invalid.
    #[error("invalid message: {0}")]
    Invalid(String),
}
