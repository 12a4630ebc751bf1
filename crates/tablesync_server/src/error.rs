//! Error types for the table server.

use tablesync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the table server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Invalid request format.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// No route or resource matches the request.
    #[error("not found: {0}")]
    NotFound(String),

    /// Authentication failed.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The push was based on a stale table data ETag.
    #[error("data ETag conflict on {table_id}: current {current}, got {actual:?}")]
    DataEtagConflict {
        /// Table id.
        table_id: String,
        /// The table's current data ETag.
        current: String,
        /// The ETag the client sent.
        actual: Option<String>,
    },

    /// The server is refusing work for now.
    #[error("service unavailable")]
    Unavailable,

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// HTTP status code for the error.
    pub fn status(&self) -> u16 {
        match self {
            ServerError::InvalidRequest(_) => 400,
            ServerError::AuthenticationFailed(_) => 401,
            ServerError::NotFound(_) => 404,
            ServerError::DataEtagConflict { .. } => 409,
            ServerError::Internal(_) => 500,
            ServerError::Unavailable => 503,
        }
    }

    /// Returns true if this is a client error (4xx).
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status())
    }

    /// Returns true if this is a server error (5xx).
    pub fn is_server_error(&self) -> bool {
        self.status() >= 500
    }
}

impl From<ProtocolError> for ServerError {
    fn from(err: ProtocolError) -> Self {
        ServerError::InvalidRequest(err.to_string())
    }
}
