//! Server configuration.

use std::time::Duration;
use tablesync_protocol::MAX_ALTER_ROWS_BATCH;

/// Configuration for the table server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Maximum rows per changeset page, whatever the client asks for.
    pub max_page_size: usize,
    /// Maximum rows accepted in one `alterRows` call.
    pub max_alter_batch: usize,
    /// Whether requests must carry a valid bearer token.
    pub require_auth: bool,
    /// Secret key for token validation (if auth enabled).
    pub auth_secret: Option<Vec<u8>>,
    /// Lifetime of issued tokens.
    pub token_expiry: Duration,
}

impl ServerConfig {
    /// Creates a configuration with default limits and no authentication.
    pub fn new() -> Self {
        Self {
            max_page_size: 1000,
            max_alter_batch: MAX_ALTER_ROWS_BATCH,
            require_auth: false,
            auth_secret: None,
            token_expiry: Duration::from_secs(24 * 60 * 60),
        }
    }

    /// Sets the maximum page size.
    pub fn with_max_page_size(mut self, rows: usize) -> Self {
        self.max_page_size = rows.max(1);
        self
    }

    /// Sets the maximum push batch size.
    pub fn with_max_alter_batch(mut self, rows: usize) -> Self {
        self.max_alter_batch = rows;
        self
    }

    /// Enables authentication with the given secret.
    pub fn with_auth(mut self, secret: Vec<u8>) -> Self {
        self.require_auth = true;
        self.auth_secret = Some(secret);
        self
    }

    /// Sets the token lifetime.
    pub fn with_token_expiry(mut self, expiry: Duration) -> Self {
        self.token_expiry = expiry;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}
