//! Bearer token authentication.
//!
//! Tokens are HMAC-SHA256 signed and carry their issue time:
//!
//! ```text
//! <user>.<issued at, Unix millis>.<hex signature over "<user>.<issued at>">
//! ```

use crate::error::{ServerError, ServerResult};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<Sha256>;

/// Authentication configuration.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Secret key for HMAC.
    pub secret: Vec<u8>,
    /// Token expiration duration.
    pub token_expiry: Duration,
}

impl AuthConfig {
    /// Creates a new auth configuration.
    pub fn new(secret: Vec<u8>) -> Self {
        Self {
            secret,
            token_expiry: Duration::from_secs(24 * 60 * 60),
        }
    }

    /// Sets the token expiration duration.
    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.token_expiry = expiry;
        self
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

/// Issues and validates bearer tokens.
#[derive(Clone)]
pub struct TokenValidator {
    config: AuthConfig,
}

impl TokenValidator {
    /// Creates a new token validator.
    pub fn new(config: AuthConfig) -> Self {
        Self { config }
    }

    /// Creates a token for `user`.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::InvalidRequest` if the user id contains a `.`.
    pub fn create_token(&self, user: &str) -> ServerResult<String> {
        if user.is_empty() || user.contains('.') {
            return Err(ServerError::InvalidRequest(format!(
                "user id {user:?} cannot be put in a token"
            )));
        }
        let payload = format!("{user}.{}", now_millis());
        let signature = self.sign(&payload)?;
        Ok(format!("{payload}.{signature}"))
    }

    /// Validates a token, returning the user it was issued to.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::AuthenticationFailed` for malformed, forged or
    /// expired tokens.
    pub fn validate_token(&self, token: &str) -> ServerResult<String> {
        let rejected = |why: &str| ServerError::AuthenticationFailed(why.to_string());
        let (payload, signature) = token
            .rsplit_once('.')
            .ok_or_else(|| rejected("malformed token"))?;
        let (user, issued) = payload
            .split_once('.')
            .ok_or_else(|| rejected("malformed token"))?;
        let issued: u64 = issued.parse().map_err(|_| rejected("malformed token"))?;

        if self.sign(payload)? != signature {
            return Err(rejected("invalid signature"));
        }

        let expiry = u64::try_from(self.config.token_expiry.as_millis()).unwrap_or(u64::MAX);
        if now_millis() > issued.saturating_add(expiry) {
            return Err(rejected("token expired"));
        }
        Ok(user.to_string())
    }

    /// Validates an `Authorization` header value of the form `Bearer <token>`.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::AuthenticationFailed` if the header is missing
    /// or the token is invalid.
    pub fn validate_header(&self, header: Option<&str>) -> ServerResult<String> {
        let token = header
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or_else(|| ServerError::AuthenticationFailed("missing bearer token".into()))?;
        self.validate_token(token.trim())
    }

    fn sign(&self, payload: &str) -> ServerResult<String> {
        let mut mac = HmacSha256::new_from_slice(&self.config.secret)
            .map_err(|e| ServerError::Internal(e.to_string()))?;
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}
