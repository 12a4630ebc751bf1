//! Token command implementation.

use tablesync_server::{AuthConfig, TokenValidator};

/// Issues a bearer token signed with `secret`.
pub fn issue(secret: &[u8], user: &str) -> Result<String, Box<dyn std::error::Error>> {
    let validator = TokenValidator::new(AuthConfig::new(secret.to_vec()));
    Ok(validator.create_token(user)?)
}
