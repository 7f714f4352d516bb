//! Identity verification seam
//!
//! Session issuance lives outside this server; connections present an opaque
//! token and get back a verified identity or an error.

use crate::error::DuelError;
use shared::Identity;

pub trait IdentityProvider: Send + Sync {
    fn verify(&self, token: &str) -> Result<Identity, DuelError>;
}

/// Development provider: the token is the identity.
///
/// Accepts 1-32 characters of `[A-Za-z0-9_-]`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokenIdentityProvider;

impl IdentityProvider for TokenIdentityProvider {
    fn verify(&self, token: &str) -> Result<Identity, DuelError> {
        let valid = !token.is_empty()
            && token.len() <= 32
            && token
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if valid {
            Ok(Identity::new(token))
        } else {
            Err(DuelError::Unauthorized("malformed token".to_string()))
        }
    }
}
