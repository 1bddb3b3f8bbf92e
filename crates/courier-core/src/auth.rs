//! Credential validation for the authentication handshake.
//!
//! The registry delegates token checks to an injected [`Authenticator`] so
//! deployments can plug in their own identity backend. The default validates
//! an HMAC-SHA256 token minted from the user id under a shared secret.

use crate::connection::UserId;
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Authentication errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Token validation failed.
    #[error("Invalid credential")]
    InvalidCredential,

    /// The client did not authenticate within the configured window.
    #[error("Authentication timeout")]
    Timeout,

    /// The user already holds the maximum number of connections.
    #[error("Connection limit reached for user: {0}")]
    ConnectionLimit(UserId),
}

/// Credentials presented in an `authenticate` frame.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub user_id: UserId,
    pub token: String,
}

impl Credentials {
    #[must_use]
    pub fn new(user_id: impl Into<UserId>, token: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            token: token.into(),
        }
    }
}

/// What a successful validation grants.
#[derive(Debug, Clone)]
pub struct AuthGrant {
    pub user_id: UserId,
    /// Role name exposed to broadcast filters.
    pub role: String,
    /// Extra attributes merged into the connection's filterable metadata.
    pub attrs: Value,
}

impl AuthGrant {
    /// Grant with the default `user` role and no extra attributes.
    #[must_use]
    pub fn user(user_id: impl Into<UserId>) -> Self {
        Self {
            user_id: user_id.into(),
            role: "user".to_string(),
            attrs: Value::Null,
        }
    }
}

/// Validates credentials during the handshake.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Check the presented credentials.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidCredential`] when validation fails.
    async fn validate(&self, credentials: &Credentials) -> Result<AuthGrant, AuthError>;
}

/// HMAC-SHA256 token validation under a shared secret.
///
/// A valid token is the hex-encoded MAC of the user id.
pub struct HmacAuthenticator {
    secret: Vec<u8>,
}

impl HmacAuthenticator {
    #[must_use]
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Mint a valid token for a user. Used by tooling and tests.
    #[must_use]
    pub fn token_for(&self, user_id: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts any key length");
        mac.update(user_id.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

#[async_trait]
impl Authenticator for HmacAuthenticator {
    async fn validate(&self, credentials: &Credentials) -> Result<AuthGrant, AuthError> {
        let presented =
            hex::decode(&credentials.token).map_err(|_| AuthError::InvalidCredential)?;

        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts any key length");
        mac.update(credentials.user_id.as_bytes());
        mac.verify_slice(&presented)
            .map_err(|_| AuthError::InvalidCredential)?;

        Ok(AuthGrant::user(credentials.user_id.clone()))
    }
}
