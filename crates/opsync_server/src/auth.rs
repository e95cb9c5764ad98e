//! Authentication support for the sync server.
//!
//! This module provides bearer-token authentication using HMAC-SHA256.
//! Tokens include the issue time for expiration checking.
//!
//! ## Token Format
//!
//! `<subject>.<issued-at unix millis>.<hex HMAC-SHA256 of "subject.issued">`
//!
//! The subject is usually a user or device id and may itself contain dots;
//! the last two fields are split off from the right.

use crate::error::{ServerError, ServerResult};
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

/// Authentication configuration.
#[derive(Clone)]
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
            token_expiry: Duration::from_secs(24 * 60 * 60), // 24 hours
        }
    }

    /// Sets the token expiration duration.
    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.token_expiry = expiry;
        self
    }
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("secret", &"<redacted>")
            .field("token_expiry", &self.token_expiry)
            .finish()
    }
}

/// Token validator for incoming requests.
#[derive(Clone, Debug)]
pub struct TokenValidator {
    config: AuthConfig,
}

impl TokenValidator {
    /// Creates a new token validator.
    pub fn new(config: AuthConfig) -> Self {
        Self { config }
    }

    /// Creates a new bearer token for `subject`, issued now.
    pub fn create_token(&self, subject: &str) -> ServerResult<String> {
        self.create_token_at(subject, now_millis())
    }

    /// Creates a token with an explicit issue time.
    pub fn create_token_at(&self, subject: &str, issued_ms: u64) -> ServerResult<String> {
        if subject.is_empty() {
            return Err(ServerError::InvalidRequest(
                "token subject must not be empty".into(),
            ));
        }
        let signed = format!("{subject}.{issued_ms}");
        let signature = self.mac(&signed)?.finalize().into_bytes();
        Ok(format!("{signed}.{}", hex::encode(signature)))
    }

    /// Validates a token and returns its subject.
    pub fn validate_token(&self, token: &str) -> ServerResult<String> {
        self.validate_token_at(token, now_millis())
    }

    /// Validates a token against an explicit clock.
    pub fn validate_token_at(&self, token: &str, now_ms: u64) -> ServerResult<String> {
        let mut parts = token.rsplitn(3, '.');
        let (Some(signature), Some(issued), Some(subject)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(ServerError::AuthenticationFailed(
                "malformed token".into(),
            ));
        };
        if subject.is_empty() {
            return Err(ServerError::AuthenticationFailed(
                "malformed token".into(),
            ));
        }

        let signature = hex::decode(signature)
            .map_err(|_| ServerError::AuthenticationFailed("malformed signature".into()))?;
        let mac = self.mac(&format!("{subject}.{issued}"))?;
        mac.verify_slice(&signature)
            .map_err(|_| ServerError::AuthenticationFailed("invalid signature".into()))?;

        let issued: u64 = issued
            .parse()
            .map_err(|_| ServerError::AuthenticationFailed("malformed issue time".into()))?;
        let expiry_ms = u64::try_from(self.config.token_expiry.as_millis()).unwrap_or(u64::MAX);
        if now_ms > issued.saturating_add(expiry_ms) {
            return Err(ServerError::AuthenticationFailed("token expired".into()));
        }

        Ok(subject.to_string())
    }

    fn mac(&self, data: &str) -> ServerResult<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.config.secret)
            .map_err(|e| ServerError::Internal(format!("hmac key: {e}")))?;
        mac.update(data.as_bytes());
        Ok(mac)
    }
}

fn now_millis() -> u64 {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0)
}
