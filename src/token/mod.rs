//! Session token issuance and verification.
//!
//! Session tokens are compact HMAC-SHA256 signed tokens (HS256) carrying the
//! subject, an optional role claim, issued-at and expiry. Verification is
//! stateless: signature plus expiry, nothing persisted.

use anyhow::{Context, Result};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};


/// Claims embedded in a session token.
///
/// Refresh tokens carry no role claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Stable subject id the token proves identity for
    pub sub: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub iat: i64,
    pub exp: i64,
}

/// Verification failures.
///
/// Callers treat all three identically (unauthenticated); the distinction
/// exists for logging and tests.
#[derive(Debug, PartialEq, Clone)]
pub enum TokenError {
    /// Tampered, truncated, or otherwise undecodable token
    Malformed,
    /// Signature valid but the token's expiry has passed
    Expired,
    /// Structurally sound but unacceptable (e.g. wrong algorithm)
    Invalid,
}

impl std::fmt::Display for TokenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenError::Malformed => write!(f, "Malformed session token"),
            TokenError::Expired => write!(f, "Expired session token"),
            TokenError::Invalid => write!(f, "Invalid session token"),
        }
    }
}

impl std::error::Error for TokenError {}

/// Issues and verifies signed session tokens.
///
/// Access and refresh TTLs are independent configuration inputs; the refresh
/// TTL is expected to be much larger (days vs minutes).
pub struct TokenCodec {
    secret: String,
    access_ttl_secs: i64,
    refresh_ttl_secs: i64,
}

impl TokenCodec {
    pub fn new(secret: impl Into<String>, access_ttl_secs: i64, refresh_ttl_secs: i64) -> Self {
        Self {
            secret: secret.into(),
            access_ttl_secs,
            refresh_ttl_secs,
        }
    }

    /// Signs an access token embedding subject and role, expiring after the
    /// configured access TTL.
    pub fn issue_access_token(&self, subject: &str, role: &str) -> Result<String> {
        self.sign(subject, Some(role.to_string()), self.access_ttl_secs)
    }

    /// Signs a refresh token (no role claim) expiring after the refresh TTL.
    pub fn issue_refresh_token(&self, subject: &str) -> Result<String> {
        self.sign(subject, None, self.refresh_ttl_secs)
    }

    fn sign(&self, subject: &str, role: Option<String>, ttl_secs: i64) -> Result<String> {
        let now = chrono::Utc::now().timestamp();
        let claims = SessionClaims {
            sub: subject.to_string(),
            role,
            iat: now,
            exp: now + ttl_secs,
        };

        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .context("Failed to sign session token")
    }

    /// Verifies signature then expiry. No leeway: a token is expired the
    /// moment its `exp` passes.
    pub fn verify(&self, token: &str) -> Result<SessionClaims, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;

        let data = decode::<SessionClaims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &validation,
        )
        .map_err(|e| match e.kind() {
            ErrorKind::ExpiredSignature => TokenError::Expired,
            ErrorKind::InvalidToken
            | ErrorKind::InvalidSignature
            | ErrorKind::Base64(_)
            | ErrorKind::Json(_)
            | ErrorKind::Utf8(_) => TokenError::Malformed,
            _ => TokenError::Invalid,
        })?;

        Ok(data.claims)
    }

    pub fn access_ttl_secs(&self) -> i64 {
        self.access_ttl_secs
    }

    pub fn refresh_ttl_secs(&self) -> i64 {
        self.refresh_ttl_secs
    }
}
