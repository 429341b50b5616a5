//! Encrypted per-user credential storage.
//!
//! One record per identity, holding both token families: the most recently
//! issued session refresh token, and the delegated Google access/refresh
//! token pair with its expiry. All token values are encrypted at rest using
//! AES-256-GCM, backed by SQLite.
//!
//! # Security
//!
//! - Token values encrypted at rest with per-value nonces (never reused)
//! - Master key is 32 bytes, provided from an environment variable,
//!   held in memory only
//! - Authenticated encryption (tampering detected)
//! - SQLite ACID guarantees prevent partial updates

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

mod encryption;
mod storage;

pub use encryption::MasterKey;
pub use storage::CredentialStore;

/// Role granted to an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "user" => Ok(Role::User),
            "admin" => Ok(Role::Admin),
            other => Err(anyhow::anyhow!("Unknown role '{}'", other)),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a stored delegated access token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    /// No access token stored
    Absent,
    /// Token present and its expiry is still comfortably in the future
    Valid,
    /// Token present, valid, but expires within the given window
    ExpiringSoon,
    /// Token present but its expiry has passed
    Expired,
}

/// Durable credential record for one identity.
///
/// Keyed both by the stable subject id (Google `sub`) and by email, since
/// inbound evidence is often an email claim from the identity provider.
/// Records are created on first successful authentication and never deleted;
/// logout nulls the token fields only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserCredential {
    /// Stable external identity id
    pub subject: String,
    pub email: String,
    pub name: String,
    pub picture: Option<String>,
    pub role: Role,

    /// Most recently issued session refresh token value. Stored to detect
    /// replay of rotated/revoked tokens; null after logout.
    pub session_refresh_token: Option<String>,

    /// Delegated Google access token (opaque bearer)
    pub google_access_token: Option<String>,
    /// Delegated Google refresh token; may be absent if the provider never
    /// issued one
    pub google_refresh_token: Option<String>,
    /// Point after which the access token must be treated as invalid
    pub google_token_expires_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserCredential {
    /// Fresh record with no tokens, created on first authentication.
    pub fn new(
        subject: impl Into<String>,
        email: impl Into<String>,
        name: impl Into<String>,
        picture: Option<String>,
        role: Role,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            subject: subject.into(),
            email: email.into(),
            name: name.into(),
            picture,
            role,
            session_refresh_token: None,
            google_access_token: None,
            google_refresh_token: None,
            google_token_expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Classifies the delegated access token at `now`, with `soon_window`
    /// as the expiring-soon horizon.
    pub fn google_token_state(&self, now: DateTime<Utc>, soon_window: Duration) -> TokenState {
        if self.google_access_token.is_none() {
            return TokenState::Absent;
        }
        match self.google_token_expires_at {
            // Access token present without expiry violates the write-site
            // invariant; treat as expired rather than trusting it.
            None => TokenState::Expired,
            Some(expires_at) if now >= expires_at => TokenState::Expired,
            Some(expires_at) if expires_at < now + soon_window => TokenState::ExpiringSoon,
            Some(_) => TokenState::Valid,
        }
    }

    /// True when a delegated access token is stored and not yet expired.
    pub fn has_valid_google_token(&self, now: DateTime<Utc>) -> bool {
        matches!(
            self.google_token_state(now, Duration::zero()),
            TokenState::Valid
        )
    }

    /// Nulls both token families. Used by full logout; the record survives.
    pub fn clear_tokens(&mut self, now: DateTime<Utc>) {
        self.session_refresh_token = None;
        self.google_access_token = None;
        self.google_refresh_token = None;
        self.google_token_expires_at = None;
        self.updated_at = now;
    }
}
