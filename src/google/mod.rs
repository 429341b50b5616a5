//! Google delegated-token refresh.
//!
//! Renews a stored delegated access token through the provider's token
//! endpoint (`grant_type=refresh_token`). The outcome is a boolean: a
//! refresh-token failure is usually durable (revoked consent), so callers
//! surface a re-authentication requirement instead of retrying inline.
//!
//! A background sweep and a foreground just-in-time refresh may race on the
//! same subject; both perform the same whole-record read-refresh-write, so
//! the race is harmless. A per-subject guard coalesces concurrent calls to
//! avoid the duplicate provider round-trip.

use crate::credentials::CredentialStore;
use anyhow::{anyhow, Context, Result};
use chrono::{Duration, Utc};
use dashmap::DashMap;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Token endpoint configuration and client credentials.
#[derive(Debug, Clone)]
pub struct RefresherConfig {
    pub client_id: String,
    pub client_secret: String,
    pub token_url: String,
    pub request_timeout_secs: u64,
}

/// Token endpoint response (standard OAuth 2.0 refresh grant)
#[derive(Deserialize, Debug)]
struct RefreshResponse {
    access_token: String,
    expires_in: i64,
    /// Google usually omits this on a refresh grant; the stored refresh
    /// token is then meant to be reused.
    #[serde(default)]
    refresh_token: Option<String>,
}

/// Why a delegated access token could not be produced on demand.
#[derive(Debug, PartialEq, Clone)]
pub enum DelegatedAccessError {
    /// No credential record for the subject
    UnknownSubject,
    /// No refresh token on record; the user must re-authenticate
    NoRefreshToken,
    /// The provider refused or the exchange failed; treat as re-auth required
    RefreshFailed,
}

impl std::fmt::Display for DelegatedAccessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DelegatedAccessError::UnknownSubject => write!(f, "Unknown subject"),
            DelegatedAccessError::NoRefreshToken => {
                write!(f, "No Google refresh token available")
            }
            DelegatedAccessError::RefreshFailed => write!(f, "Google token refresh failed"),
        }
    }
}

impl std::error::Error for DelegatedAccessError {}

/// Performs the refresh-token grant and writes the renewed token back.
pub struct TokenRefresher {
    store: Arc<CredentialStore>,
    http: reqwest::Client,
    config: RefresherConfig,
    /// Per-subject guard for single-flight coalescing
    inflight: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl TokenRefresher {
    pub fn new(store: Arc<CredentialStore>, config: RefresherConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            store,
            http,
            config,
            inflight: DashMap::new(),
        })
    }

    /// Refreshes the subject's delegated access token.
    ///
    /// Returns `true` when a renewed token was stored (or another concurrent
    /// refresh just stored one). Returns `false` without mutating the record
    /// when there is no refresh token, the provider call fails, or the
    /// response cannot be parsed.
    pub async fn refresh(&self, subject: &str) -> bool {
        let before = match self.store.find_by_subject(subject) {
            Ok(Some(cred)) => cred,
            Ok(None) => {
                warn!(subject = %subject, "Refresh requested for unknown subject");
                return false;
            }
            Err(e) => {
                error!(subject = %subject, error = %e, "Failed to read credential record");
                return false;
            }
        };

        if before.google_refresh_token.is_none() {
            // Nothing to retry with; the user must re-authenticate.
            error!(subject = %subject, "No Google refresh token available");
            return false;
        }

        // Single-flight per subject: concurrent refreshes queue here.
        let guard = self
            .inflight
            .entry(subject.to_string())
            .or_default()
            .clone();
        let _held = guard.lock().await;

        // Re-read after acquiring the guard. If the expiry advanced while we
        // waited, another refresh already landed a fresh token.
        let mut current = match self.store.find_by_subject(subject) {
            Ok(Some(cred)) => cred,
            _ => return false,
        };
        if current.google_token_expires_at > before.google_token_expires_at {
            debug!(subject = %subject, "Coalesced with concurrent refresh");
            return true;
        }

        let refresh_token = match current.google_refresh_token.clone() {
            Some(token) => token,
            None => return false,
        };

        let response = match self.request_refresh_grant(&refresh_token).await {
            Ok(response) => response,
            Err(e) => {
                error!(subject = %subject, error = %e, "Google token refresh failed");
                return false;
            }
        };

        let now = Utc::now();
        current.google_access_token = Some(response.access_token);
        current.google_token_expires_at = Some(now + Duration::seconds(response.expires_in));
        if let Some(new_refresh) = response.refresh_token {
            current.google_refresh_token = Some(new_refresh);
        }
        current.updated_at = now;

        if let Err(e) = self.store.upsert(&current) {
            error!(subject = %subject, error = %e, "Failed to store refreshed token");
            return false;
        }

        info!(
            subject = %subject,
            expires_in = response.expires_in,
            "Refreshed Google access token"
        );
        true
    }

    /// POSTs the refresh-token grant to the token endpoint.
    async fn request_refresh_grant(&self, refresh_token: &str) -> Result<RefreshResponse> {
        let params = [
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ];

        let response = self
            .http
            .post(&self.config.token_url)
            .form(&params)
            .send()
            .await
            .context("Failed to send token refresh request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(anyhow!(
                "Token endpoint returned {}: {}",
                status,
                body
            ));
        }

        response
            .json()
            .await
            .context("Failed to parse token endpoint response")
    }

    /// Hands back a currently-valid delegated access token for an imminent
    /// provider API call, refreshing just-in-time when the stored one has
    /// expired.
    ///
    /// An error here means the caller should surface "re-authenticate with
    /// Google" to the user, not retry.
    pub async fn fresh_access_token(
        &self,
        subject: &str,
    ) -> Result<String, DelegatedAccessError> {
        let cred = match self.store.find_by_subject(subject) {
            Ok(Some(cred)) => cred,
            Ok(None) => return Err(DelegatedAccessError::UnknownSubject),
            Err(e) => {
                error!(subject = %subject, error = %e, "Failed to read credential record");
                return Err(DelegatedAccessError::UnknownSubject);
            }
        };

        if cred.has_valid_google_token(Utc::now()) {
            if let Some(token) = cred.google_access_token {
                return Ok(token);
            }
        }

        if cred.google_refresh_token.is_none() {
            return Err(DelegatedAccessError::NoRefreshToken);
        }

        if !self.refresh(subject).await {
            return Err(DelegatedAccessError::RefreshFailed);
        }

        match self.store.find_by_subject(subject) {
            Ok(Some(cred)) => cred
                .google_access_token
                .ok_or(DelegatedAccessError::RefreshFailed),
            _ => Err(DelegatedAccessError::RefreshFailed),
        }
    }
}
