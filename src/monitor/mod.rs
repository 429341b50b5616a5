//! Token health monitoring and proactive refresh.
//!
//! Two independent timer-driven sweeps share the credential store with live
//! requests:
//!
//! - the **health sweep** classifies every tracked delegated token and logs
//!   aggregate counts, raising an alert log when the majority are expired
//!   (a signal, not an automatic action)
//! - the **proactive refresh sweep** renews tokens that are still valid but
//!   expiring within a tighter window, so foreground requests rarely hit an
//!   expired token
//!
//! Per-item failures are logged and skipped; a sweep never aborts and never
//! takes the process down. On shutdown a mid-flight sweep finishes its
//! current item and exits.

use crate::config::MonitorConfig;
use crate::credentials::{CredentialStore, TokenState, UserCredential};
use crate::google::TokenRefresher;
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{error, info, warn};

/// Aggregate snapshot over every record holding a delegated access token.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStats {
    pub total: usize,
    pub with_google_tokens: usize,
    pub valid: usize,
    pub expired: usize,
    pub expiring_soon: usize,
    pub with_refresh_tokens: usize,
    /// valid / with_google_tokens, as an integer percentage
    pub health_percentage: u32,
    pub last_checked: DateTime<Utc>,
}

impl HealthStats {
    /// Alert condition: more than half of all tracked tokens are expired.
    pub fn majority_expired(&self) -> bool {
        self.with_google_tokens > 0 && self.expired * 100 / self.with_google_tokens > 50
    }
}

/// Per-subject inspection result for administrative use.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectTokenReport {
    pub exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub has_access_token: bool,
    pub has_refresh_token: bool,
    pub valid: bool,
    pub expiring_soon: bool,
    /// A refresh makes sense: there is a refresh token and no valid access
    /// token to protect
    pub can_refresh: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

/// Outcome of the administrative bulk refresh.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkRefreshOutcome {
    pub attempted: usize,
    pub successful: usize,
    pub failed: usize,
    pub timestamp: DateTime<Utc>,
}

pub struct TokenHealthMonitor {
    store: Arc<CredentialStore>,
    refresher: Arc<TokenRefresher>,
    config: MonitorConfig,
}

impl TokenHealthMonitor {
    pub fn new(
        store: Arc<CredentialStore>,
        refresher: Arc<TokenRefresher>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            store,
            refresher,
            config,
        }
    }

    /// Spawns the two sweep loops. They stop after the shutdown signal
    /// flips, finishing the item in flight first.
    pub fn start(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let monitor = Arc::clone(self);
        let mut health_shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            let mut timer = interval(std::time::Duration::from_secs(
                monitor.config.health_interval_secs,
            ));
            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        if let Err(e) = monitor.run_health_sweep() {
                            error!(error = %e, "Health sweep failed");
                        }
                    }
                    _ = health_shutdown.changed() => {
                        info!("Health sweep loop stopping");
                        break;
                    }
                }
            }
        }));

        let monitor = Arc::clone(self);
        let mut refresh_shutdown = shutdown;
        handles.push(tokio::spawn(async move {
            let mut timer = interval(std::time::Duration::from_secs(
                monitor.config.refresh_interval_secs,
            ));
            loop {
                let shutdown_probe = refresh_shutdown.clone();
                tokio::select! {
                    _ = timer.tick() => {
                        if let Err(e) = monitor.run_refresh_sweep(&shutdown_probe).await {
                            error!(error = %e, "Refresh sweep failed");
                        }
                    }
                    _ = refresh_shutdown.changed() => {
                        info!("Refresh sweep loop stopping");
                        break;
                    }
                }
            }
        }));

        handles
    }

    /// One health sweep: classify, log, alert.
    pub fn run_health_sweep(&self) -> Result<HealthStats> {
        let stats = self.health_stats()?;

        info!(
            tracked = stats.with_google_tokens,
            valid = stats.valid,
            expired = stats.expired,
            expiring_soon = stats.expiring_soon,
            "Token health sweep"
        );

        if stats.majority_expired() {
            warn!(
                expired = stats.expired,
                tracked = stats.with_google_tokens,
                "More than half of tracked Google tokens are expired"
            );
        }

        Ok(stats)
    }

    /// One proactive refresh sweep over tokens that are valid but expiring
    /// within the refresh window and hold a refresh token. Returns
    /// (refreshed, failed) counts.
    pub async fn run_refresh_sweep(
        &self,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<(usize, usize)> {
        let now = Utc::now();
        let window = Duration::seconds(self.config.refresh_window_secs);

        let due: Vec<UserCredential> = self
            .store
            .list_with_google_tokens()?
            .into_iter()
            .filter(|cred| {
                cred.google_token_state(now, window) == TokenState::ExpiringSoon
                    && cred.google_refresh_token.is_some()
            })
            .collect();

        if !due.is_empty() {
            info!(count = due.len(), "Proactively refreshing expiring Google tokens");
        }

        let mut refreshed = 0;
        let mut failed = 0;
        for cred in &due {
            if *shutdown.borrow() {
                info!("Shutdown requested, ending refresh sweep after current item");
                break;
            }
            if self.refresher.refresh(&cred.subject).await {
                refreshed += 1;
            } else {
                // Logged by the refresher; the sweep moves on
                warn!(subject = %cred.subject, "Proactive refresh failed");
                failed += 1;
            }
        }

        Ok((refreshed, failed))
    }

    /// Aggregate health snapshot for administrative reporting.
    pub fn health_stats(&self) -> Result<HealthStats> {
        let now = Utc::now();
        let soon_window = Duration::seconds(self.config.expiring_soon_secs);

        let total = self.store.list_all()?.len();
        let tracked = self.store.list_with_google_tokens()?;

        let mut valid = 0;
        let mut expired = 0;
        let mut expiring_soon = 0;
        let mut with_refresh_tokens = 0;

        for cred in &tracked {
            match cred.google_token_state(now, soon_window) {
                TokenState::Valid => valid += 1,
                TokenState::ExpiringSoon => {
                    valid += 1;
                    expiring_soon += 1;
                }
                TokenState::Expired => expired += 1,
                // Unreachable for this subset, every record has a token
                TokenState::Absent => {}
            }
            if cred.google_refresh_token.is_some() {
                with_refresh_tokens += 1;
            }
        }

        let health_percentage = if tracked.is_empty() {
            0
        } else {
            (valid * 100 / tracked.len()) as u32
        };

        Ok(HealthStats {
            total,
            with_google_tokens: tracked.len(),
            valid,
            expired,
            expiring_soon,
            with_refresh_tokens,
            health_percentage,
            last_checked: now,
        })
    }

    /// Inspects one subject's token health.
    pub fn validate(&self, subject: &str) -> Result<SubjectTokenReport> {
        let Some(cred) = self.store.find_by_subject(subject)? else {
            return Ok(SubjectTokenReport {
                exists: false,
                email: None,
                has_access_token: false,
                has_refresh_token: false,
                valid: false,
                expiring_soon: false,
                can_refresh: false,
                token_expires_at: None,
                last_updated: None,
            });
        };

        let now = Utc::now();
        let soon_window = Duration::seconds(self.config.expiring_soon_secs);
        let state = cred.google_token_state(now, soon_window);
        let valid = matches!(state, TokenState::Valid | TokenState::ExpiringSoon);
        let has_refresh_token = cred.google_refresh_token.is_some();

        Ok(SubjectTokenReport {
            exists: true,
            email: Some(cred.email),
            has_access_token: cred.google_access_token.is_some(),
            has_refresh_token,
            valid,
            expiring_soon: state == TokenState::ExpiringSoon,
            can_refresh: has_refresh_token && !valid,
            token_expires_at: cred.google_token_expires_at,
            last_updated: Some(cred.updated_at),
        })
    }

    /// Administrative bulk refresh, restricted to records that are expired
    /// and still hold a refresh token.
    pub async fn force_refresh_all_expired(&self) -> Result<BulkRefreshOutcome> {
        let now = Utc::now();

        let expired: Vec<UserCredential> = self
            .store
            .list_with_google_tokens()?
            .into_iter()
            .filter(|cred| {
                cred.google_token_state(now, Duration::zero()) == TokenState::Expired
                    && cred.google_refresh_token.is_some()
            })
            .collect();

        let attempted = expired.len();
        let mut successful = 0;
        let mut failed = 0;

        for cred in &expired {
            if self.refresher.refresh(&cred.subject).await {
                successful += 1;
            } else {
                failed += 1;
            }
        }

        info!(attempted, successful, failed, "Forced refresh of expired tokens");

        Ok(BulkRefreshOutcome {
            attempted,
            successful,
            failed,
            timestamp: Utc::now(),
        })
    }
}
