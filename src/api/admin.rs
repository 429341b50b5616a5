//! Administrative token endpoints.
//!
//! All routes require a resolved identity carrying the admin role.

use super::cookies::evidence_from_headers;
use super::AppError;
use crate::credentials::Role;
use crate::google::TokenRefresher;
use crate::monitor::{BulkRefreshOutcome, HealthStats, SubjectTokenReport, TokenHealthMonitor};
use crate::resolver::{CredentialResolver, Resolution};
use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::error;

/// Shared state for the admin API
#[derive(Clone)]
pub struct AdminAppState {
    pub resolver: Arc<CredentialResolver>,
    pub monitor: Arc<TokenHealthMonitor>,
    pub refresher: Arc<TokenRefresher>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResult {
    success: bool,
    subject: String,
    message: String,
}

/// Create admin API router
pub fn create_admin_router(state: AdminAppState) -> Router {
    Router::new()
        .route("/api/admin/tokens/health", get(token_health))
        .route("/api/admin/tokens/validate/:subject", get(validate_subject))
        .route("/api/admin/tokens/refresh/:subject", post(refresh_subject))
        .route(
            "/api/admin/tokens/refresh-all-expired",
            post(refresh_all_expired),
        )
        .with_state(Arc::new(state))
}

/// Resolves the caller and requires the admin role.
fn require_admin(state: &AdminAppState, headers: &HeaderMap) -> Result<(), AppError> {
    match state.resolver.resolve(&evidence_from_headers(headers)) {
        Resolution::Authenticated { credential, .. } if credential.role == Role::Admin => Ok(()),
        Resolution::Authenticated { .. } => {
            Err(AppError::Forbidden("Admin role required".to_string()))
        }
        _ => Err(AppError::Unauthorized("Authentication required".to_string())),
    }
}

/// GET /api/admin/tokens/health
async fn token_health(
    State(state): State<Arc<AdminAppState>>,
    headers: HeaderMap,
) -> Result<Json<HealthStats>, AppError> {
    require_admin(&state, &headers)?;

    let stats = state.monitor.health_stats().map_err(|e| {
        error!(error = %e, "Failed to compute token health stats");
        AppError::ServerError("Failed to get token health stats".to_string())
    })?;

    Ok(Json(stats))
}

/// GET /api/admin/tokens/validate/:subject
async fn validate_subject(
    State(state): State<Arc<AdminAppState>>,
    Path(subject): Path<String>,
    headers: HeaderMap,
) -> Result<Json<SubjectTokenReport>, AppError> {
    require_admin(&state, &headers)?;

    let report = state.monitor.validate(&subject).map_err(|e| {
        error!(subject = %subject, error = %e, "Failed to validate subject tokens");
        AppError::ServerError("Failed to validate subject tokens".to_string())
    })?;

    Ok(Json(report))
}

/// POST /api/admin/tokens/refresh/:subject
async fn refresh_subject(
    State(state): State<Arc<AdminAppState>>,
    Path(subject): Path<String>,
    headers: HeaderMap,
) -> Result<Json<RefreshResult>, AppError> {
    require_admin(&state, &headers)?;

    let success = state.refresher.refresh(&subject).await;
    Ok(Json(RefreshResult {
        success,
        subject,
        message: if success {
            "Token refreshed successfully".to_string()
        } else {
            "Token refresh failed".to_string()
        },
    }))
}

/// POST /api/admin/tokens/refresh-all-expired
async fn refresh_all_expired(
    State(state): State<Arc<AdminAppState>>,
    headers: HeaderMap,
) -> Result<Json<BulkRefreshOutcome>, AppError> {
    require_admin(&state, &headers)?;

    let outcome = state.monitor.force_refresh_all_expired().await.map_err(|e| {
        error!(error = %e, "Failed to refresh expired tokens");
        AppError::ServerError("Failed to refresh expired tokens".to_string())
    })?;

    Ok(Json(outcome))
}
