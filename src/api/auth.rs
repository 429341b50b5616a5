//! Session endpoints: refresh, logout, status.
//!
//! The refresh endpoint is the only place a new session token pair is
//! issued outside grant intake — identity checks through the resolver never
//! issue tokens. It accepts the refresh token from the request body, with a
//! cookie fallback, and answers 4xx with a plain message on failure.

use super::cookies::{cookie_value, evidence_from_headers, CookieSettings, REFRESH_COOKIE};
use crate::credentials::UserCredential;
use crate::resolver::{CredentialResolver, Resolution};
use crate::session::{IssuedSession, SessionError, SessionService};
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::error;

/// Entry point for starting a new interactive login, handled by the OAuth
/// collaborator.
const LOGIN_URL: &str = "/oauth2/authorization/google";

/// Horizon used by the status endpoint to flag a token as expiring soon
const STATUS_EXPIRING_SOON: i64 = 3600;

/// Shared state for the session endpoints
#[derive(Clone)]
pub struct AuthAppState {
    pub resolver: Arc<CredentialResolver>,
    pub session: Arc<SessionService>,
    pub cookies: CookieSettings,
    pub refresh_ttl_secs: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest {
    refresh_token: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub email: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
    pub role: String,
}

impl From<&UserCredential> for UserInfo {
    fn from(credential: &UserCredential) -> Self {
        Self {
            email: credential.email.clone(),
            name: credential.name.clone(),
            picture: credential.picture.clone(),
            role: credential.role.to_string(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionResponse {
    access_token: String,
    refresh_token: String,
    /// Access token lifetime in seconds
    expires_in: i64,
    user: UserInfo,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AuthStatusResponse {
    authenticated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<UserInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    has_google_tokens: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    has_refresh_token: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    token_valid: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    token_expiring_soon: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    token_expiration: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    login_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LoginUrlResponse {
    login_url: String,
    message: String,
}

/// Create session endpoint router
pub fn create_auth_router(state: AuthAppState) -> Router {
    Router::new()
        .route("/auth/refresh", post(refresh_session))
        .route("/auth/logout", post(logout))
        .route("/auth/status", get(auth_status))
        .route("/auth/login-url", get(login_url))
        .with_state(Arc::new(state))
}

/// POST /auth/refresh
///
/// Rotates the session token pair. The refresh token comes from the JSON
/// body when present, falling back to the refresh cookie.
async fn refresh_session(
    State(state): State<Arc<AuthAppState>>,
    headers: HeaderMap,
    body: Option<Json<RefreshRequest>>,
) -> Response {
    let presented = body
        .and_then(|Json(request)| request.refresh_token)
        .filter(|token| !token.trim().is_empty())
        .or_else(|| cookie_value(&headers, REFRESH_COOKIE));

    let Some(presented) = presented else {
        return (StatusCode::BAD_REQUEST, "Refresh token not found").into_response();
    };

    match state.session.refresh_session(&presented) {
        Ok(session) => session_response(&state, session),
        Err(SessionError::InvalidToken) => {
            (StatusCode::BAD_REQUEST, "Invalid refresh token").into_response()
        }
        Err(SessionError::Internal(e)) => {
            error!(error = %e, "Session refresh failed");
            (StatusCode::BAD_REQUEST, "Token refresh failed").into_response()
        }
    }
}

fn session_response(state: &AuthAppState, session: IssuedSession) -> Response {
    let body = SessionResponse {
        access_token: session.access_token.clone(),
        refresh_token: session.refresh_token.clone(),
        expires_in: session.expires_in,
        user: UserInfo::from(&session.credential),
    };

    let mut response = Json(body).into_response();
    state
        .cookies
        .append_session_cookies(response.headers_mut(), &session, state.refresh_ttl_secs);
    response
}

/// POST /auth/logout
///
/// Full logout: clears both session cookies and nulls the stored session
/// refresh token and delegated Google tokens. Always answers 200; cookies
/// are cleared even when nothing could be resolved.
async fn logout(State(state): State<Arc<AuthAppState>>, headers: HeaderMap) -> Response {
    let evidence = evidence_from_headers(&headers);
    if let Resolution::Authenticated { credential, .. } = state.resolver.resolve(&evidence) {
        if let Err(e) = state.session.logout(&credential.subject) {
            error!(subject = %credential.subject, error = %e, "Failed to clear tokens on logout");
        }
    }

    let mut response = (StatusCode::OK, "Logged out successfully").into_response();
    state.cookies.append_cleared_cookies(response.headers_mut());
    response
}

/// GET /auth/status
///
/// Read-only identity check through the resolver. Reports the authenticated
/// user and the health of their delegated tokens, or the login entry point.
/// Never issues tokens.
async fn auth_status(State(state): State<Arc<AuthAppState>>, headers: HeaderMap) -> Response {
    let evidence = evidence_from_headers(&headers);

    match state.resolver.resolve(&evidence) {
        Resolution::Authenticated { credential, .. } => {
            let now = Utc::now();
            let expiring_soon = credential
                .google_token_expires_at
                .map(|expires_at| {
                    expires_at > now && expires_at < now + Duration::seconds(STATUS_EXPIRING_SOON)
                })
                .unwrap_or(false);

            Json(AuthStatusResponse {
                authenticated: true,
                user: Some(UserInfo::from(&credential)),
                has_google_tokens: Some(credential.google_access_token.is_some()),
                has_refresh_token: Some(credential.google_refresh_token.is_some()),
                token_valid: Some(credential.has_valid_google_token(now)),
                token_expiring_soon: Some(expiring_soon),
                token_expiration: credential.google_token_expires_at,
                login_url: None,
                message: None,
                error: None,
            })
            .into_response()
        }
        Resolution::NoAccount { email } => Json(AuthStatusResponse {
            authenticated: false,
            user: None,
            has_google_tokens: None,
            has_refresh_token: None,
            token_valid: None,
            token_expiring_soon: None,
            token_expiration: None,
            login_url: Some(LOGIN_URL.to_string()),
            message: None,
            error: Some(format!("No account for authenticated principal {}", email)),
        })
        .into_response(),
        Resolution::Unauthenticated => Json(AuthStatusResponse {
            authenticated: false,
            user: None,
            has_google_tokens: None,
            has_refresh_token: None,
            token_valid: None,
            token_expiring_soon: None,
            token_expiration: None,
            login_url: Some(LOGIN_URL.to_string()),
            message: Some("Please login to access your account".to_string()),
            error: None,
        })
        .into_response(),
    }
}

/// GET /auth/login-url
async fn login_url() -> Json<LoginUrlResponse> {
    Json(LoginUrlResponse {
        login_url: LOGIN_URL.to_string(),
        message: "Redirect to this URL to start Google login".to_string(),
    })
}
