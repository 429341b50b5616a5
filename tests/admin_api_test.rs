// Integration tests for the admin token endpoints

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{Duration, Utc};
use std::sync::Arc;
use tower::ServiceExt;
use warden::api::{create_admin_router, AdminAppState};
use warden::config::MonitorConfig;
use warden::credentials::CredentialStore;
use warden::google::{RefresherConfig, TokenRefresher};
use warden::monitor::TokenHealthMonitor;
use warden::resolver::CredentialResolver;
use warden::session::{GoogleGrant, SessionService};
use warden::token::TokenCodec;

struct TestContext {
    app: Router,
    session: Arc<SessionService>,
    store: Arc<CredentialStore>,
}

fn create_test_context(token_url: String) -> TestContext {
    let key = BASE64.encode([0u8; 32]);
    let store = Arc::new(CredentialStore::new(":memory:", &key).unwrap());
    let codec = Arc::new(TokenCodec::new("admin-test-secret", 900, 604_800));
    let resolver = Arc::new(CredentialResolver::new(
        Arc::clone(&codec),
        Arc::clone(&store),
    ));
    let session = Arc::new(SessionService::new(
        Arc::clone(&codec),
        Arc::clone(&store),
        Some("admin@example.com".to_string()),
    ));
    let refresher = Arc::new(
        TokenRefresher::new(
            Arc::clone(&store),
            RefresherConfig {
                client_id: "client-id".to_string(),
                client_secret: "client-secret".to_string(),
                token_url,
                request_timeout_secs: 5,
            },
        )
        .unwrap(),
    );
    let monitor = Arc::new(TokenHealthMonitor::new(
        Arc::clone(&store),
        Arc::clone(&refresher),
        MonitorConfig::default(),
    ));

    let app = create_admin_router(AdminAppState {
        resolver,
        monitor,
        refresher,
    });

    TestContext {
        app,
        session,
        store,
    }
}

fn grant(subject: &str, email: &str, expires_at: chrono::DateTime<Utc>) -> GoogleGrant {
    GoogleGrant {
        subject: subject.to_string(),
        email: email.to_string(),
        name: "Test User".to_string(),
        picture: None,
        access_token: Some("ya29.access".to_string()),
        refresh_token: Some("1//refresh".to_string()),
        expires_at: Some(expires_at),
    }
}

/// Logs in the configured admin and returns a bearer access token.
fn admin_token(ctx: &TestContext) -> String {
    ctx.session
        .complete_grant(grant(
            "admin-sub",
            "admin@example.com",
            Utc::now() + Duration::hours(1),
        ))
        .unwrap()
        .access_token
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn get(uri: &str, bearer: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(token) = bearer {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    builder.body(Body::empty()).unwrap()
}

fn post(uri: &str, bearer: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("POST").uri(uri);
    if let Some(token) = bearer {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    builder.body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_health_requires_authentication() {
    let ctx = create_test_context("http://127.0.0.1:1/token".to_string());

    let response = ctx
        .app
        .clone()
        .oneshot(get("/api/admin/tokens/health", None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_health_requires_admin_role() {
    let ctx = create_test_context("http://127.0.0.1:1/token".to_string());

    // A regular user's token is not enough
    let user = ctx
        .session
        .complete_grant(grant(
            "user-sub",
            "user@example.com",
            Utc::now() + Duration::hours(1),
        ))
        .unwrap();

    let response = ctx
        .app
        .clone()
        .oneshot(get("/api/admin/tokens/health", Some(&user.access_token)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_health_stats() {
    let ctx = create_test_context("http://127.0.0.1:1/token".to_string());
    let token = admin_token(&ctx);

    // One valid (the admin's own), one expired
    ctx.session
        .complete_grant(grant(
            "user-sub",
            "user@example.com",
            Utc::now() - Duration::minutes(5),
        ))
        .unwrap();

    let response = ctx
        .app
        .clone()
        .oneshot(get("/api/admin/tokens/health", Some(&token)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["total"], 2);
    assert_eq!(body["withGoogleTokens"], 2);
    assert_eq!(body["valid"], 1);
    assert_eq!(body["expired"], 1);
    assert_eq!(body["withRefreshTokens"], 2);
    assert_eq!(body["healthPercentage"], 50);
}

#[tokio::test]
async fn test_validate_subject() {
    let ctx = create_test_context("http://127.0.0.1:1/token".to_string());
    let token = admin_token(&ctx);

    // Expired with a refresh token on record → refresh would make sense
    ctx.session
        .complete_grant(grant(
            "user-sub",
            "user@example.com",
            Utc::now() - Duration::seconds(1),
        ))
        .unwrap();

    let response = ctx
        .app
        .clone()
        .oneshot(get("/api/admin/tokens/validate/user-sub", Some(&token)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["exists"], true);
    assert_eq!(body["hasAccessToken"], true);
    assert_eq!(body["hasRefreshToken"], true);
    assert_eq!(body["valid"], false);
    assert_eq!(body["canRefresh"], true);
}

#[tokio::test]
async fn test_validate_unknown_subject() {
    let ctx = create_test_context("http://127.0.0.1:1/token".to_string());
    let token = admin_token(&ctx);

    let response = ctx
        .app
        .clone()
        .oneshot(get("/api/admin/tokens/validate/missing", Some(&token)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["exists"], false);
    assert_eq!(body["canRefresh"], false);
}

#[tokio::test]
async fn test_refresh_subject() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/token")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token": "ya29.new", "expires_in": 3600}"#)
        .create_async()
        .await;

    let ctx = create_test_context(format!("{}/token", server.url()));
    let token = admin_token(&ctx);

    ctx.session
        .complete_grant(grant(
            "user-sub",
            "user@example.com",
            Utc::now() - Duration::minutes(5),
        ))
        .unwrap();

    let response = ctx
        .app
        .clone()
        .oneshot(post("/api/admin/tokens/refresh/user-sub", Some(&token)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["subject"], "user-sub");

    let stored = ctx.store.find_by_subject("user-sub").unwrap().unwrap();
    assert_eq!(stored.google_access_token, Some("ya29.new".to_string()));
}

#[tokio::test]
async fn test_refresh_all_expired() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/token")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token": "ya29.new", "expires_in": 3600}"#)
        .create_async()
        .await;

    let ctx = create_test_context(format!("{}/token", server.url()));
    let token = admin_token(&ctx);

    // Only the expired credential is eligible; the admin's own is valid
    ctx.session
        .complete_grant(grant(
            "user-sub",
            "user@example.com",
            Utc::now() - Duration::seconds(1),
        ))
        .unwrap();

    let response = ctx
        .app
        .clone()
        .oneshot(post("/api/admin/tokens/refresh-all-expired", Some(&token)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["attempted"], 1);
    assert_eq!(body["successful"], 1);
    assert_eq!(body["failed"], 0);
}
