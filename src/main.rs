use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, Method};
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use warden::api::{
    create_admin_router, create_auth_router, AdminAppState, AuthAppState, CookieSettings,
};
use warden::config::{load_config, Secrets, WardenConfig};
use warden::credentials::CredentialStore;
use warden::google::{RefresherConfig, TokenRefresher};
use warden::monitor::TokenHealthMonitor;
use warden::resolver::CredentialResolver;
use warden::session::SessionService;
use warden::token::TokenCodec;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warden=info".into()),
        )
        .init();

    info!("Warden starting...");

    let config_path =
        std::env::var("WARDEN_CONFIG").unwrap_or_else(|_| "warden.toml".to_string());
    let config = if std::path::Path::new(&config_path).exists() {
        load_config(&config_path)?
    } else {
        warn!(path = %config_path, "Config file not found, using defaults");
        WardenConfig::default()
    };
    let secrets = Secrets::from_env()?;

    // Credential store, shared by every component
    let store = Arc::new(
        CredentialStore::new(&config.store.db_path, &secrets.encryption_key)
            .context("Failed to initialize credential store")?,
    );
    info!(db_path = %config.store.db_path, "Credential store initialized");

    let codec = Arc::new(TokenCodec::new(
        secrets.jwt_secret.clone(),
        config.auth.access_ttl_secs,
        config.auth.refresh_ttl_secs,
    ));

    let refresher = Arc::new(
        TokenRefresher::new(
            Arc::clone(&store),
            RefresherConfig {
                client_id: secrets.google_client_id.clone(),
                client_secret: secrets.google_client_secret.clone(),
                token_url: config.google.token_url.clone(),
                request_timeout_secs: config.google.request_timeout_secs,
            },
        )
        .context("Failed to initialize token refresher")?,
    );

    let monitor = Arc::new(TokenHealthMonitor::new(
        Arc::clone(&store),
        Arc::clone(&refresher),
        config.monitor.clone(),
    ));

    let resolver = Arc::new(CredentialResolver::new(
        Arc::clone(&codec),
        Arc::clone(&store),
    ));

    let session = Arc::new(SessionService::new(
        Arc::clone(&codec),
        Arc::clone(&store),
        secrets.admin_email.clone(),
    ));

    // Background sweeps; the watch channel lets an in-flight sweep finish
    // its current item before exiting
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweep_handles = monitor.start(shutdown_rx);
    info!(
        health_interval_secs = config.monitor.health_interval_secs,
        refresh_interval_secs = config.monitor.refresh_interval_secs,
        "Token health monitor started"
    );

    let cookies = CookieSettings {
        secure: config.server.use_secure_cookies(),
    };

    let cors = CorsLayer::new()
        .allow_origin(
            config
                .server
                .frontend_url
                .parse::<HeaderValue>()
                .context("Invalid frontend URL")?,
        )
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_credentials(true);

    let app = create_auth_router(AuthAppState {
        resolver: Arc::clone(&resolver),
        session: Arc::clone(&session),
        cookies,
        refresh_ttl_secs: config.auth.refresh_ttl_secs,
    })
    .merge(create_admin_router(AdminAppState {
        resolver: Arc::clone(&resolver),
        monitor: Arc::clone(&monitor),
        refresher: Arc::clone(&refresher),
    }))
    .layer(cors);

    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind_addr))?;
    info!(
        addr = %config.server.bind_addr,
        secure_cookies = cookies.secure,
        "Listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    // Stop the sweeps and wait for them to finish their current item
    let _ = shutdown_tx.send(true);
    for handle in sweep_handles {
        let _ = handle.await;
    }

    info!("Warden stopped");
    Ok(())
}
