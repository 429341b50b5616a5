use anyhow::{Context, Result};
use serde::Deserialize;

/// Complete Warden configuration
#[derive(Debug, Clone, Deserialize)]
pub struct WardenConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub google: GoogleConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Frontend origin, used for CORS and the cookie deployment-mode switch
    #[serde(default = "default_frontend_url")]
    pub frontend_url: String,
    /// Force Secure + SameSite=None cookies even on an http frontend URL
    #[serde(default)]
    pub secure_cookies: bool,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_frontend_url() -> String {
    "http://localhost:3000".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            frontend_url: default_frontend_url(),
            secure_cookies: false,
        }
    }
}

impl ServerConfig {
    /// Cookies are marked Secure when explicitly configured or when the
    /// frontend is served over HTTPS (production profile).
    pub fn use_secure_cookies(&self) -> bool {
        self.secure_cookies || self.frontend_url.starts_with("https://")
    }
}

/// Session token configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Access token lifetime (seconds)
    #[serde(default = "default_access_ttl")]
    pub access_ttl_secs: i64,
    /// Refresh token lifetime (seconds)
    #[serde(default = "default_refresh_ttl")]
    pub refresh_ttl_secs: i64,
}

fn default_access_ttl() -> i64 {
    900 // 15 minutes
}

fn default_refresh_ttl() -> i64 {
    604_800 // 7 days
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            access_ttl_secs: default_access_ttl(),
            refresh_ttl_secs: default_refresh_ttl(),
        }
    }
}

/// Google token endpoint configuration
#[derive(Debug, Clone, Deserialize)]
pub struct GoogleConfig {
    #[serde(default = "default_token_url")]
    pub token_url: String,
    /// Request timeout for the token endpoint (seconds)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_token_url() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

fn default_request_timeout() -> u64 {
    10
}

impl Default for GoogleConfig {
    fn default() -> Self {
        Self {
            token_url: default_token_url(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// Token health monitor configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// How often the health sweep runs (seconds)
    #[serde(default = "default_health_interval")]
    pub health_interval_secs: u64,
    /// How often the proactive refresh sweep runs (seconds)
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
    /// Expiring-soon horizon for health reporting (seconds)
    #[serde(default = "default_expiring_soon")]
    pub expiring_soon_secs: i64,
    /// Tighter horizon the refresh sweep acts on (seconds)
    #[serde(default = "default_refresh_window")]
    pub refresh_window_secs: i64,
}

fn default_health_interval() -> u64 {
    300 // Every 5 minutes
}

fn default_refresh_interval() -> u64 {
    600 // Every 10 minutes
}

fn default_expiring_soon() -> i64 {
    3600
}

fn default_refresh_window() -> i64 {
    1800
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            health_interval_secs: default_health_interval(),
            refresh_interval_secs: default_refresh_interval(),
            expiring_soon_secs: default_expiring_soon(),
            refresh_window_secs: default_refresh_window(),
        }
    }
}

/// Credential store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_db_path() -> String {
    "credentials.db".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            google: GoogleConfig::default(),
            monitor: MonitorConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> Result<WardenConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file '{}'", path))?;
    let config: WardenConfig =
        toml::from_str(&contents).context("Failed to parse config file")?;
    Ok(config)
}

/// Secrets read from the environment, never from the config file.
#[derive(Debug, Clone)]
pub struct Secrets {
    /// HMAC signing secret for session tokens
    pub jwt_secret: String,
    /// Google OAuth client credentials, used for the refresh-token grant
    pub google_client_id: String,
    pub google_client_secret: String,
    /// Base64-encoded 32-byte master key for credential encryption at rest
    pub encryption_key: String,
    /// Email granted the admin role on first login
    pub admin_email: Option<String>,
}

impl Secrets {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            jwt_secret: std::env::var("WARDEN_JWT_SECRET")
                .context("WARDEN_JWT_SECRET is required")?,
            google_client_id: std::env::var("WARDEN_GOOGLE_CLIENT_ID")
                .context("WARDEN_GOOGLE_CLIENT_ID is required")?,
            google_client_secret: std::env::var("WARDEN_GOOGLE_CLIENT_SECRET")
                .context("WARDEN_GOOGLE_CLIENT_SECRET is required")?,
            encryption_key: std::env::var("WARDEN_ENCRYPTION_KEY")
                .context("WARDEN_ENCRYPTION_KEY is required (base64-encoded 32-byte key)")?,
            admin_email: std::env::var("WARDEN_ADMIN_EMAIL").ok(),
        })
    }
}
