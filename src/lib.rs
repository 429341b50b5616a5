// Immutable service configuration
pub mod config;

// Session token issuance and verification
pub mod token;

// Encrypted credential storage
pub mod credentials;

// Google delegated-token refresh
pub mod google;

// Per-request identity resolution
pub mod resolver;

// Session lifecycle (grant intake, rotation, logout)
pub mod session;

// Token health monitoring and proactive refresh
pub mod monitor;

// HTTP API
pub mod api;
