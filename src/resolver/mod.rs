//! Per-request identity resolution.
//!
//! Inbound requests can carry three kinds of evidence, any subset of which
//! may be present: an already-authenticated provider principal (email), a
//! session access token, and a session refresh token. The web layer collects
//! them once into [`Evidence`]; [`CredentialResolver::resolve`] then runs a
//! strict-order state machine, first success wins.
//!
//! Resolution is side-effect free: a successful resolution through the
//! refresh token does NOT issue new tokens. Reissuance is the explicit
//! refresh endpoint's job, so read-only identity checks stay read-only.

use crate::credentials::{CredentialStore, UserCredential};
use crate::token::{TokenCodec, TokenError};
use std::sync::Arc;
use tracing::{debug, error, warn};


/// Authentication evidence collected from one inbound request.
#[derive(Debug, Clone, Default)]
pub struct Evidence {
    /// Email attribute of a live delegated-provider principal
    pub principal_email: Option<String>,
    /// Session access token (cookie or Authorization header)
    pub access_token: Option<String>,
    /// Session refresh token (cookie or request body)
    pub refresh_token: Option<String>,
}

impl Evidence {
    pub fn none() -> Self {
        Self::default()
    }
}

/// Which step of the state machine produced the identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthSource {
    Principal,
    AccessToken,
    RefreshToken,
}

/// Outcome of resolving one request's evidence.
#[derive(Debug, Clone)]
pub enum Resolution {
    Authenticated {
        credential: UserCredential,
        source: AuthSource,
    },
    /// The provider authenticated the principal but no account exists for
    /// that email. Deliberately distinct from a bad token.
    NoAccount { email: String },
    Unauthenticated,
}

pub struct CredentialResolver {
    codec: Arc<TokenCodec>,
    store: Arc<CredentialStore>,
}

impl CredentialResolver {
    pub fn new(codec: Arc<TokenCodec>, store: Arc<CredentialStore>) -> Self {
        Self { codec, store }
    }

    /// Runs the state machine over the evidence, in strict order:
    ///
    /// 1. Provider principal → lookup by email → authenticated, or
    ///    `NoAccount` when the email has no record
    /// 2. Access token → verify; on any failure (expired included) fall
    ///    through to the refresh token
    /// 3. Refresh token → verify, and require that its value match the
    ///    stored `session_refresh_token` (rotated/revoked tokens fail here)
    /// 4. Nothing usable → unauthenticated
    ///
    /// Token verification failures never escape this method.
    pub fn resolve(&self, evidence: &Evidence) -> Resolution {
        if let Some(email) = &evidence.principal_email {
            match self.store.find_by_email(email) {
                Ok(Some(credential)) => {
                    return Resolution::Authenticated {
                        credential,
                        source: AuthSource::Principal,
                    };
                }
                Ok(None) => {
                    warn!(email = %email, "Authenticated principal has no account");
                    return Resolution::NoAccount {
                        email: email.clone(),
                    };
                }
                Err(e) => {
                    error!(email = %email, error = %e, "Credential lookup failed");
                    return Resolution::Unauthenticated;
                }
            }
        }

        if let Some(token) = &evidence.access_token {
            match self.codec.verify(token) {
                Ok(claims) => match self.store.find_by_subject(&claims.sub) {
                    Ok(Some(credential)) => {
                        return Resolution::Authenticated {
                            credential,
                            source: AuthSource::AccessToken,
                        };
                    }
                    Ok(None) => {
                        warn!(subject = %claims.sub, "Access token for unknown subject");
                    }
                    Err(e) => {
                        error!(error = %e, "Credential lookup failed");
                        return Resolution::Unauthenticated;
                    }
                },
                Err(TokenError::Expired) => {
                    debug!("Access token expired, trying refresh token");
                }
                Err(e) => {
                    debug!(reason = %e, "Access token rejected");
                }
            }
        }

        if let Some(token) = &evidence.refresh_token {
            let claims = match self.codec.verify(token) {
                Ok(claims) => claims,
                Err(e) => {
                    debug!(reason = %e, "Refresh token rejected");
                    return Resolution::Unauthenticated;
                }
            };

            let credential = match self.store.find_by_subject(&claims.sub) {
                Ok(Some(credential)) => credential,
                Ok(None) => {
                    warn!(subject = %claims.sub, "Refresh token for unknown subject");
                    return Resolution::Unauthenticated;
                }
                Err(e) => {
                    error!(error = %e, "Credential lookup failed");
                    return Resolution::Unauthenticated;
                }
            };

            // The presented token must be the one most recently issued.
            // Anything else was rotated away or revoked by logout.
            if credential.session_refresh_token.as_deref() != Some(token.as_str()) {
                warn!(subject = %claims.sub, "Stale or revoked refresh token presented");
                return Resolution::Unauthenticated;
            }

            return Resolution::Authenticated {
                credential,
                source: AuthSource::RefreshToken,
            };
        }

        Resolution::Unauthenticated
    }
}
