//! Session lifecycle: grant intake, refresh rotation, logout.
//!
//! The OAuth2 authorization-code exchange happens in a web-layer
//! collaborator; it hands this module a completed [`GoogleGrant`].
//! `complete_grant` is the single intake path: it always captures whatever
//! delegated tokens the grant carries, creates or updates the credential
//! record, and issues a fresh session token pair.

use crate::credentials::{CredentialStore, Role, UserCredential};
use crate::token::TokenCodec;
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{info, warn};

/// Fallback lifetime when the provider sends an access token without an
/// expiry (Google's tokens live one hour).
const DEFAULT_GOOGLE_TOKEN_TTL_SECS: i64 = 3600;

/// A completed authorization grant, as delivered by the OAuth collaborator.
#[derive(Debug, Clone)]
pub struct GoogleGrant {
    /// Google's stable `sub` identifier
    pub subject: String,
    pub email: String,
    pub name: String,
    pub picture: Option<String>,
    pub access_token: Option<String>,
    /// Absent when consent was granted previously without `prompt=consent`
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// A freshly issued session token pair.
#[derive(Debug, Clone)]
pub struct IssuedSession {
    pub access_token: String,
    pub refresh_token: String,
    /// Access token lifetime in seconds
    pub expires_in: i64,
    pub credential: UserCredential,
}

/// Session refresh failures surfaced to the web layer.
#[derive(Debug)]
pub enum SessionError {
    /// Bad signature, expired, unknown subject, or rotated-away token value
    InvalidToken,
    Internal(anyhow::Error),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::InvalidToken => write!(f, "Invalid refresh token"),
            SessionError::Internal(e) => write!(f, "Token refresh failed: {}", e),
        }
    }
}

impl From<anyhow::Error> for SessionError {
    fn from(e: anyhow::Error) -> Self {
        SessionError::Internal(e)
    }
}

pub struct SessionService {
    codec: Arc<TokenCodec>,
    store: Arc<CredentialStore>,
    /// Email granted the admin role on first login
    admin_email: Option<String>,
}

impl SessionService {
    pub fn new(
        codec: Arc<TokenCodec>,
        store: Arc<CredentialStore>,
        admin_email: Option<String>,
    ) -> Self {
        Self {
            codec,
            store,
            admin_email,
        }
    }

    /// Intakes a completed grant: finds or creates the credential record,
    /// captures the delegated tokens, and issues the session token pair.
    ///
    /// A stored access token always gets an expiry; a grant refresh token is
    /// only overwritten when the grant actually carries one.
    pub fn complete_grant(&self, grant: GoogleGrant) -> Result<IssuedSession> {
        let now = Utc::now();

        let mut credential = match self.store.find_by_subject(&grant.subject)? {
            Some(existing) => existing,
            None => {
                let role = match &self.admin_email {
                    Some(admin) if admin == &grant.email => Role::Admin,
                    _ => Role::User,
                };
                info!(subject = %grant.subject, email = %grant.email, role = %role, "Creating credential record");
                UserCredential::new(
                    grant.subject.clone(),
                    grant.email.clone(),
                    grant.name.clone(),
                    None,
                    role,
                    now,
                )
            }
        };

        credential.name = grant.name;
        credential.picture = grant.picture;
        credential.google_access_token = grant.access_token;
        credential.google_token_expires_at = match &credential.google_access_token {
            Some(_) => Some(
                grant
                    .expires_at
                    .unwrap_or(now + Duration::seconds(DEFAULT_GOOGLE_TOKEN_TTL_SECS)),
            ),
            None => None,
        };
        if grant.refresh_token.is_some() {
            credential.google_refresh_token = grant.refresh_token;
        }

        let access_token = self
            .codec
            .issue_access_token(&credential.subject, credential.role.as_str())?;
        let refresh_token = self.codec.issue_refresh_token(&credential.subject)?;

        credential.session_refresh_token = Some(refresh_token.clone());
        credential.updated_at = now;
        self.store.upsert(&credential)?;

        info!(
            subject = %credential.subject,
            has_google_access = credential.google_access_token.is_some(),
            has_google_refresh = credential.google_refresh_token.is_some(),
            "Authentication completed"
        );

        Ok(IssuedSession {
            access_token,
            refresh_token,
            expires_in: self.codec.access_ttl_secs(),
            credential,
        })
    }

    /// Rotates the session token pair against a presented refresh token.
    ///
    /// The token must verify and match the stored `session_refresh_token`
    /// exactly; the rotation persists the new value, so the presented one
    /// cannot be replayed.
    pub fn refresh_session(&self, presented: &str) -> Result<IssuedSession, SessionError> {
        let claims = self
            .codec
            .verify(presented)
            .map_err(|_| SessionError::InvalidToken)?;

        let mut credential = self
            .store
            .find_by_subject(&claims.sub)
            .map_err(SessionError::Internal)?
            .ok_or(SessionError::InvalidToken)?;

        if credential.session_refresh_token.as_deref() != Some(presented) {
            warn!(subject = %claims.sub, "Refresh attempted with rotated or revoked token");
            return Err(SessionError::InvalidToken);
        }

        let access_token = self
            .codec
            .issue_access_token(&credential.subject, credential.role.as_str())?;
        let refresh_token = self.codec.issue_refresh_token(&credential.subject)?;

        credential.session_refresh_token = Some(refresh_token.clone());
        credential.updated_at = Utc::now();
        self.store.upsert(&credential).map_err(SessionError::Internal)?;

        Ok(IssuedSession {
            access_token,
            refresh_token,
            expires_in: self.codec.access_ttl_secs(),
            credential,
        })
    }

    /// Full logout: nulls the session refresh token and the delegated
    /// access/refresh tokens. The record itself survives.
    pub fn logout(&self, subject: &str) -> Result<()> {
        match self.store.find_by_subject(subject)? {
            Some(mut credential) => {
                credential.clear_tokens(Utc::now());
                self.store.upsert(&credential)?;
                info!(subject = %subject, "Cleared all tokens on logout");
            }
            None => {
                warn!(subject = %subject, "Logout for unknown subject");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

    fn create_service(admin_email: Option<&str>) -> (SessionService, Arc<CredentialStore>) {
        let key = BASE64.encode([0u8; 32]);
        let store = Arc::new(CredentialStore::new(":memory:", &key).unwrap());
        let codec = Arc::new(TokenCodec::new("session-test-secret", 900, 604_800));
        let service = SessionService::new(
            codec,
            Arc::clone(&store),
            admin_email.map(|e| e.to_string()),
        );
        (service, store)
    }

    fn full_grant() -> GoogleGrant {
        GoogleGrant {
            subject: "sub-1".to_string(),
            email: "user@example.com".to_string(),
            name: "Test User".to_string(),
            picture: Some("https://example.com/p.jpg".to_string()),
            access_token: Some("ya29.access".to_string()),
            refresh_token: Some("1//refresh".to_string()),
            expires_at: Some(Utc::now() + Duration::hours(1)),
        }
    }

    #[test]
    fn test_complete_grant_creates_record() {
        let (service, store) = create_service(None);

        let session = service.complete_grant(full_grant()).unwrap();
        assert_eq!(session.expires_in, 900);
        assert_eq!(session.credential.role, Role::User);

        let stored = store.find_by_subject("sub-1").unwrap().unwrap();
        assert_eq!(stored.google_access_token, Some("ya29.access".to_string()));
        assert_eq!(stored.google_refresh_token, Some("1//refresh".to_string()));
        assert_eq!(
            stored.session_refresh_token,
            Some(session.refresh_token.clone())
        );
        assert!(stored.google_token_expires_at.is_some());
    }

    #[test]
    fn test_admin_email_gets_admin_role() {
        let (service, _) = create_service(Some("user@example.com"));
        let session = service.complete_grant(full_grant()).unwrap();
        assert_eq!(session.credential.role, Role::Admin);

        // Someone else stays a regular user
        let mut grant = full_grant();
        grant.subject = "sub-2".to_string();
        grant.email = "other@example.com".to_string();
        let session = service.complete_grant(grant).unwrap();
        assert_eq!(session.credential.role, Role::User);
    }

    #[test]
    fn test_access_token_without_expiry_gets_default() {
        let (service, store) = create_service(None);
        let mut grant = full_grant();
        grant.expires_at = None;

        let before = Utc::now();
        service.complete_grant(grant).unwrap();

        let stored = store.find_by_subject("sub-1").unwrap().unwrap();
        let expires_at = stored.google_token_expires_at.expect("expiry must be set");
        assert!(expires_at >= before + Duration::seconds(3500));
        assert!(expires_at <= Utc::now() + Duration::seconds(3700));
    }

    #[test]
    fn test_regrant_without_refresh_token_preserves_stored_one() {
        let (service, store) = create_service(None);
        service.complete_grant(full_grant()).unwrap();

        // Second login: Google omits the refresh token this time
        let mut grant = full_grant();
        grant.refresh_token = None;
        grant.access_token = Some("ya29.newer".to_string());
        service.complete_grant(grant).unwrap();

        let stored = store.find_by_subject("sub-1").unwrap().unwrap();
        assert_eq!(stored.google_access_token, Some("ya29.newer".to_string()));
        assert_eq!(stored.google_refresh_token, Some("1//refresh".to_string()));
    }

    #[test]
    fn test_refresh_session_rotates() {
        let (service, store) = create_service(None);
        let first = service.complete_grant(full_grant()).unwrap();

        let second = service.refresh_session(&first.refresh_token).unwrap();
        assert_ne!(second.refresh_token, first.refresh_token);

        let stored = store.find_by_subject("sub-1").unwrap().unwrap();
        assert_eq!(
            stored.session_refresh_token,
            Some(second.refresh_token.clone())
        );

        // The superseded token is now rejected
        assert!(matches!(
            service.refresh_session(&first.refresh_token),
            Err(SessionError::InvalidToken)
        ));
    }

    #[test]
    fn test_refresh_session_rejects_garbage() {
        let (service, _) = create_service(None);
        service.complete_grant(full_grant()).unwrap();

        assert!(matches!(
            service.refresh_session("not-a-token"),
            Err(SessionError::InvalidToken)
        ));
    }

    #[test]
    fn test_logout_clears_both_token_families() {
        let (service, store) = create_service(None);
        service.complete_grant(full_grant()).unwrap();

        service.logout("sub-1").unwrap();

        let stored = store.find_by_subject("sub-1").unwrap().unwrap();
        assert!(stored.session_refresh_token.is_none());
        assert!(stored.google_access_token.is_none());
        assert!(stored.google_refresh_token.is_none());
        assert!(stored.google_token_expires_at.is_none());
        // Identity survives
        assert_eq!(stored.email, "user@example.com");
    }

    #[test]
    fn test_logout_unknown_subject_is_ok() {
        let (service, _) = create_service(None);
        assert!(service.logout("missing").is_ok());
    }
}
