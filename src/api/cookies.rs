//! Session cookie issuance and request-evidence extraction.
//!
//! Cookies are always `HttpOnly`. Under a production/HTTPS profile they are
//! `Secure; SameSite=None` (the frontend is cross-origin there); otherwise
//! `SameSite=Lax` without `Secure`. This is a deployment-mode switch, not
//! styling.

use crate::resolver::Evidence;
use crate::session::IssuedSession;
use axum::http::{header, HeaderMap, HeaderValue};
use tracing::error;

pub const ACCESS_COOKIE: &str = "accessToken";
pub const REFRESH_COOKIE: &str = "refreshToken";

#[derive(Debug, Clone, Copy)]
pub struct CookieSettings {
    pub secure: bool,
}

impl CookieSettings {
    pub fn set_cookie(&self, name: &str, value: &str, max_age_secs: i64) -> String {
        if self.secure {
            format!(
                "{}={}; Max-Age={}; Path=/; HttpOnly; Secure; SameSite=None",
                name, value, max_age_secs
            )
        } else {
            format!(
                "{}={}; Max-Age={}; Path=/; HttpOnly; SameSite=Lax",
                name, value, max_age_secs
            )
        }
    }

    pub fn clear_cookie(&self, name: &str) -> String {
        self.set_cookie(name, "", 0)
    }

    /// Appends both session cookies to a response.
    pub fn append_session_cookies(
        &self,
        headers: &mut HeaderMap,
        session: &IssuedSession,
        refresh_ttl_secs: i64,
    ) {
        let cookies = [
            self.set_cookie(ACCESS_COOKIE, &session.access_token, session.expires_in),
            self.set_cookie(REFRESH_COOKIE, &session.refresh_token, refresh_ttl_secs),
        ];
        append_all(headers, &cookies);
    }

    /// Appends expired cookies that clear both token cookies.
    pub fn append_cleared_cookies(&self, headers: &mut HeaderMap) {
        let cookies = [
            self.clear_cookie(ACCESS_COOKIE),
            self.clear_cookie(REFRESH_COOKIE),
        ];
        append_all(headers, &cookies);
    }
}

fn append_all(headers: &mut HeaderMap, cookies: &[String]) {
    for cookie in cookies {
        match HeaderValue::from_str(cookie) {
            Ok(value) => {
                headers.append(header::SET_COOKIE, value);
            }
            Err(e) => error!(error = %e, "Failed to encode cookie header"),
        }
    }
}

/// Reads one cookie's value from the request's Cookie header(s).
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| {
            let (cookie_name, cookie_value) = pair.trim().split_once('=')?;
            if cookie_name == name && !cookie_value.is_empty() {
                Some(cookie_value.to_string())
            } else {
                None
            }
        })
        .next()
}

/// Extracts a bearer token from the Authorization header.
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    if token.is_empty() {
        return None;
    }
    Some(token.to_string())
}

/// Collects session-token evidence from request headers: bearer token or
/// access cookie, plus the refresh cookie. The provider-principal evidence,
/// when one exists, is supplied by the OAuth collaborator, not by headers.
pub fn evidence_from_headers(headers: &HeaderMap) -> Evidence {
    Evidence {
        principal_email: None,
        access_token: bearer_token(headers).or_else(|| cookie_value(headers, ACCESS_COOKIE)),
        refresh_token: cookie_value(headers, REFRESH_COOKIE),
    }
}
