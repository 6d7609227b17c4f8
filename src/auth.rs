//! Session cookie authentication for the HTTP and browser WebSocket surface.
//!
//! Browsers authenticate with the signed session token stored in the session
//! cookie (default `beacon_session`). [`AuthSession`] is an extractor that
//! rejects requests without a valid one; the plugin's `/ws` endpoint uses the
//! optional agent key instead (see [`constant_time_eq`]).

use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts, HeaderMap},
};

use crate::credentials::SessionClaims;
use crate::error::RelayError;
use crate::permissions::PermissionSet;
use crate::state::AppState;

/// An authenticated browser session.
#[derive(Debug, Clone)]
pub struct AuthSession {
    /// The raw signed token, re-verified on every WebSocket action.
    pub token: String,
    pub claims: SessionClaims,
}

impl FromRequestParts<AppState> for AuthSession {
    type Rejection = RelayError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        read_session_claims(state, &parts.headers).await
    }
}

impl AuthSession {
    /// Current permissions of the session's player. An offline plugin with
    /// nothing cached yields an empty set.
    pub async fn permissions(&self, state: &AppState) -> Result<PermissionSet, RelayError> {
        state.relay.resolve_permissions(&self.claims.sub).await
    }

    /// Fail with [`RelayError::Forbidden`] unless `check` passes.
    pub async fn require(
        &self,
        state: &AppState,
        check: impl FnOnce(&[String]) -> bool,
    ) -> Result<PermissionSet, RelayError> {
        let set = self.permissions(state).await?;
        if check(&set.permissions) {
            Ok(set)
        } else {
            Err(RelayError::Forbidden)
        }
    }
}

/// Verify the session cookie in `headers` and record activity on it.
pub async fn read_session_claims(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<AuthSession, RelayError> {
    let token = cookie_value(headers, &state.config.auth.cookie_name).ok_or(RelayError::Unauthorized)?;
    let claims = state.relay.credentials.decode_session(&token).await?;
    state.relay.credentials.touch(&claims).await;
    Ok(AuthSession { token, claims })
}

/// Value of cookie `name` from the `Cookie` headers, if present and non-empty.
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, value)| *key == name && !value.is_empty())
        .map(|(_, value)| value.to_string())
}

/// `Set-Cookie` value installing the session token.
pub fn session_cookie(name: &str, token: &str, max_age_secs: u64) -> String {
    format!("{name}={token}; Path=/; HttpOnly; SameSite=Lax; Max-Age={max_age_secs}")
}

/// `Set-Cookie` value deleting the session cookie.
pub fn expired_cookie(name: &str) -> String {
    format!("{name}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0")
}

/// Constant-time byte comparison to prevent timing side-channel attacks.
///
/// Always iterates over the full length of `expected` regardless of `provided`
/// length, so an attacker cannot determine the key length from response times.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for (i, e) in expected.iter().enumerate() {
        let p = provided.get(i).copied().unwrap_or(0xff);
        diff |= e ^ p;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"secret", b"secret-longer"));
        assert!(!constant_time_eq(b"secret", b""));
    }

    #[test]
    fn test_cookie_value_picks_named_cookie() {
        let mut headers = HeaderMap::new();
        headers.append(header::COOKIE, HeaderValue::from_static("theme=dark; beacon_session=abc.def.ghi"));
        headers.append(header::COOKIE, HeaderValue::from_static("other=1"));
        assert_eq!(cookie_value(&headers, "beacon_session").as_deref(), Some("abc.def.ghi"));
        assert_eq!(cookie_value(&headers, "other").as_deref(), Some("1"));
        assert!(cookie_value(&headers, "missing").is_none());
    }

    #[test]
    fn test_cookie_value_ignores_empty() {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("beacon_session="));
        assert!(cookie_value(&headers, "beacon_session").is_none());
    }

    #[test]
    fn test_cookie_headers() {
        let set = session_cookie("beacon_session", "tok", 60);
        assert!(set.starts_with("beacon_session=tok;"));
        assert!(set.contains("HttpOnly"));
        assert!(expired_cookie("beacon_session").contains("Max-Age=0"));
    }
}
