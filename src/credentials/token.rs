//! Signed session tokens and one-time token hashing.
//!
//! Session tokens are compact `header.claims.mac` strings, each part
//! base64url without padding. The MAC is HMAC-SHA256 over
//! `header.claims` keyed by the store's signing key.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::RelayError;

type HmacSha256 = Hmac<Sha256>;

const HEADER: &str = r#"{"alg":"HS256","typ":"JWT"}"#;

/// Claims carried by a session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Player UUID.
    pub sub: String,
    /// Player name at login time.
    pub name: String,
    /// Session id.
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
}

/// Hex SHA-256 of a one-time secret. Only this form is ever stored.
pub fn hash_secret(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.trim().as_bytes()))
}

pub fn encode(claims: &SessionClaims, key: &[u8]) -> Result<String, RelayError> {
    let header = URL_SAFE_NO_PAD.encode(HEADER);
    let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?);
    let signing_input = format!("{header}.{payload}");

    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| RelayError::Unauthorized)?;
    mac.update(signing_input.as_bytes());
    let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

    Ok(format!("{signing_input}.{signature}"))
}

/// Verify the MAC (constant time) and the `exp` claim against `now`.
///
/// Every failure is reported as [`RelayError::Unauthorized`].
pub fn decode(token: &str, key: &[u8], now: i64) -> Result<SessionClaims, RelayError> {
    let mut parts = token.trim().split('.');
    let (Some(header), Some(payload), Some(signature), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(RelayError::Unauthorized);
    };

    let signature = URL_SAFE_NO_PAD
        .decode(signature)
        .map_err(|_| RelayError::Unauthorized)?;
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| RelayError::Unauthorized)?;
    mac.update(header.as_bytes());
    mac.update(b".");
    mac.update(payload.as_bytes());
    mac.verify_slice(&signature)
        .map_err(|_| RelayError::Unauthorized)?;

    let payload = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| RelayError::Unauthorized)?;
    let claims: SessionClaims =
        serde_json::from_slice(&payload).map_err(|_| RelayError::Unauthorized)?;

    if claims.exp <= now || claims.sub.is_empty() || claims.jti.is_empty() {
        return Err(RelayError::Unauthorized);
    }
    Ok(claims)
}
