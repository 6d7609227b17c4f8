//! Error taxonomy shared by the credential store, the permission resolver and
//! the relay.
//!
//! Connection-level failures never surface here: they are handled by tearing
//! down the affected connection. What remains are the outcomes a caller can
//! act on: a rejected login, a denied action, or an offline plugin.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Every failure the relay core reports to its callers.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Missing, tampered, expired or revoked session. Deliberately carries no
    /// detail about which check failed.
    #[error("unauthorized")]
    Unauthorized,

    /// One-time token unknown or already consumed.
    #[error("invalid token")]
    TokenInvalid,

    /// One-time token found but past its expiry (it is consumed anyway).
    #[error("token expired")]
    TokenExpired,

    /// No upstream agent connected, or the connection dropped mid-request.
    #[error("server is offline")]
    PluginOffline,

    /// A correlated request got no response before its deadline.
    #[error("request timed out")]
    Timeout,

    /// The caller abandoned a correlated request.
    #[error("request canceled")]
    Canceled,

    /// Authenticated, but lacking the permission the action needs.
    #[error("forbidden")]
    Forbidden,

    #[error("bad request: {0}")]
    BadRequest(String),

    /// The upstream agent answered a correlated request with `ok = false`.
    #[error("{0}")]
    UpstreamRejected(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RelayError {
    /// HTTP status used when this error reaches an API handler.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized | Self::TokenInvalid | Self::TokenExpired => StatusCode::UNAUTHORIZED,
            Self::PluginOffline => StatusCode::SERVICE_UNAVAILABLE,
            Self::Timeout | Self::Canceled => StatusCode::GATEWAY_TIMEOUT,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::BadRequest(_) | Self::UpstreamRejected(_) => StatusCode::BAD_REQUEST,
            Self::Io(_) | Self::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short machine-readable code, mirrored in JSON error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized => "UNAUTHORIZED",
            Self::TokenInvalid => "TOKEN_INVALID",
            Self::TokenExpired => "TOKEN_EXPIRED",
            Self::PluginOffline => "PLUGIN_OFFLINE",
            Self::Timeout => "TIMEOUT",
            Self::Canceled => "CANCELED",
            Self::Forbidden => "FORBIDDEN",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::UpstreamRejected(_) => "UPSTREAM_REJECTED",
            Self::Io(_) => "IO_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        // Internal failures are logged, not echoed to the browser.
        let message = match &self {
            Self::Io(_) | Self::Serialization(_) => {
                tracing::error!(error = %self, "Internal error while handling request");
                "internal error".to_string()
            }
            other => other.to_string(),
        };
        (status, Json(json!({"error": message, "code": self.code()}))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_failures_map_to_unauthorized() {
        assert_eq!(RelayError::TokenInvalid.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(RelayError::TokenExpired.status_code(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn offline_and_timeout_are_distinct() {
        assert_eq!(RelayError::PluginOffline.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(RelayError::Timeout.status_code(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(RelayError::Canceled.code(), "CANCELED");
    }
}
