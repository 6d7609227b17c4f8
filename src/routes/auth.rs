//! Login, logout and session introspection.

use axum::{
    extract::State,
    http::header,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::auth::{expired_cookie, session_cookie, AuthSession};
use crate::error::RelayError;
use crate::permissions::SessionGrants;
use crate::util::now_unix;
use crate::AppState;

#[derive(Deserialize)]
pub struct MagicLinkRequest {
    #[serde(default)]
    pub token: String,
}

/// `POST /api/auth/magic-link` — exchange a one-time token for a session
/// cookie.
///
/// Unknown, consumed and expired tokens all answer 401.
pub async fn magic_link(
    State(state): State<AppState>,
    Json(req): Json<MagicLinkRequest>,
) -> Result<Response, RelayError> {
    let credentials = &state.relay.credentials;
    let claims = credentials
        .redeem_token(&req.token)
        .await
        .map_err(|_| RelayError::Unauthorized)?;
    let token = credentials.encode_session(&claims).await?;
    let max_age = u64::try_from(claims.exp - now_unix()).unwrap_or(0);

    info!(player = %claims.name, "Browser signed in");
    Ok((
        [(
            header::SET_COOKIE,
            session_cookie(&state.config.auth.cookie_name, &token, max_age),
        )],
        Json(json!({"ok": true})),
    )
        .into_response())
}

/// `POST /api/auth/logout` — revoke the current session and clear the cookie.
pub async fn logout(State(state): State<AppState>, session: AuthSession) -> Response {
    state.relay.credentials.revoke_session(&session.claims.jti).await;
    (
        [(header::SET_COOKIE, expired_cookie(&state.config.auth.cookie_name))],
        Json(json!({"ok": true})),
    )
        .into_response()
}

/// `GET /api/session` — who the cookie belongs to and what they may do.
pub async fn session(
    State(state): State<AppState>,
    session: AuthSession,
) -> Result<Json<Value>, RelayError> {
    let set = session.permissions(&state).await?;
    let grants = SessionGrants::derive(&set.permissions);
    let identity = state.relay.credentials.identity(&session.claims.sub).await;

    Ok(Json(json!({
        "player_uuid": session.claims.sub,
        "player_name": session.claims.name,
        "session_id": session.claims.jti,
        "permissions": set.permissions,
        "online": set.online,
        "grants": grants,
        "expires_at": session.claims.exp,
        "first_seen": identity.as_ref().map(|i| i.created_at),
        "last_seen": identity.as_ref().map(|i| i.last_seen_at),
    })))
}
