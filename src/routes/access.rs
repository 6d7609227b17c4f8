//! Access administration: known players, their sessions and panel permissions.
//!
//! - `GET    /api/access/data`                  — node catalogue + users
//! - `DELETE /api/access/sessions?session_id=`  — revoke one session
//! - `POST   /api/access/permissions`           — grant or revoke one node
//!
//! Viewing needs `beacon.access` (or `access.manage`); changes need
//! `access.manage`. `beacon.access.*` implies both.

use std::collections::{BTreeMap, HashMap};

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use futures::future::join_all;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::auth::AuthSession;
use crate::credentials::Session;
use crate::error::RelayError;
use crate::permissions::{
    all_nodes, has_any_permission, SessionGrants, ACCESS_ALL, ACCESS_MANAGE, ACCESS_VIEW,
    NODE_CATEGORIES,
};
use crate::AppState;

type ApiError = (StatusCode, Json<Value>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({"error": message.into()})))
}

fn from_relay(e: &RelayError) -> ApiError {
    (e.status_code(), Json(json!({"error": e.to_string(), "code": e.code()})))
}

async fn require_view(state: &AppState, session: &AuthSession) -> Result<(), ApiError> {
    session
        .require(state, |perms| {
            has_any_permission(perms, &[ACCESS_ALL, ACCESS_VIEW, ACCESS_MANAGE])
        })
        .await
        .map(drop)
        .map_err(|e| from_relay(&e))
}

async fn require_manage(state: &AppState, session: &AuthSession) -> Result<(), ApiError> {
    session
        .require(state, |perms| has_any_permission(perms, &[ACCESS_ALL, ACCESS_MANAGE]))
        .await
        .map(drop)
        .map_err(|e| from_relay(&e))
}

fn categories_json() -> Value {
    let categories: Vec<Value> = NODE_CATEGORIES
        .iter()
        .map(|&(id, label, nodes)| {
            let permissions: Vec<Value> = nodes
                .iter()
                .map(|&(node, label)| json!({"node": node, "label": label}))
                .collect();
            json!({"id": id, "label": label, "permissions": permissions})
        })
        .collect();
    Value::Array(categories)
}

fn session_json(s: &Session) -> Value {
    json!({
        "id": s.id,
        "created_at": s.created_at,
        "last_seen": s.last_seen_at,
        "expires_at": s.expires_at,
        "revoked": s.revoked,
    })
}

/// `GET /api/access/data`
///
/// Each user's `permissions` map comes from the plugin's permission backend;
/// a player whose snapshot cannot be fetched is listed with an empty map.
pub async fn data(
    State(state): State<AppState>,
    session: AuthSession,
) -> Result<Json<Value>, ApiError> {
    require_view(&state, &session).await?;

    let relay = &state.relay;
    let nodes = all_nodes();
    let identities = relay.credentials.identities().await;

    let mut sessions_by_user: HashMap<String, Vec<Session>> = HashMap::new();
    for s in relay.credentials.active_sessions().await {
        sessions_by_user
            .entry(s.player_uuid.clone())
            .or_default()
            .push(s);
    }

    let snapshots = join_all(identities.iter().map(|identity| {
        relay.request_permission_snapshot(&identity.player_uuid, &identity.player_name, &nodes)
    }))
    .await;

    let users: Vec<Value> = identities
        .iter()
        .zip(snapshots)
        .map(|(identity, snapshot)| {
            let snapshot: BTreeMap<String, bool> = snapshot.unwrap_or_else(|e| {
                warn!(player_uuid = %identity.player_uuid, error = %e, "Permission snapshot unavailable");
                BTreeMap::new()
            });
            let effective: Vec<&str> = nodes
                .iter()
                .copied()
                .filter(|node| snapshot.get(*node).copied().unwrap_or(false))
                .collect();

            let mut sessions = sessions_by_user
                .remove(&identity.player_uuid)
                .unwrap_or_default();
            sessions.sort_by(|a, b| b.last_seen_at.cmp(&a.last_seen_at));

            json!({
                "player_uuid": identity.player_uuid,
                "player_name": identity.player_name,
                "first_seen": identity.created_at,
                "last_seen": identity.last_seen_at,
                "sessions": sessions.iter().map(session_json).collect::<Vec<_>>(),
                "permissions": snapshot,
                "grants": SessionGrants::derive(&effective),
            })
        })
        .collect();

    Ok(Json(json!({
        "categories": categories_json(),
        "users": users,
    })))
}

#[derive(Deserialize)]
pub struct RevokeQuery {
    #[serde(default)]
    pub session_id: String,
}

/// `DELETE /api/access/sessions?session_id=...`
pub async fn revoke_session(
    State(state): State<AppState>,
    session: AuthSession,
    Query(q): Query<RevokeQuery>,
) -> Result<Json<Value>, ApiError> {
    require_manage(&state, &session).await?;

    let session_id = q.session_id.trim();
    if session_id.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "missing session_id"));
    }
    if !state.relay.credentials.revoke_session(session_id).await {
        return Err(api_error(StatusCode::NOT_FOUND, "session not found"));
    }
    info!(by = %session.claims.name, session_id, "Session revoked by administrator");
    Ok(Json(json!({"ok": true})))
}

#[derive(Deserialize)]
pub struct PermissionUpdate {
    #[serde(default)]
    pub player_uuid: String,
    #[serde(default)]
    pub player_name: String,
    #[serde(default)]
    pub node: String,
    #[serde(default)]
    pub enabled: bool,
}

/// `POST /api/access/permissions` — grant (`enabled: true`) or revoke a node.
/// Plugin-side failures answer 502 with the plugin's message.
pub async fn update_permission(
    State(state): State<AppState>,
    session: AuthSession,
    Json(req): Json<PermissionUpdate>,
) -> Result<Json<Value>, ApiError> {
    require_manage(&state, &session).await?;

    let player_uuid = req.player_uuid.trim();
    let node = req.node.trim();
    if player_uuid.is_empty() || node.is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "player_uuid and node are required",
        ));
    }

    state
        .relay
        .request_permission_set(player_uuid, req.player_name.trim(), node, req.enabled)
        .await
        .map_err(|e| api_error(StatusCode::BAD_GATEWAY, e.to_string()))?;

    Ok(Json(json!({"ok": true})))
}
