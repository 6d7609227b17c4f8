//! File manager endpoints, proxied to the plugin as correlated requests.
//!
//! - `GET    /api/files/meta?path=...`      — file or directory metadata
//! - `GET    /api/files/list?path=...`      — directory listing
//! - `GET    /api/files/content?path=...`   — read a text file
//! - `PUT    /api/files/content?path=...`   — write a text file
//! - `DELETE /api/files?path=...`           — delete a file or directory
//! - `GET    /api/files/download?path=...`  — raw bytes as an attachment
//!
//! ## Path scopes
//!
//! Every request is checked against the path-scoped file permission for its
//! action before anything is sent to the plugin. Paths are interpreted by the
//! plugin relative to the server root; `..` is resolved before the scope check.
//!
//! ## Errors
//!
//! Offline plugin → 503, timeout → 504, plugin-side failure → 400 with the
//! plugin's message.

use axum::{
    extract::{Query, State},
    http::header,
    response::{IntoResponse, Response},
    Json,
};
use base64::Engine;
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use crate::auth::AuthSession;
use crate::error::RelayError;
use crate::permissions::{can_access_file_path, FileAction};
use crate::AppState;

const DEFAULT_DOWNLOAD_NAME: &str = "download.bin";

#[derive(Deserialize)]
pub struct PathQuery {
    #[serde(default)]
    pub path: String,
}

#[derive(Deserialize)]
pub struct WriteRequest {
    #[serde(default)]
    pub content: String,
}

#[derive(Deserialize)]
struct DownloadData {
    #[serde(default)]
    file_name: String,
    #[serde(default)]
    content_base64: String,
}

/// Check the path scope, then run `action` on the plugin.
async fn file_operation(
    state: &AppState,
    session: &AuthSession,
    scope: FileAction,
    action: &str,
    path: &str,
    content: Option<&str>,
) -> Result<Value, RelayError> {
    session
        .require(state, |perms| can_access_file_path(perms, scope, path))
        .await?;
    state
        .relay
        .request_file_operation(action, path, content, None)
        .await
}

/// `GET /api/files/meta`
pub async fn meta(
    State(state): State<AppState>,
    session: AuthSession,
    Query(q): Query<PathQuery>,
) -> Result<Json<Value>, RelayError> {
    file_operation(&state, &session, FileAction::View, "meta", &q.path, None)
        .await
        .map(Json)
}

/// `GET /api/files/list`
pub async fn list(
    State(state): State<AppState>,
    session: AuthSession,
    Query(q): Query<PathQuery>,
) -> Result<Json<Value>, RelayError> {
    file_operation(&state, &session, FileAction::View, "list", &q.path, None)
        .await
        .map(Json)
}

/// `GET /api/files/content`
pub async fn read_content(
    State(state): State<AppState>,
    session: AuthSession,
    Query(q): Query<PathQuery>,
) -> Result<Json<Value>, RelayError> {
    file_operation(&state, &session, FileAction::View, "read_text", &q.path, None)
        .await
        .map(Json)
}

/// `PUT /api/files/content`
pub async fn write_content(
    State(state): State<AppState>,
    session: AuthSession,
    Query(q): Query<PathQuery>,
    Json(req): Json<WriteRequest>,
) -> Result<Json<Value>, RelayError> {
    let data = file_operation(
        &state,
        &session,
        FileAction::Edit,
        "write_text",
        &q.path,
        Some(&req.content),
    )
    .await?;
    info!(player = %session.claims.name, path = %q.path, bytes = req.content.len(), "File written");
    Ok(Json(data))
}

/// `DELETE /api/files`
pub async fn delete(
    State(state): State<AppState>,
    session: AuthSession,
    Query(q): Query<PathQuery>,
) -> Result<Json<Value>, RelayError> {
    let data = file_operation(&state, &session, FileAction::Delete, "delete", &q.path, None).await?;
    info!(player = %session.claims.name, path = %q.path, "File deleted");
    Ok(Json(data))
}

/// `GET /api/files/download` — the plugin returns the bytes base64-encoded;
/// they are decoded and served as `application/octet-stream`.
pub async fn download(
    State(state): State<AppState>,
    session: AuthSession,
    Query(q): Query<PathQuery>,
) -> Result<Response, RelayError> {
    let data = file_operation(
        &state,
        &session,
        FileAction::Download,
        "download",
        &q.path,
        None,
    )
    .await?;

    let data: DownloadData = serde_json::from_value(data)?;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(data.content_base64.trim())
        .map_err(|e| RelayError::UpstreamRejected(format!("invalid download data: {e}")))?;

    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", attachment_name(&data.file_name)),
            ),
        ],
        bytes,
    )
        .into_response())
}

/// File name safe to place inside a quoted `Content-Disposition` value.
fn attachment_name(raw: &str) -> String {
    let name: String = raw
        .chars()
        .filter(|c| !c.is_control() && *c != '"' && *c != '\\')
        .collect();
    let name = name.trim();
    if name.is_empty() {
        DEFAULT_DOWNLOAD_NAME.to_string()
    } else {
        name.to_string()
    }
}
