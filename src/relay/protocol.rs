//! Wire shapes of the upstream and downstream protocols.
//!
//! Every message is a JSON envelope `{"event": ..., "payload": ...}`. The
//! envelope is parsed first; payloads of known events are then decoded into
//! the typed structs below. A payload that does not fit its struct is logged
//! and dropped by the caller.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub event: String,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Decode the payload into `T`.
    pub fn payload_as<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }
}

// ── Upstream → relay ────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerStats {
    pub players: i64,
    pub max_players: i64,
    /// Preformatted by the plugin (e.g. `"19.98"`).
    pub tps: String,
    pub ram_used: i64,
    pub ram_max: i64,
    pub player_list: Vec<PlayerInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerInfo {
    pub name: String,
    pub uuid: String,
    pub ping: i64,
    pub first_join: i64,
    pub playtime: i64,
    pub world: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PluginPaths {
    pub plugin_data_dir: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthTokenIssued {
    pub token: String,
    pub player_uuid: String,
    pub player_name: String,
    pub expires_at_unix: i64,
    pub permissions: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileManagerResponse {
    pub request_id: String,
    pub ok: bool,
    pub error: String,
    pub data: Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PlayerPermissionsResponse {
    pub request_id: String,
    pub player_uuid: String,
    pub online: bool,
    pub permissions: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct PermissionAdminResponse {
    pub request_id: String,
    pub action: String,
    pub player_uuid: String,
    pub ok: bool,
    pub error: String,
    pub permissions: BTreeMap<String, bool>,
}

// ── Client → relay ──────────────────────────────────────────────────

/// The fields of a client action that authorization looks at. Everything
/// else is forwarded untouched.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClientAction {
    pub event: String,
    /// `console_command` carries its command at the top level.
    pub command: String,
    pub payload: Value,
}

impl ClientAction {
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// `payload.action` of a `world_action`, empty if absent.
    pub fn world_action(&self) -> &str {
        self.payload
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }
}

// ── Relay → anyone ──────────────────────────────────────────────────

pub fn plugin_status(online: bool) -> String {
    let status = if online { "online" } else { "offline" };
    json!({"event": "plugin_status", "payload": {"status": status}}).to_string()
}

pub fn permission_denied(reason: &str) -> String {
    json!({"event": "permission_denied", "payload": {"reason": reason}}).to_string()
}

pub fn command_rejected(reason: &str) -> String {
    json!({"event": "command_rejected", "payload": {"reason": reason}}).to_string()
}

pub fn clear_logs() -> String {
    json!({"event": "clear_logs"}).to_string()
}

pub fn console_log(message: &str, level: &str) -> String {
    json!({"event": "console_log", "payload": {"message": message, "level": level}}).to_string()
}

/// Outbound correlated request. `request_id` is inserted into `payload`.
pub fn correlated_request(event: &str, request_id: &str, mut payload: Value) -> String {
    if !payload.is_object() {
        payload = json!({});
    }
    payload["request_id"] = json!(request_id);
    json!({"event": event, "payload": payload}).to_string()
}

/// Severity of a `latest.log` line, from the `[thread/LEVEL]` marker.
pub fn detect_log_level(line: &str) -> &'static str {
    let upper = line.to_uppercase();
    for level in ["SEVERE", "ERROR", "WARN", "DEBUG"] {
        if upper.contains(&format!("/{level}]")) || upper.contains(&format!(" {level} ")) {
            return level;
        }
    }
    "INFO"
}

pub const EVENT_FILE_REQUEST: &str = "file_manager_request";
pub const EVENT_PERMISSIONS_REQUEST: &str = "player_permissions_request";
pub const EVENT_PERMISSION_ADMIN_REQUEST: &str = "permission_admin_request";
