//! Connection registry and relay between the plugin and browsers.
//!
//! Exactly one upstream plugin connection is live at a time; a new one
//! replaces the old wholesale. Any number of browser connections subscribe to
//! broadcasts and send actions which are authorized, then forwarded upstream.
//!
//! Every connection owns a writer task fed by a bounded channel, so writes on
//! one socket never interleave and stay in FIFO order. Upstream messages are
//! demultiplexed by [`RelayState::dispatch_upstream`]; correlated responses
//! are routed to the matching [`correlation::PendingRequests`] table.

pub mod authorize;
pub mod correlation;
pub mod protocol;
pub mod ws;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::credentials::CredentialStore;
use crate::error::RelayError;
use crate::event_log::{EventLog, Retention};
use crate::permissions::{PermissionResolver, PermissionSet, PermissionSource};
use crate::snapshot::SnapshotStore;

use correlation::PendingRequests;
use protocol::{
    AuthTokenIssued, ClientAction, Envelope, FileManagerResponse, PermissionAdminResponse,
    PlayerPermissionsResponse, PluginPaths, ServerStats,
};

/// Outbound queue depth of the plugin connection.
const UPSTREAM_QUEUE: usize = 256;

const LATEST_LOG_PATH: &str = "logs/latest.log";

struct UpstreamHandle {
    id: u64,
    tx: mpsc::Sender<String>,
    shutdown_tx: watch::Sender<bool>,
}

/// Handed to the upstream socket task on connect.
pub struct UpstreamConnection {
    pub id: u64,
    /// Messages to write to the plugin.
    pub rx: mpsc::Receiver<String>,
    /// Flips to `true` when this connection is replaced or torn down.
    pub shutdown_rx: watch::Receiver<bool>,
}

/// Handed to a browser socket task on connect.
pub struct ClientConnection {
    pub id: u64,
    pub tx: mpsc::Sender<String>,
    pub rx: mpsc::Receiver<String>,
}

/// Deadlines of the correlated request kinds.
#[derive(Debug, Clone, Copy)]
pub struct RelayTimeouts {
    pub permission: Duration,
    pub file: Duration,
    pub admin: Duration,
}

/// State shared by every connection task and HTTP handler.
#[derive(Clone)]
pub struct RelayState {
    upstream: Arc<RwLock<Option<UpstreamHandle>>>,
    clients: Arc<RwLock<HashMap<u64, mpsc::Sender<String>>>>,
    next_conn_id: Arc<AtomicU64>,
    pub file_requests: Arc<PendingRequests<FileManagerResponse>>,
    pub permission_requests: Arc<PendingRequests<PlayerPermissionsResponse>>,
    pub admin_requests: Arc<PendingRequests<PermissionAdminResponse>>,
    pub event_log: Arc<Mutex<EventLog>>,
    pub snapshot: Arc<SnapshotStore>,
    pub credentials: Arc<CredentialStore>,
    pub permissions: Arc<PermissionResolver>,
    /// Broadcasts dropped because a client's queue was full.
    pub dropped_messages: Arc<AtomicU64>,
    pub timeouts: RelayTimeouts,
    pub client_queue: usize,
    agent_key: Option<String>,
    /// Cancelled on process shutdown; connection tasks exit on it.
    pub shutdown: CancellationToken,
}

impl RelayState {
    pub fn new(config: &Config) -> Self {
        let permissions = Arc::new(PermissionResolver::new(
            config.auth.permission_ttl(),
            config.auth.permission_idle(),
        ));
        let credentials = Arc::new(CredentialStore::new(&config.auth, permissions.clone()));
        Self {
            upstream: Arc::new(RwLock::new(None)),
            clients: Arc::new(RwLock::new(HashMap::new())),
            next_conn_id: Arc::new(AtomicU64::new(1)),
            file_requests: Arc::new(PendingRequests::new("file")),
            permission_requests: Arc::new(PendingRequests::new("permissions")),
            admin_requests: Arc::new(PendingRequests::new("permission_admin")),
            event_log: Arc::new(Mutex::new(EventLog::new(Retention::from(&config.log_buffer)))),
            snapshot: Arc::new(SnapshotStore::new()),
            credentials,
            permissions,
            dropped_messages: Arc::new(AtomicU64::new(0)),
            timeouts: RelayTimeouts {
                permission: config.relay.permission_timeout(),
                file: config.relay.file_timeout(),
                admin: config.relay.admin_timeout(),
            },
            client_queue: config.relay.client_queue.max(1),
            agent_key: config.auth.agent_key.clone().filter(|k| !k.is_empty()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Whether a plugin presenting `provided` may connect.
    pub fn agent_key_matches(&self, provided: Option<&str>) -> bool {
        match &self.agent_key {
            None => true,
            Some(expected) => {
                crate::auth::constant_time_eq(expected.as_bytes(), provided.unwrap_or("").as_bytes())
            }
        }
    }

    // ── Upstream lifecycle ──────────────────────────────────────────

    /// Install a new upstream connection, replacing any existing one.
    ///
    /// The replaced connection is told to shut down and its pending requests
    /// fail. The event log is cleared and clients are told the plugin is online.
    pub async fn connect_upstream(&self) -> UpstreamConnection {
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(UPSTREAM_QUEUE);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let previous = self.upstream.write().await.replace(UpstreamHandle {
            id,
            tx,
            shutdown_tx,
        });
        if let Some(old) = previous {
            warn!(conn_id = id, old_conn_id = old.id, "Plugin reconnected, replacing previous connection");
            let _ = old.shutdown_tx.send(true);
            self.fail_pending();
        }

        self.event_log.lock().await.clear();
        self.broadcast(&protocol::plugin_status(true)).await;
        info!(conn_id = id, "Plugin connected");

        UpstreamConnection {
            id,
            rx,
            shutdown_rx,
        }
    }

    /// Tear down upstream connection `id` if it is still the current one.
    ///
    /// Fails every pending correlated request and broadcasts offline status.
    /// Returns `false` if `id` was already replaced or removed.
    pub async fn upstream_lost(&self, id: u64, reason: &str) -> bool {
        let handle = {
            let mut upstream = self.upstream.write().await;
            match upstream.as_ref() {
                Some(current) if current.id == id => upstream.take(),
                _ => None,
            }
        };
        let Some(handle) = handle else {
            return false;
        };
        let _ = handle.shutdown_tx.send(true);

        let failed = self.fail_pending();
        self.broadcast(&protocol::plugin_status(false)).await;
        info!(conn_id = id, reason, failed, "Plugin disconnected");
        true
    }

    pub async fn is_upstream_connected(&self) -> bool {
        self.upstream.read().await.is_some()
    }

    /// Queue `message` for the plugin. A closed writer counts as a disconnect.
    pub async fn send_upstream(&self, message: String) -> Result<(), RelayError> {
        let (id, tx) = {
            let upstream = self.upstream.read().await;
            let handle = upstream.as_ref().ok_or(RelayError::PluginOffline)?;
            (handle.id, handle.tx.clone())
        };
        if tx.send(message).await.is_err() {
            self.upstream_lost(id, "write failed").await;
            return Err(RelayError::PluginOffline);
        }
        Ok(())
    }

    fn fail_pending(&self) -> usize {
        self.file_requests.fail_all(|| RelayError::PluginOffline)
            + self.permission_requests.fail_all(|| RelayError::PluginOffline)
            + self.admin_requests.fail_all(|| RelayError::PluginOffline)
    }

    /// Process shutdown: stop every connection task and fail pending requests.
    /// Clients are not sent an offline status; their sockets just close.
    pub async fn drain_all(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.upstream.write().await.take() {
            let _ = handle.shutdown_tx.send(true);
        }
        let failed = self.fail_pending();
        self.clients.write().await.clear();
        info!(failed, "Relay drained");
    }

    // ── Downstream registry ─────────────────────────────────────────

    pub async fn register_client(&self) -> ClientConnection {
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.client_queue);
        self.clients.write().await.insert(id, tx.clone());
        debug!(conn_id = id, "Client registered");
        ClientConnection { id, tx, rx }
    }

    pub async fn unregister_client(&self, id: u64) {
        if self.clients.write().await.remove(&id).is_some() {
            debug!(conn_id = id, "Client unregistered");
        }
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Queue `message` on every client without waiting. A full queue drops
    /// the message for that client only; a closed one is unregistered.
    pub async fn broadcast(&self, message: &str) {
        let mut closed = Vec::new();
        {
            let clients = self.clients.read().await;
            for (id, tx) in clients.iter() {
                match tx.try_send(message.to_string()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        let total = self.dropped_messages.fetch_add(1, Ordering::Relaxed) + 1;
                        warn!(conn_id = id, dropped_total = total, "Client queue full, dropping message");
                    }
                    Err(TrySendError::Closed(_)) => closed.push(*id),
                }
            }
        }
        if !closed.is_empty() {
            let mut clients = self.clients.write().await;
            for id in closed {
                clients.remove(&id);
                debug!(conn_id = id, "Removed closed client");
            }
        }
    }

    // ── Upstream dispatch ───────────────────────────────────────────

    /// Route one plugin message. Returns whether the raw message should also
    /// be broadcast to every client.
    pub async fn dispatch_upstream(&self, raw: &str) -> bool {
        let envelope = match Envelope::parse(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "Dropping unparseable plugin message");
                return false;
            }
        };

        match envelope.event.as_str() {
            "server_stats" => {
                let Some(stats) = decode::<ServerStats>(&envelope) else {
                    return false;
                };
                self.snapshot.update_stats(stats).await;
                true
            }
            "world_stats" => {
                let Some(worlds) = decode::<Vec<Value>>(&envelope) else {
                    return false;
                };
                self.snapshot.update_worlds(worlds).await;
                true
            }
            "server_env" => {
                self.snapshot.update_env(envelope.payload).await;
                true
            }
            "console_log" => {
                self.event_log.lock().await.append(raw.to_string());
                true
            }
            "plugin_paths" => {
                if let Some(paths) = decode::<PluginPaths>(&envelope) {
                    // Disk I/O stays off the read loop.
                    let credentials = self.credentials.clone();
                    tokio::spawn(async move {
                        if let Err(e) = credentials.relocate(&paths.plugin_data_dir).await {
                            warn!(error = %e, "Refusing to relocate auth state");
                        }
                    });
                }
                false
            }
            "file_manager_response" => {
                if let Some(response) = decode::<FileManagerResponse>(&envelope) {
                    let id = response.request_id.clone();
                    self.file_requests.resolve(&id, response);
                }
                false
            }
            "auth_token_issued" => {
                if let Some(issued) = decode::<AuthTokenIssued>(&envelope) {
                    self.credentials
                        .issue_token(
                            &issued.token,
                            &issued.player_uuid,
                            &issued.player_name,
                            issued.expires_at_unix,
                            issued.permissions,
                        )
                        .await;
                }
                false
            }
            "player_permissions_response" => {
                if let Some(response) = decode::<PlayerPermissionsResponse>(&envelope) {
                    let id = response.request_id.clone();
                    self.permission_requests.resolve(&id, response);
                }
                false
            }
            "permission_admin_response" => {
                if let Some(response) = decode::<PermissionAdminResponse>(&envelope) {
                    let id = response.request_id.clone();
                    self.admin_requests.resolve(&id, response);
                }
                false
            }
            _ => true,
        }
    }

    // ── Downstream dispatch ─────────────────────────────────────────

    /// Handle one client message sent on a session authenticated with
    /// `session_token`. Returns the reply for that client, if any.
    pub async fn dispatch_client(&self, session_token: &str, raw: &str) -> Option<String> {
        let event = match Envelope::parse(raw) {
            Ok(envelope) => envelope.event,
            Err(e) => {
                debug!(error = %e, "Dropping unparseable client message");
                return None;
            }
        };

        if event == "plugin_status_request" {
            return Some(protocol::plugin_status(self.is_upstream_connected().await));
        }

        let Ok(claims) = self.credentials.decode_session(session_token).await else {
            return Some(protocol::permission_denied("unauthorized"));
        };

        // A known event with the wrong field shapes is denied, not dropped.
        let action = match ClientAction::parse(raw) {
            Ok(action) => action,
            Err(e) => {
                info!(player_uuid = %claims.sub, event = %event, error = %e, "Malformed client action denied");
                return Some(protocol::permission_denied(authorize::denial_reason(&event)));
            }
        };

        if !self.authorize(&claims.sub, &action).await {
            info!(player_uuid = %claims.sub, event = %action.event, "Client action denied");
            return Some(protocol::permission_denied(authorize::denial_reason(
                &action.event,
            )));
        }

        if action.event == "clear_logs" {
            self.event_log.lock().await.clear();
            self.broadcast(&protocol::clear_logs()).await;
            return None;
        }

        if action.event == "console_command" {
            info!(
                player = %claims.name,
                player_uuid = %claims.sub,
                command = %action.command.trim(),
                "Console command"
            );
        }

        match self.send_upstream(raw.to_string()).await {
            Ok(()) => None,
            Err(_) => Some(protocol::command_rejected("plugin_offline")),
        }
    }

    async fn authorize(&self, player_uuid: &str, action: &ClientAction) -> bool {
        if authorize::required_permission(action).is_none() {
            return false;
        }
        match self.resolve_permissions(player_uuid).await {
            Ok(set) => authorize::is_authorized(action, &set.permissions),
            Err(e) => {
                warn!(player_uuid, error = %e, "Permission lookup failed");
                false
            }
        }
    }

    /// Permissions of `player_uuid`, with an unreachable plugin and no cache
    /// meaning "no permissions" rather than an error.
    pub async fn resolve_permissions(&self, player_uuid: &str) -> Result<PermissionSet, RelayError> {
        match self.permissions.get_permissions(self, player_uuid).await {
            Err(RelayError::PluginOffline) => Ok(PermissionSet::default()),
            other => other,
        }
    }

    // ── Correlated requests ─────────────────────────────────────────

    async fn send_correlated<R: Send>(
        &self,
        table: &PendingRequests<R>,
        event: &str,
        payload: Value,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<R, RelayError> {
        if !self.is_upstream_connected().await {
            return Err(RelayError::PluginOffline);
        }
        let registration = table.register();
        let message = protocol::correlated_request(event, registration.request_id(), payload);
        debug!(kind = table.kind(), request_id = %registration.request_id(), "Correlated request");
        self.send_upstream(message).await?;
        registration.wait(timeout, cancel).await
    }

    /// Ask the plugin's file manager to perform `action` on `path`. Returns
    /// the response's `data` on success.
    pub async fn request_file_operation(
        &self,
        action: &str,
        path: &str,
        content: Option<&str>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value, RelayError> {
        let mut payload = json!({"action": action, "path": path});
        if let Some(content) = content {
            payload["content"] = json!(content);
        }
        let response = self
            .send_correlated(
                &self.file_requests,
                protocol::EVENT_FILE_REQUEST,
                payload,
                self.timeouts.file,
                cancel,
            )
            .await?;
        // The plugin answers `ok = false` without a reason when its file
        // manager is not ready.
        if !response.ok {
            if response.error.trim().is_empty() {
                return Err(RelayError::PluginOffline);
            }
            return Err(RelayError::UpstreamRejected(response.error));
        }
        Ok(response.data)
    }

    pub async fn request_player_permissions(
        &self,
        player_uuid: &str,
    ) -> Result<PermissionSet, RelayError> {
        let response = self
            .send_correlated(
                &self.permission_requests,
                protocol::EVENT_PERMISSIONS_REQUEST,
                json!({"player_uuid": player_uuid}),
                self.timeouts.permission,
                None,
            )
            .await?;
        Ok(PermissionSet {
            permissions: response.permissions,
            online: response.online,
        })
    }

    /// Which of `nodes` the player holds, per the plugin's permission backend.
    pub async fn request_permission_snapshot(
        &self,
        player_uuid: &str,
        player_name: &str,
        nodes: &[&str],
    ) -> Result<BTreeMap<String, bool>, RelayError> {
        let response = self
            .send_correlated(
                &self.admin_requests,
                protocol::EVENT_PERMISSION_ADMIN_REQUEST,
                json!({
                    "action": "snapshot",
                    "player_uuid": player_uuid,
                    "player_name": player_name,
                    "permission_nodes": nodes,
                }),
                self.timeouts.admin,
                None,
            )
            .await?;
        if !response.ok {
            return Err(RelayError::UpstreamRejected(non_empty_or(
                response.error,
                "permission snapshot failed",
            )));
        }
        Ok(response.permissions)
    }

    /// Grant or revoke `node`. On success the cached permissions of the
    /// player are invalidated.
    pub async fn request_permission_set(
        &self,
        player_uuid: &str,
        player_name: &str,
        node: &str,
        enabled: bool,
    ) -> Result<(), RelayError> {
        let response = self
            .send_correlated(
                &self.admin_requests,
                protocol::EVENT_PERMISSION_ADMIN_REQUEST,
                json!({
                    "action": "set",
                    "player_uuid": player_uuid,
                    "player_name": player_name,
                    "permission_node": node,
                    "enabled": enabled,
                }),
                self.timeouts.admin,
                None,
            )
            .await?;
        if !response.ok {
            return Err(RelayError::UpstreamRejected(non_empty_or(
                response.error,
                "permission update failed",
            )));
        }
        self.permissions.invalidate(player_uuid).await;
        info!(player_uuid, node, enabled, "Permission updated");
        Ok(())
    }

    // ── Late-join replay ────────────────────────────────────────────

    /// Console history for a newly connected client: the plugin's
    /// `latest.log` if it can be read, else the buffered event log.
    pub async fn late_join_replay(&self) -> Vec<String> {
        match self.read_latest_log().await {
            Ok(lines) => lines,
            Err(e) => {
                debug!(error = %e, "latest.log unavailable, replaying buffered log");
                self.event_log.lock().await.snapshot()
            }
        }
    }

    async fn read_latest_log(&self) -> Result<Vec<String>, RelayError> {
        let data = self
            .request_file_operation("read_text", LATEST_LOG_PATH, None, Some(&self.shutdown))
            .await?;
        if !data.is_object() {
            return Err(RelayError::BadRequest("read_text returned no object".into()));
        }
        let content = data
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default();
        Ok(content
            .lines()
            .filter(|line| !line.is_empty())
            .map(|line| protocol::console_log(line, protocol::detect_log_level(line)))
            .collect())
    }
}

impl PermissionSource for RelayState {
    async fn fetch_permissions(&self, player_uuid: &str) -> Result<PermissionSet, RelayError> {
        self.request_player_permissions(player_uuid).await
    }
}

/// Decode a known event's payload, logging a shape mismatch.
fn decode<T: DeserializeOwned>(envelope: &Envelope) -> Option<T> {
    match envelope.payload_as::<T>() {
        Ok(payload) => Some(payload),
        Err(e) => {
            warn!(event = %envelope.event, error = %e, "Dropping malformed plugin payload");
            None
        }
    }
}

fn non_empty_or(message: String, fallback: &str) -> String {
    if message.trim().is_empty() {
        fallback.to_string()
    } else {
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::{CONSOLE_USE, SERVER_STOP};
    use crate::util::now_unix;

    fn relay() -> RelayState {
        RelayState::new(&Config::default())
    }

    fn relay_with(edit: impl FnOnce(&mut Config)) -> RelayState {
        let mut config = Config::default();
        edit(&mut config);
        RelayState::new(&config)
    }

    /// Issue and redeem a token, returning a signed session token.
    async fn login(relay: &RelayState, permissions: &[&str]) -> String {
        relay
            .credentials
            .issue_token(
                "secret",
                "uuid-1",
                "Steve",
                now_unix() + 300,
                permissions.iter().map(ToString::to_string).collect(),
            )
            .await;
        let claims = relay.credentials.redeem_token("secret").await.unwrap();
        relay.credentials.encode_session(&claims).await.unwrap()
    }

    fn event_of(raw: &str) -> String {
        let v: Value = serde_json::from_str(raw).unwrap();
        v["event"].as_str().unwrap_or_default().to_string()
    }

    #[tokio::test]
    async fn connect_clears_log_and_announces_online() {
        let relay = relay();
        relay.event_log.lock().await.append("stale".into());
        let mut client = relay.register_client().await;

        let _upstream = relay.connect_upstream().await;
        assert!(relay.event_log.lock().await.is_empty());
        assert_eq!(client.rx.recv().await.unwrap(), protocol::plugin_status(true));
        assert!(relay.is_upstream_connected().await);
    }

    #[tokio::test]
    async fn reconnect_replaces_previous_upstream() {
        let relay = relay();
        let first = relay.connect_upstream().await;
        let mut first_shutdown = first.shutdown_rx.clone();
        let second = relay.connect_upstream().await;

        first_shutdown.changed().await.unwrap();
        assert!(*first_shutdown.borrow());
        // The replaced connection going away must not touch the new one.
        assert!(!relay.upstream_lost(first.id, "closed").await);
        assert!(relay.is_upstream_connected().await);
        assert!(relay.upstream_lost(second.id, "closed").await);
        assert!(!relay.is_upstream_connected().await);
    }

    #[tokio::test]
    async fn upstream_events_route_and_report_fanout() {
        let relay = relay();
        assert!(relay
            .dispatch_upstream(r#"{"event":"console_log","payload":{"message":"hi"}}"#)
            .await);
        assert_eq!(relay.event_log.lock().await.len(), 1);

        assert!(relay
            .dispatch_upstream(r#"{"event":"server_stats","payload":{"players":4,"tps":"20"}}"#)
            .await);
        assert_eq!(relay.snapshot.stats().await.players, 4);

        assert!(relay.dispatch_upstream(r#"{"event":"custom_event","payload":{}}"#).await);
        assert!(!relay
            .dispatch_upstream(r#"{"event":"file_manager_response","payload":{"request_id":"x","ok":true}}"#)
            .await);
        assert!(!relay.dispatch_upstream("not json").await);
        assert!(!relay
            .dispatch_upstream(r#"{"event":"server_stats","payload":{"players":"lots"}}"#)
            .await);
    }

    #[tokio::test]
    async fn issued_token_can_be_redeemed() {
        let relay = relay();
        let raw = json!({
            "event": "auth_token_issued",
            "payload": {
                "token": "magic",
                "player_uuid": "uuid-9",
                "player_name": "Alex",
                "expires_at_unix": now_unix() + 60,
                "permissions": ["beacon.access.console"],
            }
        })
        .to_string();
        assert!(!relay.dispatch_upstream(&raw).await);
        let claims = relay.credentials.redeem_token("magic").await.unwrap();
        assert_eq!(claims.sub, "uuid-9");
    }

    #[tokio::test]
    async fn file_operation_resolves_from_response() {
        let relay = relay();
        let mut upstream = relay.connect_upstream().await;

        let requester = relay.clone();
        let pending = tokio::spawn(async move {
            requester
                .request_file_operation("list", "plugins", None, None)
                .await
        });

        let sent: Value = serde_json::from_str(&upstream.rx.recv().await.unwrap()).unwrap();
        assert_eq!(sent["event"], "file_manager_request");
        assert_eq!(sent["payload"]["path"], "plugins");
        let request_id = sent["payload"]["request_id"].as_str().unwrap().to_string();

        let response = json!({
            "event": "file_manager_response",
            "payload": {"request_id": request_id, "ok": true, "data": {"entries": []}}
        });
        relay.dispatch_upstream(&response.to_string()).await;

        let data = pending.await.unwrap().unwrap();
        assert_eq!(data, json!({"entries": []}));
        assert!(relay.file_requests.is_empty());
    }

    #[tokio::test]
    async fn rejected_file_operation_surfaces_error() {
        let relay = relay();
        let mut upstream = relay.connect_upstream().await;
        let requester = relay.clone();
        let pending = tokio::spawn(async move {
            requester
                .request_file_operation("delete", "world", None, None)
                .await
        });
        let sent: Value = serde_json::from_str(&upstream.rx.recv().await.unwrap()).unwrap();
        let response = json!({
            "event": "file_manager_response",
            "payload": {"request_id": sent["payload"]["request_id"], "ok": false, "error": "protected"}
        });
        relay.dispatch_upstream(&response.to_string()).await;
        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, RelayError::UpstreamRejected(msg) if msg == "protected"));
    }

    #[tokio::test]
    async fn timed_out_request_ignores_late_response() {
        let relay = relay_with(|c| c.relay.file_timeout_secs = 0);
        let mut upstream = relay.connect_upstream().await;

        let err = relay
            .request_file_operation("meta", "x", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Timeout));

        let sent: Value = serde_json::from_str(&upstream.rx.recv().await.unwrap()).unwrap();
        let late = json!({
            "event": "file_manager_response",
            "payload": {"request_id": sent["payload"]["request_id"], "ok": true}
        });
        assert!(!relay.dispatch_upstream(&late.to_string()).await);
        assert!(relay.file_requests.is_empty());
    }

    #[tokio::test]
    async fn disconnect_fails_every_pending_table() {
        let relay = relay();
        let upstream = relay.connect_upstream().await;
        let mut client = relay.register_client().await;

        let a = relay.clone();
        let b = relay.clone();
        let c = relay.clone();
        let file = tokio::spawn(async move { a.request_file_operation("list", "/", None, None).await });
        let perms = tokio::spawn(async move { b.request_player_permissions("u").await });
        let admin = tokio::spawn(async move { c.request_permission_set("u", "n", "x", true).await });

        while relay.file_requests.is_empty()
            || relay.permission_requests.is_empty()
            || relay.admin_requests.is_empty()
        {
            tokio::task::yield_now().await;
        }

        assert!(relay.upstream_lost(upstream.id, "read error").await);
        assert!(matches!(file.await.unwrap(), Err(RelayError::PluginOffline)));
        assert!(matches!(perms.await.unwrap(), Err(RelayError::PluginOffline)));
        assert!(matches!(admin.await.unwrap(), Err(RelayError::PluginOffline)));

        let mut last = String::new();
        while let Ok(msg) = client.rx.try_recv() {
            last = msg;
        }
        assert_eq!(last, protocol::plugin_status(false));
    }

    #[tokio::test]
    async fn offline_requests_fail_fast() {
        let relay = relay();
        let err = relay.request_player_permissions("u").await.unwrap_err();
        assert!(matches!(err, RelayError::PluginOffline));
        assert!(relay.permission_requests.is_empty());
    }

    #[tokio::test]
    async fn stop_without_permission_is_denied_and_not_forwarded() {
        let relay = relay();
        let mut upstream = relay.connect_upstream().await;
        let session = login(&relay, &[CONSOLE_USE]).await;

        let reply = relay
            .dispatch_client(&session, r#"{"event":"console_command","command":"stop"}"#)
            .await
            .unwrap();
        assert_eq!(reply, protocol::permission_denied("forbidden"));
        assert!(upstream.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn permitted_command_is_forwarded_verbatim() {
        let relay = relay();
        let mut upstream = relay.connect_upstream().await;
        let session = login(&relay, &[SERVER_STOP]).await;
        let raw = r#"{"event":"console_command","command":"stop"}"#;

        assert!(relay.dispatch_client(&session, raw).await.is_none());
        assert_eq!(upstream.rx.recv().await.unwrap(), raw);
    }

    #[tokio::test]
    async fn forwarding_while_offline_is_rejected() {
        let relay = relay();
        let session = login(&relay, &[CONSOLE_USE]).await;
        let reply = relay
            .dispatch_client(&session, r#"{"event":"console_command","command":"list"}"#)
            .await
            .unwrap();
        assert_eq!(reply, protocol::command_rejected("plugin_offline"));
    }

    #[tokio::test]
    async fn revoked_session_is_refused() {
        let relay = relay();
        let session = login(&relay, &[CONSOLE_USE]).await;
        let claims = relay.credentials.decode_session(&session).await.unwrap();
        relay.credentials.revoke_session(&claims.jti).await;

        let reply = relay
            .dispatch_client(&session, r#"{"event":"console_tab_complete"}"#)
            .await
            .unwrap();
        assert_eq!(reply, protocol::permission_denied("unauthorized"));
    }

    #[tokio::test]
    async fn clear_logs_is_local_and_broadcast() {
        let relay = relay();
        let mut upstream = relay.connect_upstream().await;
        let session = login(&relay, &[CONSOLE_USE]).await;
        relay.event_log.lock().await.append("line".into());
        let mut client = relay.register_client().await;

        assert!(relay
            .dispatch_client(&session, r#"{"event":"clear_logs"}"#)
            .await
            .is_none());
        assert!(relay.event_log.lock().await.is_empty());
        assert_eq!(event_of(&client.rx.recv().await.unwrap()), "clear_logs");
        assert!(upstream.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn clear_logs_denial_has_own_reason() {
        let relay = relay();
        let session = login(&relay, &["beacon.access.console.view"]).await;
        let reply = relay
            .dispatch_client(&session, r#"{"event":"clear_logs"}"#)
            .await
            .unwrap();
        assert_eq!(reply, protocol::permission_denied("clear_logs"));
    }

    #[tokio::test]
    async fn malformed_action_is_denied_not_dropped() {
        let relay = relay();
        let mut upstream = relay.connect_upstream().await;
        let session = login(&relay, &[CONSOLE_USE]).await;

        let reply = relay
            .dispatch_client(&session, r#"{"event":"console_command","command":42}"#)
            .await
            .unwrap();
        assert_eq!(reply, protocol::permission_denied("forbidden"));

        let reply = relay
            .dispatch_client(&session, r#"{"event":"clear_logs","command":1}"#)
            .await
            .unwrap();
        assert_eq!(reply, protocol::permission_denied("clear_logs"));
        assert!(upstream.rx.try_recv().is_err());

        assert!(relay.dispatch_client(&session, "not json").await.is_none());
    }

    #[tokio::test]
    async fn failed_write_tears_down_upstream() {
        let relay = relay();
        let mut upstream = relay.connect_upstream().await;
        let mut client = relay.register_client().await;
        let session = login(&relay, &[CONSOLE_USE]).await;

        let a = relay.clone();
        let file = tokio::spawn(async move { a.request_file_operation("list", "/", None, None).await });
        assert_eq!(event_of(&upstream.rx.recv().await.unwrap()), "file_manager_request");
        assert!(!relay.file_requests.is_empty());

        // The writer task is gone; the next send finds the queue closed.
        drop(upstream.rx);
        let reply = relay
            .dispatch_client(&session, r#"{"event":"console_command","command":"list"}"#)
            .await
            .unwrap();
        assert_eq!(reply, protocol::command_rejected("plugin_offline"));

        assert!(matches!(file.await.unwrap(), Err(RelayError::PluginOffline)));
        assert!(!relay.is_upstream_connected().await);
        assert!(relay.file_requests.is_empty());
        assert!(matches!(
            relay.request_player_permissions("u").await,
            Err(RelayError::PluginOffline)
        ));

        let mut last = String::new();
        while let Ok(msg) = client.rx.try_recv() {
            last = msg;
        }
        assert_eq!(last, protocol::plugin_status(false));
    }

    #[tokio::test]
    async fn status_request_needs_no_session() {
        let relay = relay();
        let reply = relay
            .dispatch_client("garbage", r#"{"event":"plugin_status_request"}"#)
            .await
            .unwrap();
        assert_eq!(reply, protocol::plugin_status(false));
    }

    #[tokio::test]
    async fn full_client_queue_drops_only_for_that_client() {
        let relay = relay_with(|c| c.relay.client_queue = 1);
        let mut slow = relay.register_client().await;
        let mut fast = relay.register_client().await;

        relay.broadcast("one").await;
        assert_eq!(fast.rx.recv().await.unwrap(), "one");
        relay.broadcast("two").await;

        assert_eq!(fast.rx.recv().await.unwrap(), "two");
        assert_eq!(slow.rx.recv().await.unwrap(), "one");
        assert!(slow.rx.try_recv().is_err());
        assert_eq!(relay.dropped_messages.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn closed_client_is_unregistered_on_broadcast() {
        let relay = relay();
        let client = relay.register_client().await;
        let ClientConnection { tx, rx, .. } = client;
        drop(tx);
        drop(rx);
        relay.broadcast("x").await;
        assert_eq!(relay.client_count().await, 0);
    }

    #[tokio::test]
    async fn permission_set_invalidates_cache() {
        let relay = relay();
        let mut upstream = relay.connect_upstream().await;
        relay
            .permissions
            .seed("uuid-1", &[CONSOLE_USE.to_string()], true)
            .await;

        let requester = relay.clone();
        let pending = tokio::spawn(async move {
            requester
                .request_permission_set("uuid-1", "Steve", SERVER_STOP, true)
                .await
        });
        let sent: Value = serde_json::from_str(&upstream.rx.recv().await.unwrap()).unwrap();
        assert_eq!(sent["payload"]["action"], "set");
        let response = json!({
            "event": "permission_admin_response",
            "payload": {"request_id": sent["payload"]["request_id"], "action": "set", "ok": true}
        });
        relay.dispatch_upstream(&response.to_string()).await;
        pending.await.unwrap().unwrap();
        assert!(relay.permissions.cached("uuid-1").await.is_none());
    }

    #[tokio::test]
    async fn replay_falls_back_to_buffer_when_offline() {
        let relay = relay();
        relay.event_log.lock().await.append("buffered".into());
        assert_eq!(relay.late_join_replay().await, vec!["buffered"]);
    }

    #[tokio::test]
    async fn replay_reads_latest_log_when_available() {
        let relay = relay();
        let mut upstream = relay.connect_upstream().await;
        let requester = relay.clone();
        let pending = tokio::spawn(async move { requester.late_join_replay().await });

        let sent: Value = serde_json::from_str(&upstream.rx.recv().await.unwrap()).unwrap();
        assert_eq!(sent["payload"]["action"], "read_text");
        assert_eq!(sent["payload"]["path"], LATEST_LOG_PATH);
        let response = json!({
            "event": "file_manager_response",
            "payload": {
                "request_id": sent["payload"]["request_id"],
                "ok": true,
                "data": {"content": "[10:00:00] [Server thread/INFO]: a\r\n\r\n[10:00:01] [Server thread/WARN]: b\n"}
            }
        });
        relay.dispatch_upstream(&response.to_string()).await;

        let lines = pending.await.unwrap();
        assert_eq!(lines.len(), 2);
        let second: Value = serde_json::from_str(&lines[1]).unwrap();
        assert_eq!(second["payload"]["level"], "WARN");
    }

    #[test]
    fn agent_key_is_optional() {
        let open = relay();
        assert!(open.agent_key_matches(None));
        let locked = relay_with(|c| c.auth.agent_key = Some("k".into()));
        assert!(!locked.agent_key_matches(None));
        assert!(!locked.agent_key_matches(Some("x")));
        assert!(locked.agent_key_matches(Some("k")));
    }
}
