//! Unauthenticated health-check endpoint.

use std::sync::atomic::Ordering;

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::AppState;

/// `GET /api/health` — liveness check.
///
/// Returns status, uptime, version, whether the plugin is connected, the
/// number of browser connections and the player count last reported. No
/// authentication required, suitable for load-balancer health checks.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let relay = &state.relay;
    let stats = relay.snapshot.stats().await;

    Json(json!({
        "status": "ok",
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
        "plugin_online": relay.is_upstream_connected().await,
        "clients": relay.client_count().await,
        "dropped_messages": relay.dropped_messages.load(Ordering::Relaxed),
        "players": stats.players,
        "max_players": stats.max_players,
    }))
}
