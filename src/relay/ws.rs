//! WebSocket endpoints: `/ws` for the plugin, `/ws/web` for browsers.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::auth::AuthSession;
use crate::state::AppState;

use super::{protocol, ClientConnection, RelayState, UpstreamConnection};

#[derive(Debug, Deserialize)]
pub struct AgentQuery {
    token: Option<String>,
}

/// `GET /ws` — the plugin's connection. Rejected with 403 when an agent key
/// is configured and `?token=` does not match.
pub async fn upstream_ws(
    State(state): State<AppState>,
    Query(query): Query<AgentQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    if !state.relay.agent_key_matches(query.token.as_deref()) {
        warn!("Plugin connection rejected: invalid agent key");
        return (StatusCode::FORBIDDEN, "Invalid agent key").into_response();
    }

    let relay = state.relay.clone();
    ws.on_upgrade(move |socket| async move {
        let conn = relay.connect_upstream().await;
        let span = info_span!("upstream", conn_id = conn.id);
        handle_upstream(socket, relay, conn).instrument(span).await;
    })
}

async fn handle_upstream(socket: WebSocket, relay: RelayState, conn: UpstreamConnection) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let UpstreamConnection {
        id,
        mut rx,
        mut shutdown_rx,
    } = conn;

    // Writer: a failed write tears the connection down like a read error.
    let writer_relay = relay.clone();
    let send_task = tokio::spawn(
        async move {
            while let Some(text) = rx.recv().await {
                if ws_sink.send(Message::Text(text.into())).await.is_err() {
                    writer_relay.upstream_lost(id, "write failed").await;
                    break;
                }
            }
            let _ = ws_sink.close().await;
        }
        .in_current_span(),
    );

    loop {
        let msg = tokio::select! {
            msg = ws_stream.next() => match msg {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => {
                    debug!(error = %e, "Plugin read error");
                    break;
                }
                None => break,
            },
            _ = shutdown_rx.changed() => {
                info!("Plugin handler shutting down");
                break;
            }
            () = relay.shutdown.cancelled() => break,
        };

        match msg {
            Message::Text(text) => {
                if relay.dispatch_upstream(text.as_str()).await {
                    relay.broadcast(text.as_str()).await;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    relay.upstream_lost(id, "connection closed").await;
    send_task.abort();
}

/// `GET /ws/web` — a browser connection, authenticated by session cookie.
pub async fn client_ws(
    State(state): State<AppState>,
    session: AuthSession,
    ws: WebSocketUpgrade,
) -> Response {
    let relay = state.relay.clone();
    ws.on_upgrade(move |socket| {
        let span = info_span!("client", player = %session.claims.name);
        handle_client(socket, relay, session.token).instrument(span)
    })
}

async fn handle_client(socket: WebSocket, relay: RelayState, session_token: String) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let ClientConnection { id, tx, mut rx } = relay.register_client().await;
    info!(conn_id = id, "Client connected");

    // Status goes out before the replay is fetched, which may wait on the
    // plugin. Broadcasts arriving meanwhile queue in `rx`.
    let status = protocol::plugin_status(relay.is_upstream_connected().await);
    if ws_sink.send(Message::Text(status.into())).await.is_err() {
        relay.unregister_client(id).await;
        return;
    }
    for text in relay.late_join_replay().await {
        if ws_sink.send(Message::Text(text.into())).await.is_err() {
            relay.unregister_client(id).await;
            return;
        }
    }

    let send_task = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if ws_sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    loop {
        let msg = tokio::select! {
            msg = ws_stream.next() => match msg {
                Some(Ok(msg)) => msg,
                _ => break,
            },
            () = relay.shutdown.cancelled() => break,
        };

        match msg {
            Message::Text(text) => {
                if let Some(reply) = relay.dispatch_client(&session_token, text.as_str()).await {
                    if tx.send(reply).await.is_err() {
                        break;
                    }
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    relay.unregister_client(id).await;
    info!(conn_id = id, "Client disconnected");
    send_task.abort();
}
