#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! beacon-relay library: the relay between one game-server plugin and the
//! browser dashboards watching it.
//!
//! The plugin connects to `/ws`; browsers authenticate with a session cookie
//! and connect to `/ws/web`. Plugin events fan out to every browser, browser
//! actions are permission-checked and forwarded to the plugin, and a small
//! request/response layer carries file and permission operations over the
//! same socket.
//!
//! - `relay` — connection registry, event routing, correlated requests
//! - `credentials` — one-time tokens, signed sessions, durable state
//! - `permissions` — node table, pack implications, cached resolver
//! - `event_log` — bounded console history for late joiners
//! - `snapshot` — last server stats, worlds and environment
//! - `auth` — session cookie extractor, agent key comparison
//! - `routes` — REST API route handlers
//! - `config` — configuration loading

pub mod auth;
pub mod config;
pub mod credentials;
pub mod error;
pub mod event_log;
pub mod permissions;
pub mod relay;
pub mod routes;
pub mod snapshot;
pub mod state;
pub mod util;

use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::trace::TraceLayer;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use error::RelayError;
pub use relay::RelayState;
pub use state::AppState;

/// Build the full HTTP + WebSocket router.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/api/health", get(routes::health::health))
        .route("/api/auth/magic-link", post(routes::auth::magic_link));

    let session_routes = Router::new()
        .route("/api/auth/logout", post(routes::auth::logout))
        .route("/api/session", get(routes::auth::session))
        .route("/api/files/meta", get(routes::files::meta))
        .route("/api/files/list", get(routes::files::list))
        .route(
            "/api/files/content",
            get(routes::files::read_content).put(routes::files::write_content),
        )
        .route("/api/files", delete(routes::files::delete))
        .route("/api/files/download", get(routes::files::download))
        .route("/api/access/data", get(routes::access::data))
        .route(
            "/api/access/sessions",
            delete(routes::access::revoke_session),
        )
        .route(
            "/api/access/permissions",
            post(routes::access::update_permission),
        );

    let ws_routes = Router::new()
        .route("/ws", get(relay::ws::upstream_ws))
        .route("/ws/web", get(relay::ws::client_ws));

    Router::new()
        .merge(public_routes)
        .merge(session_routes)
        .merge(ws_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
