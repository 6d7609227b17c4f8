//! # beacon-relay
//!
//! Relay between a game-server plugin and browser dashboards.
//!
//! ## Subcommands
//!
//! - `beacon-relay serve` (default) — run the HTTP/WS server
//!
//! ## API surface
//!
//! | Method | Path                       | Auth    | Description                         |
//! |--------|----------------------------|---------|-------------------------------------|
//! | GET    | `/api/health`              | No      | Liveness check                      |
//! | POST   | `/api/auth/magic-link`     | No      | Redeem a one-time token             |
//! | POST   | `/api/auth/logout`         | Cookie  | Revoke the current session          |
//! | GET    | `/api/session`             | Cookie  | Identity, permissions, grants       |
//! | GET    | `/api/files/{meta,list}`   | Cookie  | File metadata / directory listing   |
//! | GET    | `/api/files/content`       | Cookie  | Read a text file                    |
//! | PUT    | `/api/files/content`       | Cookie  | Write a text file                   |
//! | DELETE | `/api/files`               | Cookie  | Delete a file                       |
//! | GET    | `/api/files/download`      | Cookie  | Download a file                     |
//! | GET    | `/api/access/data`         | Cookie  | Users, sessions, permission nodes   |
//! | DELETE | `/api/access/sessions`     | Cookie  | Revoke a session                    |
//! | POST   | `/api/access/permissions`  | Cookie  | Grant or revoke a node              |
//! | GET    | `/ws`                      | Agent*  | Plugin connection                   |
//! | GET    | `/ws/web`                  | Cookie  | Browser connection                  |
//!
//! *Only when `auth.agent_key` is set, via `?token=<key>`.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use beacon_relay::{AppState, Config};

/// Relay between a game-server plugin and browser dashboards.
#[derive(Parser)]
#[command(name = "beacon-relay", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP/WS server (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Serve { config }) => run_server(config.as_deref()).await,
        None => {
            // No subcommand, but --config may still be passed
            let args: Vec<String> = std::env::args().collect();
            let config_path = args
                .windows(2)
                .find(|w| w[0] == "--config")
                .map(|w| w[1].clone());
            run_server(config_path.as_deref()).await;
        }
    }
}

async fn run_server(config_path: Option<&str>) {
    let config = Config::load(config_path);

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("beacon-relay v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);
    if config.auth.agent_key.is_none() {
        warn!("No agent key configured; any client may connect as the plugin");
    }

    let sweep_every = Duration::from_secs(config.auth.sweep_interval_secs.max(1));
    let state = AppState::new(config);
    let relay = state.relay.clone();
    relay.credentials.load_persisted().await;

    let persist_cancel = CancellationToken::new();
    let persister = Arc::clone(&relay.credentials).spawn_persister(persist_cancel.clone());

    // Periodic sweep: expired tokens and sessions (idle permission entries go with them)
    let sweep_relay = relay.clone();
    let sweep_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_every);
        loop {
            interval.tick().await;
            sweep_relay.credentials.sweep().await;
        }
    });

    let app = beacon_relay::router(state.clone());
    let listener = TcpListener::bind(&state.config.server.listen)
        .await
        .expect("Failed to bind");

    info!("Server ready");

    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
    };

    // WebSocket handlers exit on the relay's shutdown token.
    let drain_relay = relay.clone();
    let shutdown = async move {
        shutdown.await;
        drain_relay.drain_all().await;
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .expect("Server error");

    info!("Shutting down...");
    sweep_task.abort();

    persist_cancel.cancel();
    if let Err(e) = persister.await {
        warn!(error = %e, "Credential persister did not finish cleanly");
    }
    info!("Goodbye");
}
