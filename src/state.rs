//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::relay::RelayState;

#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Connection registry, correlation tables, credentials and permissions.
    pub relay: RelayState,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let relay = RelayState::new(&config);
        Self {
            config: Arc::new(config),
            start_time: Instant::now(),
            relay,
        }
    }
}
