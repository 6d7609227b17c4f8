//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `BEACON_LISTEN`, `BEACON_AUTH_STATE_PATH`,
//!    `BEACON_AGENT_KEY`
//! 2. **Config file** — path via `--config <path>`, or `beacon.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8080"
//!
//! [auth]
//! state_path = "plugins/Beacon/auth_state.json"   # omit to keep state in memory only
//! state_root = "."                                 # persistence never escapes this dir
//! cookie_name = "beacon_session"
//! session_ttl_secs = 86400
//! permission_ttl_secs = 10
//! permission_idle_secs = 30
//! sweep_interval_secs = 60
//! agent_key = "shared-secret"                      # optional plugin auth
//!
//! [relay]
//! permission_timeout_secs = 4
//! file_timeout_secs = 12
//! admin_timeout_secs = 5
//! client_queue = 256
//!
//! [log_buffer]
//! max_lines = 1000
//! max_bytes = 1048576
//! idle_reset_secs = 900
//!
//! [logging]
//! level = "info"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub log_buffer: LogBufferConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:8080`).
    #[serde(default = "default_listen")]
    pub listen: String,
}

/// Credential store and permission cache settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Durable state file (signing key, sessions, identities). `None` keeps
    /// everything in memory until the plugin reports its data directory.
    pub state_path: Option<String>,
    /// Directory the state file must live under (default `.`).
    #[serde(default = "default_state_root")]
    pub state_root: String,
    /// Name of the session cookie (default `beacon_session`).
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,
    /// Lifetime of a web session in seconds (default 24h).
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: u64,
    /// Age after which a cached permission set is refetched (default 10).
    #[serde(default = "default_permission_ttl")]
    pub permission_ttl_secs: u64,
    /// Age after which the sweep discards a cached permission set (default 30).
    #[serde(default = "default_permission_idle")]
    pub permission_idle_secs: u64,
    /// Interval of the expiry sweep (default 60).
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Shared secret the plugin presents as `?token=` on `/ws`. `None`
    /// accepts any plugin connection.
    pub agent_key: Option<String>,
}

/// Correlated request deadlines and per-client queue depth.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_permission_timeout")]
    pub permission_timeout_secs: u64,
    #[serde(default = "default_file_timeout")]
    pub file_timeout_secs: u64,
    #[serde(default = "default_admin_timeout")]
    pub admin_timeout_secs: u64,
    /// Outbound queue per browser connection (default 256). A full queue
    /// drops the message for that client only.
    #[serde(default = "default_client_queue")]
    pub client_queue: usize,
}

/// Retention policy of the console log replayed to late joiners.
#[derive(Debug, Clone, Deserialize)]
pub struct LogBufferConfig {
    #[serde(default = "default_max_lines")]
    pub max_lines: usize,
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,
    /// Gap between appends after which the buffer starts over (default 900).
    #[serde(default = "default_idle_reset")]
    pub idle_reset_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_state_root() -> String {
    ".".to_string()
}
fn default_cookie_name() -> String {
    "beacon_session".to_string()
}
fn default_session_ttl() -> u64 {
    24 * 60 * 60
}
fn default_permission_ttl() -> u64 {
    10
}
fn default_permission_idle() -> u64 {
    30
}
fn default_sweep_interval() -> u64 {
    60
}
fn default_permission_timeout() -> u64 {
    4
}
fn default_file_timeout() -> u64 {
    12
}
fn default_admin_timeout() -> u64 {
    5
}
fn default_client_queue() -> usize {
    256
}
fn default_max_lines() -> usize {
    1000
}
fn default_max_bytes() -> usize {
    1024 * 1024 // 1 MiB
}
fn default_idle_reset() -> u64 {
    900
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            state_path: None,
            state_root: default_state_root(),
            cookie_name: default_cookie_name(),
            session_ttl_secs: default_session_ttl(),
            permission_ttl_secs: default_permission_ttl(),
            permission_idle_secs: default_permission_idle(),
            sweep_interval_secs: default_sweep_interval(),
            agent_key: None,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            permission_timeout_secs: default_permission_timeout(),
            file_timeout_secs: default_file_timeout(),
            admin_timeout_secs: default_admin_timeout(),
            client_queue: default_client_queue(),
        }
    }
}

impl Default for LogBufferConfig {
    fn default() -> Self {
        Self {
            max_lines: default_max_lines(),
            max_bytes: default_max_bytes(),
            idle_reset_secs: default_idle_reset(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl AuthConfig {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }
    pub fn permission_ttl(&self) -> Duration {
        Duration::from_secs(self.permission_ttl_secs)
    }
    pub fn permission_idle(&self) -> Duration {
        Duration::from_secs(self.permission_idle_secs)
    }
}

impl RelayConfig {
    pub fn permission_timeout(&self) -> Duration {
        Duration::from_secs(self.permission_timeout_secs)
    }
    pub fn file_timeout(&self) -> Duration {
        Duration::from_secs(self.file_timeout_secs)
    }
    pub fn admin_timeout(&self) -> Duration {
        Duration::from_secs(self.admin_timeout_secs)
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise looks
    /// for `beacon.toml` in the current directory, falling back to compiled defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            Self::from_toml(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("beacon.toml").exists() {
            let content =
                std::fs::read_to_string("beacon.toml").expect("Failed to read beacon.toml");
            Self::from_toml(&content).expect("Failed to parse beacon.toml")
        } else {
            Config::default()
        };

        // Env var overrides
        if let Ok(listen) = std::env::var("BEACON_LISTEN") {
            config.server.listen = listen;
        }
        if let Ok(path) = std::env::var("BEACON_AUTH_STATE_PATH") {
            let path = path.trim();
            if !path.is_empty() {
                config.auth.state_path = Some(path.to_string());
            }
        }
        if let Ok(key) = std::env::var("BEACON_AGENT_KEY") {
            if !key.is_empty() {
                config.auth.agent_key = Some(key);
            }
        }

        config
    }

    /// Parse a TOML document, filling every omitted field with its default.
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}
