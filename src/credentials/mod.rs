//! One-time tokens, web sessions and player identities.
//!
//! The upstream agent hands out one-time login secrets (see
//! [`CredentialStore::issue_token`]); a browser exchanges one for a signed
//! session token kept in a cookie. Sessions are also tracked server-side so
//! they can be revoked.
//!
//! Durable state (signing key, live sessions, identities) is written by a
//! single background task whenever a mutation raises the dirty signal, see
//! [`CredentialStore::spawn_persister`].

pub mod persist;
pub mod token;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AuthConfig;
use crate::error::RelayError;
use crate::permissions::PermissionResolver;
use crate::util::{expand_tilde, now_unix, random_id};

pub use persist::StateFile;
pub use token::SessionClaims;

/// File name used when the plugin reports its data directory.
pub const STATE_FILE_NAME: &str = "auth_state.json";

const SIGNING_KEY_BYTES: usize = 32;

/// A player known to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub player_uuid: String,
    pub player_name: String,
    pub created_at: i64,
    pub last_seen_at: i64,
}

/// Server-side record of a web session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub player_uuid: String,
    pub player_name: String,
    pub created_at: i64,
    pub last_seen_at: i64,
    pub expires_at: i64,
    #[serde(default)]
    pub revoked: bool,
}

impl Session {
    fn is_live(&self, now: i64) -> bool {
        !self.revoked && self.expires_at > now
    }
}

struct OneTimeToken {
    player_uuid: String,
    player_name: String,
    expires_at: i64,
    permissions: Vec<String>,
}

/// Tokens, sessions and identities, each behind its own lock.
pub struct CredentialStore {
    signing_key: RwLock<Vec<u8>>,
    tokens: Mutex<HashMap<String, OneTimeToken>>,
    sessions: RwLock<HashMap<String, Session>>,
    identities: RwLock<HashMap<String, Identity>>,
    /// Also serializes writers of the state file.
    state_path: Mutex<Option<PathBuf>>,
    state_root: PathBuf,
    session_ttl: Duration,
    permissions: Arc<PermissionResolver>,
    dirty: Notify,
}

impl CredentialStore {
    /// Fresh store with a random signing key. Call
    /// [`load_persisted`](Self::load_persisted) to pick up durable state.
    pub fn new(config: &AuthConfig, permissions: Arc<PermissionResolver>) -> Self {
        let state_root = PathBuf::from(expand_tilde(&config.state_root).into_owned());
        let state_path = config.state_path.as_deref().and_then(|p| {
            let expanded = expand_tilde(p);
            let confined = persist::confine(&state_root, Path::new(&*expanded));
            if confined.is_none() {
                warn!(path = %p, root = %state_root.display(), "Auth state path is outside the state root, keeping state in memory");
            }
            confined
        });

        Self {
            signing_key: RwLock::new(random_signing_key()),
            tokens: Mutex::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            identities: RwLock::new(HashMap::new()),
            state_path: Mutex::new(state_path),
            state_root,
            session_ttl: config.session_ttl(),
            permissions,
            dirty: Notify::new(),
        }
    }

    /// Load the configured state file, if any. A missing file is normal; an
    /// unreadable one is logged and ignored.
    pub async fn load_persisted(&self) {
        let Some(path) = self.state_path.lock().await.clone() else {
            return;
        };
        match read_state(path.clone()).await {
            Ok(Some(state)) => {
                self.apply(state).await;
                info!(path = %path.display(), "Loaded auth state");
            }
            Ok(None) => debug!(path = %path.display(), "No auth state file yet"),
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to load auth state, starting empty"),
        }
    }

    pub async fn state_path(&self) -> Option<PathBuf> {
        self.state_path.lock().await.clone()
    }

    // ── One-time tokens ─────────────────────────────────────────────

    /// Register a one-time login secret. Only its hash is kept.
    pub async fn issue_token(
        &self,
        secret: &str,
        player_uuid: &str,
        player_name: &str,
        expires_at: i64,
        permissions: Vec<String>,
    ) {
        let player_uuid = player_uuid.trim();
        if secret.trim().is_empty() || player_uuid.is_empty() {
            return;
        }
        self.tokens.lock().await.insert(
            token::hash_secret(secret),
            OneTimeToken {
                player_uuid: player_uuid.to_string(),
                player_name: player_name.trim().to_string(),
                expires_at,
                permissions,
            },
        );
        debug!(player_uuid = %player_uuid, "One-time token issued");
    }

    /// Exchange a one-time secret for a new session.
    ///
    /// The token is removed before its expiry is checked, so a secret can be
    /// presented successfully at most once and never retried.
    pub async fn redeem_token(&self, secret: &str) -> Result<SessionClaims, RelayError> {
        let secret = secret.trim();
        if secret.is_empty() {
            return Err(RelayError::TokenInvalid);
        }

        let token = self
            .tokens
            .lock()
            .await
            .remove(&token::hash_secret(secret))
            .ok_or(RelayError::TokenInvalid)?;

        let now = now_unix();
        if token.expires_at <= now {
            return Err(RelayError::TokenExpired);
        }

        let ttl = i64::try_from(self.session_ttl.as_secs()).unwrap_or(i64::MAX);
        let session = Session {
            id: random_id(),
            player_uuid: token.player_uuid.clone(),
            player_name: token.player_name.clone(),
            created_at: now,
            last_seen_at: now,
            expires_at: now.saturating_add(ttl),
            revoked: false,
        };
        let claims = SessionClaims {
            sub: session.player_uuid.clone(),
            name: session.player_name.clone(),
            jti: session.id.clone(),
            iat: now,
            exp: session.expires_at,
        };

        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session);
        self.upsert_identity(&token.player_uuid, &token.player_name, now)
            .await;
        self.permissions
            .seed(&token.player_uuid, &token.permissions, true)
            .await;
        self.mark_dirty();

        info!(player_uuid = %claims.sub, session_id = %claims.jti, "Session created");
        Ok(claims)
    }

    // ── Sessions ────────────────────────────────────────────────────

    pub async fn encode_session(&self, claims: &SessionClaims) -> Result<String, RelayError> {
        let key = self.signing_key.read().await;
        token::encode(claims, &key)
    }

    /// Verify a session token and the session it names.
    ///
    /// Bad signature, expiry, unknown session, revocation and subject
    /// mismatch all yield [`RelayError::Unauthorized`].
    pub async fn decode_session(&self, raw: &str) -> Result<SessionClaims, RelayError> {
        let now = now_unix();
        let claims = {
            let key = self.signing_key.read().await;
            token::decode(raw, &key, now)?
        };

        let sessions = self.sessions.read().await;
        match sessions.get(&claims.jti) {
            Some(session) if session.is_live(now) && session.player_uuid == claims.sub => {
                Ok(claims)
            }
            _ => Err(RelayError::Unauthorized),
        }
    }

    /// Record activity on a session and its identity.
    pub async fn touch(&self, claims: &SessionClaims) {
        let now = now_unix();
        if let Some(session) = self.sessions.write().await.get_mut(&claims.jti) {
            session.last_seen_at = now;
        }
        if let Some(identity) = self.identities.write().await.get_mut(&claims.sub) {
            identity.last_seen_at = now;
        }
    }

    /// Mark a session revoked. Returns `false` for an unknown id.
    pub async fn revoke_session(&self, session_id: &str) -> bool {
        let revoked = match self.sessions.write().await.get_mut(session_id.trim()) {
            Some(session) => {
                session.revoked = true;
                true
            }
            None => false,
        };
        if revoked {
            info!(session_id = %session_id.trim(), "Session revoked");
            self.mark_dirty();
        }
        revoked
    }

    /// Live sessions, newest first.
    pub async fn active_sessions(&self) -> Vec<Session> {
        let now = now_unix();
        let mut sessions: Vec<Session> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.is_live(now))
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        sessions
    }

    /// Known identities, most recently seen first.
    pub async fn identities(&self) -> Vec<Identity> {
        let mut identities: Vec<Identity> =
            self.identities.read().await.values().cloned().collect();
        identities.sort_by(|a, b| b.last_seen_at.cmp(&a.last_seen_at));
        identities
    }

    pub async fn identity(&self, player_uuid: &str) -> Option<Identity> {
        self.identities.read().await.get(player_uuid.trim()).cloned()
    }

    async fn upsert_identity(&self, player_uuid: &str, player_name: &str, now: i64) {
        let mut identities = self.identities.write().await;
        let identity = identities
            .entry(player_uuid.to_string())
            .or_insert_with(|| Identity {
                player_uuid: player_uuid.to_string(),
                player_name: String::new(),
                created_at: now,
                last_seen_at: now,
            });
        if !player_name.is_empty() {
            identity.player_name = player_name.to_string();
        }
        identity.last_seen_at = now;
    }

    // ── Expiry ──────────────────────────────────────────────────────

    /// Drop expired tokens, dead sessions and idle permission cache entries.
    /// Raises the dirty signal only if a token or session was removed.
    pub async fn sweep(&self) -> bool {
        let now = now_unix();

        let tokens_removed = {
            let mut tokens = self.tokens.lock().await;
            let before = tokens.len();
            tokens.retain(|_, t| t.expires_at > now);
            before - tokens.len()
        };
        let sessions_removed = {
            let mut sessions = self.sessions.write().await;
            let before = sessions.len();
            sessions.retain(|_, s| s.is_live(now));
            before - sessions.len()
        };
        let permissions_removed = self.permissions.sweep().await;

        let changed = tokens_removed > 0 || sessions_removed > 0;
        if changed || permissions_removed > 0 {
            debug!(
                tokens = tokens_removed,
                sessions = sessions_removed,
                permissions = permissions_removed,
                "Credential sweep"
            );
        }
        if changed {
            self.mark_dirty();
        }
        changed
    }

    // ── Persistence ─────────────────────────────────────────────────

    pub fn mark_dirty(&self) {
        self.dirty.notify_one();
    }

    /// Write the durable state now. A store without a state path is a no-op.
    pub async fn persist(&self) -> Result<(), RelayError> {
        let path_guard = self.state_path.lock().await;
        let Some(path) = path_guard.clone() else {
            return Ok(());
        };
        let state = self.snapshot().await;
        tokio::task::spawn_blocking(move || persist::save(&path, &state))
            .await
            .map_err(std::io::Error::other)??;
        Ok(())
    }

    /// Background writer: persists once per dirty signal until `cancel`
    /// fires, then flushes a final time.
    pub fn spawn_persister(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = self.dirty.notified() => {
                        if let Err(e) = self.persist().await {
                            warn!(error = %e, "Failed to persist auth state");
                        }
                    }
                }
            }
            if let Err(e) = self.persist().await {
                warn!(error = %e, "Failed to flush auth state on shutdown");
            }
        })
    }

    /// Move the state file to `<plugin_data_dir>/auth_state.json`.
    ///
    /// The previous file is copied over if the new one does not exist yet. An
    /// existing file at the new location is loaded; otherwise the in-memory
    /// state is written there.
    pub async fn relocate(&self, plugin_data_dir: &str) -> Result<PathBuf, RelayError> {
        let dir = plugin_data_dir.trim();
        if dir.is_empty() {
            return Err(RelayError::BadRequest("empty plugin data dir".into()));
        }
        let requested = Path::new(dir).join(STATE_FILE_NAME);
        let target = persist::confine(&self.state_root, &requested).ok_or_else(|| {
            RelayError::BadRequest(format!(
                "{} is outside {}",
                requested.display(),
                self.state_root.display()
            ))
        })?;

        let mut path_guard = self.state_path.lock().await;
        if path_guard.as_deref() == Some(target.as_path()) {
            return Ok(target);
        }

        let previous = path_guard.clone();
        let copy_target = target.clone();
        let copied = tokio::task::spawn_blocking(move || -> std::io::Result<bool> {
            let Some(previous) = previous.filter(|p| p.exists()) else {
                return Ok(false);
            };
            if copy_target.exists() {
                return Ok(false);
            }
            if let Some(parent) = copy_target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(&previous, &copy_target)?;
            Ok(true)
        })
        .await
        .map_err(std::io::Error::other)?;
        match copied {
            Ok(true) => info!(path = %target.display(), "Copied auth state to plugin data dir"),
            Ok(false) => {}
            Err(e) => warn!(path = %target.display(), error = %e, "Failed to copy previous auth state"),
        }

        *path_guard = Some(target.clone());
        drop(path_guard);

        match read_state(target.clone()).await {
            Ok(Some(state)) => {
                self.apply(state).await;
                info!(path = %target.display(), "Auth state relocated and loaded");
            }
            Ok(None) => {
                info!(path = %target.display(), "Auth state relocated");
                self.mark_dirty();
            }
            Err(e) => {
                warn!(path = %target.display(), error = %e, "Unreadable auth state at new location, overwriting");
                self.mark_dirty();
            }
        }
        Ok(target)
    }

    async fn snapshot(&self) -> StateFile {
        let signing_key = STANDARD.encode(self.signing_key.read().await.as_slice());
        let now = now_unix();
        let sessions = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.is_live(now))
            .cloned()
            .collect();
        let identities = self.identities.read().await.values().cloned().collect();
        StateFile {
            signing_key,
            sessions,
            identities,
        }
    }

    /// Merge a loaded state file into memory. Dead sessions are discarded and
    /// a missing or undecodable key keeps the current one.
    async fn apply(&self, state: StateFile) {
        match STANDARD.decode(state.signing_key.trim()) {
            Ok(key) if !key.is_empty() => *self.signing_key.write().await = key,
            _ => warn!("Auth state has no usable signing key, keeping current key"),
        }

        let now = now_unix();
        {
            let mut sessions = self.sessions.write().await;
            for session in state.sessions.into_iter().filter(|s| s.is_live(now)) {
                sessions.insert(session.id.clone(), session);
            }
        }
        {
            let mut identities = self.identities.write().await;
            for identity in state.identities {
                if identity.player_uuid.trim().is_empty() {
                    continue;
                }
                identities.insert(identity.player_uuid.clone(), identity);
            }
        }
    }
}

fn random_signing_key() -> Vec<u8> {
    let mut key = vec![0u8; SIGNING_KEY_BYTES];
    rand::rng().fill(key.as_mut_slice());
    key
}

async fn read_state(path: PathBuf) -> std::io::Result<Option<StateFile>> {
    tokio::task::spawn_blocking(move || persist::load(&path))
        .await
        .map_err(std::io::Error::other)?
}
