//! Latest server state reported by the plugin.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::relay::protocol::ServerStats;
use crate::util::now_unix;

/// Point-in-time copy of everything the plugin last reported.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ServerSnapshot {
    pub stats: ServerStats,
    /// One opaque object per world.
    pub worlds: Vec<Value>,
    pub env: Value,
    /// Unix seconds of the last update of any part, 0 if never.
    pub updated_at: i64,
}

/// Each part is replaced wholesale on update.
#[derive(Default)]
pub struct SnapshotStore {
    inner: RwLock<ServerSnapshot>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn update_stats(&self, stats: ServerStats) {
        let mut inner = self.inner.write().await;
        inner.stats = stats;
        inner.updated_at = now_unix();
    }

    pub async fn update_worlds(&self, worlds: Vec<Value>) {
        let mut inner = self.inner.write().await;
        inner.worlds = worlds;
        inner.updated_at = now_unix();
    }

    pub async fn update_env(&self, env: Value) {
        let mut inner = self.inner.write().await;
        inner.env = env;
        inner.updated_at = now_unix();
    }

    pub async fn stats(&self) -> ServerStats {
        self.inner.read().await.stats.clone()
    }

    pub async fn snapshot(&self) -> ServerSnapshot {
        self.inner.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn updates_replace_wholesale() {
        let store = SnapshotStore::new();
        store
            .update_worlds(vec![json!({"name": "world"}), json!({"name": "nether"})])
            .await;
        store.update_worlds(vec![json!({"name": "end"})]).await;
        let snap = store.snapshot().await;
        assert_eq!(snap.worlds.len(), 1);
        assert!(snap.updated_at > 0);
    }

    #[tokio::test]
    async fn stats_accessor_returns_copy() {
        let store = SnapshotStore::new();
        store
            .update_stats(ServerStats {
                players: 3,
                ..ServerStats::default()
            })
            .await;
        assert_eq!(store.stats().await.players, 3);
    }
}
