//! Per-identity permission cache in front of the upstream agent.

use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::RelayError;

/// Permissions of one identity as last reported upstream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionSet {
    pub permissions: Vec<String>,
    /// Whether the player was online on the game server at fetch time.
    pub online: bool,
}

/// Where fresh permission sets come from. The relay implements this with a
/// correlated `player_permissions_request`.
pub trait PermissionSource: Send + Sync {
    fn fetch_permissions(
        &self,
        player_uuid: &str,
    ) -> impl Future<Output = Result<PermissionSet, RelayError>> + Send;
}

struct CacheEntry {
    set: PermissionSet,
    fetched_at: Instant,
}

/// TTL cache with stale-on-error fallback.
pub struct PermissionResolver {
    cache: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
    idle: Duration,
}

impl PermissionResolver {
    /// `ttl` is how long an entry is served without refetching; `idle` is the
    /// age after which [`sweep`](Self::sweep) discards it.
    pub fn new(ttl: Duration, idle: Duration) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            ttl,
            idle,
        }
    }

    /// Current permissions for `player_uuid`.
    ///
    /// A fresh cache entry is returned as-is. Otherwise the source is asked;
    /// on failure any cached entry, however old, is preferred over the error.
    /// With no cache the error propagates unchanged, so callers can treat
    /// [`RelayError::PluginOffline`] as "no permissions" rather than a failure.
    pub async fn get_permissions<S: PermissionSource>(
        &self,
        source: &S,
        player_uuid: &str,
    ) -> Result<PermissionSet, RelayError> {
        let key = player_uuid.trim();
        if key.is_empty() {
            return Ok(PermissionSet::default());
        }

        if let Some(entry) = self.cache.read().await.get(key) {
            if entry.fetched_at.elapsed() <= self.ttl {
                return Ok(entry.set.clone());
            }
        }

        match source.fetch_permissions(key).await {
            Ok(set) => {
                let set = PermissionSet {
                    permissions: super::normalize(&set.permissions),
                    online: set.online,
                };
                self.store(key, set.clone()).await;
                Ok(set)
            }
            Err(e) => {
                if let Some(entry) = self.cache.read().await.get(key) {
                    warn!(player_uuid = %key, error = %e, "Permission refresh failed, serving cached set");
                    return Ok(entry.set.clone());
                }
                Err(e)
            }
        }
    }

    /// Prime the cache, e.g. from the snapshot carried by a one-time token.
    /// An empty list is ignored.
    pub async fn seed(&self, player_uuid: &str, permissions: &[String], online: bool) {
        let key = player_uuid.trim();
        if key.is_empty() || permissions.is_empty() {
            return;
        }
        let set = PermissionSet {
            permissions: super::normalize(permissions),
            online,
        };
        self.store(key, set).await;
    }

    /// Forget the cached set so the next lookup refetches.
    pub async fn invalidate(&self, player_uuid: &str) {
        if self.cache.write().await.remove(player_uuid.trim()).is_some() {
            debug!(player_uuid = %player_uuid.trim(), "Permission cache invalidated");
        }
    }

    /// Drop entries older than the idle window. Returns how many were removed.
    pub async fn sweep(&self) -> usize {
        self.sweep_at(Instant::now()).await
    }

    pub async fn sweep_at(&self, now: Instant) -> usize {
        let mut cache = self.cache.write().await;
        let before = cache.len();
        cache.retain(|_, entry| now.saturating_duration_since(entry.fetched_at) <= self.idle);
        before - cache.len()
    }

    /// Cached set regardless of age.
    pub async fn cached(&self, player_uuid: &str) -> Option<PermissionSet> {
        self.cache
            .read()
            .await
            .get(player_uuid.trim())
            .map(|entry| entry.set.clone())
    }

    async fn store(&self, key: &str, set: PermissionSet) {
        self.cache.write().await.insert(
            key.to_string(),
            CacheEntry {
                set,
                fetched_at: Instant::now(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Scripted source: pops queued results, counting calls.
    struct FakeSource {
        results: Mutex<Vec<Result<PermissionSet, RelayError>>>,
        calls: AtomicUsize,
    }

    impl FakeSource {
        fn new(mut results: Vec<Result<PermissionSet, RelayError>>) -> Self {
            results.reverse();
            Self {
                results: Mutex::new(results),
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl PermissionSource for FakeSource {
        async fn fetch_permissions(&self, _uuid: &str) -> Result<PermissionSet, RelayError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.results
                .lock()
                .unwrap()
                .pop()
                .unwrap_or(Err(RelayError::PluginOffline))
        }
    }

    fn set(perms: &[&str]) -> PermissionSet {
        PermissionSet {
            permissions: perms.iter().map(ToString::to_string).collect(),
            online: true,
        }
    }

    #[tokio::test]
    async fn fetch_normalizes_and_caches() {
        let resolver = PermissionResolver::new(Duration::from_secs(60), Duration::from_secs(120));
        let source = FakeSource::new(vec![Ok(set(&[" Beacon.Access.Console ", "beacon.access.console"]))]);

        let first = resolver.get_permissions(&source, "u1").await.unwrap();
        assert_eq!(first.permissions, vec!["beacon.access.console"]);

        let second = resolver.get_permissions(&source, "u1").await.unwrap();
        assert_eq!(second, first);
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn stale_entry_is_refetched() {
        let resolver = PermissionResolver::new(Duration::ZERO, Duration::from_secs(120));
        let source = FakeSource::new(vec![Ok(set(&["a"])), Ok(set(&["b"]))]);

        resolver.get_permissions(&source, "u1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let refreshed = resolver.get_permissions(&source, "u1").await.unwrap();
        assert_eq!(refreshed.permissions, vec!["b"]);
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn failure_falls_back_to_stale_cache() {
        let resolver = PermissionResolver::new(Duration::ZERO, Duration::from_secs(120));
        let source = FakeSource::new(vec![Ok(set(&["a"])), Err(RelayError::Timeout)]);

        resolver.get_permissions(&source, "u1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let fallback = resolver.get_permissions(&source, "u1").await.unwrap();
        assert_eq!(fallback.permissions, vec!["a"]);
    }

    #[tokio::test]
    async fn failure_without_cache_propagates_kind() {
        let resolver = PermissionResolver::new(Duration::from_secs(10), Duration::from_secs(30));
        let source = FakeSource::new(vec![]);
        let err = resolver.get_permissions(&source, "u1").await.unwrap_err();
        assert!(matches!(err, RelayError::PluginOffline));
    }

    #[tokio::test]
    async fn empty_uuid_short_circuits() {
        let resolver = PermissionResolver::new(Duration::from_secs(10), Duration::from_secs(30));
        let source = FakeSource::new(vec![]);
        let result = resolver.get_permissions(&source, "  ").await.unwrap();
        assert!(result.permissions.is_empty());
        assert_eq!(source.calls(), 0);
    }

    #[tokio::test]
    async fn seed_then_invalidate() {
        let resolver = PermissionResolver::new(Duration::from_secs(10), Duration::from_secs(30));
        resolver.seed("u1", &[], true).await;
        assert!(resolver.cached("u1").await.is_none());

        resolver.seed("u1", &["A".to_string()], true).await;
        assert_eq!(resolver.cached("u1").await.unwrap().permissions, vec!["a"]);

        resolver.invalidate("u1").await;
        assert!(resolver.cached("u1").await.is_none());
    }

    #[tokio::test]
    async fn sweep_discards_idle_entries() {
        let resolver = PermissionResolver::new(Duration::from_secs(10), Duration::from_secs(30));
        resolver.seed("u1", &["a".to_string()], true).await;

        assert_eq!(resolver.sweep_at(Instant::now()).await, 0);
        let later = Instant::now() + Duration::from_secs(31);
        assert_eq!(resolver.sweep_at(later).await, 1);
        assert!(resolver.cached("u1").await.is_none());
    }
}
