use bytes::Bytes;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct CacheEntry {
    // Stored value plus optional expiration.
    value: Bytes,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }
}

/// Simple in-memory cache with optional TTL expiry.
///
/// ```
/// use bytes::Bytes;
/// use sizewatch_storage::EphemeralCache;
///
/// let cache = EphemeralCache::new();
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     assert!(cache.insert_if_absent("k", Bytes::from_static(b"v"), None).await);
///     assert!(!cache.insert_if_absent("k", Bytes::new(), None).await);
///     assert_eq!(cache.delete("k").await, Some(Bytes::from_static(b"v")));
/// });
/// ```
#[derive(Debug, Default)]
pub struct EphemeralCache {
    // RwLock allows concurrent readers while updates take exclusive access.
    inner: RwLock<HashMap<String, CacheEntry>>,
    // When set, expired entries are swept once the map grows past this many keys.
    max_entries: Option<usize>,
}

impl EphemeralCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(max_entries: usize) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            max_entries: Some(max_entries),
        }
    }

    /// Insert only if the key is absent or expired. Returns true if inserted.
    ///
    /// The check and the insert happen under one write lock, so concurrent
    /// callers racing on the same key see exactly one winner.
    pub async fn insert_if_absent(
        &self,
        key: impl Into<String>,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> bool {
        let key = key.into();
        let now = Instant::now();
        let mut guard = self.inner.write().await;
        if guard.get(&key).is_some_and(|entry| !entry.is_expired(now)) {
            return false;
        }
        let expires_at = ttl.map(|ttl| now + ttl);
        guard.insert(key, CacheEntry { value, expires_at });
        self.enforce_capacity(&mut guard);
        true
    }

    pub async fn delete(&self, key: &str) -> Option<Bytes> {
        self.inner
            .write()
            .await
            .remove(key)
            .map(|entry| entry.value)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    fn enforce_capacity(&self, guard: &mut HashMap<String, CacheEntry>) {
        let Some(max_entries) = self.max_entries else {
            return;
        };
        if guard.len() <= max_entries {
            return;
        }
        let now = Instant::now();
        guard.retain(|_, entry| !entry.is_expired(now));
        // Still over: drop the entries closest to expiry first.
        while guard.len() > max_entries {
            let victim = guard
                .iter()
                .min_by_key(|(_, entry)| (entry.expires_at.is_none(), entry.expires_at))
                .map(|(key, _)| key.clone());
            match victim {
                Some(key) => {
                    guard.remove(&key);
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn expired_entry_can_be_claimed_again() {
        let cache = EphemeralCache::new();
        let ttl = Some(Duration::from_millis(10));
        assert!(cache.insert_if_absent("k", Bytes::from_static(b"v"), ttl).await);
        tokio::time::advance(Duration::from_millis(15)).await;
        assert!(cache.insert_if_absent("k", Bytes::from_static(b"w"), ttl).await);
        assert_eq!(cache.len().await, 1);
        assert_eq!(cache.delete("k").await, Some(Bytes::from_static(b"w")));
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn delete_releases_a_claim() {
        let cache = EphemeralCache::new();
        assert!(cache.insert_if_absent("k", Bytes::from_static(b"value"), None).await);
        assert_eq!(cache.delete("k").await, Some(Bytes::from_static(b"value")));
        assert!(cache.delete("k").await.is_none());
        assert!(cache.insert_if_absent("k", Bytes::new(), None).await);
    }

    #[tokio::test(start_paused = true)]
    async fn insert_if_absent_has_one_winner_until_expiry() {
        let cache = EphemeralCache::new();
        let ttl = Some(Duration::from_secs(60));
        assert!(cache.insert_if_absent("id-1", Bytes::new(), ttl).await);
        assert!(!cache.insert_if_absent("id-1", Bytes::new(), ttl).await);
        assert!(cache.insert_if_absent("id-2", Bytes::new(), ttl).await);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(cache.insert_if_absent("id-1", Bytes::new(), ttl).await);
    }

    #[tokio::test]
    async fn capacity_evicts_soonest_expiring_first() {
        let cache = EphemeralCache::with_capacity(2);
        for (key, secs) in [("short", 1), ("long", 100), ("longer", 200)] {
            assert!(
                cache
                    .insert_if_absent(key, Bytes::new(), Some(Duration::from_secs(secs)))
                    .await
            );
        }
        assert_eq!(cache.len().await, 2);
        assert!(!cache.insert_if_absent("longer", Bytes::new(), None).await);
        assert!(!cache.insert_if_absent("long", Bytes::new(), None).await);
        assert!(cache.insert_if_absent("short", Bytes::new(), None).await);
    }
}
