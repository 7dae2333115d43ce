// =============================================================================
// Market-data cache — key -> JSON with per-entry TTL
// =============================================================================
//
// The contract is Redis-shaped (string key, JSON value, TTL) but the store is
// in-process: a `parking_lot` map whose writers are atomic per key. Expired
// entries are dropped lazily on read and in bulk via `purge_expired`.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;
use tracing::debug;

struct Entry {
    value: serde_json::Value,
    expires_at: Instant,
}

/// Process-wide TTL cache for quotes, bar series, and fundamentals.
pub struct DataCache {
    entries: RwLock<HashMap<String, Entry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Counters for the operator surface.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

impl DataCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Fetch a live entry. An expired entry counts as a miss and is removed.
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        let now = Instant::now();
        {
            let entries = self.entries.read();
            if let Some(entry) = entries.get(key) {
                if entry.expires_at > now {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.value.clone());
                }
            } else {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        }
        // Entry exists but has expired — drop it under the write lock.
        self.entries.write().remove(key);
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Insert or replace an entry. A later write for the same key wins.
    pub fn set(&self, key: impl Into<String>, value: serde_json::Value, ttl: Duration) {
        let key = key.into();
        debug!(key = %key, ttl_secs = ttl.as_secs(), "cache write");
        self.entries.write().insert(
            key,
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Drop every expired entry; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

impl Default for DataCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DataCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataCache").field("entries", &self.len()).finish()
    }
}

/// Build a cache key: `market:<kind>:<SYMBOL>[:k=v...]` with extras sorted so
/// equal requests always produce equal keys.
pub fn cache_key(kind: &str, symbol: &str, extras: &[(&str, &str)]) -> String {
    let mut key = format!("market:{kind}:{}", symbol.to_uppercase());
    let mut extras: Vec<_> = extras.to_vec();
    extras.sort();
    for (k, v) in extras {
        key.push_str(&format!(":{k}={v}"));
    }
    key
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_get_round_trip() {
        let cache = DataCache::new();
        cache.set("k1", json!({"price": 10.5}), Duration::from_secs(60));
        assert_eq!(cache.get("k1").unwrap()["price"], 10.5);
        assert_eq!(cache.get("absent"), None);
    }

    #[test]
    fn expired_entries_read_as_misses() {
        let cache = DataCache::new();
        cache.set("k1", json!(1), Duration::from_nanos(1));
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(cache.get("k1"), None);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn later_write_replaces_earlier() {
        let cache = DataCache::new();
        cache.set("k1", json!(1), Duration::from_secs(60));
        cache.set("k1", json!(2), Duration::from_secs(60));
        assert_eq!(cache.get("k1").unwrap(), json!(2));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn purge_removes_only_expired() {
        let cache = DataCache::new();
        cache.set("live", json!(1), Duration::from_secs(600));
        cache.set("dead", json!(2), Duration::from_nanos(1));
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.get("live").is_some());
    }

    #[test]
    fn cache_keys_are_canonical() {
        let a = cache_key("historical", "spy", &[("interval", "daily"), ("b", "1")]);
        let b = cache_key("historical", "SPY", &[("b", "1"), ("interval", "daily")]);
        assert_eq!(a, b);
        assert_eq!(a, "market:historical:SPY:b=1:interval=daily");
    }

    #[test]
    fn stats_count_hits_and_misses() {
        let cache = DataCache::new();
        cache.set("k", json!(1), Duration::from_secs(60));
        let _ = cache.get("k");
        let _ = cache.get("nope");
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }
}
