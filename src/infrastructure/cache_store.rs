//! TTL-keyed in-memory cache
//!
//! One process-wide instance holds every derived view the engine fetches
//! (task-list pages, progress snapshots, marketing data, quota). Keys are
//! namespaced strings built with the helpers in [`keys`] so that everything
//! derived from one task can be dropped with a single prefix invalidation.
//!
//! Expiry is purely time-based: an entry is served while
//! `now < written_at + ttl` and treated as absent afterwards. There is no size
//! bound. Time comes from `tokio::time::Instant` so paused-clock tests drive
//! expiry deterministically.

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Cache key namespaces.
pub mod keys {
    /// Prefix shared by every task-scoped entry.
    pub fn task_prefix(task_id: &str) -> String {
        format!("task:{task_id}:")
    }

    pub fn progress(task_id: &str, step_type: u32) -> String {
        format!("task:{task_id}:progress:{step_type}")
    }

    pub fn marketing_progress(task_id: &str, is_all: bool) -> String {
        let scope = if is_all { "all" } else { "filtered" };
        format!("task:{task_id}:market_progress:{scope}")
    }

    pub fn marketing_progress_family(task_id: &str) -> String {
        format!("task:{task_id}:market_progress:")
    }

    pub fn marketing_list(task_id: &str, offset: u32, count: u32) -> String {
        format!("task:{task_id}:market_list:{offset}:{count}")
    }

    pub fn marketing_list_family(task_id: &str) -> String {
        format!("task:{task_id}:market_list:")
    }

    pub const TASK_LIST_PREFIX: &str = "task_list:";

    pub fn task_list(offset: u32, count: u32) -> String {
        format!("task_list:{offset}:{count}")
    }

    pub const QUOTA: &str = "quota";
}

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    written_at: Instant,
    ttl: Duration,
}

impl<V> CacheEntry<V> {
    fn is_fresh_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.written_at) < self.ttl
    }
}

#[derive(Debug)]
pub struct CacheStore<V = Value> {
    entries: RwLock<HashMap<String, CacheEntry<V>>>,
    default_ttl: Duration,
}

impl<V: Clone> CacheStore<V> {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            default_ttl,
        }
    }

    pub const fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Live value for `key`; expired entries read as absent.
    pub fn get(&self, key: &str) -> Option<V> {
        self.get_at(key, Instant::now())
    }

    pub fn get_at(&self, key: &str, now: Instant) -> Option<V> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let hit = entries
            .get(key)
            .filter(|entry| entry.is_fresh_at(now))
            .map(|entry| entry.value.clone());
        trace!(key, hit = hit.is_some(), "cache lookup");
        hit
    }

    /// Age of a live entry.
    pub fn age(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(key)
            .filter(|entry| entry.is_fresh_at(now))
            .map(|entry| now.saturating_duration_since(entry.written_at))
    }

    pub fn set(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let entry = CacheEntry {
            value,
            written_at: Instant::now(),
            ttl,
        };
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), entry);
    }

    pub fn set_default(&self, key: impl Into<String>, value: V) {
        self.set(key, value, self.default_ttl);
    }

    pub fn invalidate(&self, key: &str) -> bool {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some()
    }

    /// Drops every entry whose key starts with `prefix`.
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        let removed = before - entries.len();
        if removed > 0 {
            debug!("🧹 Invalidated {} cache entries under '{}'", removed, prefix);
        }
        removed
    }

    /// Most recently written live entry under `prefix`.
    ///
    /// Serves the 503 fallback: any live snapshot of the same resource family
    /// beats an error.
    pub fn freshest_with_prefix(&self, prefix: &str) -> Option<(String, V)> {
        let now = Instant::now();
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && entry.is_fresh_at(now))
            .max_by_key(|(_, entry)| entry.written_at)
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
    }

    /// Physically removes expired entries. Reads never need this.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, entry| entry.is_fresh_at(now));
        before - entries.len()
    }

    /// Stored entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.write().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

impl CacheStore<Value> {
    /// Typed read; an entry that no longer decodes reads as absent.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|value| serde_json::from_value(value).ok())
    }

    pub fn set_as<T: Serialize>(&self, key: impl Into<String>, value: &T, ttl: Duration) {
        match serde_json::to_value(value) {
            Ok(value) => self.set(key, value, ttl),
            Err(e) => debug!("Skipping cache write, value not serializable: {}", e),
        }
    }

    pub fn freshest_as<T: DeserializeOwned>(&self, prefix: &str) -> Option<(String, T)> {
        self.freshest_with_prefix(prefix)
            .and_then(|(key, value)| serde_json::from_value(value).ok().map(|v| (key, v)))
    }
}

impl<V: Clone> Default for CacheStore<V> {
    fn default() -> Self {
        Self::new(Duration::from_millis(
            crate::infrastructure::config::defaults::CACHE_DEFAULT_TTL_MS,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test(start_paused = true)]
    async fn entry_expires_exactly_at_ttl() {
        let cache: CacheStore<u32> = CacheStore::new(TTL);
        cache.set("k", 7, TTL);

        tokio::time::advance(TTL - Duration::from_millis(1)).await;
        assert_eq!(cache.get("k"), Some(7));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(cache.get("k"), None);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn last_write_wins_and_refreshes_timestamp() {
        let cache: CacheStore<&str> = CacheStore::new(TTL);
        cache.set("k", "old", TTL);
        tokio::time::advance(Duration::from_secs(50)).await;
        cache.set("k", "new", TTL);
        tokio::time::advance(Duration::from_secs(50)).await;
        assert_eq!(cache.get("k"), Some("new"));
    }

    #[tokio::test(start_paused = true)]
    async fn prefix_invalidation_is_scoped() {
        let cache: CacheStore<u32> = CacheStore::new(TTL);
        cache.set_default(keys::progress("t1", 2), 1);
        cache.set_default(keys::marketing_progress("t1", true), 2);
        cache.set_default(keys::progress("t11", 2), 3);
        cache.set_default(keys::task_list(0, 50), 4);

        assert_eq!(cache.invalidate_prefix(&keys::task_prefix("t1")), 2);
        assert_eq!(cache.get(&keys::progress("t11", 2)), Some(3));
        assert_eq!(cache.invalidate_prefix(keys::TASK_LIST_PREFIX), 1);
        assert!(cache.invalidate(&keys::progress("t11", 2)));
        assert!(!cache.invalidate(&keys::progress("t11", 2)));
    }

    #[tokio::test(start_paused = true)]
    async fn freshest_with_prefix_skips_expired_and_picks_newest() {
        let cache: CacheStore<u32> = CacheStore::new(TTL);
        cache.set(keys::marketing_progress("t", true), 1, Duration::from_secs(5));
        tokio::time::advance(Duration::from_secs(1)).await;
        cache.set(keys::marketing_progress("t", false), 2, TTL);

        let family = keys::marketing_progress_family("t");
        assert_eq!(cache.freshest_with_prefix(&family).map(|(_, v)| v), Some(2));

        cache.invalidate(&keys::marketing_progress("t", false));
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(cache.freshest_with_prefix(&family).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn typed_access_over_json_values() {
        let cache: CacheStore = CacheStore::new(TTL);
        cache.set_as(keys::QUOTA, &serde_json::json!({ "left": 9 }), TTL);
        let quota: serde_json::Map<String, Value> = cache.get_as(keys::QUOTA).unwrap();
        assert_eq!(quota["left"], 9);
        assert!(cache.get_as::<Vec<u8>>(keys::QUOTA).is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_and_readers() {
        let cache = Arc::new(CacheStore::<usize>::new(TTL));
        let mut handles = Vec::new();
        for worker in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..200 {
                    cache.set_default(format!("w{worker}:{i}"), i);
                    let _ = cache.get(&format!("w{}:{}", (worker + 1) % 8, i));
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(cache.len(), 8 * 200);
    }

    proptest! {
        #[test]
        fn get_respects_ttl(ttl_ms in 1u64..10_000, probe_ms in 0u64..20_000) {
            let cache: CacheStore<u64> = CacheStore::new(Duration::from_millis(ttl_ms));
            cache.set("k", 42, Duration::from_millis(ttl_ms));
            prop_assume!(probe_ms >= ttl_ms || probe_ms + 50 < ttl_ms);
            let written = Instant::now();
            let probe = written + Duration::from_millis(probe_ms);
            let got = cache.get_at("k", probe);
            if probe_ms >= ttl_ms {
                prop_assert_eq!(got, None);
            } else {
                prop_assert_eq!(got, Some(42));
            }
        }
    }
}
