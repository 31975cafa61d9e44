//! Process-local retrieval caching and concurrency limiting.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;

/// TTL + LRU bounded cache. Values are cloned out; keep them cheap
/// (Arc-backed) at the call site.
pub struct TtlLruCache<V: Clone> {
    entries: Mutex<HashMap<String, CacheSlot<V>>>,
    tick: AtomicU64,
}

struct CacheSlot<V> {
    value: V,
    expires_at: Instant,
    last_used: u64,
}

impl<V: Clone> Default for TtlLruCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone> TtlLruCache<V> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            tick: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.entries.lock().unwrap();
        let slot = entries.get_mut(key)?;
        if slot.expires_at <= Instant::now() {
            entries.remove(key);
            return None;
        }
        slot.last_used = self.tick.fetch_add(1, Ordering::Relaxed);
        Some(slot.value.clone())
    }

    /// ttl=0 or maxsize=0 disables caching entirely.
    pub fn set(&self, key: &str, value: V, ttl: Duration, maxsize: usize) {
        if ttl.is_zero() || maxsize == 0 {
            return;
        }
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            key.to_string(),
            CacheSlot {
                value,
                expires_at: Instant::now() + ttl,
                last_used: self.tick.fetch_add(1, Ordering::Relaxed),
            },
        );
        while entries.len() > maxsize {
            let oldest = entries
                .iter()
                .min_by_key(|(_, slot)| slot.last_used)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => entries.remove(&k),
                None => break,
            };
        }
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }
}

/// Stable cache key: mode, top_k, query length and sha256 — never the
/// raw query (it may contain sensitive text) and never secrets.
pub fn make_cache_key(prefix: &str, query: &str, mode: &str, top_k: usize) -> String {
    let q = query.trim();
    let mut hasher = Sha256::new();
    hasher.update(q.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{prefix}|m={mode}|k={top_k}|ql={}|qh={digest}", q.len())
}

/// Bounded semaphores keyed by their permit count, so a reconfigured
/// `max_concurrency` gets a fresh semaphore while in-flight holders of
/// the old one drain naturally.
#[derive(Default)]
pub struct SemaphoreRegistry {
    semaphores: DashMap<usize, Arc<Semaphore>>,
}

impl SemaphoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, max_concurrency: usize) -> Arc<Semaphore> {
        let n = max_concurrency.max(1);
        self.semaphores
            .entry(n)
            .or_insert_with(|| Arc::new(Semaphore::new(n)))
            .clone()
    }

    /// Test hook.
    pub fn clear(&self) {
        self.semaphores.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_expiry_evicts() {
        let cache: TtlLruCache<String> = TtlLruCache::new();
        cache.set("k", "v".into(), Duration::from_millis(5), 10);
        assert_eq!(cache.get("k").as_deref(), Some("v"));
        std::thread::sleep(Duration::from_millis(10));
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn lru_eviction_drops_least_recent() {
        let cache: TtlLruCache<u32> = TtlLruCache::new();
        let ttl = Duration::from_secs(60);
        cache.set("a", 1, ttl, 2);
        cache.set("b", 2, ttl, 2);
        cache.get("a"); // touch a so b is the LRU
        cache.set("c", 3, ttl, 2);
        assert!(cache.get("b").is_none());
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("c"), Some(3));
    }

    #[test]
    fn zero_ttl_disables_caching() {
        let cache: TtlLruCache<u32> = TtlLruCache::new();
        cache.set("a", 1, Duration::ZERO, 10);
        assert!(cache.get("a").is_none());
    }

    #[test]
    fn cache_key_hides_query_text() {
        let key = make_cache_key("query", "private thoughts", "mix", 10);
        assert!(!key.contains("private"));
        assert!(key.contains("m=mix|k=10"));
        // Stable across calls.
        assert_eq!(key, make_cache_key("query", "private thoughts", "mix", 10));
    }

    #[test]
    fn semaphore_registry_is_keyed_by_size() {
        let registry = SemaphoreRegistry::new();
        let a = registry.get(2);
        let b = registry.get(2);
        let c = registry.get(3);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(a.available_permits(), 2);
    }
}
