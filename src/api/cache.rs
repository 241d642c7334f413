// Response Cache - TTL cache for buffered (non-streaming) upstream responses

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::proxy::Provider;

pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_MAX_ENTRIES: usize = 100;

#[derive(Clone, Debug)]
struct CacheEntry {
    data: Value,
    timestamp: Instant,
}

impl CacheEntry {
    fn new(data: Value) -> Self {
        Self {
            data,
            timestamp: Instant::now(),
        }
    }

    fn is_expired(&self, ttl: Duration) -> bool {
        self.timestamp.elapsed() >= ttl
    }
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    /// Keys in insertion order; eviction pops from the front
    order: VecDeque<String>,
}

impl CacheInner {
    fn remove(&mut self, key: &str) {
        if self.entries.remove(key).is_some() {
            self.order.retain(|k| k != key);
        }
    }

    fn purge_expired(&mut self, ttl: Duration) {
        let entries = &mut self.entries;
        entries.retain(|_, v| !v.is_expired(ttl));
        self.order.retain(|k| entries.contains_key(k));
    }
}

/// Bounded TTL cache. Eviction is by insertion order, not recency of use.
pub struct ResponseCache {
    inner: Mutex<CacheInner>,
    ttl: Duration,
    max_entries: usize,
}

impl ResponseCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    /// Deterministic key: `provider:model:<payload json>`.
    pub fn key(provider: Provider, model: &str, payload: &Value) -> String {
        format!("{}:{}:{}", provider.id(), model, payload)
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let mut inner = self.inner.lock();
        let expired = match inner.entries.get(key) {
            None => return None,
            Some(entry) => entry.is_expired(self.ttl),
        };
        if expired {
            tracing::debug!("[ResponseCache] Entry expired, evicting");
            inner.remove(key);
            return None;
        }
        inner.entries.get(key).map(|e| e.data.clone())
    }

    pub fn set(&self, key: String, data: Value) {
        let mut inner = self.inner.lock();

        // Overwrites keep their original insertion slot
        if let Some(entry) = inner.entries.get_mut(&key) {
            *entry = CacheEntry::new(data);
            return;
        }

        inner.purge_expired(self.ttl);
        if inner.entries.len() >= self.max_entries {
            if let Some(oldest) = inner.order.pop_front() {
                tracing::debug!("[ResponseCache] Cache full, evicting oldest entry");
                inner.entries.remove(&oldest);
            }
        }

        inner.order.push_back(key.clone());
        inner.entries.insert(key, CacheEntry::new(data));
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL, DEFAULT_MAX_ENTRIES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_get_before_ttl() {
        let cache = ResponseCache::default();
        cache.set("k".into(), json!({"a": 1}));
        assert_eq!(cache.get("k"), Some(json!({"a": 1})));
        assert_eq!(cache.get("missing"), None);
    }

    #[test]
    fn test_expired_at_ttl() {
        let cache = ResponseCache::new(Duration::ZERO, 10);
        cache.set("k".into(), json!(1));
        assert_eq!(cache.get("k"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_expired_after_ttl_elapses() {
        let cache = ResponseCache::new(Duration::from_millis(30), 10);
        cache.set("k".into(), json!(1));
        assert_eq!(cache.get("k"), Some(json!(1)));
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn test_evicts_first_inserted_when_full() {
        let cache = ResponseCache::new(DEFAULT_TTL, 3);
        for i in 0..3 {
            cache.set(format!("k{}", i), json!(i));
        }
        // Reading does not refresh position
        assert!(cache.get("k0").is_some());
        cache.set("k3".into(), json!(3));

        assert_eq!(cache.len(), 3);
        assert_eq!(cache.get("k0"), None);
        assert_eq!(cache.get("k1"), Some(json!(1)));
        assert_eq!(cache.get("k3"), Some(json!(3)));
    }

    #[test]
    fn test_overwrite_does_not_evict() {
        let cache = ResponseCache::new(DEFAULT_TTL, 2);
        cache.set("a".into(), json!(1));
        cache.set("b".into(), json!(2));
        cache.set("a".into(), json!(10));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a"), Some(json!(10)));
        assert_eq!(cache.get("b"), Some(json!(2)));
    }

    #[test]
    fn test_expired_entries_purged_before_eviction() {
        let cache = ResponseCache::new(Duration::from_millis(20), 2);
        cache.set("old".into(), json!(0));
        std::thread::sleep(Duration::from_millis(30));
        cache.set("a".into(), json!(1));
        cache.set("b".into(), json!(2));
        assert_eq!(cache.get("a"), Some(json!(1)));
        assert_eq!(cache.get("b"), Some(json!(2)));
    }

    #[test]
    fn test_key_is_deterministic() {
        let a = ResponseCache::key(Provider::OpenAI, "gpt", &json!({"b": 1, "a": [1, 2]}));
        let b = ResponseCache::key(Provider::OpenAI, "gpt", &json!({"a": [1, 2], "b": 1}));
        assert_eq!(a, b);
        assert!(a.starts_with("openai:gpt:"));
    }
}
