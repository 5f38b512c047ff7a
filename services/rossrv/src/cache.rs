//! Read-command caching
//!
//! Query replies (`*/print` paths) can be served from a short-lived cache
//! to keep repeated polling off the devices. The trait keeps the facade
//! decoupled from the storage; the default store is in-process with a TTL,
//! and `NoopCache` turns caching off entirely.

use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::protocol::Sentence;
use crate::types::DeviceId;

/// Reply cache for read-only commands
pub trait CommandCache: Send + Sync {
    fn get(&self, device_id: DeviceId, words: &[String]) -> Option<Vec<Sentence>>;
    fn put(&self, device_id: DeviceId, words: &[String], replies: Vec<Sentence>);
    /// Drop everything cached for one device (after writes, or on
    /// reconnect)
    fn invalidate_device(&self, device_id: DeviceId);
}

fn cache_key(device_id: DeviceId, words: &[String]) -> String {
    format!("{device_id}:{}", words.join("\x1f"))
}

/// TTL-bounded in-process cache
pub struct MemoryCache {
    ttl: Duration,
    entries: DashMap<String, (Instant, Vec<Sentence>)>,
}

impl MemoryCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl CommandCache for MemoryCache {
    fn get(&self, device_id: DeviceId, words: &[String]) -> Option<Vec<Sentence>> {
        let key = cache_key(device_id, words);
        let entry = self.entries.get(&key)?;
        let (stored_at, replies) = entry.value();
        if stored_at.elapsed() < self.ttl {
            Some(replies.clone())
        } else {
            drop(entry);
            self.entries.remove(&key);
            None
        }
    }

    fn put(&self, device_id: DeviceId, words: &[String], replies: Vec<Sentence>) {
        self.entries
            .insert(cache_key(device_id, words), (Instant::now(), replies));
    }

    fn invalidate_device(&self, device_id: DeviceId) {
        let prefix = format!("{device_id}:");
        self.entries.retain(|key, _| !key.starts_with(&prefix));
    }
}

/// Cache that never holds anything
pub struct NoopCache;

impl CommandCache for NoopCache {
    fn get(&self, _: DeviceId, _: &[String]) -> Option<Vec<Sentence>> {
        None
    }

    fn put(&self, _: DeviceId, _: &[String], _: Vec<Sentence>) {}

    fn invalidate_device(&self, _: DeviceId) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replies() -> Vec<Sentence> {
        vec![Sentence::from_words(vec!["!done".into()])]
    }

    #[test]
    fn test_memory_cache_hit_and_ttl() {
        let cache = MemoryCache::new(Duration::from_millis(50));
        let words = vec!["/interface/print".to_string()];

        assert!(cache.get(DeviceId(1), &words).is_none());
        cache.put(DeviceId(1), &words, replies());
        assert!(cache.get(DeviceId(1), &words).is_some());
        // Other devices miss
        assert!(cache.get(DeviceId(2), &words).is_none());

        std::thread::sleep(Duration::from_millis(70));
        assert!(cache.get(DeviceId(1), &words).is_none());
    }

    #[test]
    fn test_invalidate_device_is_scoped() {
        let cache = MemoryCache::new(Duration::from_secs(60));
        let words = vec!["/ip/address/print".to_string()];
        cache.put(DeviceId(1), &words, replies());
        cache.put(DeviceId(2), &words, replies());

        cache.invalidate_device(DeviceId(1));
        assert!(cache.get(DeviceId(1), &words).is_none());
        assert!(cache.get(DeviceId(2), &words).is_some());
    }

    #[test]
    fn test_noop_cache_never_stores() {
        let cache = NoopCache;
        let words = vec!["/x/print".to_string()];
        cache.put(DeviceId(1), &words, replies());
        assert!(cache.get(DeviceId(1), &words).is_none());
    }
}
