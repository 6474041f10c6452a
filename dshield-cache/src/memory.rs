//! In-memory cache tier
//!
//! A bounded map from cache key to JSON blob. Reads hold the lock only long
//! enough to clone the entry out; inserts above the bound evict entries with
//! the oldest `retrieved_at` until the map is back within bound.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: serde_json::Value,
    retrieved_at: DateTime<Utc>,
}

/// Bounded in-memory tier with TTL-on-read semantics.
#[derive(Debug)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, MemoryEntry>>,
    max_entries: usize,
    ttl: Duration,
}

impl MemoryCache {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_entries: max_entries.max(1),
            ttl,
        }
    }

    /// Look up a key. Expired entries read as absent and are removed.
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(key) {
            Some(entry) if Utc::now() - entry.retrieved_at < self.ttl => {
                Some(entry.value.clone())
            }
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Insert a value, evicting oldest entries past the bound.
    pub fn put(&self, key: String, value: serde_json::Value, retrieved_at: DateTime<Utc>) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            key,
            MemoryEntry {
                value,
                retrieved_at,
            },
        );

        while entries.len() > self.max_entries {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.retrieved_at)
                .map(|(key, _)| key.clone());
            match oldest {
                Some(key) => {
                    entries.remove(&key);
                }
                None => break,
            }
        }
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Current entry count, including not-yet-collected expired entries.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Count of entries that are still within TTL.
    pub fn valid_len(&self) -> usize {
        let now = Utc::now();
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|entry| now - entry.retrieved_at < self.ttl)
            .count()
    }

    /// The configured TTL.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_put_get() {
        let cache = MemoryCache::new(10, Duration::hours(1));
        cache.put("k1".into(), json!({"a": 1}), Utc::now());
        assert_eq!(cache.get("k1"), Some(json!({"a": 1})));
        assert_eq!(cache.get("k2"), None);
    }

    #[test]
    fn test_expired_entry_is_invisible() {
        let cache = MemoryCache::new(10, Duration::hours(1));
        cache.put("old".into(), json!(1), Utc::now() - Duration::hours(2));
        assert_eq!(cache.get("old"), None);
        // The expired entry was dropped on read
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_eviction_removes_oldest_first() {
        let cache = MemoryCache::new(3, Duration::hours(1));
        let base = Utc::now();
        cache.put("a".into(), json!(1), base - Duration::minutes(30));
        cache.put("b".into(), json!(2), base - Duration::minutes(20));
        cache.put("c".into(), json!(3), base - Duration::minutes(10));
        cache.put("d".into(), json!(4), base);

        assert_eq!(cache.len(), 3);
        assert_eq!(cache.get("a"), None, "oldest entry should be evicted");
        assert_eq!(cache.get("d"), Some(json!(4)));
    }

    #[test]
    fn test_clear() {
        let cache = MemoryCache::new(10, Duration::hours(1));
        cache.put("k".into(), json!(true), Utc::now());
        cache.clear();
        assert!(cache.is_empty());
    }
}
