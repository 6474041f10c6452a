//! Two-tier enrichment cache
//!
//! A memory tier and a persistent tier consulted in that order on read;
//! writes go to both. TTLs differ per tier: the memory tier defaults to one
//! hour, the persistent tier to twenty-four. Callers always get their own
//! copy; the cache never hands out shared references.

mod memory;
mod persistent;

pub use memory::MemoryCache;
pub use persistent::{CacheRow, PersistentCache, PersistentStats};

use chrono::{DateTime, Duration, Utc};
use dshield_core::{CacheError, DshieldResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::PathBuf;

/// Which tier satisfied a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    Memory,
    Persistent,
}

/// Construction parameters for the tiered cache.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enable_memory: bool,
    pub enable_persistent: bool,
    /// Directory holding the persistent database.
    pub directory: PathBuf,
    /// Memory-tier TTL.
    pub memory_ttl: Duration,
    /// Persistent-tier TTL.
    pub persistent_ttl: Duration,
    /// Memory-tier entry bound.
    pub max_entries: usize,
    /// LMDB map size in megabytes.
    pub max_disk_mb: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enable_memory: true,
            enable_persistent: true,
            directory: PathBuf::from("data"),
            memory_ttl: Duration::hours(1),
            persistent_ttl: Duration::hours(24),
            max_entries: 1000,
            max_disk_mb: 256,
        }
    }
}

/// Combined cache statistics across both tiers.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct CacheStatistics {
    pub memory_enabled: bool,
    pub memory_entries: usize,
    pub memory_valid_entries: usize,
    pub memory_ttl_seconds: i64,
    pub persistent_enabled: bool,
    pub persistent_valid_entries: u64,
    pub persistent_expired_entries: u64,
    pub persistent_ttl_seconds: i64,
    pub disk_bytes: u64,
}

/// The two-tier cache.
#[derive(Debug)]
pub struct TieredCache {
    memory: Option<MemoryCache>,
    persistent: Option<PersistentCache>,
    memory_ttl: Duration,
    persistent_ttl: Duration,
}

impl TieredCache {
    /// Open the cache with the given settings.
    ///
    /// Startup also purges rows that expired while the process was down.
    pub fn open(settings: &CacheSettings) -> DshieldResult<Self> {
        let memory = settings
            .enable_memory
            .then(|| MemoryCache::new(settings.max_entries, settings.memory_ttl));

        let persistent = if settings.enable_persistent {
            let cache = PersistentCache::open(&settings.directory, settings.max_disk_mb)?;
            cache.purge_expired()?;
            Some(cache)
        } else {
            None
        };

        Ok(Self {
            memory,
            persistent,
            memory_ttl: settings.memory_ttl,
            persistent_ttl: settings.persistent_ttl,
        })
    }

    /// A cache with both tiers disabled; every read is a miss.
    pub fn disabled() -> Self {
        Self {
            memory: None,
            persistent: None,
            memory_ttl: Duration::zero(),
            persistent_ttl: Duration::zero(),
        }
    }

    fn memory_key(indicator: &str, source_label: &str) -> String {
        format!("{}\u{0}{}", indicator, source_label)
    }

    /// Read `(indicator, source_label)`: memory first, then persistent.
    ///
    /// A persistent hit is promoted into the memory tier.
    pub fn get<T: DeserializeOwned>(
        &self,
        indicator: &str,
        source_label: &str,
    ) -> DshieldResult<Option<(T, CacheTier)>> {
        if let Some(memory) = &self.memory {
            if let Some(value) = memory.get(&Self::memory_key(indicator, source_label)) {
                let decoded = decode(value)?;
                return Ok(Some((decoded, CacheTier::Memory)));
            }
        }

        if let Some(persistent) = &self.persistent {
            if let Some(row) = persistent.get(indicator, source_label)? {
                if let Some(memory) = &self.memory {
                    memory.put(
                        Self::memory_key(indicator, source_label),
                        row.value.clone(),
                        row.retrieved_at,
                    );
                }
                let decoded = decode(row.value)?;
                return Ok(Some((decoded, CacheTier::Persistent)));
            }
        }

        Ok(None)
    }

    /// Write to both tiers. The cache stores its own serialized copy.
    pub fn put<T: Serialize>(
        &self,
        indicator: &str,
        source_label: &str,
        value: &T,
        retrieved_at: DateTime<Utc>,
    ) -> DshieldResult<()> {
        let encoded = serde_json::to_value(value).map_err(|e| CacheError::Serialization {
            reason: e.to_string(),
        })?;

        if let Some(memory) = &self.memory {
            memory.put(
                Self::memory_key(indicator, source_label),
                encoded.clone(),
                retrieved_at,
            );
        }

        if let Some(persistent) = &self.persistent {
            persistent.put(
                indicator,
                source_label,
                &CacheRow {
                    value: encoded,
                    retrieved_at,
                    expires_at: retrieved_at + self.persistent_ttl,
                },
            )?;
        }

        Ok(())
    }

    /// Drop every memory-tier entry. The persistent tier is untouched.
    pub fn clear_memory(&self) {
        if let Some(memory) = &self.memory {
            memory.clear();
        }
    }

    /// Purge expired persistent rows; the janitor entry point.
    pub fn purge_expired(&self) -> DshieldResult<u64> {
        match &self.persistent {
            Some(persistent) => persistent.purge_expired(),
            None => Ok(0),
        }
    }

    /// Sizes, TTLs, valid/expired counts, and on-disk bytes.
    pub fn statistics(&self) -> DshieldResult<CacheStatistics> {
        let persistent_stats = match &self.persistent {
            Some(persistent) => persistent.stats()?,
            None => PersistentStats::default(),
        };

        Ok(CacheStatistics {
            memory_enabled: self.memory.is_some(),
            memory_entries: self.memory.as_ref().map(MemoryCache::len).unwrap_or(0),
            memory_valid_entries: self
                .memory
                .as_ref()
                .map(MemoryCache::valid_len)
                .unwrap_or(0),
            memory_ttl_seconds: self.memory_ttl.num_seconds(),
            persistent_enabled: self.persistent.is_some(),
            persistent_valid_entries: persistent_stats.valid_entries,
            persistent_expired_entries: persistent_stats.expired_entries,
            persistent_ttl_seconds: self.persistent_ttl.num_seconds(),
            disk_bytes: persistent_stats.disk_bytes,
        })
    }
}

fn decode<T: DeserializeOwned>(value: serde_json::Value) -> DshieldResult<T> {
    serde_json::from_value(value)
        .map_err(|e| {
            CacheError::Serialization {
                reason: e.to_string(),
            }
            .into()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Verdict {
        score: f64,
        tags: Vec<String>,
    }

    fn sample() -> Verdict {
        Verdict {
            score: 71.25,
            tags: vec!["scanner".into(), "ssh".into()],
        }
    }

    fn settings(dir: &TempDir) -> CacheSettings {
        CacheSettings {
            directory: dir.path().to_path_buf(),
            max_disk_mb: 10,
            ..Default::default()
        }
    }

    #[test]
    fn test_read_through_both_tiers() {
        let dir = TempDir::new().expect("temp dir should be created");
        let cache = TieredCache::open(&settings(&dir)).expect("open should succeed");

        cache
            .put("8.8.8.8", "comprehensive_ip", &sample(), Utc::now())
            .expect("put should succeed");

        let (hit, tier) = cache
            .get::<Verdict>("8.8.8.8", "comprehensive_ip")
            .expect("get should succeed")
            .expect("entry should exist");
        assert_eq!(hit, sample());
        assert_eq!(tier, CacheTier::Memory);

        // After clearing memory the persistent tier still answers
        cache.clear_memory();
        let (hit, tier) = cache
            .get::<Verdict>("8.8.8.8", "comprehensive_ip")
            .expect("get should succeed")
            .expect("entry should exist");
        assert_eq!(hit, sample());
        assert_eq!(tier, CacheTier::Persistent);

        // ...and the hit was promoted back into memory
        let (_, tier) = cache
            .get::<Verdict>("8.8.8.8", "comprehensive_ip")
            .expect("get should succeed")
            .expect("entry should exist");
        assert_eq!(tier, CacheTier::Memory);
    }

    #[test]
    fn test_miss_on_unknown_key() {
        let dir = TempDir::new().expect("temp dir should be created");
        let cache = TieredCache::open(&settings(&dir)).expect("open should succeed");
        assert!(cache
            .get::<Verdict>("1.1.1.1", "comprehensive_ip")
            .expect("get should succeed")
            .is_none());
    }

    #[test]
    fn test_disabled_cache_always_misses() {
        let cache = TieredCache::disabled();
        cache
            .put("8.8.8.8", "comprehensive_ip", &sample(), Utc::now())
            .expect("put should succeed");
        assert!(cache
            .get::<Verdict>("8.8.8.8", "comprehensive_ip")
            .expect("get should succeed")
            .is_none());
    }

    #[test]
    fn test_statistics() {
        let dir = TempDir::new().expect("temp dir should be created");
        let cache = TieredCache::open(&settings(&dir)).expect("open should succeed");
        cache
            .put("8.8.8.8", "comprehensive_ip", &sample(), Utc::now())
            .expect("put should succeed");

        let stats = cache.statistics().expect("statistics should succeed");
        assert!(stats.memory_enabled);
        assert_eq!(stats.memory_entries, 1);
        assert_eq!(stats.memory_valid_entries, 1);
        assert_eq!(stats.persistent_valid_entries, 1);
        assert_eq!(stats.memory_ttl_seconds, 3600);
        assert_eq!(stats.persistent_ttl_seconds, 86400);
        assert!(stats.disk_bytes > 0);
    }
}
