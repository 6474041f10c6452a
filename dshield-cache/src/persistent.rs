//! Persistent cache tier backed by LMDB
//!
//! A single-file key/value store keyed by `(indicator, source_label)`.
//! Value layout: `[expires_at_millis: 8][retrieved_at_millis: 8][json blob]`,
//! little-endian. Rows whose `expires_at` is in the past read as absent and
//! are deleted on access; a periodic purge removes the rest.

use chrono::{DateTime, Utc};
use dshield_core::{CacheError, DshieldResult};
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use std::path::Path;

/// Separator between indicator and source label in encoded keys.
///
/// NUL cannot appear in either component, so the encoding is unambiguous.
const KEY_SEPARATOR: u8 = 0;

const HEADER_LEN: usize = 16;

/// A decoded persistent cache row.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheRow {
    pub value: serde_json::Value,
    pub retrieved_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Statistics over the persistent tier.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PersistentStats {
    /// Rows currently within TTL.
    pub valid_entries: u64,
    /// Rows past expiry awaiting purge.
    pub expired_entries: u64,
    /// On-disk size of the store in bytes.
    pub disk_bytes: u64,
}

/// LMDB-backed persistent cache.
pub struct PersistentCache {
    env: Env,
    db: Database<Bytes, Bytes>,
    path: std::path::PathBuf,
}

impl PersistentCache {
    /// Open (or create) the cache database under `dir`.
    pub fn open(dir: &Path, max_size_mb: usize) -> DshieldResult<Self> {
        std::fs::create_dir_all(dir).map_err(|e| CacheError::Open {
            reason: e.to_string(),
        })?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb.max(1) * 1024 * 1024)
                .max_dbs(1)
                .open(dir)
        }
        .map_err(|e| CacheError::Open {
            reason: e.to_string(),
        })?;

        let mut wtxn = env.write_txn().map_err(txn_err)?;
        let db: Database<Bytes, Bytes> =
            env.create_database(&mut wtxn, None).map_err(|e| CacheError::Open {
                reason: e.to_string(),
            })?;
        wtxn.commit().map_err(txn_err)?;

        Ok(Self {
            env,
            db,
            path: dir.to_path_buf(),
        })
    }

    fn encode_key(indicator: &str, source_label: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(indicator.len() + 1 + source_label.len());
        key.extend_from_slice(indicator.as_bytes());
        key.push(KEY_SEPARATOR);
        key.extend_from_slice(source_label.as_bytes());
        key
    }

    fn encode_value(row: &CacheRow) -> DshieldResult<Vec<u8>> {
        let blob = serde_json::to_vec(&row.value).map_err(|e| CacheError::Serialization {
            reason: e.to_string(),
        })?;
        let mut bytes = Vec::with_capacity(HEADER_LEN + blob.len());
        bytes.extend_from_slice(&row.expires_at.timestamp_millis().to_le_bytes());
        bytes.extend_from_slice(&row.retrieved_at.timestamp_millis().to_le_bytes());
        bytes.extend_from_slice(&blob);
        Ok(bytes)
    }

    fn decode_value(bytes: &[u8]) -> DshieldResult<CacheRow> {
        if bytes.len() < HEADER_LEN {
            return Err(CacheError::Serialization {
                reason: "row too short for timestamp header".to_string(),
            }
            .into());
        }
        let expires_ms = i64::from_le_bytes(bytes[0..8].try_into().expect("8 byte slice"));
        let retrieved_ms = i64::from_le_bytes(bytes[8..16].try_into().expect("8 byte slice"));
        let value: serde_json::Value =
            serde_json::from_slice(&bytes[HEADER_LEN..]).map_err(|e| CacheError::Serialization {
                reason: e.to_string(),
            })?;
        Ok(CacheRow {
            value,
            retrieved_at: DateTime::from_timestamp_millis(retrieved_ms).unwrap_or_else(Utc::now),
            expires_at: DateTime::from_timestamp_millis(expires_ms).unwrap_or_else(Utc::now),
        })
    }

    /// Fetch the row for `(indicator, source_label)`.
    ///
    /// A missing or expired row reads as `None`; expired rows are deleted.
    pub fn get(&self, indicator: &str, source_label: &str) -> DshieldResult<Option<CacheRow>> {
        let key = Self::encode_key(indicator, source_label);
        let row = {
            let rtxn = self.env.read_txn().map_err(txn_err)?;
            match self.db.get(&rtxn, &key).map_err(txn_err)? {
                Some(bytes) => Some(Self::decode_value(bytes)?),
                None => None,
            }
        };

        match row {
            Some(row) if row.expires_at > Utc::now() => Ok(Some(row)),
            Some(_) => {
                self.delete(indicator, source_label)?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Insert or replace the row for `(indicator, source_label)`.
    pub fn put(&self, indicator: &str, source_label: &str, row: &CacheRow) -> DshieldResult<()> {
        let key = Self::encode_key(indicator, source_label);
        let value = Self::encode_value(row)?;

        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        self.db.put(&mut wtxn, &key, &value).map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(())
    }

    /// Delete the row for `(indicator, source_label)`, if present.
    pub fn delete(&self, indicator: &str, source_label: &str) -> DshieldResult<bool> {
        let key = Self::encode_key(indicator, source_label);
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let deleted = self.db.delete(&mut wtxn, &key).map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(deleted)
    }

    /// Delete all rows whose `expires_at` is in the past.
    ///
    /// Run at startup and by the hourly janitor.
    pub fn purge_expired(&self) -> DshieldResult<u64> {
        let now_ms = Utc::now().timestamp_millis();
        let mut stale: Vec<Vec<u8>> = Vec::new();
        {
            let rtxn = self.env.read_txn().map_err(txn_err)?;
            let iter = self.db.iter(&rtxn).map_err(txn_err)?;
            for item in iter {
                let (key, value) = item.map_err(txn_err)?;
                if value.len() >= 8 {
                    let expires_ms =
                        i64::from_le_bytes(value[0..8].try_into().expect("8 byte slice"));
                    if expires_ms < now_ms {
                        stale.push(key.to_vec());
                    }
                }
            }
        }

        let mut deleted = 0u64;
        if !stale.is_empty() {
            let mut wtxn = self.env.write_txn().map_err(txn_err)?;
            for key in &stale {
                if self.db.delete(&mut wtxn, key).map_err(txn_err)? {
                    deleted += 1;
                }
            }
            wtxn.commit().map_err(txn_err)?;
        }

        if deleted > 0 {
            tracing::info!(deleted, "purged expired cache rows");
        }
        Ok(deleted)
    }

    /// Valid/expired row counts and on-disk size.
    pub fn stats(&self) -> DshieldResult<PersistentStats> {
        let now_ms = Utc::now().timestamp_millis();
        let mut stats = PersistentStats::default();

        let rtxn = self.env.read_txn().map_err(txn_err)?;
        let iter = self.db.iter(&rtxn).map_err(txn_err)?;
        for item in iter {
            let (_, value) = item.map_err(txn_err)?;
            if value.len() >= 8 {
                let expires_ms = i64::from_le_bytes(value[0..8].try_into().expect("8 byte slice"));
                if expires_ms < now_ms {
                    stats.expired_entries += 1;
                } else {
                    stats.valid_entries += 1;
                }
            }
        }
        drop(rtxn);

        stats.disk_bytes = std::fs::metadata(self.path.join("data.mdb"))
            .map(|m| m.len())
            .unwrap_or(0);
        Ok(stats)
    }
}

impl std::fmt::Debug for PersistentCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentCache")
            .field("path", &self.path)
            .finish()
    }
}

fn txn_err(e: heed::Error) -> CacheError {
    CacheError::Transaction {
        reason: e.to_string(),
    }
}
