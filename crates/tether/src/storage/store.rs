//! Durable key → value cache with TTL and LRU eviction
//!
//! Every cached key has one row in the SQLite index and one content file
//! in the blob directory. The index is authoritative: a row whose content
//! file has gone missing is treated as a miss and removed on read.
//!
//! Public methods model cache misses and I/O failures as `false`/`None`
//! and log the cause; they never return errors for environmental problems.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use chrono::{Duration, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::blob_file::FileBlobStore;
use super::entry::{CacheEntry, CacheStatistics, CacheValue, SizeInfo};
use super::index::EntryIndex;
use crate::config::{CacheConfig, ConfigError};

/// Index database file name inside the store root
const INDEX_FILE: &str = "index.sqlite";
/// Blob directory name inside the store root
const BLOB_DIR: &str = "blobs";

#[derive(Debug, Default)]
struct AccessCounters {
    hits: u64,
    misses: u64,
}

/// Durable, indexed cache of named values
pub struct EntryStore {
    root: PathBuf,
    index: EntryIndex,
    blobs: FileBlobStore,
    budget_bytes: u64,
    high_water: f64,
    low_water: f64,
    compression_level: i32,
    /// Monotonic access clock; breaks ties between equal timestamps
    access_seq: AtomicU64,
    counters: Mutex<AccessCounters>,
}

impl EntryStore {
    /// Open a store at `root` with the default eviction watermarks
    pub fn open(root: impl AsRef<Path>, budget_bytes: u64) -> Result<Self> {
        let config = CacheConfig {
            dir: Some(root.as_ref().to_path_buf()),
            budget_bytes,
            ..CacheConfig::default()
        };
        Self::open_with_config(root, &config)
    }

    /// Open a store at `root` using the given settings
    pub fn open_with_config(root: impl AsRef<Path>, config: &CacheConfig) -> Result<Self> {
        if config.budget_bytes == 0 {
            return Err(ConfigError::Invalid("cache budget must be non-zero".into()).into());
        }

        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;

        let index = EntryIndex::open(root.join(INDEX_FILE))?;
        let blobs = FileBlobStore::new(root.join(BLOB_DIR))?;
        let access_seq = AtomicU64::new(index.max_access_seq()? + 1);

        info!(
            "[CACHE] Opened entry store at {} ({} entries, budget {} bytes)",
            root.display(),
            index.count()?,
            config.budget_bytes
        );

        Ok(Self {
            root,
            index,
            blobs,
            budget_bytes: config.budget_bytes,
            high_water: config.evict_high_water,
            low_water: config.evict_low_water,
            compression_level: config.compression_level,
            access_seq,
            counters: Mutex::new(AccessCounters::default()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn budget_bytes(&self) -> u64 {
        self.budget_bytes
    }

    fn next_seq(&self) -> u64 {
        self.access_seq.fetch_add(1, Ordering::SeqCst)
    }

    fn record_hit(&self) {
        self.counters.lock().unwrap().hits += 1;
    }

    fn record_miss(&self) {
        self.counters.lock().unwrap().misses += 1;
    }

    /// Cache a value. `ttl` of zero or less stores an already-expired entry.
    ///
    /// Returns false if the value could not be written.
    pub fn store(&self, key: &str, value: impl Into<CacheValue>, ttl: Option<Duration>) -> bool {
        self.store_with_metadata(key, value, ttl, None)
    }

    /// Cache a value with caller-supplied metadata
    pub fn store_with_metadata(
        &self,
        key: &str,
        value: impl Into<CacheValue>,
        ttl: Option<Duration>,
        metadata: Option<HashMap<String, String>>,
    ) -> bool {
        match self.try_store(key, value.into(), ttl, metadata) {
            Ok(()) => true,
            Err(e) => {
                warn!("[CACHE] Failed to store {}: {:#}", key, e);
                false
            }
        }
    }

    fn try_store(
        &self,
        key: &str,
        value: CacheValue,
        ttl: Option<Duration>,
        metadata: Option<HashMap<String, String>>,
    ) -> Result<()> {
        let data_kind = value.kind();
        let bytes = value.encode(self.compression_level)?;
        let file_name = FileBlobStore::file_name_for(key);
        let staged = self.blobs.stage(&file_name, &bytes)?;

        let now = Utc::now();
        // An unrepresentable expiry is treated as no TTL
        let expires_at = ttl.and_then(|ttl| now.checked_add_signed(ttl));
        let seq = self.next_seq();

        let entry = CacheEntry {
            key: key.to_string(),
            data_kind,
            file_name,
            size_bytes: staged.size(),
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
            expires_at,
            metadata,
            revision: seq,
        };

        if let Err(e) = self.index.upsert_with(&entry, seq, || staged.commit())
        {
            staged.discard();
            return Err(e);
        }

        debug!(
            "[CACHE] Stored {} ({}, {} bytes)",
            key, entry.data_kind, entry.size_bytes
        );

        if let Err(e) = self.enforce_budget(key) {
            warn!("[CACHE] Eviction pass failed: {:#}", e);
        }

        Ok(())
    }

    /// Evict least recently accessed entries once usage passes the high
    /// watermark, down to the low watermark. `just_written` is kept.
    fn enforce_budget(&self, just_written: &str) -> Result<usize> {
        let total = self.index.total_size()?;
        let budget = self.budget_bytes as f64;

        if (total as f64) <= budget * self.high_water {
            return Ok(0);
        }

        let target = (budget * self.low_water) as u64;
        let victims = self
            .index
            .evict_lru(target, just_written, |file| self.blobs.delete_quietly(file))?;
        let freed: u64 = victims.iter().map(|e| e.size_bytes).sum();

        if !victims.is_empty() {
            info!(
                "[CACHE] Evicted {} entries ({} bytes) to stay within budget",
                victims.len(),
                freed
            );
        }

        Ok(victims.len())
    }

    /// Look up a value. Expired, missing, or unreadable entries are
    /// removed and reported as a miss.
    pub fn retrieve(&self, key: &str) -> Option<CacheValue> {
        match self.try_retrieve(key) {
            Ok(value) => value,
            Err(e) => {
                warn!("[CACHE] Failed to retrieve {}: {:#}", key, e);
                self.record_miss();
                None
            }
        }
    }

    fn try_retrieve(&self, key: &str) -> Result<Option<CacheValue>> {
        let Some(entry) = self.index.get(key)? else {
            self.record_miss();
            return Ok(None);
        };

        if entry.is_expired() {
            debug!("[CACHE] {} expired, removing", key);
            self.discard(&entry);
            self.record_miss();
            return Ok(None);
        }

        let Some(bytes) = self.blobs.read(&entry.file_name)? else {
            warn!("[CACHE] Content for {} is missing, dropping index row", key);
            self.discard(&entry);
            self.record_miss();
            return Ok(None);
        };

        let value = match CacheValue::decode(entry.data_kind, &bytes) {
            Ok(value) => value,
            Err(e) => {
                warn!("[CACHE] Content for {} is unreadable, removing: {:#}", key, e);
                self.discard(&entry);
                self.record_miss();
                return Ok(None);
            }
        };

        self.index.touch(key, Utc::now(), self.next_seq())?;
        self.record_hit();
        Ok(Some(value))
    }

    /// Index-only presence check that honors expiry
    pub fn exists(&self, key: &str) -> bool {
        match self.index.get(key) {
            Ok(Some(entry)) => !entry.is_expired(),
            Ok(None) => false,
            Err(e) => {
                warn!("[CACHE] Failed to check {}: {:#}", key, e);
                false
            }
        }
    }

    /// Index record for a key, without touching it
    pub fn get_entry(&self, key: &str) -> Option<CacheEntry> {
        self.index.get(key).unwrap_or_else(|e| {
            warn!("[CACHE] Failed to read index row for {}: {:#}", key, e);
            None
        })
    }

    /// All cached keys, most recently accessed first
    pub fn keys(&self) -> Vec<String> {
        self.index.keys().unwrap_or_else(|e| {
            warn!("[CACHE] Failed to list keys: {:#}", e);
            Vec::new()
        })
    }

    /// Remove a key and its content. Returns whether the key existed.
    pub fn remove(&self, key: &str) -> bool {
        match self
            .index
            .delete_with(key, None, |file| self.blobs.delete_quietly(file))
        {
            Ok(Some(_)) => true,
            Ok(None) => false,
            Err(e) => {
                warn!("[CACHE] Failed to remove {}: {:#}", key, e);
                false
            }
        }
    }

    /// Remove the write that was read as `entry`, unless the key has been
    /// stored again since
    fn discard(&self, entry: &CacheEntry) {
        let removed = self.index.delete_with(&entry.key, Some(entry.revision), |file| {
            self.blobs.delete_quietly(file)
        });
        match removed {
            Ok(Some(_)) => {}
            Ok(None) => debug!("[CACHE] {} was already gone or rewritten", entry.key),
            Err(e) => warn!("[CACHE] Failed to remove {}: {:#}", entry.key, e),
        }
    }

    /// Remove every entry and reset hit/miss counters
    pub fn clear_all(&self) -> bool {
        let result = self.index.clear_with(|| self.blobs.clear());

        *self.counters.lock().unwrap() = AccessCounters::default();

        match result {
            Ok(removed) => {
                info!("[CACHE] Cleared {} entries", removed);
                true
            }
            Err(e) => {
                warn!("[CACHE] Failed to clear cache: {:#}", e);
                false
            }
        }
    }

    /// Sweep all expired entries, returning how many were removed
    pub fn cleanup_expired(&self) -> usize {
        match self
            .index
            .take_expired(Utc::now(), |file| self.blobs.delete_quietly(file))
        {
            Ok(expired) => {
                if !expired.is_empty() {
                    info!("[CACHE] Removed {} expired entries", expired.len());
                }
                expired.len()
            }
            Err(e) => {
                warn!("[CACHE] Expiry sweep failed: {:#}", e);
                0
            }
        }
    }

    /// Cache a serializable value as a structured entry
    pub fn store_serde<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) -> bool {
        match serde_json::to_value(value) {
            Ok(json) => self.store(key, CacheValue::Structured(json), ttl),
            Err(e) => {
                warn!("[CACHE] Failed to serialize {}: {}", key, e);
                false
            }
        }
    }

    /// Retrieve a structured (or opaque) entry as a typed value
    pub fn retrieve_serde<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let json = self.retrieve(key)?.into_json()?;
        serde_json::from_value(json)
            .map_err(|e| warn!("[CACHE] Cached {} has an unexpected shape: {}", key, e))
            .ok()
    }

    pub fn get_size_info(&self) -> SizeInfo {
        let (entry_count, total) = match (self.index.count(), self.index.total_size()) {
            (Ok(count), Ok(total)) => (count, total),
            (Err(e), _) | (_, Err(e)) => {
                warn!("[CACHE] Failed to read size info: {:#}", e);
                (0, 0)
            }
        };

        SizeInfo {
            entry_count,
            total_size_bytes: total,
            average_size_bytes: if entry_count > 0 {
                total / entry_count as u64
            } else {
                0
            },
            budget_bytes: self.budget_bytes,
            usage_percent: total as f64 / self.budget_bytes as f64 * 100.0,
        }
    }

    pub fn get_statistics(&self) -> CacheStatistics {
        let size = self.get_size_info();
        let (hits, misses) = {
            let counters = self.counters.lock().unwrap();
            (counters.hits, counters.misses)
        };
        let lookups = hits + misses;

        CacheStatistics {
            size,
            hits,
            misses,
            hit_rate: if lookups > 0 {
                hits as f64 / lookups as f64
            } else {
                0.0
            },
            expired_entries: self.index.count_expired(Utc::now()).unwrap_or(0),
            entries_by_kind: self.index.counts_by_kind().unwrap_or_default(),
            oldest_entry_at: self.index.oldest_created_at().unwrap_or(None),
        }
    }
}
