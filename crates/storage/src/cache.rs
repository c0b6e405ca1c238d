//! Query result cache
//!
//! In-memory LRU with per-entry TTL and a byte quota, optionally written
//! through to the `query-cache` collection so results survive a restart.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::num::NonZeroUsize;
use std::time::Duration;
use thiserror::Error;

use crate::error::StorageError;
use crate::kv::{collections, Collection, Database};

/// Cache error types
#[derive(Debug, Error)]
pub enum CacheError {
    /// A single entry is larger than the whole quota
    #[error("Entry {key} needs {size} bytes, quota is {quota}")]
    QuotaExceeded {
        /// Cache key
        key: String,
        /// Entry size in bytes
        size: usize,
        /// Configured quota in bytes
        quota: usize,
    },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backing collection error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

/// Cached value with expiry and bookkeeping
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    /// Cache key
    pub key: String,
    /// Cached value
    pub value: Value,
    /// Expiry time
    pub expires_at: DateTime<Utc>,
    /// Approximate size in bytes
    pub size: usize,
    /// Last read or write
    pub last_access: DateTime<Utc>,
}

impl CacheEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// TTL applied when `put` is not given one
    pub default_ttl: Duration,
    /// Storage quota in bytes
    pub quota_bytes: usize,
    /// Fraction of the quota above which cleanup evicts
    pub pressure_threshold: f64,
    /// Maximum number of entries
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(300),
            quota_bytes: 10 * 1024 * 1024, // 10MB
            pressure_threshold: 0.8,
            max_entries: 1000,
        }
    }
}

impl CacheConfig {
    /// Create a new cache configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set default TTL
    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Set storage quota in bytes
    pub fn quota_bytes(mut self, bytes: usize) -> Self {
        self.quota_bytes = bytes;
        self
    }

    /// Set the pressure threshold (clamped to 0..=1)
    pub fn pressure_threshold(mut self, threshold: f64) -> Self {
        self.pressure_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    /// Set maximum entries
    pub fn max_entries(mut self, max: usize) -> Self {
        self.max_entries = max;
        self
    }

    fn pressure_limit(&self) -> usize {
        (self.quota_bytes as f64 * self.pressure_threshold) as usize
    }
}

/// What a [`CacheStore::cleanup`] pass removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Entries dropped because their TTL passed
    pub expired: usize,
    /// Live entries dropped to relieve storage pressure
    pub evicted: usize,
}

struct Inner {
    entries: LruCache<String, CacheEntry>,
    usage: usize,
}

impl Inner {
    fn pop(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.pop(key)?;
        self.usage = self.usage.saturating_sub(entry.size);
        Some(entry)
    }
}

/// Query result cache with TTL, LRU eviction and optional persistence
pub struct CacheStore {
    inner: Mutex<Inner>,
    disk: Option<Collection>,
    config: CacheConfig,
}

impl CacheStore {
    /// Memory-only cache
    pub fn new(config: CacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(Inner { entries: LruCache::new(capacity), usage: 0 }),
            disk: None,
            config,
        }
    }

    /// Cache written through to the `query-cache` collection
    ///
    /// Non-expired entries persisted by an earlier run are loaded immediately.
    pub fn persistent(config: CacheConfig, db: &Database) -> Result<Self> {
        Self::persistent_in(config, db, collections::QUERY_CACHE)
    }

    /// Cache written through to an arbitrary collection
    pub fn persistent_in(config: CacheConfig, db: &Database, collection: &str) -> Result<Self> {
        let mut cache = Self::new(config);
        cache.disk = Some(db.collection(collection)?);
        let loaded = cache.load_from_disk()?;
        if loaded > 0 {
            tracing::debug!(collection, "Restored {} cached entries", loaded);
        }
        Ok(cache)
    }

    /// Active configuration
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Get a live value; expired entries are dropped and reported as absent
    ///
    /// A hit refreshes the entry's `last_access`, on disk as well, so the
    /// recency order survives a reload.
    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        match inner.entries.peek(key).map(|e| e.is_expired(now)) {
            None => Ok(None),
            Some(false) => {
                let Some(entry) = inner.entries.get_mut(key) else {
                    return Ok(None);
                };
                entry.last_access = now;
                if let Some(disk) = &self.disk {
                    disk.set(key, &*entry)?;
                }
                Ok(Some(entry.value.clone()))
            }
            Some(true) => {
                inner.pop(key);
                self.remove_from_disk(key)?;
                Ok(None)
            }
        }
    }

    /// Store a value with `ttl`, or the configured default
    ///
    /// Fails with [`CacheError::QuotaExceeded`] if the entry alone is larger
    /// than the quota. Otherwise least-recently-used entries are evicted until
    /// total usage fits the quota. Disk writes happen under the same lock as
    /// the memory update, so both always hold the same entries.
    pub fn put(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
        let size = key.len() + serde_json::to_vec(&value)?.len();
        if size > self.config.quota_bytes {
            return Err(CacheError::QuotaExceeded {
                key: key.to_string(),
                size,
                quota: self.config.quota_bytes,
            });
        }

        let now = Utc::now();
        let ttl = ChronoDuration::from_std(ttl.unwrap_or(self.config.default_ttl))
            .unwrap_or_else(|_| ChronoDuration::days(365 * 100));
        let entry = CacheEntry {
            key: key.to_string(),
            value,
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
            size,
            last_access: now,
        };

        let mut inner = self.inner.lock();
        inner.pop(key);
        let mut dropped = Vec::new();
        while inner.usage + size > self.config.quota_bytes {
            match inner.entries.pop_lru() {
                Some((old_key, old)) => {
                    inner.usage = inner.usage.saturating_sub(old.size);
                    dropped.push(old_key);
                }
                None => break,
            }
        }
        if let Some((old_key, old)) = inner.entries.push(key.to_string(), entry.clone()) {
            inner.usage = inner.usage.saturating_sub(old.size);
            dropped.push(old_key);
        }
        inner.usage += size;

        if let Some(disk) = &self.disk {
            for old_key in &dropped {
                disk.remove(old_key)?;
            }
            disk.set(key, &entry)?;
        }
        Ok(())
    }

    /// Remove one entry
    pub fn remove(&self, key: &str) -> Result<bool> {
        let mut inner = self.inner.lock();
        let removed = inner.pop(key).is_some();
        self.remove_from_disk(key)?;
        Ok(removed)
    }

    /// Remove every entry whose key starts with `prefix`
    pub fn remove_prefix(&self, prefix: &str) -> Result<usize> {
        let mut inner = self.inner.lock();
        let keys: Vec<String> = inner
            .entries
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &keys {
            inner.pop(key);
            self.remove_from_disk(key)?;
        }
        Ok(keys.len())
    }

    /// Drop expired entries, then evict least-recently-used entries while
    /// usage is above `pressure_threshold × quota`
    pub fn cleanup(&self) -> Result<CleanupReport> {
        let now = Utc::now();
        let limit = self.config.pressure_limit();
        let mut report = CleanupReport::default();

        let mut inner = self.inner.lock();
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            inner.pop(&key);
            self.remove_from_disk(&key)?;
            report.expired += 1;
        }

        while inner.usage > limit {
            match inner.entries.pop_lru() {
                Some((key, entry)) => {
                    inner.usage = inner.usage.saturating_sub(entry.size);
                    self.remove_from_disk(&key)?;
                    report.evicted += 1;
                }
                None => break,
            }
        }
        let usage = inner.usage;
        drop(inner);

        if report.evicted > 0 {
            tracing::warn!(
                evicted = report.evicted,
                usage,
                quota = self.config.quota_bytes,
                "Query cache under storage pressure"
            );
        }
        Ok(report)
    }

    /// Drop everything
    pub fn clear(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.usage = 0;
        if let Some(disk) = &self.disk {
            disk.clear()?;
        }
        Ok(())
    }

    /// Bytes currently used
    pub fn usage(&self) -> usize {
        self.inner.lock().usage
    }

    /// Whether usage is above the pressure threshold
    pub fn is_under_pressure(&self) -> bool {
        self.usage() > self.config.pressure_limit()
    }

    /// Number of entries, including expired ones not yet cleaned up
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Load persisted entries, discarding expired ones
    pub fn load_from_disk(&self) -> Result<usize> {
        let Some(disk) = &self.disk else {
            return Ok(0);
        };

        let now = Utc::now();
        let mut stored: Vec<CacheEntry> = disk.values()?;
        stored.sort_by_key(|e| e.last_access);

        let mut loaded = 0;
        let mut stale = Vec::new();
        {
            let mut inner = self.inner.lock();
            for entry in stored {
                if entry.is_expired(now) || inner.usage + entry.size > self.config.quota_bytes {
                    stale.push(entry.key);
                    continue;
                }
                inner.usage += entry.size;
                if let Some((old_key, old)) = inner.entries.push(entry.key.clone(), entry) {
                    inner.usage = inner.usage.saturating_sub(old.size);
                    stale.push(old_key);
                } else {
                    loaded += 1;
                }
            }
        }

        for key in &stale {
            disk.remove(key)?;
        }
        Ok(loaded)
    }

    fn remove_from_disk(&self, key: &str) -> Result<()> {
        if let Some(disk) = &self.disk {
            disk.remove(key)?;
        }
        Ok(())
    }
}
