//! Durable keyed collections
//!
//! This module wraps a sled database and exposes one [`Collection`] per
//! logical store (entities, queue, log, cache, settings). Values are stored
//! as JSON so every collection stays inspectable with plain tooling.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sled::{Db, Tree};
use std::sync::Arc;

use crate::error::{Result, StorageError};

/// Names of the persisted collections
pub mod collections {
    /// Patient snapshots
    pub const PATIENTS: &str = "patients";
    /// Appointment snapshots
    pub const APPOINTMENTS: &str = "appointments";
    /// Document snapshots
    pub const DOCUMENTS: &str = "documents";
    /// Notification snapshots
    pub const NOTIFICATIONS: &str = "notifications";
    /// Payment snapshots
    pub const PAYMENTS: &str = "payments";
    /// Pending write operations
    pub const SYNC_QUEUE: &str = "sync-queue";
    /// Append-only record of sync outcomes
    pub const SYNC_LOG: &str = "sync-log";
    /// Detected conflicts
    pub const CONFLICT_RECORDS: &str = "conflict-records";
    /// Raw server responses kept for offline reads
    pub const API_CACHE: &str = "api-cache";
    /// Persisted query results
    pub const QUERY_CACHE: &str = "query-cache";
    /// Engine bookkeeping such as the last successful sync time
    pub const APP_STATE: &str = "app-state";
    /// Per-user settings owned by the embedding application
    pub const USER_PREFERENCES: &str = "user-preferences";
}

/// Key-value store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KvConfig {
    /// Database path
    pub path: String,
    /// Cache capacity in bytes
    pub cache_capacity: u64,
    /// Enable compression
    pub use_compression: bool,
    /// Flush interval in milliseconds (None for immediate flush)
    pub flush_every_ms: Option<u64>,
    /// Discard the database when it is dropped
    pub temporary: bool,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            path: "clinic_sync.db".to_string(),
            cache_capacity: 64 * 1024 * 1024, // 64MB
            use_compression: true,
            flush_every_ms: Some(500),
            temporary: false,
        }
    }
}

impl KvConfig {
    /// Create a new configuration with a custom path
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into(), ..Default::default() }
    }

    /// Configuration for a throwaway database
    pub fn temporary() -> Self {
        Self { temporary: true, ..Default::default() }
    }

    /// Set cache capacity in bytes
    pub fn cache_capacity(mut self, bytes: u64) -> Self {
        self.cache_capacity = bytes;
        self
    }

    /// Enable or disable compression
    pub fn use_compression(mut self, enabled: bool) -> Self {
        self.use_compression = enabled;
        self
    }

    /// Set flush interval in milliseconds
    pub fn flush_every_ms(mut self, ms: Option<u64>) -> Self {
        self.flush_every_ms = ms;
        self
    }
}

/// Handle to the opened database
#[derive(Clone)]
pub struct Database {
    db: Arc<Db>,
}

impl Database {
    /// Open the database described by `config`
    ///
    /// Any failure here is reported as [`StorageError::Initialization`]; the
    /// offline core cannot run without persistence.
    pub fn open(config: &KvConfig) -> Result<Self> {
        let mut db_config = sled::Config::new()
            .cache_capacity(config.cache_capacity)
            .use_compression(config.use_compression);

        db_config = if config.temporary {
            db_config.temporary(true)
        } else {
            db_config.path(&config.path)
        };

        if let Some(ms) = config.flush_every_ms {
            db_config = db_config.flush_every_ms(Some(ms));
        }

        let db = db_config
            .open()
            .map_err(|e| StorageError::Initialization(format!("{}: {}", config.path, e)))?;

        tracing::info!(path = %config.path, temporary = config.temporary, "Opened local database");
        Ok(Self { db: Arc::new(db) })
    }

    /// Open a temporary database (for testing)
    pub fn in_memory() -> Result<Self> {
        Self::open(&KvConfig::temporary())
    }

    /// Open (or create) a named collection
    pub fn collection(&self, name: &str) -> Result<Collection> {
        let tree = self.db.open_tree(name)?;
        Ok(Collection { name: name.to_string(), tree })
    }

    /// Monotonic id, unique for the lifetime of the database
    pub fn next_sequence(&self) -> Result<u64> {
        Ok(self.db.generate_id()?)
    }

    /// Flush pending writes to disk
    pub async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }

    /// Approximate on-disk size in bytes
    pub fn size_on_disk(&self) -> Result<u64> {
        Ok(self.db.size_on_disk()?)
    }
}

/// A single keyed collection with JSON values
#[derive(Clone)]
pub struct Collection {
    name: String,
    tree: Tree,
}

impl Collection {
    /// Collection name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get a value by key
    pub fn get<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        self.get_raw(key.as_bytes())
    }

    /// Get a value by raw key bytes
    pub fn get_raw<T>(&self, key: &[u8]) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        match self.tree.get(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Set a value by key
    pub fn set<T>(&self, key: &str, value: &T) -> Result<()>
    where
        T: Serialize,
    {
        self.set_raw(key.as_bytes(), value)
    }

    /// Set a value by raw key bytes
    pub fn set_raw<T>(&self, key: &[u8], value: &T) -> Result<()>
    where
        T: Serialize,
    {
        let bytes = serde_json::to_vec(value)?;
        self.tree.insert(key, bytes)?;
        Ok(())
    }

    /// Remove a value by key
    pub fn remove(&self, key: &str) -> Result<bool> {
        self.remove_raw(key.as_bytes())
    }

    /// Remove a value by raw key bytes
    pub fn remove_raw(&self, key: &[u8]) -> Result<bool> {
        Ok(self.tree.remove(key)?.is_some())
    }

    /// Check if a key exists
    pub fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.tree.contains_key(key.as_bytes())?)
    }

    /// Insert an empty marker value (used by index trees)
    pub fn insert_marker(&self, key: &[u8]) -> Result<()> {
        self.tree.insert(key, &[] as &[u8])?;
        Ok(())
    }

    /// All raw keys starting with `prefix`, in key order
    pub fn keys_with_prefix(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>> {
        let mut keys = Vec::new();
        for item in self.tree.scan_prefix(prefix) {
            let (key, _) = item?;
            keys.push(key.to_vec());
        }
        Ok(keys)
    }

    /// All values in key order
    pub fn values<T>(&self) -> Result<Vec<T>>
    where
        T: DeserializeOwned,
    {
        let mut values = Vec::new();
        for item in self.tree.iter() {
            let (_, value) = item?;
            values.push(serde_json::from_slice(&value)?);
        }
        Ok(values)
    }

    /// All values in reverse key order, up to `limit`
    pub fn values_rev<T>(&self, limit: usize) -> Result<Vec<T>>
    where
        T: DeserializeOwned,
    {
        let mut values = Vec::new();
        for item in self.tree.iter().rev().take(limit) {
            let (_, value) = item?;
            values.push(serde_json::from_slice(&value)?);
        }
        Ok(values)
    }

    /// All key/value pairs in key order
    pub fn entries<T>(&self) -> Result<Vec<(Vec<u8>, T)>>
    where
        T: DeserializeOwned,
    {
        let mut entries = Vec::new();
        for item in self.tree.iter() {
            let (key, value) = item?;
            entries.push((key.to_vec(), serde_json::from_slice(&value)?));
        }
        Ok(entries)
    }

    /// First `count` raw keys in key order
    pub fn first_keys(&self, count: usize) -> Result<Vec<Vec<u8>>> {
        let mut keys = Vec::with_capacity(count);
        for item in self.tree.iter().take(count) {
            let (key, _) = item?;
            keys.push(key.to_vec());
        }
        Ok(keys)
    }

    /// Clear all data
    pub fn clear(&self) -> Result<()> {
        self.tree.clear()?;
        Ok(())
    }

    /// Get the number of keys in the collection
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    /// Check if the collection is empty
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}
