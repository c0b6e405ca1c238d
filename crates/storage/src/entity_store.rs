//! Entity store
//!
//! One collection per entity kind plus one index collection per kind. Index
//! keys have the shape `index \0 value \0 id` and carry no value, so a lookup
//! is a prefix scan followed by primary-key reads.
//!
//! All writes go through a single async write lock. Reads never take it and
//! may observe either the state before or after a concurrent write.

use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::entity::{EntityKind, EntityPayload, LocalRecord};
use crate::error::{Result, StorageError};
use crate::kv::{Collection, Database};

struct KindCollections {
    records: Collection,
    index: Collection,
}

/// Durable, indexed storage of entity snapshots
pub struct EntityStore {
    collections: HashMap<EntityKind, KindCollections>,
    write_lock: Mutex<()>,
}

fn index_key(index: &str, value: &str, id: &str) -> Vec<u8> {
    let mut key = index_prefix(index, value);
    key.extend_from_slice(id.as_bytes());
    key
}

fn index_prefix(index: &str, value: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(index.len() + value.len() + 2);
    key.extend_from_slice(index.as_bytes());
    key.push(0);
    key.extend_from_slice(value.as_bytes());
    key.push(0);
    key
}

impl EntityStore {
    /// Open every entity collection
    ///
    /// Fails with [`StorageError::Initialization`] if any collection cannot
    /// be opened.
    pub async fn initialize(db: &Database) -> Result<Self> {
        let mut collections = HashMap::new();
        for kind in EntityKind::ALL {
            let records = db
                .collection(kind.collection())
                .map_err(|e| StorageError::Initialization(e.to_string()))?;
            let index = db
                .collection(&format!("{}.index", kind.collection()))
                .map_err(|e| StorageError::Initialization(e.to_string()))?;
            collections.insert(kind, KindCollections { records, index });
        }

        tracing::debug!("Entity store initialized with {} collections", collections.len());
        Ok(Self { collections, write_lock: Mutex::new(()) })
    }

    fn kind(&self, kind: EntityKind) -> Result<&KindCollections> {
        self.collections
            .get(&kind)
            .ok_or_else(|| StorageError::NotFound(format!("collection for {}", kind)))
    }

    /// Upsert a record by id
    ///
    /// Validates the payload, stamps `last_sync_at` with the current time,
    /// recomputes the integrity proof and replaces the record's index entries.
    /// `version` is the server-confirmed version, or `None` for a local write,
    /// which keeps the previously confirmed version.
    pub async fn save(&self, payload: EntityPayload, version: Option<u64>) -> Result<LocalRecord> {
        payload.validate()?;
        let kind = payload.kind();
        let colls = self.kind(kind)?;

        let _guard = self.write_lock.lock().await;

        let previous: Option<LocalRecord> = colls.records.get(payload.id())?;
        if let Some(previous) = &previous {
            for (index, value) in previous.payload.index_entries() {
                colls.index.remove_raw(&index_key(index, &value, &previous.id))?;
            }
        }

        let record = LocalRecord {
            id: payload.id().to_string(),
            integrity_proof: Some(LocalRecord::compute_proof(&payload)?),
            version: version.or_else(|| previous.and_then(|p| p.version)),
            last_sync_at: Utc::now(),
            payload,
        };

        colls.records.set(&record.id, &record)?;
        for (index, value) in record.payload.index_entries() {
            colls.index.insert_marker(&index_key(index, &value, &record.id))?;
        }

        tracing::debug!(kind = %kind, id = %record.id, version = ?record.version, "Saved entity");
        Ok(record)
    }

    /// Get a record by id
    pub async fn get_by_id(&self, kind: EntityKind, id: &str) -> Result<Option<LocalRecord>> {
        let record: Option<LocalRecord> = self.kind(kind)?.records.get(id)?;
        if let Some(record) = &record {
            record.verify()?;
        }
        Ok(record)
    }

    /// Get all records whose `index` equals `value`
    pub async fn get_all_by_index(
        &self,
        kind: EntityKind,
        index: &str,
        value: &str,
    ) -> Result<Vec<LocalRecord>> {
        if !kind.indexes().contains(&index) {
            return Err(StorageError::UnknownIndex {
                collection: kind.collection().to_string(),
                index: index.to_string(),
            });
        }

        let colls = self.kind(kind)?;
        // Email lookups are case-insensitive
        let value = if index == "email" { value.to_lowercase() } else { value.to_string() };
        let prefix = index_prefix(index, &value);

        let mut records = Vec::new();
        for key in colls.index.keys_with_prefix(&prefix)? {
            let id = String::from_utf8_lossy(&key[prefix.len()..]).to_string();
            // A concurrent delete may have removed the record after the scan
            if let Some(record) = colls.records.get::<LocalRecord>(&id)? {
                record.verify()?;
                records.push(record);
            }
        }

        Ok(records)
    }

    /// Delete a record and its index entries
    pub async fn delete(&self, kind: EntityKind, id: &str) -> Result<bool> {
        let colls = self.kind(kind)?;
        let _guard = self.write_lock.lock().await;

        let Some(previous) = colls.records.get::<LocalRecord>(id)? else {
            return Ok(false);
        };

        for (index, value) in previous.payload.index_entries() {
            colls.index.remove_raw(&index_key(index, &value, id))?;
        }
        colls.records.remove(id)?;

        tracing::debug!(kind = %kind, id = %id, "Deleted entity");
        Ok(true)
    }

    /// All records of a kind
    pub async fn list(&self, kind: EntityKind) -> Result<Vec<LocalRecord>> {
        self.kind(kind)?.records.values()
    }

    /// Number of records of a kind
    pub fn count(&self, kind: EntityKind) -> Result<usize> {
        Ok(self.kind(kind)?.records.len())
    }

    /// Drop and rebuild the index collection of a kind from its records
    pub async fn rebuild_indexes(&self, kind: EntityKind) -> Result<usize> {
        let colls = self.kind(kind)?;
        let _guard = self.write_lock.lock().await;

        colls.index.clear()?;
        let records: Vec<LocalRecord> = colls.records.values()?;
        let mut entries = 0;
        for record in &records {
            for (index, value) in record.payload.index_entries() {
                colls.index.insert_marker(&index_key(index, &value, &record.id))?;
                entries += 1;
            }
        }

        tracing::info!(kind = %kind, records = records.len(), entries, "Rebuilt entity indexes");
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::fixtures::{appointment, patient};

    async fn store() -> EntityStore {
        let db = Database::in_memory().unwrap();
        EntityStore::initialize(&db).await.unwrap()
    }

    #[tokio::test]
    async fn test_save_and_get() {
        let store = store().await;
        let before = Utc::now();

        let saved = store.save(patient("p1", "active"), None).await.unwrap();
        assert!(saved.last_sync_at >= before);
        assert!(saved.integrity_proof.is_some());

        let loaded = store.get_by_id(EntityKind::Patient, "p1").await.unwrap().unwrap();
        assert_eq!(loaded, saved);
    }

    #[tokio::test]
    async fn test_save_restamps_last_sync_at() {
        let store = store().await;

        let first = store.save(patient("p1", "active"), None).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = store.save(patient("p1", "archived"), None).await.unwrap();

        assert!(second.last_sync_at > first.last_sync_at);
    }

    #[tokio::test]
    async fn test_local_write_keeps_confirmed_version() {
        let store = store().await;

        store.save(patient("p1", "active"), Some(4)).await.unwrap();
        let local = store.save(patient("p1", "archived"), None).await.unwrap();

        assert_eq!(local.version, Some(4));
    }

    #[tokio::test]
    async fn test_get_all_by_index() {
        let store = store().await;

        store.save(appointment("a1", "p1", "scheduled"), None).await.unwrap();
        store.save(appointment("a2", "p1", "cancelled"), None).await.unwrap();
        store.save(appointment("a3", "p2", "scheduled"), None).await.unwrap();

        let for_p1 = store
            .get_all_by_index(EntityKind::Appointment, "patient_id", "p1")
            .await
            .unwrap();
        assert_eq!(for_p1.len(), 2);

        let scheduled = store
            .get_all_by_index(EntityKind::Appointment, "status", "scheduled")
            .await
            .unwrap();
        let mut ids: Vec<_> = scheduled.iter().map(|r| r.id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["a1", "a3"]);
    }

    #[tokio::test]
    async fn test_update_moves_index_entries() {
        let store = store().await;

        store.save(appointment("a1", "p1", "scheduled"), None).await.unwrap();
        store.save(appointment("a1", "p1", "cancelled"), None).await.unwrap();

        let scheduled = store
            .get_all_by_index(EntityKind::Appointment, "status", "scheduled")
            .await
            .unwrap();
        assert!(scheduled.is_empty());

        let cancelled = store
            .get_all_by_index(EntityKind::Appointment, "status", "cancelled")
            .await
            .unwrap();
        assert_eq!(cancelled.len(), 1);
    }

    #[tokio::test]
    async fn test_email_index_is_case_insensitive() {
        let store = store().await;
        store.save(patient("p1", "active"), None).await.unwrap();

        let found = store
            .get_all_by_index(EntityKind::Patient, "email", "P1@Example.com")
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_index() {
        let store = store().await;
        let result = store.get_all_by_index(EntityKind::Patient, "shoe_size", "42").await;
        assert!(matches!(result, Err(StorageError::UnknownIndex { .. })));
    }

    #[tokio::test]
    async fn test_delete_removes_index_entries() {
        let store = store().await;
        store.save(appointment("a1", "p1", "scheduled"), None).await.unwrap();

        assert!(store.delete(EntityKind::Appointment, "a1").await.unwrap());
        assert!(!store.delete(EntityKind::Appointment, "a1").await.unwrap());

        assert!(store.get_by_id(EntityKind::Appointment, "a1").await.unwrap().is_none());
        let by_patient = store
            .get_all_by_index(EntityKind::Appointment, "patient_id", "p1")
            .await
            .unwrap();
        assert!(by_patient.is_empty());
    }

    #[tokio::test]
    async fn test_rejects_invalid_payload() {
        let store = store().await;
        let result = store.save(patient("p1", ""), None).await;
        assert!(matches!(result, Err(StorageError::Validation(_))));
        assert_eq!(store.count(EntityKind::Patient).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_rebuild_indexes() {
        let store = store().await;
        store.save(patient("p1", "active"), None).await.unwrap();
        store.save(patient("p2", "active"), None).await.unwrap();

        let entries = store.rebuild_indexes(EntityKind::Patient).await.unwrap();
        assert_eq!(entries, 4);

        let active = store
            .get_all_by_index(EntityKind::Patient, "status", "active")
            .await
            .unwrap();
        assert_eq!(active.len(), 2);
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = crate::kv::KvConfig::new(dir.path().join("db").to_string_lossy().to_string());

        {
            let db = Database::open(&config).unwrap();
            let store = EntityStore::initialize(&db).await.unwrap();
            store.save(patient("p1", "active"), Some(1)).await.unwrap();
            db.flush().await.unwrap();
        }

        let db = Database::open(&config).unwrap();
        let store = EntityStore::initialize(&db).await.unwrap();
        let record = store.get_by_id(EntityKind::Patient, "p1").await.unwrap().unwrap();
        assert_eq!(record.version, Some(1));
    }
}
