//! Persisted conflict records
//!
//! Records are kept after resolution so the history stays auditable; nothing
//! here deletes them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::entity::{EntityKind, EntityPayload};
use crate::error::{Result, StorageError};
use crate::kv::{collections, Collection, Database};

/// What kind of divergence the backend reported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Both sides modified the entity
    UpdateConflict,
    /// One side deleted the entity the other modified
    DeleteConflict,
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictKind::UpdateConflict => write!(f, "update_conflict"),
            ConflictKind::DeleteConflict => write!(f, "delete_conflict"),
        }
    }
}

/// How a conflict was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// The local write was resent and accepted
    LocalWins,
    /// The server state replaced the local snapshot
    ServerWins,
    /// A merge of both sides was written
    Merged,
}

/// Settlement of a conflict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictResolution {
    /// Which side won
    pub strategy: Resolution,
    /// When it was settled
    pub resolved_at: DateTime<Utc>,
}

/// A detected conflict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    /// Conflict id
    pub id: String,
    /// Queue operation that hit the conflict
    pub operation_id: String,
    /// Entity kind
    pub entity_type: EntityKind,
    /// Entity id
    pub entity_id: String,
    /// Version the local write was based on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_version: Option<u64>,
    /// Version reported by the backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_version: Option<u64>,
    /// Update or delete conflict
    pub kind: ConflictKind,
    /// Local side of the conflict
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_payload: Option<EntityPayload>,
    /// Server side of the conflict, as returned by the backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_payload: Option<Value>,
    /// When the conflict was detected
    pub detected_at: DateTime<Utc>,
    /// Set once the conflict is settled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<ConflictResolution>,
}

impl ConflictRecord {
    /// New unresolved conflict with a fresh id
    pub fn new(
        operation_id: impl Into<String>,
        entity_type: EntityKind,
        entity_id: impl Into<String>,
        kind: ConflictKind,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            operation_id: operation_id.into(),
            entity_type,
            entity_id: entity_id.into(),
            local_version: None,
            server_version: None,
            kind,
            local_payload: None,
            server_payload: None,
            detected_at: Utc::now(),
            resolution: None,
        }
    }

    /// Whether a resolution was recorded
    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }
}

/// Durable store of [`ConflictRecord`]s
pub struct ConflictStore {
    records: Collection,
    write_lock: Mutex<()>,
}

impl ConflictStore {
    /// Open the conflict collection
    pub fn open(db: &Database) -> Result<Self> {
        let records = db.collection(collections::CONFLICT_RECORDS)?;
        Ok(Self { records, write_lock: Mutex::new(()) })
    }

    /// Insert or replace a record
    pub async fn save(&self, record: &ConflictRecord) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.records.set(&record.id, record)?;
        Ok(())
    }

    /// Get a conflict by id
    pub async fn get(&self, id: &str) -> Result<Option<ConflictRecord>> {
        self.records.get(id)
    }

    /// Unresolved conflicts, oldest first
    pub async fn unresolved(&self) -> Result<Vec<ConflictRecord>> {
        let mut records: Vec<ConflictRecord> = self.all().await?;
        records.retain(|r| !r.is_resolved());
        Ok(records)
    }

    /// All conflicts, oldest first
    pub async fn all(&self) -> Result<Vec<ConflictRecord>> {
        let mut records: Vec<ConflictRecord> = self.records.values()?;
        records.sort_by_key(|r| r.detected_at);
        Ok(records)
    }

    /// Mark a conflict settled
    pub async fn resolve(&self, id: &str, strategy: Resolution) -> Result<ConflictRecord> {
        let _guard = self.write_lock.lock().await;
        let mut record: ConflictRecord = self
            .records
            .get(id)?
            .ok_or_else(|| StorageError::NotFound(format!("conflict {}", id)))?;

        record.resolution = Some(ConflictResolution { strategy, resolved_at: Utc::now() });
        self.records.set(&record.id, &record)?;
        Ok(record)
    }

    /// Drop a record
    pub async fn remove(&self, id: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        self.records.remove(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_keeps_record() {
        let db = Database::in_memory().unwrap();
        let store = ConflictStore::open(&db).unwrap();

        let mut record =
            ConflictRecord::new("op1", EntityKind::Appointment, "a1", ConflictKind::UpdateConflict);
        record.server_version = Some(3);
        store.save(&record).await.unwrap();
        assert_eq!(store.unresolved().await.unwrap().len(), 1);

        let resolved = store.resolve(&record.id, Resolution::ServerWins).await.unwrap();
        assert!(resolved.is_resolved());
        assert!(store.unresolved().await.unwrap().is_empty());
        assert_eq!(store.all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_remove() {
        let db = Database::in_memory().unwrap();
        let store = ConflictStore::open(&db).unwrap();
        let record = ConflictRecord::new("op1", EntityKind::Patient, "p1", ConflictKind::DeleteConflict);
        store.save(&record).await.unwrap();

        assert!(store.remove(&record.id).await.unwrap());
        assert!(!store.remove(&record.id).await.unwrap());
        assert!(store.all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resolve_missing() {
        let db = Database::in_memory().unwrap();
        let store = ConflictStore::open(&db).unwrap();
        let result = store.resolve("nope", Resolution::LocalWins).await;
        assert!(matches!(result, Err(StorageError::NotFound(_))));
    }
}
