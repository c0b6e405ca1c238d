//! Append-only record of sync outcomes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::Mutex;

use crate::entity::EntityKind;
use crate::error::Result;
use crate::kv::{collections, Collection, Database};

/// Outcome of one delivery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    /// Backend confirmed the operation
    Completed,
    /// Transient failure, attempts remain
    Retrying,
    /// Terminal failure
    Failed,
    /// Backend reported a conflict that stayed unresolved
    Conflict,
    /// Conflict detected and resolved by a strategy
    ConflictResolved,
    /// Postponed without consuming an attempt
    Deferred,
}

impl fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncOutcome::Completed => "completed",
            SyncOutcome::Retrying => "retrying",
            SyncOutcome::Failed => "failed",
            SyncOutcome::Conflict => "conflict",
            SyncOutcome::ConflictResolved => "conflict_resolved",
            SyncOutcome::Deferred => "deferred",
        };
        f.write_str(s)
    }
}

/// One line of the sync log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncLogEntry {
    /// Append order
    pub sequence: u64,
    /// Queue operation this entry describes
    pub operation_id: String,
    /// Target entity kind
    pub entity_type: EntityKind,
    /// Target entity id
    pub entity_id: String,
    /// What happened
    pub outcome: SyncOutcome,
    /// Error or detail text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// When it happened
    pub at: DateTime<Utc>,
}

/// Durable, append-only sync log
pub struct SyncLog {
    db: Database,
    entries: Collection,
    write_lock: Mutex<()>,
}

impl SyncLog {
    /// Open the log collection
    pub fn open(db: &Database) -> Result<Self> {
        let entries = db.collection(collections::SYNC_LOG)?;
        Ok(Self { db: db.clone(), entries, write_lock: Mutex::new(()) })
    }

    /// Append an entry; keys are big-endian sequences so key order is append order
    pub async fn append(
        &self,
        operation_id: &str,
        entity_type: EntityKind,
        entity_id: &str,
        outcome: SyncOutcome,
        message: Option<String>,
    ) -> Result<SyncLogEntry> {
        let entry = SyncLogEntry {
            sequence: self.db.next_sequence()?,
            operation_id: operation_id.to_string(),
            entity_type,
            entity_id: entity_id.to_string(),
            outcome,
            message,
            at: Utc::now(),
        };

        let _guard = self.write_lock.lock().await;
        self.entries.set_raw(&entry.sequence.to_be_bytes(), &entry)?;
        Ok(entry)
    }

    /// Most recent entries, newest first
    pub async fn recent(&self, limit: usize) -> Result<Vec<SyncLogEntry>> {
        self.entries.values_rev(limit)
    }

    /// Every entry for one operation, oldest first
    pub async fn for_operation(&self, operation_id: &str) -> Result<Vec<SyncLogEntry>> {
        let entries: Vec<SyncLogEntry> = self.entries.values()?;
        Ok(entries.into_iter().filter(|e| e.operation_id == operation_id).collect())
    }

    /// Drop the oldest entries so at most `max_entries` remain
    pub async fn prune(&self, max_entries: usize) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let excess = self.entries.len().saturating_sub(max_entries);
        if excess == 0 {
            return Ok(0);
        }
        for key in self.entries.first_keys(excess)? {
            self.entries.remove_raw(&key)?;
        }
        tracing::debug!("Pruned {} sync log entries", excess);
        Ok(excess)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the log is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recent_is_newest_first() {
        let db = Database::in_memory().unwrap();
        let log = SyncLog::open(&db).unwrap();

        log.append("op1", EntityKind::Patient, "p1", SyncOutcome::Retrying, Some("timeout".into()))
            .await
            .unwrap();
        log.append("op1", EntityKind::Patient, "p1", SyncOutcome::Completed, None)
            .await
            .unwrap();
        log.append("op2", EntityKind::Payment, "pay1", SyncOutcome::Failed, None)
            .await
            .unwrap();

        let recent = log.recent(2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].operation_id, "op2");
        assert_eq!(recent[1].outcome, SyncOutcome::Completed);

        let op1 = log.for_operation("op1").await.unwrap();
        let outcomes: Vec<_> = op1.iter().map(|e| e.outcome).collect();
        assert_eq!(outcomes, vec![SyncOutcome::Retrying, SyncOutcome::Completed]);
    }

    #[tokio::test]
    async fn test_prune_keeps_newest() {
        let db = Database::in_memory().unwrap();
        let log = SyncLog::open(&db).unwrap();

        for i in 0..5 {
            log.append(&format!("op{}", i), EntityKind::Document, "d1", SyncOutcome::Completed, None)
                .await
                .unwrap();
        }

        assert_eq!(log.prune(2).await.unwrap(), 3);
        assert_eq!(log.len(), 2);
        let remaining: Vec<_> =
            log.recent(10).await.unwrap().into_iter().map(|e| e.operation_id).collect();
        assert_eq!(remaining, vec!["op4", "op3"]);
        assert_eq!(log.prune(2).await.unwrap(), 0);
    }
}
