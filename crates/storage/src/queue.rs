//! Mutation queue
//!
//! Durable, prioritized staging area for writes that must eventually reach the
//! backend. Operations are stored in their own collection, independent of the
//! entity data they describe.
//!
//! State machine:
//!
//! ```text
//! pending --> processing --> completed
//!                  |
//!                  +--(fail, retry_count < max_retries)--> pending
//!                  +--(fail, retry_count == max_retries)-> failed (terminal)
//!                  +--(deferred)--> pending
//! ```
//!
//! An operation rewritten to settle a conflict keeps its id and bumps its
//! `revision`, which gives the rewritten write its own idempotency key.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::conflicts::Resolution;
use crate::entity::{EntityKind, EntityPayload};
use crate::error::{Result, StorageError};
use crate::kv::{collections, Collection, Database};

/// Delivery priority; declaration order is drain order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Must go out first
    Critical,
    /// User-visible writes
    High,
    /// Default tier
    Medium,
    /// Background housekeeping
    Low,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Critical => write!(f, "critical"),
            Priority::High => write!(f, "high"),
            Priority::Medium => write!(f, "medium"),
            Priority::Low => write!(f, "low"),
        }
    }
}

/// What the operation does to its entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    /// Create a new entity
    Create,
    /// Update an existing entity
    Update,
    /// Delete an entity
    Delete,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Create => write!(f, "create"),
            OperationKind::Update => write!(f, "update"),
            OperationKind::Delete => write!(f, "delete"),
        }
    }
}

/// Lifecycle status of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    /// Waiting for a sync pass
    Pending,
    /// Currently being delivered
    Processing,
    /// Confirmed by the backend
    Completed,
    /// Terminal failure; needs an explicit requeue
    Failed,
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationStatus::Pending => write!(f, "pending"),
            OperationStatus::Processing => write!(f, "processing"),
            OperationStatus::Completed => write!(f, "completed"),
            OperationStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A queued write operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOperation {
    /// Operation id
    pub id: String,
    /// Create, update or delete
    pub kind: OperationKind,
    /// Target entity kind
    pub entity_type: EntityKind,
    /// Target entity id
    pub entity_id: String,
    /// New entity state (absent for deletes)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<EntityPayload>,
    /// Server version the write was based on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_version: Option<u64>,
    /// Delivery priority
    pub priority: Priority,
    /// When the operation was enqueued
    pub enqueued_at: DateTime<Utc>,
    /// Enqueue order tiebreaker
    pub sequence: u64,
    /// Failed delivery attempts so far
    pub retry_count: u32,
    /// Attempts allowed before the operation fails terminally
    pub max_retries: u32,
    /// Current status
    pub status: OperationStatus,
    /// Message of the most recent failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Time of the last status change
    pub updated_at: DateTime<Utc>,
    /// Times the operation was rewritten for a conflict resend
    #[serde(default)]
    pub revision: u32,
    /// Conflict settled once this operation is confirmed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict: Option<PendingResolution>,
}

/// Conflict an operation was rewritten to settle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingResolution {
    /// Conflict record id
    pub conflict_id: String,
    /// Recorded when the rewritten write is accepted
    pub resolution: Resolution,
}

impl SyncOperation {
    /// Key the backend deduplicates deliveries by
    ///
    /// The operation id until the first conflict rewrite, then the id plus
    /// the revision. Replays of the same revision always share a key.
    pub fn idempotency_key(&self) -> String {
        if self.revision == 0 {
            self.id.clone()
        } else {
            format!("{}:{}", self.id, self.revision)
        }
    }

    /// Whether the operation reached a terminal failure
    pub fn is_terminal_failure(&self) -> bool {
        self.status == OperationStatus::Failed
    }

    /// Approximate payload size in bytes
    pub fn payload_size(&self) -> usize {
        self.payload
            .as_ref()
            .and_then(|p| serde_json::to_vec(p).ok())
            .map(|bytes| bytes.len())
            .unwrap_or(0)
    }
}

/// Write intent submitted to [`MutationQueue::enqueue`]
#[derive(Debug, Clone)]
pub struct NewOperation {
    /// Create, update or delete
    pub kind: OperationKind,
    /// Target entity kind
    pub entity_type: EntityKind,
    /// Target entity id
    pub entity_id: String,
    /// New entity state (required for create and update)
    pub payload: Option<EntityPayload>,
    /// Server version the write was based on
    pub base_version: Option<u64>,
    /// Delivery priority
    pub priority: Priority,
    /// Override of the per-priority retry limit
    pub max_retries: Option<u32>,
}

impl NewOperation {
    /// Create or update intent carrying `payload`
    pub fn upsert(kind: OperationKind, payload: EntityPayload, priority: Priority) -> Self {
        Self {
            kind,
            entity_type: payload.kind(),
            entity_id: payload.id().to_string(),
            payload: Some(payload),
            base_version: None,
            priority,
            max_retries: None,
        }
    }

    /// Delete intent
    pub fn delete(entity_type: EntityKind, entity_id: impl Into<String>, priority: Priority) -> Self {
        Self {
            kind: OperationKind::Delete,
            entity_type,
            entity_id: entity_id.into(),
            payload: None,
            base_version: None,
            priority,
            max_retries: None,
        }
    }

    /// Record the server version this write is based on
    pub fn with_base_version(mut self, version: Option<u64>) -> Self {
        self.base_version = version;
        self
    }

    /// Override the retry limit
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    fn validate(&self) -> Result<()> {
        if self.entity_id.trim().is_empty() {
            return Err(StorageError::Validation("entity id must not be empty".to_string()));
        }

        match (&self.kind, &self.payload) {
            (OperationKind::Create | OperationKind::Update, None) => {
                Err(StorageError::Validation(format!("{} operation requires a payload", self.kind)))
            }
            (_, Some(payload)) => {
                payload.validate()?;
                if payload.kind() != self.entity_type {
                    return Err(StorageError::Validation(format!(
                        "payload kind {} does not match entity type {}",
                        payload.kind(),
                        self.entity_type
                    )));
                }
                if payload.id() != self.entity_id {
                    return Err(StorageError::Validation(format!(
                        "payload id {} does not match entity id {}",
                        payload.id(),
                        self.entity_id
                    )));
                }
                Ok(())
            }
            (OperationKind::Delete, None) => Ok(()),
        }
    }
}

/// Retry limits per priority tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryLimits {
    /// Limit for critical operations
    pub critical: u32,
    /// Limit for high priority operations
    pub high: u32,
    /// Limit for medium priority operations
    pub medium: u32,
    /// Limit for low priority operations
    pub low: u32,
}

impl Default for RetryLimits {
    fn default() -> Self {
        Self { critical: 10, high: 5, medium: 3, low: 2 }
    }
}

impl RetryLimits {
    /// Same limit for every tier
    pub fn uniform(limit: u32) -> Self {
        Self { critical: limit, high: limit, medium: limit, low: limit }
    }

    /// Limit for `priority`
    pub fn for_priority(&self, priority: Priority) -> u32 {
        match priority {
            Priority::Critical => self.critical,
            Priority::High => self.high,
            Priority::Medium => self.medium,
            Priority::Low => self.low,
        }
    }
}

/// Per-status counts plus the failure reasons a UI needs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSummary {
    /// Operations waiting for a pass
    pub pending: usize,
    /// Operations in flight
    pub processing: usize,
    /// Confirmed operations not yet pruned
    pub completed: usize,
    /// Terminally failed operations
    pub failed: usize,
    /// `(operation id, last error)` for every terminal failure
    pub failures: Vec<(String, String)>,
}

impl fmt::Display for QueueSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} pending, {} failed", self.pending, self.failed)?;
        if let Some((_, reason)) = self.failures.first() {
            write!(f, ": {}", reason)?;
        }
        Ok(())
    }
}

/// Durable priority queue of pending writes
pub struct MutationQueue {
    db: Database,
    ops: Collection,
    limits: RetryLimits,
    write_lock: Mutex<()>,
}

impl MutationQueue {
    /// Open the queue collection
    pub fn open(db: &Database, limits: RetryLimits) -> Result<Self> {
        let ops = db.collection(collections::SYNC_QUEUE)?;
        Ok(Self { db: db.clone(), ops, limits, write_lock: Mutex::new(()) })
    }

    /// Retry limits applied to new operations
    pub fn limits(&self) -> RetryLimits {
        self.limits
    }

    /// Validate and persist a new operation
    pub async fn enqueue(&self, new_op: NewOperation) -> Result<SyncOperation> {
        new_op.validate()?;

        let now = Utc::now();
        let op = SyncOperation {
            id: Uuid::new_v4().to_string(),
            kind: new_op.kind,
            entity_type: new_op.entity_type,
            entity_id: new_op.entity_id,
            payload: new_op.payload,
            base_version: new_op.base_version,
            priority: new_op.priority,
            enqueued_at: now,
            sequence: self.db.next_sequence()?,
            retry_count: 0,
            max_retries: new_op
                .max_retries
                .unwrap_or_else(|| self.limits.for_priority(new_op.priority)),
            status: OperationStatus::Pending,
            last_error: None,
            updated_at: now,
            revision: 0,
            conflict: None,
        };

        let _guard = self.write_lock.lock().await;
        self.ops.set(&op.id, &op)?;
        self.db.flush().await?;

        tracing::debug!(
            operation_id = %op.id,
            kind = %op.kind,
            entity = %op.entity_type,
            priority = %op.priority,
            "Enqueued operation"
        );
        Ok(op)
    }

    /// Pending operations in drain order: priority, then enqueue time
    pub async fn dequeue_pending(&self) -> Result<Vec<SyncOperation>> {
        let mut pending = self.list(Some(OperationStatus::Pending)).await?;
        pending.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.enqueued_at.cmp(&b.enqueued_at))
                .then(a.sequence.cmp(&b.sequence))
        });
        Ok(pending)
    }

    /// Drive the state machine for operation `id`
    ///
    /// A transition into `Failed` counts one failed attempt. The operation
    /// returns to `Pending` while attempts remain and stays `Failed` once
    /// `retry_count` reaches `max_retries`.
    pub async fn update_status(
        &self,
        id: &str,
        status: OperationStatus,
        error: Option<String>,
    ) -> Result<SyncOperation> {
        self.modify(id, |op| {
            use OperationStatus::*;
            match (op.status, status) {
                (Pending, Processing) | (Processing, Pending) => {
                    op.status = status;
                }
                (Processing, Completed) => {
                    op.status = Completed;
                    op.last_error = None;
                }
                (Processing, Failed) => {
                    op.retry_count = (op.retry_count + 1).min(op.max_retries);
                    op.last_error = error;
                    op.status = if op.retry_count < op.max_retries { Pending } else { Failed };
                }
                (from, to) => return Err(invalid_transition(op, from, to)),
            }
            Ok(())
        })
        .await
    }

    /// Fail an in-flight operation without further retries
    ///
    /// Used for backend validation errors and unresolved conflicts.
    pub async fn fail_permanently(&self, id: &str, error: impl Into<String>) -> Result<SyncOperation> {
        let error = error.into();
        self.modify(id, move |op| {
            if op.status != OperationStatus::Processing {
                return Err(invalid_transition(op, op.status, OperationStatus::Failed));
            }
            op.retry_count = (op.retry_count + 1).min(op.max_retries);
            op.status = OperationStatus::Failed;
            op.last_error = Some(error.clone());
            Ok(())
        })
        .await
    }

    /// Rewrite an in-flight operation to resend it on top of the server state
    ///
    /// The operation stays `Processing` and its revision is bumped, so the
    /// rewritten write is delivered under a new idempotency key that survives
    /// later passes.
    pub async fn rewrite_for_resend(
        &self,
        id: &str,
        kind: OperationKind,
        payload: Option<EntityPayload>,
        base_version: Option<u64>,
        conflict: PendingResolution,
    ) -> Result<SyncOperation> {
        let op = self
            .modify(id, move |op| {
                if op.status != OperationStatus::Processing {
                    return Err(invalid_transition(op, op.status, OperationStatus::Processing));
                }
                op.kind = kind;
                op.payload = payload;
                op.base_version = base_version;
                op.revision += 1;
                op.conflict = Some(conflict);
                Ok(())
            })
            .await?;
        tracing::debug!(operation_id = %id, revision = op.revision, "Rewrote operation for resend");
        Ok(op)
    }

    /// Move every pending write to an entity onto `version`
    ///
    /// Called when an earlier write to the same entity is confirmed, so the
    /// later ones carry the version the backend now holds. Returns how many
    /// operations were rebased.
    pub async fn rebase_pending(
        &self,
        entity_type: EntityKind,
        entity_id: &str,
        version: Option<u64>,
    ) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let ops: Vec<SyncOperation> = self.ops.values()?;
        let now = Utc::now();
        let mut rebased = 0;
        for mut op in ops {
            if op.status != OperationStatus::Pending
                || op.entity_type != entity_type
                || op.entity_id != entity_id
            {
                continue;
            }
            op.base_version = version;
            op.updated_at = now;
            self.ops.set(&op.id, &op)?;
            rebased += 1;
        }

        if rebased > 0 {
            tracing::debug!(entity = %entity_type, entity_id, ?version, "Rebased {} pending operations", rebased);
        }
        Ok(rebased)
    }

    /// Explicitly re-enqueue a terminally failed operation
    pub async fn requeue(&self, id: &str) -> Result<SyncOperation> {
        let op = self
            .modify(id, |op| {
                if op.status != OperationStatus::Failed {
                    return Err(invalid_transition(op, op.status, OperationStatus::Pending));
                }
                op.status = OperationStatus::Pending;
                op.retry_count = 0;
                Ok(())
            })
            .await?;
        tracing::info!(operation_id = %id, "Requeued failed operation");
        Ok(op)
    }

    /// Return operations left `Processing` by an interrupted run to `Pending`
    pub async fn recover_interrupted(&self) -> Result<usize> {
        let stuck = self.list(Some(OperationStatus::Processing)).await?;
        for op in &stuck {
            self.update_status(&op.id, OperationStatus::Pending, None).await?;
        }
        if !stuck.is_empty() {
            tracing::warn!("Recovered {} interrupted operations", stuck.len());
        }
        Ok(stuck.len())
    }

    /// Remove completed operations last updated before `now - older_than`
    ///
    /// Only the sync engine calls this, after a pass.
    pub async fn prune_completed(&self, older_than: std::time::Duration) -> Result<usize> {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(older_than).unwrap_or_else(|_| ChronoDuration::zero());

        let _guard = self.write_lock.lock().await;
        let ops: Vec<SyncOperation> = self.ops.values()?;
        let mut removed = 0;
        for op in ops {
            if op.status == OperationStatus::Completed && op.updated_at <= cutoff {
                self.ops.remove(&op.id)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Get an operation by id
    pub async fn get(&self, id: &str) -> Result<Option<SyncOperation>> {
        self.ops.get(id)
    }

    /// All operations, optionally filtered by status
    pub async fn list(&self, status: Option<OperationStatus>) -> Result<Vec<SyncOperation>> {
        let ops: Vec<SyncOperation> = self.ops.values()?;
        Ok(match status {
            Some(status) => ops.into_iter().filter(|op| op.status == status).collect(),
            None => ops,
        })
    }

    /// Status counts and failure reasons
    pub async fn summary(&self) -> Result<QueueSummary> {
        let mut summary = QueueSummary::default();
        let mut ops = self.list(None).await?;
        ops.sort_by_key(|op| op.sequence);

        for op in ops {
            match op.status {
                OperationStatus::Pending => summary.pending += 1,
                OperationStatus::Processing => summary.processing += 1,
                OperationStatus::Completed => summary.completed += 1,
                OperationStatus::Failed => {
                    summary.failed += 1;
                    summary
                        .failures
                        .push((op.id, op.last_error.unwrap_or_else(|| "unknown error".to_string())));
                }
            }
        }
        Ok(summary)
    }

    async fn modify<F>(&self, id: &str, f: F) -> Result<SyncOperation>
    where
        F: FnOnce(&mut SyncOperation) -> Result<()>,
    {
        let _guard = self.write_lock.lock().await;
        let mut op: SyncOperation = self
            .ops
            .get(id)?
            .ok_or_else(|| StorageError::NotFound(format!("operation {}", id)))?;

        f(&mut op)?;
        op.updated_at = Utc::now();
        self.ops.set(&op.id, &op)?;
        Ok(op)
    }
}

fn invalid_transition(op: &SyncOperation, from: OperationStatus, to: OperationStatus) -> StorageError {
    StorageError::InvalidTransition { id: op.id.clone(), from: from.to_string(), to: to.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::fixtures::{appointment, patient};

    fn queue() -> MutationQueue {
        let db = Database::in_memory().unwrap();
        MutationQueue::open(&db, RetryLimits::uniform(3)).unwrap()
    }

    fn create(id: &str, priority: Priority) -> NewOperation {
        NewOperation::upsert(OperationKind::Create, patient(id, "active"), priority)
    }

    #[tokio::test]
    async fn test_enqueue_assigns_defaults() {
        let queue = queue();
        let op = queue.enqueue(create("p1", Priority::High)).await.unwrap();

        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(op.retry_count, 0);
        assert_eq!(op.max_retries, 3);
        assert!(Uuid::parse_str(&op.id).is_ok());
        assert_eq!(queue.get(&op.id).await.unwrap(), Some(op));
    }

    #[tokio::test]
    async fn test_max_retries_follows_priority_tier() {
        let db = Database::in_memory().unwrap();
        let queue = MutationQueue::open(&db, RetryLimits::default()).unwrap();

        let critical = queue.enqueue(create("p1", Priority::Critical)).await.unwrap();
        let low = queue.enqueue(create("p2", Priority::Low)).await.unwrap();
        let custom = queue
            .enqueue(create("p3", Priority::Low).with_max_retries(7))
            .await
            .unwrap();

        assert_eq!(critical.max_retries, 10);
        assert_eq!(low.max_retries, 2);
        assert_eq!(custom.max_retries, 7);
    }

    #[tokio::test]
    async fn test_dequeue_orders_by_priority_then_fifo() {
        let queue = queue();
        let low = queue.enqueue(create("p1", Priority::Low)).await.unwrap();
        let critical = queue.enqueue(create("p2", Priority::Critical)).await.unwrap();
        let medium = queue.enqueue(create("p3", Priority::Medium)).await.unwrap();
        let medium_later = queue.enqueue(create("p4", Priority::Medium)).await.unwrap();

        let order: Vec<String> =
            queue.dequeue_pending().await.unwrap().into_iter().map(|op| op.id).collect();
        assert_eq!(order, vec![critical.id, medium.id, medium_later.id, low.id]);
    }

    #[tokio::test]
    async fn test_enqueue_rejects_mismatched_payload() {
        let queue = queue();

        let mut op = create("p1", Priority::High);
        op.entity_type = EntityKind::Appointment;
        assert!(matches!(queue.enqueue(op).await, Err(StorageError::Validation(_))));

        let mut op = NewOperation::upsert(
            OperationKind::Update,
            appointment("a1", "p1", "scheduled"),
            Priority::High,
        );
        op.payload = None;
        assert!(matches!(queue.enqueue(op).await, Err(StorageError::Validation(_))));
    }

    #[tokio::test]
    async fn test_failed_attempts_return_to_pending_until_exhausted() {
        let queue = queue();
        let op = queue.enqueue(create("p1", Priority::High)).await.unwrap();

        for attempt in 1..=3u32 {
            queue.update_status(&op.id, OperationStatus::Processing, None).await.unwrap();
            let updated = queue
                .update_status(&op.id, OperationStatus::Failed, Some("timeout".to_string()))
                .await
                .unwrap();
            assert_eq!(updated.retry_count, attempt);
            if attempt < 3 {
                assert_eq!(updated.status, OperationStatus::Pending);
            } else {
                assert_eq!(updated.status, OperationStatus::Failed);
            }
        }

        // Terminal: no automatic pickup
        let result = queue.update_status(&op.id, OperationStatus::Processing, None).await;
        assert!(matches!(result, Err(StorageError::InvalidTransition { .. })));
        assert!(queue.dequeue_pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_completion_clears_error() {
        let queue = queue();
        let op = queue.enqueue(create("p1", Priority::High)).await.unwrap();

        queue.update_status(&op.id, OperationStatus::Processing, None).await.unwrap();
        queue
            .update_status(&op.id, OperationStatus::Failed, Some("boom".to_string()))
            .await
            .unwrap();
        queue.update_status(&op.id, OperationStatus::Processing, None).await.unwrap();
        let done = queue.update_status(&op.id, OperationStatus::Completed, None).await.unwrap();

        assert_eq!(done.status, OperationStatus::Completed);
        assert_eq!(done.last_error, None);
        assert_eq!(done.retry_count, 1);
    }

    #[tokio::test]
    async fn test_pending_cannot_complete_directly() {
        let queue = queue();
        let op = queue.enqueue(create("p1", Priority::High)).await.unwrap();
        let result = queue.update_status(&op.id, OperationStatus::Completed, None).await;
        assert!(matches!(result, Err(StorageError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn test_fail_permanently_and_requeue() {
        let queue = queue();
        let op = queue.enqueue(create("p1", Priority::High)).await.unwrap();

        queue.update_status(&op.id, OperationStatus::Processing, None).await.unwrap();
        let failed = queue.fail_permanently(&op.id, "invalid date of birth").await.unwrap();
        assert_eq!(failed.status, OperationStatus::Failed);
        assert!(failed.retry_count <= failed.max_retries);

        let requeued = queue.requeue(&op.id).await.unwrap();
        assert_eq!(requeued.status, OperationStatus::Pending);
        assert_eq!(requeued.retry_count, 0);
    }

    #[tokio::test]
    async fn test_recover_interrupted() {
        let queue = queue();
        let op = queue.enqueue(create("p1", Priority::High)).await.unwrap();
        queue.update_status(&op.id, OperationStatus::Processing, None).await.unwrap();

        assert_eq!(queue.recover_interrupted().await.unwrap(), 1);
        let op = queue.get(&op.id).await.unwrap().unwrap();
        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(op.retry_count, 0);
    }

    #[tokio::test]
    async fn test_prune_completed_only() {
        let queue = queue();
        let done = queue.enqueue(create("p1", Priority::High)).await.unwrap();
        let waiting = queue.enqueue(create("p2", Priority::High)).await.unwrap();

        queue.update_status(&done.id, OperationStatus::Processing, None).await.unwrap();
        queue.update_status(&done.id, OperationStatus::Completed, None).await.unwrap();

        let removed = queue.prune_completed(std::time::Duration::ZERO).await.unwrap();
        assert_eq!(removed, 1);
        assert!(queue.get(&done.id).await.unwrap().is_none());
        assert!(queue.get(&waiting.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_summary_reports_failures() {
        let queue = queue();
        for id in ["p1", "p2", "p3"] {
            queue.enqueue(create(id, Priority::Medium)).await.unwrap();
        }
        let failing = queue.enqueue(create("p4", Priority::Medium)).await.unwrap();
        queue.update_status(&failing.id, OperationStatus::Processing, None).await.unwrap();
        queue.fail_permanently(&failing.id, "card declined").await.unwrap();

        let summary = queue.summary().await.unwrap();
        assert_eq!(summary.pending, 3);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.to_string(), "3 pending, 1 failed: card declined");
    }

    #[tokio::test]
    async fn test_rebase_pending_touches_only_pending_writes_to_entity() {
        let queue = queue();
        let in_flight = queue.enqueue(create("p1", Priority::High)).await.unwrap();
        let later = queue
            .enqueue(NewOperation::upsert(OperationKind::Update, patient("p1", "archived"), Priority::Low))
            .await
            .unwrap();
        let other = queue.enqueue(create("p2", Priority::High)).await.unwrap();
        queue.update_status(&in_flight.id, OperationStatus::Processing, None).await.unwrap();

        let rebased = queue.rebase_pending(EntityKind::Patient, "p1", Some(4)).await.unwrap();
        assert_eq!(rebased, 1);
        assert_eq!(queue.get(&later.id).await.unwrap().unwrap().base_version, Some(4));
        assert_eq!(queue.get(&in_flight.id).await.unwrap().unwrap().base_version, None);
        assert_eq!(queue.get(&other.id).await.unwrap().unwrap().base_version, None);
    }

    #[tokio::test]
    async fn test_rewrite_for_resend_changes_key_once_per_revision() {
        let queue = queue();
        let op = queue.enqueue(create("p1", Priority::High)).await.unwrap();
        assert_eq!(op.idempotency_key(), op.id);

        let pending = PendingResolution { conflict_id: "c1".to_string(), resolution: Resolution::LocalWins };
        let result = queue
            .rewrite_for_resend(&op.id, OperationKind::Update, op.payload.clone(), Some(3), pending.clone())
            .await;
        assert!(matches!(result, Err(StorageError::InvalidTransition { .. })));

        queue.update_status(&op.id, OperationStatus::Processing, None).await.unwrap();
        let rewritten = queue
            .rewrite_for_resend(&op.id, OperationKind::Update, op.payload.clone(), Some(3), pending.clone())
            .await
            .unwrap();
        assert_eq!(rewritten.revision, 1);
        assert_eq!(rewritten.base_version, Some(3));
        assert_eq!(rewritten.conflict, Some(pending));
        assert_eq!(rewritten.idempotency_key(), format!("{}:1", op.id));

        // A failed attempt keeps the rewrite and its key
        let retried = queue
            .update_status(&op.id, OperationStatus::Failed, Some("timeout".to_string()))
            .await
            .unwrap();
        assert_eq!(retried.idempotency_key(), rewritten.idempotency_key());
        assert_eq!(retried.base_version, Some(3));
    }

    #[tokio::test]
    async fn test_queue_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = crate::kv::KvConfig::new(dir.path().join("db").to_string_lossy().to_string());

        let id = {
            let db = Database::open(&config).unwrap();
            let queue = MutationQueue::open(&db, RetryLimits::default()).unwrap();
            queue.enqueue(create("p1", Priority::High)).await.unwrap().id
        };

        let db = Database::open(&config).unwrap();
        let queue = MutationQueue::open(&db, RetryLimits::default()).unwrap();
        let pending = queue.dequeue_pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);
    }
}
