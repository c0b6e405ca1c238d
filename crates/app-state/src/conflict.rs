//! Conflict resolution
//!
//! The sync engine hands every conflict response to the [`ConflictResolver`],
//! which persists a [`ConflictRecord`] and decides what happens next according
//! to the configured [`ConflictStrategy`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use networking::ConflictDetails;
use storage::{
    ConflictKind, ConflictRecord, ConflictStore, EntityKind, EntityPayload, OperationKind,
    Resolution, StorageError, SyncOperation,
};

/// How conflicts are settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Resend the local write based on the server version
    LocalWins,
    /// Replace the local snapshot with the server state
    #[default]
    ServerWins,
    /// Combine both sides with the registered [`MergeStrategy`]
    Merge,
    /// Leave every conflict for a person to resolve
    Manual,
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictStrategy::LocalWins => write!(f, "local_wins"),
            ConflictStrategy::ServerWins => write!(f, "server_wins"),
            ConflictStrategy::Merge => write!(f, "merge"),
            ConflictStrategy::Manual => write!(f, "manual"),
        }
    }
}

/// Field-level merge of a local write with the server state
///
/// Domain specific; the core only provides the hook.
pub trait MergeStrategy: Send + Sync {
    /// Merged payload, or `None` to leave the conflict unresolved
    fn merge(&self, kind: EntityKind, local: &EntityPayload, server: &Value) -> Option<EntityPayload>;
}

/// What the engine should do about a conflict
#[derive(Debug, Clone, PartialEq)]
pub enum ResolutionAction {
    /// Send the write again against the server version
    Resend {
        /// Operation kind for the resend
        kind: OperationKind,
        /// Payload to send (absent for deletes)
        payload: Option<EntityPayload>,
        /// Server version the resend is based on
        base_version: Option<u64>,
        /// Recorded once the resend is accepted
        resolution: Resolution,
    },
    /// Make the local snapshot match the server
    ApplyServer {
        /// Server state (absent when deleted)
        payload: Option<EntityPayload>,
        /// Server version
        version: Option<u64>,
        /// The entity no longer exists on the server
        deleted: bool,
    },
    /// Fail the operation and keep the record for manual resolution
    Unresolved {
        /// Why no automatic resolution applied
        reason: String,
    },
}

/// Persists conflicts and applies the configured strategy
pub struct ConflictResolver {
    strategy: ConflictStrategy,
    merger: Option<Arc<dyn MergeStrategy>>,
    store: Arc<ConflictStore>,
}

impl ConflictResolver {
    /// Create a resolver backed by `store`
    pub fn new(strategy: ConflictStrategy, store: Arc<ConflictStore>) -> Self {
        Self { strategy, merger: None, store }
    }

    /// Register the merge hook used by [`ConflictStrategy::Merge`]
    pub fn with_merge_strategy(mut self, merger: Arc<dyn MergeStrategy>) -> Self {
        self.merger = Some(merger);
        self
    }

    /// Active strategy
    pub fn strategy(&self) -> ConflictStrategy {
        self.strategy
    }

    /// Persist a conflict reported for `op`
    pub async fn record(
        &self,
        op: &SyncOperation,
        details: &ConflictDetails,
    ) -> Result<ConflictRecord, StorageError> {
        let kind = conflict_kind(op, details);
        let mut record = ConflictRecord::new(&op.id, op.entity_type, &op.entity_id, kind);
        record.local_version = op.base_version;
        record.server_version = details.server_version;
        record.local_payload = op.payload.clone();
        record.server_payload = details.server_payload.clone();
        self.store.save(&record).await?;

        tracing::warn!(
            conflict_id = %record.id,
            operation_id = %op.id,
            kind = %record.kind,
            entity = %op.entity_type,
            entity_id = %op.entity_id,
            "Conflict detected: {}",
            details
        );
        Ok(record)
    }

    /// Decide how to proceed with a recorded conflict
    ///
    /// A local delete of an entity the server already deleted is settled
    /// under every strategy: both sides agree.
    pub fn decide(&self, op: &SyncOperation, record: &ConflictRecord) -> ResolutionAction {
        let gone_on_server =
            record.kind == ConflictKind::DeleteConflict && record.server_payload.is_none();
        if gone_on_server && op.kind == OperationKind::Delete {
            return ResolutionAction::ApplyServer {
                payload: None,
                version: record.server_version,
                deleted: true,
            };
        }

        match self.strategy {
            ConflictStrategy::LocalWins => {
                // The server dropped the entity; recreate it
                let kind = if gone_on_server { OperationKind::Create } else { op.kind };
                ResolutionAction::Resend {
                    kind,
                    payload: op.payload.clone(),
                    base_version: record.server_version,
                    resolution: Resolution::LocalWins,
                }
            }
            ConflictStrategy::ServerWins => {
                if gone_on_server {
                    return ResolutionAction::ApplyServer {
                        payload: None,
                        version: record.server_version,
                        deleted: true,
                    };
                }
                match self.server_payload(record) {
                    Ok(payload) => ResolutionAction::ApplyServer {
                        payload: Some(payload),
                        version: record.server_version,
                        deleted: false,
                    },
                    Err(reason) => ResolutionAction::Unresolved { reason },
                }
            }
            ConflictStrategy::Merge => {
                let Some(merger) = &self.merger else {
                    return ResolutionAction::Unresolved {
                        reason: "no merge strategy registered".to_string(),
                    };
                };
                let (Some(local), Some(server)) = (&op.payload, &record.server_payload) else {
                    return ResolutionAction::Unresolved {
                        reason: "both sides are needed to merge".to_string(),
                    };
                };
                match merger.merge(op.entity_type, local, server) {
                    Some(merged) => ResolutionAction::Resend {
                        kind: OperationKind::Update,
                        payload: Some(merged),
                        base_version: record.server_version,
                        resolution: Resolution::Merged,
                    },
                    None => ResolutionAction::Unresolved {
                        reason: "merge strategy declined".to_string(),
                    },
                }
            }
            ConflictStrategy::Manual => ResolutionAction::Unresolved {
                reason: "manual resolution required".to_string(),
            },
        }
    }

    /// Record how a conflict was settled
    pub async fn mark_resolved(
        &self,
        conflict_id: &str,
        resolution: Resolution,
    ) -> Result<ConflictRecord, StorageError> {
        let record = self.store.resolve(conflict_id, resolution).await?;
        tracing::info!(conflict_id = %conflict_id, resolution = ?resolution, "Conflict resolved");
        Ok(record)
    }

    /// Forget a conflict that will be detected again on the next attempt
    pub async fn discard(&self, conflict_id: &str) -> Result<(), StorageError> {
        self.store.remove(conflict_id).await?;
        tracing::debug!(conflict_id = %conflict_id, "Conflict discarded");
        Ok(())
    }

    /// Conflicts still waiting for a decision
    pub async fn unresolved(&self) -> Result<Vec<ConflictRecord>, StorageError> {
        self.store.unresolved().await
    }

    fn server_payload(&self, record: &ConflictRecord) -> Result<EntityPayload, String> {
        let value = record
            .server_payload
            .clone()
            .ok_or_else(|| "server state not provided".to_string())?;
        EntityPayload::from_value(record.entity_type, value)
            .map_err(|e| format!("server state unusable: {}", e))
    }
}

/// Kind of conflict the backend reported for `op`
pub fn conflict_kind(op: &SyncOperation, details: &ConflictDetails) -> ConflictKind {
    if details.deleted || op.kind == OperationKind::Delete {
        ConflictKind::DeleteConflict
    } else {
        ConflictKind::UpdateConflict
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::{json, Map};
    use storage::{
        Database, MutationQueue, NewOperation, OperationStatus, Patient, Priority, RetryLimits,
    };

    fn patient(id: &str, status: &str) -> EntityPayload {
        EntityPayload::Patient(Patient {
            id: id.to_string(),
            full_name: "Ada Lovelace".to_string(),
            email: None,
            status: status.to_string(),
            attributes: Map::new(),
        })
    }

    async fn setup(strategy: ConflictStrategy) -> (ConflictResolver, SyncOperation) {
        let db = Database::in_memory().unwrap();
        let store = Arc::new(ConflictStore::open(&db).unwrap());
        let queue = MutationQueue::open(&db, RetryLimits::default()).unwrap();
        let op = queue
            .enqueue(
                NewOperation::upsert(OperationKind::Update, patient("p1", "archived"), Priority::High)
                    .with_base_version(Some(1)),
            )
            .await
            .unwrap();
        assert_eq!(op.status, OperationStatus::Pending);
        (ConflictResolver::new(strategy, store), op)
    }

    fn server_details() -> ConflictDetails {
        ConflictDetails {
            message: "version mismatch".to_string(),
            server_version: Some(4),
            server_payload: Some(json!({
                "id": "p1",
                "full_name": "Ada King",
                "status": "active"
            })),
            deleted: false,
        }
    }

    struct KeepLocalStatus;

    impl MergeStrategy for KeepLocalStatus {
        fn merge(&self, kind: EntityKind, local: &EntityPayload, server: &Value) -> Option<EntityPayload> {
            let mut merged = EntityPayload::from_value(kind, server.clone()).ok()?;
            if let (EntityPayload::Patient(m), EntityPayload::Patient(l)) = (&mut merged, local) {
                m.status = l.status.clone();
            }
            Some(merged)
        }
    }

    #[tokio::test]
    async fn test_record_is_persisted() {
        let (resolver, op) = setup(ConflictStrategy::Manual).await;
        let record = resolver.record(&op, &server_details()).await.unwrap();

        assert_eq!(record.kind, ConflictKind::UpdateConflict);
        assert_eq!(record.local_version, Some(1));
        assert_eq!(record.server_version, Some(4));
        assert_eq!(resolver.unresolved().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_server_wins_applies_server_state() {
        let (resolver, op) = setup(ConflictStrategy::ServerWins).await;
        let record = resolver.record(&op, &server_details()).await.unwrap();

        match resolver.decide(&op, &record) {
            ResolutionAction::ApplyServer { payload: Some(EntityPayload::Patient(p)), version, deleted } => {
                assert_eq!(p.full_name, "Ada King");
                assert_eq!(version, Some(4));
                assert!(!deleted);
            }
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_server_wins_on_server_delete() {
        let (resolver, op) = setup(ConflictStrategy::ServerWins).await;
        let details = ConflictDetails { deleted: true, server_payload: None, ..server_details() };
        let record = resolver.record(&op, &details).await.unwrap();

        assert_eq!(record.kind, ConflictKind::DeleteConflict);
        assert!(matches!(
            resolver.decide(&op, &record),
            ResolutionAction::ApplyServer { deleted: true, .. }
        ));
    }

    #[tokio::test]
    async fn test_delete_of_entity_deleted_on_server_settles() {
        let gone = ConflictDetails { deleted: true, server_payload: None, ..server_details() };

        for strategy in [ConflictStrategy::ServerWins, ConflictStrategy::LocalWins, ConflictStrategy::Manual] {
            let (resolver, mut op) = setup(strategy).await;
            op.kind = OperationKind::Delete;
            op.payload = None;
            let record = resolver.record(&op, &gone).await.unwrap();

            assert_eq!(
                resolver.decide(&op, &record),
                ResolutionAction::ApplyServer { payload: None, version: Some(4), deleted: true },
                "{}",
                strategy
            );
        }
    }

    #[tokio::test]
    async fn test_local_wins_resends_on_server_version() {
        let (resolver, op) = setup(ConflictStrategy::LocalWins).await;
        let record = resolver.record(&op, &server_details()).await.unwrap();

        assert_eq!(
            resolver.decide(&op, &record),
            ResolutionAction::Resend {
                kind: OperationKind::Update,
                payload: op.payload.clone(),
                base_version: Some(4),
                resolution: Resolution::LocalWins,
            }
        );
    }

    #[tokio::test]
    async fn test_merge_uses_registered_strategy() {
        let (resolver, op) = setup(ConflictStrategy::Merge).await;
        let resolver = resolver.with_merge_strategy(Arc::new(KeepLocalStatus));
        let record = resolver.record(&op, &server_details()).await.unwrap();

        match resolver.decide(&op, &record) {
            ResolutionAction::Resend { payload: Some(EntityPayload::Patient(p)), resolution, .. } => {
                assert_eq!(p.full_name, "Ada King");
                assert_eq!(p.status, "archived");
                assert_eq!(resolution, Resolution::Merged);
            }
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_merge_without_strategy_is_unresolved() {
        let (resolver, op) = setup(ConflictStrategy::Merge).await;
        let record = resolver.record(&op, &server_details()).await.unwrap();
        assert!(matches!(resolver.decide(&op, &record), ResolutionAction::Unresolved { .. }));
    }

    #[tokio::test]
    async fn test_manual_then_resolve() {
        let (resolver, op) = setup(ConflictStrategy::Manual).await;
        let record = resolver.record(&op, &server_details()).await.unwrap();
        assert!(matches!(resolver.decide(&op, &record), ResolutionAction::Unresolved { .. }));

        let resolved = resolver.mark_resolved(&record.id, Resolution::LocalWins).await.unwrap();
        assert!(resolved.resolution.unwrap().resolved_at <= Utc::now());
        assert!(resolver.unresolved().await.unwrap().is_empty());
    }
}
