//! Offline-first clinic data core
//!
//! [`OfflineCore`] wires the storage, networking and state crates into one
//! service with an explicit lifecycle:
//!
//! 1. [`OfflineCore::initialize`] opens the database and builds every
//!    component. A storage failure here aborts initialization.
//! 2. [`OfflineCore::start`] launches the sync engine loop and, optionally,
//!    the latency probe.
//! 3. [`OfflineCore::shutdown`] stops both and flushes the database.
//!
//! Writes are optimistic: [`OfflineCore::save`] updates the local snapshot
//! first and queues the change for the backend. Local writes and the sync
//! engine's confirmed results share one write lock, so a queued write always
//! carries the version its entity had when it was made.

#![warn(missing_docs)]
#![warn(clippy::all)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

pub use app_state::{
    ConfigError, ConflictResolver, ConflictStrategy, EngineComponents, MergePolicy, MergeStrategy,
    QueryClient, QueryError, QueryKey, SyncConfig, SyncError, SyncEngine, SyncEvent, SyncReport,
};
pub use networking::{
    ConnectivityEvent, ConnectivityMonitor, LatencyProbe, LinkQuality, NetworkState, Transport,
};
pub use storage::{
    ConflictRecord, EntityKind, EntityPayload, KvConfig, LocalRecord, Priority, QueueSummary,
    SyncLogEntry, SyncOperation,
};

use app_state::EngineHandle;
use networking::ProbeHandle;
use storage::{
    collections, CacheError, CacheStore, ConflictKind, ConflictStore, Database, EntityStore,
    MutationQueue, NewOperation, OperationKind, Resolution, StorageError, SyncLog,
};

/// Errors surfaced by [`OfflineCore`]
#[derive(Debug, Error)]
pub enum CoreError {
    /// The database could not be opened or prepared
    #[error("Initialization failed: {0}")]
    Initialization(#[source] StorageError),

    /// Storage error
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Cache error
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// Configuration error
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Sync engine error
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// Query error
    #[error(transparent)]
    Query(#[from] QueryError),

    /// A manual resolution does not fit the conflict
    #[error("Invalid resolution: {0}")]
    InvalidResolution(String),
}

/// Result type for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

/// Complete configuration of the core
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Database settings
    pub storage: KvConfig,
    /// Sync, cache and connectivity settings
    pub sync: SyncConfig,
}

impl CoreConfig {
    /// Configuration with the database at `path`
    pub fn new(path: impl Into<String>) -> Self {
        Self { storage: KvConfig::new(path), sync: SyncConfig::default() }
    }

    /// Parse and validate a JSON config
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(ConfigError::from)?;
        config.sync.validate()?;
        Ok(config)
    }
}

/// Snapshot for status displays
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreStatus {
    /// Host network state
    pub network: NetworkState,
    /// Measured link quality
    pub quality: LinkQuality,
    /// Queue counts and failure reasons
    pub queue: QueueSummary,
    /// Conflicts waiting for a decision
    pub unresolved_conflicts: usize,
    /// End of the last complete sync pass
    pub last_sync_at: Option<DateTime<Utc>>,
}

/// Decision for a conflict that no strategy settled
#[derive(Debug, Clone, PartialEq)]
pub enum ManualResolution {
    /// Send the local write again on top of the server version
    KeepLocal,
    /// Adopt the server state locally
    KeepServer,
    /// Send a hand-merged payload on top of the server version
    Merged(EntityPayload),
}

/// The offline-first data core
pub struct OfflineCore {
    db: Database,
    config: SyncConfig,
    store: Arc<EntityStore>,
    queue: Arc<MutationQueue>,
    log: Arc<SyncLog>,
    conflicts: Arc<ConflictStore>,
    queries: Arc<QueryClient>,
    connectivity: Arc<ConnectivityMonitor>,
    engine: Arc<SyncEngine>,
    write_lock: Arc<Mutex<()>>,
    engine_handle: Mutex<Option<EngineHandle>>,
    probe_handle: Mutex<Option<ProbeHandle>>,
}

impl OfflineCore {
    /// Open storage and build every component
    pub async fn initialize(config: CoreConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.sync.validate()?;
        let sync = config.sync;

        let db = Database::open(&config.storage).map_err(CoreError::Initialization)?;
        let store = Arc::new(EntityStore::initialize(&db).await.map_err(CoreError::Initialization)?);

        let queue = Arc::new(MutationQueue::open(&db, sync.retry_limits)?);
        queue.recover_interrupted().await?;

        let log = Arc::new(SyncLog::open(&db)?);
        let conflicts = Arc::new(ConflictStore::open(&db)?);

        let cache = Arc::new(CacheStore::persistent(sync.cache_config(), &db)?);
        let responses = Arc::new(CacheStore::persistent_in(
            sync.cache_config().default_ttl(sync.api_cache_ttl()),
            &db,
            collections::API_CACHE,
        )?);
        let queries = Arc::new(
            QueryClient::new(cache, Arc::clone(&transport))
                .with_response_cache(responses, sync.api_cache_ttl())
                .with_request_timeout(sync.request_timeout()),
        );

        let connectivity = Arc::new(ConnectivityMonitor::new(sync.quality_thresholds()));
        let resolver = Arc::new(ConflictResolver::new(sync.conflict_strategy, Arc::clone(&conflicts)));
        let write_lock = Arc::new(Mutex::new(()));

        let engine = SyncEngine::new(
            EngineComponents {
                db: db.clone(),
                store: Arc::clone(&store),
                queue: Arc::clone(&queue),
                log: Arc::clone(&log),
                resolver,
                transport,
                connectivity: Arc::clone(&connectivity),
                queries: Some(Arc::clone(&queries)),
                write_lock: Arc::clone(&write_lock),
            },
            sync.clone(),
        )?;

        tracing::info!(
            path = %config.storage.path,
            strategy = %sync.conflict_strategy,
            "Offline core initialized"
        );

        Ok(Self {
            db,
            config: sync,
            store,
            queue,
            log,
            conflicts,
            queries,
            connectivity,
            engine: Arc::new(engine),
            write_lock,
            engine_handle: Mutex::new(None),
            probe_handle: Mutex::new(None),
        })
    }

    /// Start the engine loop and, if given, periodic latency probing
    ///
    /// Calling this while already running has no effect.
    pub async fn start(&self, probe: Option<Arc<dyn LatencyProbe>>) {
        let mut engine_handle = self.engine_handle.lock().await;
        if engine_handle.is_some() {
            return;
        }
        *engine_handle = Some(self.engine.start());

        if let Some(probe) = probe {
            let handle = self.connectivity.spawn_probe_loop(probe, self.config.probe_interval());
            *self.probe_handle.lock().await = Some(handle);
        }
        tracing::info!("Offline core started");
    }

    /// Stop background work and flush storage
    pub async fn shutdown(&self) -> Result<()> {
        if let Some(probe) = self.probe_handle.lock().await.take() {
            probe.stop();
        }
        if let Some(handle) = self.engine_handle.lock().await.take() {
            handle.stop().await;
        }
        self.db.flush().await?;
        tracing::info!("Offline core shut down");
        Ok(())
    }

    /// Save an entity locally and queue it for the backend
    ///
    /// Creates when the entity is not known locally, otherwise updates on
    /// top of the last server-confirmed version.
    pub async fn save(&self, payload: EntityPayload, priority: Priority) -> Result<SyncOperation> {
        let kind = payload.kind();
        let op = {
            let _local = self.write_lock.lock().await;
            let existing = self.store.get_by_id(kind, payload.id()).await?;
            let (op_kind, base_version) = match &existing {
                Some(record) => (OperationKind::Update, record.version),
                None => (OperationKind::Create, None),
            };

            self.store.save(payload.clone(), base_version).await?;
            self.queue
                .enqueue(NewOperation::upsert(op_kind, payload, priority).with_base_version(base_version))
                .await?
        };

        self.after_local_write(kind).await;
        Ok(op)
    }

    /// Delete an entity locally and queue the deletion
    ///
    /// Returns `None` when the entity is not known locally.
    pub async fn delete(
        &self,
        kind: EntityKind,
        id: &str,
        priority: Priority,
    ) -> Result<Option<SyncOperation>> {
        let op = {
            let _local = self.write_lock.lock().await;
            let Some(existing) = self.store.get_by_id(kind, id).await? else {
                return Ok(None);
            };

            self.store.delete(kind, id).await?;
            self.queue
                .enqueue(NewOperation::delete(kind, id, priority).with_base_version(existing.version))
                .await?
        };

        self.after_local_write(kind).await;
        Ok(Some(op))
    }

    /// Local snapshot of one entity
    pub async fn get(&self, kind: EntityKind, id: &str) -> Result<Option<LocalRecord>> {
        Ok(self.store.get_by_id(kind, id).await?)
    }

    /// Local snapshots matching an indexed field
    pub async fn find_by_index(
        &self,
        kind: EntityKind,
        index: &str,
        value: &str,
    ) -> Result<Vec<LocalRecord>> {
        Ok(self.store.get_all_by_index(kind, index, value).await?)
    }

    /// Every local snapshot of one kind
    pub async fn list(&self, kind: EntityKind) -> Result<Vec<LocalRecord>> {
        Ok(self.store.list(kind).await?)
    }

    /// Run a sync pass now
    pub async fn sync_now(&self) -> Result<SyncReport> {
        Ok(self.engine.sync_now().await?)
    }

    /// Forward a host connectivity signal
    pub async fn set_network_state(&self, state: NetworkState) {
        self.connectivity.set_network_state(state).await;
    }

    /// Current status snapshot
    pub async fn status(&self) -> Result<CoreStatus> {
        Ok(CoreStatus {
            network: self.connectivity.network_state().await,
            quality: self.connectivity.link_quality().await,
            queue: self.queue.summary().await?,
            unresolved_conflicts: self.conflicts.unresolved().await?.len(),
            last_sync_at: self.engine.last_sync_at()?,
        })
    }

    /// Queue a terminally failed operation again
    pub async fn retry_failed(&self, operation_id: &str) -> Result<SyncOperation> {
        let op = self.queue.requeue(operation_id).await?;
        self.trigger().await;
        Ok(op)
    }

    /// Conflicts waiting for a decision
    pub async fn unresolved_conflicts(&self) -> Result<Vec<ConflictRecord>> {
        Ok(self.conflicts.unresolved().await?)
    }

    /// Settle a conflict by hand
    ///
    /// Keeping the server state applies it locally. Keeping the local state
    /// or a merge queues a new write on top of the server version. Returns
    /// the queued operation, if any.
    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        decision: ManualResolution,
    ) -> Result<Option<SyncOperation>> {
        let local = self.write_lock.lock().await;
        let record = self
            .conflicts
            .get(conflict_id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("conflict {}", conflict_id)))?;
        if record.is_resolved() {
            return Err(CoreError::InvalidResolution(format!("conflict {} is already resolved", conflict_id)));
        }

        let priority = self
            .queue
            .get(&record.operation_id)
            .await?
            .map(|op| op.priority)
            .unwrap_or(Priority::High);

        let (resolution, op) = match decision {
            ManualResolution::KeepServer => {
                self.apply_server_side(&record).await?;
                (Resolution::ServerWins, None)
            }
            ManualResolution::KeepLocal => {
                let new_op = match &record.local_payload {
                    Some(payload) => {
                        NewOperation::upsert(self.resend_kind(&record), payload.clone(), priority)
                    }
                    None => NewOperation::delete(record.entity_type, &record.entity_id, priority),
                };
                let op = self.queue.enqueue(new_op.with_base_version(record.server_version)).await?;
                (Resolution::LocalWins, Some(op))
            }
            ManualResolution::Merged(payload) => {
                if payload.kind() != record.entity_type || payload.id() != record.entity_id {
                    return Err(CoreError::InvalidResolution(format!(
                        "merged payload does not match {} {}",
                        record.entity_type, record.entity_id
                    )));
                }
                self.store.save(payload.clone(), record.server_version).await?;
                let op = self
                    .queue
                    .enqueue(
                        NewOperation::upsert(self.resend_kind(&record), payload, priority)
                            .with_base_version(record.server_version),
                    )
                    .await?;
                (Resolution::Merged, Some(op))
            }
        };

        self.conflicts.resolve(conflict_id, resolution).await?;
        drop(local);
        tracing::info!(conflict_id, ?resolution, "Conflict resolved by hand");
        self.after_local_write(record.entity_type).await;
        Ok(op)
    }

    /// Most recent sync log entries, newest first
    pub async fn recent_activity(&self, limit: usize) -> Result<Vec<SyncLogEntry>> {
        Ok(self.log.recent(limit).await?)
    }

    /// Typed key-value access to user preferences
    pub fn preferences(&self) -> Result<storage::Collection> {
        Ok(self.db.collection(collections::USER_PREFERENCES)?)
    }

    /// Read-through query access
    pub fn queries(&self) -> &Arc<QueryClient> {
        &self.queries
    }

    /// Connectivity monitor
    pub fn connectivity(&self) -> &Arc<ConnectivityMonitor> {
        &self.connectivity
    }

    /// Subscribe to sync progress
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<SyncEvent> {
        self.engine.subscribe()
    }

    fn resend_kind(&self, record: &ConflictRecord) -> OperationKind {
        match record.kind {
            ConflictKind::DeleteConflict => OperationKind::Create,
            ConflictKind::UpdateConflict => OperationKind::Update,
        }
    }

    async fn apply_server_side(&self, record: &ConflictRecord) -> Result<()> {
        match &record.server_payload {
            Some(value) => {
                let payload = EntityPayload::from_value(record.entity_type, value.clone())?;
                self.store.save(payload, record.server_version).await?;
            }
            None if record.kind == ConflictKind::DeleteConflict => {
                self.store.delete(record.entity_type, &record.entity_id).await?;
            }
            None => {
                return Err(CoreError::InvalidResolution(format!(
                    "conflict {} carries no server state",
                    record.id
                )));
            }
        }
        Ok(())
    }

    async fn after_local_write(&self, kind: EntityKind) {
        if let Err(e) = self.queries.invalidate_scope(kind.collection()) {
            tracing::warn!("Failed to invalidate query cache for {}: {}", kind, e);
        }
        self.trigger().await;
    }

    async fn trigger(&self) {
        if let Some(handle) = self.engine_handle.lock().await.as_ref() {
            handle.trigger();
        }
    }
}
