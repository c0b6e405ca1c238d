//! Sync engine
//!
//! Drains the mutation queue against the backend. A pass takes every pending
//! operation in priority order and delivers them one at a time. Within a
//! priority tier, operations go out in the order they were enqueued.
//!
//! Writes to one entity always reach the backend in the order they were
//! issued. A write is pulled forward ahead of its priority slot when a more
//! urgent later write to the same entity needs it, and once a write is held
//! back (deferred, or waiting to be retried) every later write to that entity
//! waits for a later pass. Each confirmed write rebases the queued writes to
//! its entity onto the version the backend now holds.
//!
//! Passes are triggered by the connectivity monitor reporting online, by a
//! periodic interval, and by explicit calls to [`SyncEngine::sync_now`] or
//! [`EngineHandle::trigger`]. Only one pass runs at a time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch, Mutex, Notify};
use tokio::task::JoinHandle;

use networking::{
    ConflictDetails, ConnectivityEvent, ConnectivityMonitor, LinkQuality, NetworkState,
    OperationRequest, OperationResponse, RequestKind, RetryPolicy, SendError, Transport,
};
use storage::{
    collections, Collection, Database, EntityKind, EntityPayload, EntityStore, MutationQueue,
    OperationKind, OperationStatus, PendingResolution, Priority, Resolution, StorageError, SyncLog,
    SyncOperation, SyncOutcome,
};

use crate::config::SyncConfig;
use crate::conflict::{conflict_kind, ConflictResolver, ResolutionAction};
use crate::query::QueryClient;

const LAST_SYNC_KEY: &str = "last_sync_at";

/// Sync engine errors
#[derive(Debug, Error)]
pub enum SyncError {
    /// Local persistence failed
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// A pass was requested while the device is offline
    #[error("Cannot sync while offline")]
    Offline,
}

/// Result type for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Outcome counts of one pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    /// Operations picked up
    pub attempted: usize,
    /// Operations confirmed by the backend
    pub completed: usize,
    /// Operations that ended in terminal failure
    pub failed: usize,
    /// Failed attempts that will be retried
    pub retried: usize,
    /// Conflicts detected
    pub conflicts: usize,
    /// Operations postponed for a better link
    pub deferred: usize,
    /// The pass stopped early because the device went offline
    pub interrupted: bool,
}

/// Progress notification
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// A pass started with this many pending operations
    PassStarted {
        /// Pending operations at pass start
        pending: usize,
    },
    /// An operation was confirmed
    OperationCompleted {
        /// Operation id
        operation_id: String,
    },
    /// An attempt failed and will be retried
    OperationRetrying {
        /// Operation id
        operation_id: String,
        /// Failed attempts so far
        attempt: u32,
        /// Failure message
        error: String,
    },
    /// An operation failed terminally
    OperationFailed {
        /// Operation id
        operation_id: String,
        /// Failure message
        error: String,
    },
    /// An operation was postponed
    OperationDeferred {
        /// Operation id
        operation_id: String,
    },
    /// A conflict was detected
    ConflictDetected {
        /// Conflict record id
        conflict_id: String,
        /// Operation id
        operation_id: String,
        /// Whether a strategy settled it
        resolved: bool,
    },
    /// A pass finished
    PassFinished(SyncReport),
}

/// Everything the engine works with
pub struct EngineComponents {
    /// Opened database, for the `app-state` collection
    pub db: Database,
    /// Entity snapshots
    pub store: Arc<EntityStore>,
    /// Pending writes
    pub queue: Arc<MutationQueue>,
    /// Outcome log
    pub log: Arc<SyncLog>,
    /// Conflict handling
    pub resolver: Arc<ConflictResolver>,
    /// Backend
    pub transport: Arc<dyn Transport>,
    /// Network state and link quality
    pub connectivity: Arc<ConnectivityMonitor>,
    /// Query cache to invalidate after writes
    pub queries: Option<Arc<QueryClient>>,
    /// Shared with every local entity writer; held while a confirmed result
    /// is applied and the entity's queued writes are rebased
    pub write_lock: Arc<Mutex<()>>,
}

/// Where an operation stands after its turn in a pass
enum Flow {
    /// Completed or terminally failed
    Settled,
    /// Back in `pending` for a later pass
    Held,
    /// The device went offline
    Stop,
}

/// Next step after a failed or conflicting attempt
enum Attempt {
    /// Send the (possibly rewritten) operation again now
    Again(SyncOperation),
    /// The operation is done for this pass
    Done(Flow),
}

type EntityRef = (EntityKind, String);

fn entity_ref(op: &SyncOperation) -> EntityRef {
    (op.entity_type, op.entity_id.clone())
}

/// Drains the mutation queue
pub struct SyncEngine {
    store: Arc<EntityStore>,
    queue: Arc<MutationQueue>,
    log: Arc<SyncLog>,
    resolver: Arc<ConflictResolver>,
    transport: Arc<dyn Transport>,
    connectivity: Arc<ConnectivityMonitor>,
    queries: Option<Arc<QueryClient>>,
    write_lock: Arc<Mutex<()>>,
    retry: Arc<dyn RetryPolicy>,
    app_state: Collection,
    config: SyncConfig,
    events: broadcast::Sender<SyncEvent>,
    pass_lock: Mutex<()>,
}

impl SyncEngine {
    /// Create an engine using the backoff from `config`
    pub fn new(components: EngineComponents, config: SyncConfig) -> Result<Self> {
        let app_state = components.db.collection(collections::APP_STATE)?;
        let (events, _) = broadcast::channel(256);

        Ok(Self {
            store: components.store,
            queue: components.queue,
            log: components.log,
            resolver: components.resolver,
            transport: components.transport,
            connectivity: components.connectivity,
            queries: components.queries,
            write_lock: components.write_lock,
            retry: Arc::new(config.backoff()),
            app_state,
            config,
            events,
            pass_lock: Mutex::new(()),
        })
    }

    /// Replace the retry policy
    pub fn with_retry_policy(mut self, retry: Arc<dyn RetryPolicy>) -> Self {
        self.retry = retry;
        self
    }

    /// Subscribe to progress events
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Time of the last pass that ran to the end
    pub fn last_sync_at(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.app_state.get(LAST_SYNC_KEY)?)
    }

    /// Run one pass now
    ///
    /// Waits for a pass already in progress to finish first.
    pub async fn sync_now(&self) -> Result<SyncReport> {
        let _pass = self.pass_lock.lock().await;

        if !self.connectivity.is_online().await {
            return Err(SyncError::Offline);
        }

        // Nothing else processes while we hold the pass lock
        self.queue.recover_interrupted().await?;

        let pending = self.queue.dequeue_pending().await?;
        let quality = self.connectivity.link_quality().await;
        let mut report = SyncReport::default();

        tracing::info!(pending = pending.len(), quality = %quality, "Starting sync pass");
        self.emit(SyncEvent::PassStarted { pending: pending.len() });

        let mut held: HashSet<EntityRef> = HashSet::new();
        for (op, priority) in delivery_order(pending) {
            if !self.connectivity.is_online().await {
                report.interrupted = true;
                break;
            }

            let entity = entity_ref(&op);
            if held.contains(&entity) {
                tracing::debug!(operation_id = %op.id, "Holding write behind an earlier write to the same entity");
                self.defer(&op, "earlier write to the same entity is pending", &mut report).await;
                continue;
            }

            if self.should_defer(&op, priority, quality) {
                tracing::debug!(operation_id = %op.id, size = op.payload_size(), "Deferring large write on poor link");
                self.defer(&op, "poor link quality", &mut report).await;
                held.insert(entity);
                continue;
            }

            report.attempted += 1;
            match self.process(op, &mut report).await? {
                Flow::Settled => {}
                Flow::Held => {
                    held.insert(entity);
                }
                Flow::Stop => {
                    report.interrupted = true;
                    break;
                }
            }
        }

        self.finish_pass(&report).await?;
        self.emit(SyncEvent::PassFinished(report.clone()));
        Ok(report)
    }

    /// Run passes on connectivity changes, on an interval and on demand
    pub fn start(self: &Arc<Self>) -> EngineHandle {
        let engine = Arc::clone(self);
        let wake = Arc::new(Notify::new());
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let mut connectivity = self.connectivity.subscribe();
        let interval = self.config.sync_interval().max(Duration::from_millis(10));
        let task_wake = Arc::clone(&wake);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut watching = true;

            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => {}
                    _ = task_wake.notified() => {}
                    event = connectivity.recv(), if watching => match event {
                        Ok(ConnectivityEvent::StateChanged { to: NetworkState::Online, .. }) => {
                            tracing::debug!("Back online, starting sync pass");
                        }
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => {
                            watching = false;
                            continue;
                        }
                    },
                }

                match engine.sync_now().await {
                    Ok(report) => tracing::debug!(?report, "Sync pass finished"),
                    Err(SyncError::Offline) => tracing::trace!("Skipping sync pass while offline"),
                    Err(e) => tracing::error!("Sync pass failed: {}", e),
                }
            }

            tracing::info!("Sync engine stopped");
        });

        EngineHandle { wake, stop_tx, task }
    }

    /// Whether to postpone `op` for a better link
    ///
    /// `priority` is the operation's own priority, or that of a more urgent
    /// later write to the same entity that pulled it forward.
    fn should_defer(&self, op: &SyncOperation, priority: Priority, quality: LinkQuality) -> bool {
        quality == LinkQuality::Poor
            && priority != Priority::Critical
            && op.payload_size() > self.config.poor_link_payload_limit
    }

    async fn defer(&self, op: &SyncOperation, reason: &str, report: &mut SyncReport) {
        self.record(op, SyncOutcome::Deferred, Some(reason.to_string())).await;
        self.emit(SyncEvent::OperationDeferred { operation_id: op.id.clone() });
        report.deferred += 1;
    }

    async fn process(&self, op: SyncOperation, report: &mut SyncReport) -> Result<Flow> {
        let mut op = self
            .queue
            .update_status(&op.id, OperationStatus::Processing, None)
            .await?;

        loop {
            tracing::debug!(
                operation_id = %op.id,
                revision = op.revision,
                kind = %op.kind,
                entity = %op.entity_type,
                "Sending operation"
            );

            let request = match build_request(&op) {
                Ok(request) => request,
                Err(e) => {
                    self.fail(&op, format!("Cannot encode payload: {}", e), report).await?;
                    return Ok(Flow::Settled);
                }
            };

            let error = match self.send(&request).await {
                Ok(response) => match self.apply_confirmed(&op, response).await {
                    Ok(()) => {
                        let outcome = if op.conflict.is_some() {
                            SyncOutcome::ConflictResolved
                        } else {
                            SyncOutcome::Completed
                        };
                        self.complete(&op, outcome, report).await?;
                        return Ok(Flow::Settled);
                    }
                    Err(e) => {
                        tracing::error!(operation_id = %op.id, "Failed to apply confirmed result: {}", e);
                        format!("Local apply failed: {}", e)
                    }
                },
                Err(SendError::Transport(message)) => message,
                Err(SendError::Validation(message)) => {
                    self.fail(&op, message, report).await?;
                    return Ok(Flow::Settled);
                }
                Err(SendError::Conflict(details)) => {
                    match self.handle_conflict(&op, details, report).await? {
                        Attempt::Again(rewritten) => {
                            op = rewritten;
                            continue;
                        }
                        Attempt::Done(flow) => return Ok(flow),
                    }
                }
            };

            match self.retry_after_failure(&op, error, report).await? {
                Attempt::Again(next) => op = next,
                Attempt::Done(flow) => return Ok(flow),
            }
        }
    }

    /// Record a transient failure and wait for the next attempt
    ///
    /// Returns the operation back in `processing` when it should be retried
    /// now. Otherwise it has failed terminally or, when the device went
    /// offline, returned to `pending`.
    async fn retry_after_failure(
        &self,
        op: &SyncOperation,
        error: String,
        report: &mut SyncReport,
    ) -> Result<Attempt> {
        if !self.connectivity.is_online().await {
            // Interrupted by connectivity loss: not a failed attempt
            self.queue.update_status(&op.id, OperationStatus::Pending, None).await?;
            self.record(op, SyncOutcome::Deferred, Some(format!("went offline: {}", error))).await;
            tracing::info!(operation_id = %op.id, "Went offline mid-pass, operation returned to queue");
            return Ok(Attempt::Done(Flow::Stop));
        }

        let updated = self
            .queue
            .update_status(&op.id, OperationStatus::Failed, Some(error.clone()))
            .await?;

        if updated.status == OperationStatus::Failed {
            tracing::error!(
                operation_id = %op.id,
                attempts = updated.retry_count,
                "Operation failed permanently: {}",
                error
            );
            self.record(op, SyncOutcome::Failed, Some(error.clone())).await;
            self.emit(SyncEvent::OperationFailed { operation_id: op.id.clone(), error });
            report.failed += 1;
            return Ok(Attempt::Done(Flow::Settled));
        }

        let delay = self.retry.delay(updated.retry_count.saturating_sub(1));
        tracing::warn!(
            operation_id = %op.id,
            attempt = updated.retry_count,
            max_retries = updated.max_retries,
            ?delay,
            "Operation failed, retrying: {}",
            error
        );
        self.record(op, SyncOutcome::Retrying, Some(error.clone())).await;
        self.emit(SyncEvent::OperationRetrying {
            operation_id: op.id.clone(),
            attempt: updated.retry_count,
            error,
        });
        report.retried += 1;

        tokio::time::sleep(delay).await;

        // Already back in pending with the failed attempt counted
        if !self.connectivity.is_online().await {
            return Ok(Attempt::Done(Flow::Stop));
        }

        let op = self
            .queue
            .update_status(&op.id, OperationStatus::Processing, None)
            .await?;
        Ok(Attempt::Again(op))
    }

    async fn handle_conflict(
        &self,
        op: &SyncOperation,
        details: ConflictDetails,
        report: &mut SyncReport,
    ) -> Result<Attempt> {
        // Already rewritten once for this conflict
        if let Some(pending) = &op.conflict {
            let reason = format!("conflict persisted after resend: {}", details);
            let kind = conflict_kind(op, &details);
            let flow = self.leave_unresolved(op, &pending.conflict_id, kind, reason, report).await?;
            return Ok(Attempt::Done(flow));
        }

        report.conflicts += 1;
        let record = self.resolver.record(op, &details).await?;

        match self.resolver.decide(op, &record) {
            ResolutionAction::ApplyServer { payload, version, deleted } => {
                let applied = {
                    let _local = self.write_lock.lock().await;
                    match (&payload, deleted) {
                        (_, true) => self.store.delete(op.entity_type, &op.entity_id).await.map(|_| ()),
                        (Some(payload), false) => self.store.save(payload.clone(), version).await.map(|_| ()),
                        (None, false) => Ok(()),
                    }
                };
                if let Err(e) = applied {
                    tracing::error!(operation_id = %op.id, "Failed to apply server state: {}", e);
                    // The next attempt detects the conflict afresh
                    self.resolver.discard(&record.id).await?;
                    let flow = self.after_failed_attempt(op, format!("Local apply failed: {}", e), report).await?;
                    return Ok(Attempt::Done(flow));
                }

                self.invalidate(op);
                self.resolver.mark_resolved(&record.id, Resolution::ServerWins).await?;
                self.emit_conflict(&record.id, op, true);
                self.complete(op, SyncOutcome::ConflictResolved, report).await?;
                Ok(Attempt::Done(Flow::Settled))
            }
            ResolutionAction::Resend { kind, payload, base_version, resolution } => {
                let pending = PendingResolution { conflict_id: record.id.clone(), resolution };
                let rewritten = self
                    .queue
                    .rewrite_for_resend(&op.id, kind, payload, base_version, pending)
                    .await?;
                tracing::info!(
                    operation_id = %op.id,
                    conflict_id = %record.id,
                    ?base_version,
                    "Resending on top of the server version"
                );
                Ok(Attempt::Again(rewritten))
            }
            ResolutionAction::Unresolved { reason } => {
                let flow = self.leave_unresolved(op, &record.id, record.kind, reason, report).await?;
                Ok(Attempt::Done(flow))
            }
        }
    }

    async fn leave_unresolved(
        &self,
        op: &SyncOperation,
        conflict_id: &str,
        kind: storage::ConflictKind,
        reason: String,
        report: &mut SyncReport,
    ) -> Result<Flow> {
        let message = format!(
            "Unresolved {} on {} {}: {}",
            kind, op.entity_type, op.entity_id, reason
        );
        tracing::warn!(operation_id = %op.id, conflict_id, "{}", message);

        self.queue.fail_permanently(&op.id, message.clone()).await?;
        self.record(op, SyncOutcome::Conflict, Some(message.clone())).await;
        self.emit_conflict(conflict_id, op, false);
        self.emit(SyncEvent::OperationFailed { operation_id: op.id.clone(), error: message });
        report.failed += 1;
        Ok(Flow::Settled)
    }

    /// Count a failed attempt without retrying inline
    async fn after_failed_attempt(
        &self,
        op: &SyncOperation,
        error: String,
        report: &mut SyncReport,
    ) -> Result<Flow> {
        if !self.connectivity.is_online().await {
            self.queue.update_status(&op.id, OperationStatus::Pending, None).await?;
            self.record(op, SyncOutcome::Deferred, Some(format!("went offline: {}", error))).await;
            return Ok(Flow::Stop);
        }

        let updated = self
            .queue
            .update_status(&op.id, OperationStatus::Failed, Some(error.clone()))
            .await?;
        if updated.status == OperationStatus::Failed {
            self.record(op, SyncOutcome::Failed, Some(error.clone())).await;
            self.emit(SyncEvent::OperationFailed { operation_id: op.id.clone(), error });
            report.failed += 1;
            Ok(Flow::Settled)
        } else {
            self.record(op, SyncOutcome::Retrying, Some(error.clone())).await;
            self.emit(SyncEvent::OperationRetrying {
                operation_id: op.id.clone(),
                attempt: updated.retry_count,
                error,
            });
            report.retried += 1;
            Ok(Flow::Held)
        }
    }

    async fn send(&self, request: &OperationRequest) -> std::result::Result<OperationResponse, SendError> {
        let timeout = self.config.request_timeout();
        match tokio::time::timeout(timeout, self.transport.send(request)).await {
            Ok(result) => result,
            Err(_) => Err(SendError::Transport(format!("Request timed out after {:?}", timeout))),
        }
    }

    /// Make the entity store reflect a server-confirmed write
    ///
    /// The server's copy wins when it decodes; otherwise the payload that was
    /// sent is stored with the confirmed version. Later writes to the entity
    /// still in the queue are rebased onto the confirmed version, and while
    /// any exist the local snapshot already reflects them, so only its version
    /// moves.
    async fn apply_confirmed(
        &self,
        op: &SyncOperation,
        response: OperationResponse,
    ) -> std::result::Result<(), StorageError> {
        let _local = self.write_lock.lock().await;

        let confirmed_version = match op.kind {
            OperationKind::Delete => None,
            OperationKind::Create | OperationKind::Update => response.version,
        };
        let newer = self
            .queue
            .rebase_pending(op.entity_type, &op.entity_id, confirmed_version)
            .await?;

        if newer > 0 {
            tracing::debug!(operation_id = %op.id, newer, "Later writes queued, keeping local snapshot");
            if op.kind != OperationKind::Delete {
                if let Some(local) = self.store.get_by_id(op.entity_type, &op.entity_id).await? {
                    self.store.save(local.payload, response.version).await?;
                }
            }
        } else if op.kind == OperationKind::Delete {
            self.store.delete(op.entity_type, &op.entity_id).await?;
        } else {
            let confirmed = if response.data.is_object() {
                match EntityPayload::from_value(op.entity_type, response.data) {
                    Ok(payload) if payload.id() == op.entity_id => Some(payload),
                    Ok(_) | Err(_) => {
                        tracing::debug!(operation_id = %op.id, "Server response is not a full entity, keeping sent payload");
                        None
                    }
                }
            } else {
                None
            };

            if let Some(payload) = confirmed.or_else(|| op.payload.clone()) {
                self.store.save(payload, response.version).await?;
            }
        }

        self.invalidate(op);
        Ok(())
    }

    /// Mark `op` completed, settling the conflict it was rewritten for
    async fn complete(&self, op: &SyncOperation, outcome: SyncOutcome, report: &mut SyncReport) -> Result<()> {
        self.queue.update_status(&op.id, OperationStatus::Completed, None).await?;
        if let Some(pending) = &op.conflict {
            self.resolver.mark_resolved(&pending.conflict_id, pending.resolution).await?;
            self.emit_conflict(&pending.conflict_id, op, true);
        }
        self.record(op, outcome, None).await;
        self.emit(SyncEvent::OperationCompleted { operation_id: op.id.clone() });
        report.completed += 1;
        tracing::debug!(operation_id = %op.id, "Operation completed");
        Ok(())
    }

    async fn fail(&self, op: &SyncOperation, error: String, report: &mut SyncReport) -> Result<()> {
        tracing::error!(operation_id = %op.id, "Operation rejected: {}", error);
        self.queue.fail_permanently(&op.id, error.clone()).await?;
        if let Some(pending) = &op.conflict {
            self.emit_conflict(&pending.conflict_id, op, false);
        }
        self.record(op, SyncOutcome::Failed, Some(error.clone())).await;
        self.emit(SyncEvent::OperationFailed { operation_id: op.id.clone(), error });
        report.failed += 1;
        Ok(())
    }

    async fn finish_pass(&self, report: &SyncReport) -> Result<()> {
        let pruned = self.queue.prune_completed(self.config.completed_retention()).await?;
        self.log.prune(self.config.sync_log_max_entries).await?;

        if !report.interrupted {
            self.app_state.set(LAST_SYNC_KEY, &Utc::now())?;
        }

        tracing::info!(
            attempted = report.attempted,
            completed = report.completed,
            failed = report.failed,
            conflicts = report.conflicts,
            deferred = report.deferred,
            pruned,
            interrupted = report.interrupted,
            "Sync pass finished"
        );
        Ok(())
    }

    fn invalidate(&self, op: &SyncOperation) {
        if let Some(queries) = &self.queries {
            if let Err(e) = queries.invalidate_scope(op.entity_type.collection()) {
                tracing::warn!("Failed to invalidate query cache for {}: {}", op.entity_type, e);
            }
        }
    }

    async fn record(&self, op: &SyncOperation, outcome: SyncOutcome, message: Option<String>) {
        if let Err(e) = self
            .log
            .append(&op.id, op.entity_type, &op.entity_id, outcome, message)
            .await
        {
            tracing::warn!(operation_id = %op.id, "Failed to append sync log entry: {}", e);
        }
    }

    fn emit_conflict(&self, conflict_id: &str, op: &SyncOperation, resolved: bool) {
        self.emit(SyncEvent::ConflictDetected {
            conflict_id: conflict_id.to_string(),
            operation_id: op.id.clone(),
            resolved,
        });
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }
}

fn build_request(op: &SyncOperation) -> std::result::Result<OperationRequest, StorageError> {
    let kind = match op.kind {
        OperationKind::Create => RequestKind::Create,
        OperationKind::Update => RequestKind::Update,
        OperationKind::Delete => RequestKind::Delete,
    };
    let body = match &op.payload {
        Some(payload) => payload.to_value()?,
        None => serde_json::Value::Null,
    };

    Ok(OperationRequest::mutation(op.idempotency_key(), kind, op.entity_type.as_str(), &op.entity_id, body)
        .with_expected_version(op.base_version))
}

/// Order a pass delivers `pending` in, with the priority each write goes out at
///
/// Follows the queue's order, except that an older pending write to the same
/// entity is pulled forward to go out just before a later one, at the later
/// write's priority.
fn delivery_order(pending: Vec<SyncOperation>) -> Vec<(SyncOperation, Priority)> {
    let mut by_entity: HashMap<EntityRef, Vec<usize>> = HashMap::new();
    for (i, op) in pending.iter().enumerate() {
        by_entity.entry(entity_ref(op)).or_default().push(i);
    }
    for writes in by_entity.values_mut() {
        writes.sort_by_key(|&i| pending[i].sequence);
    }

    let mut taken = vec![false; pending.len()];
    let mut order = Vec::with_capacity(pending.len());
    for i in 0..pending.len() {
        if taken[i] {
            continue;
        }
        let priority = pending[i].priority;
        let Some(writes) = by_entity.get(&entity_ref(&pending[i])) else {
            continue;
        };
        for &j in writes {
            if pending[j].sequence > pending[i].sequence {
                break;
            }
            if !taken[j] {
                taken[j] = true;
                order.push((j, priority));
            }
        }
    }

    let mut slots: Vec<Option<SyncOperation>> = pending.into_iter().map(Some).collect();
    order
        .into_iter()
        .filter_map(|(i, priority)| slots[i].take().map(|op| (op, priority)))
        .collect()
}

/// Control handle for a running engine loop
pub struct EngineHandle {
    wake: Arc<Notify>,
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl EngineHandle {
    /// Request a pass as soon as the current one (if any) finishes
    pub fn trigger(&self) {
        self.wake.notify_one();
    }

    /// Stop the loop after the current pass and wait for it to exit
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.task.await {
            if !e.is_cancelled() {
                tracing::error!("Sync engine task failed: {}", e);
            }
        }
    }

    /// Whether the loop has exited
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
