//! Storage layer for the clinic sync core
//!
//! This crate provides the sled-backed key-value layer and the durable
//! components built on it: entity snapshots, the mutation queue, the sync
//! log, conflict records and the query result cache.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod conflicts;
pub mod entity;
pub mod entity_store;
pub mod error;
pub mod kv;
pub mod queue;
pub mod sync_log;

pub use cache::{CacheConfig, CacheError, CacheStore, CleanupReport};
pub use conflicts::{ConflictKind, ConflictRecord, ConflictResolution, ConflictStore, Resolution};
pub use entity::{
    Appointment, Document, EntityKind, EntityPayload, LocalRecord, Notification, Patient, Payment,
};
pub use entity_store::EntityStore;
pub use error::{Result, StorageError};
pub use kv::{collections, Collection, Database, KvConfig};
pub use queue::{
    MutationQueue, NewOperation, OperationKind, OperationStatus, PendingResolution, Priority,
    QueueSummary, RetryLimits, SyncOperation,
};
pub use sync_log::{SyncLog, SyncLogEntry, SyncOutcome};
