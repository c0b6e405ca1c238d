//! Application state management for the clinic sync core
//!
//! This crate ties storage and networking together: configuration, the
//! query cache client with merge policies, conflict resolution and the sync
//! engine that drains the mutation queue.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod conflict;
pub mod engine;
pub mod query;

pub use config::{ConfigError, SyncConfig};
pub use conflict::{ConflictResolver, ConflictStrategy, MergeStrategy, ResolutionAction};
pub use engine::{EngineComponents, EngineHandle, SyncEngine, SyncError, SyncEvent, SyncReport};
pub use query::{MergePolicy, QueryClient, QueryError, QueryKey};
