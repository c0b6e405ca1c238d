//! Storage error types

use thiserror::Error;

/// Errors raised by the persistence layer
#[derive(Debug, Error)]
pub enum StorageError {
    /// Sled database error
    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The underlying storage could not be opened
    #[error("Storage initialization failed: {0}")]
    Initialization(String),

    /// A record was rejected at the store boundary
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Query against an index the collection does not define
    #[error("Unknown index '{index}' for collection '{collection}'")]
    UnknownIndex {
        /// Collection name
        collection: String,
        /// Requested index name
        index: String,
    },

    /// Illegal queue state transition
    #[error("Invalid status transition for {id}: {from} -> {to}")]
    InvalidTransition {
        /// Operation id
        id: String,
        /// Current status
        from: String,
        /// Requested status
        to: String,
    },

    /// Record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Stored data failed its integrity check
    #[error("Corruption detected: {0}")]
    Corruption(String),
}

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;
