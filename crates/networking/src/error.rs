//! Error types for the networking layer

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Server-side state reported alongside a conflict
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConflictDetails {
    /// Human-readable reason
    pub message: String,
    /// Current server version of the entity
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_version: Option<u64>,
    /// Current server state of the entity
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_payload: Option<Value>,
    /// The entity no longer exists on the server
    pub deleted: bool,
}

impl fmt::Display for ConflictDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(version) = self.server_version {
            write!(f, " (server version {})", version)?;
        }
        if self.deleted {
            write!(f, " (deleted on server)")?;
        }
        Ok(())
    }
}

/// Failure to deliver an operation
///
/// Exactly one of three classes, which decide what the caller does next.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SendError {
    /// Network or server availability problem; safe to retry
    #[error("Transport error: {0}")]
    Transport(String),

    /// The backend rejected the operation; retrying cannot help
    #[error("Validation error: {0}")]
    Validation(String),

    /// The entity changed on the server since the write was based on it
    #[error("Conflict: {0}")]
    Conflict(ConflictDetails),
}

impl SendError {
    /// Whether retrying may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, SendError::Transport(_))
    }
}

/// Latency probe failure
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProbeError {
    /// Probe target could not be reached
    #[error("Probe target unreachable: {0}")]
    Unreachable(String),

    /// Probe did not answer in time
    #[error("Probe timed out after {0:?}")]
    Timeout(Duration),
}

/// Failure to construct a transport
#[derive(Debug, Error)]
pub enum TransportBuildError {
    /// No endpoint configured
    #[error("At least one endpoint is required")]
    NoEndpoints,

    /// HTTP client construction failed
    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),

    /// A configured header is not valid HTTP
    #[error("Invalid header {0}")]
    InvalidHeader(String),
}
