//! Transport contract between the sync core and the backend
//!
//! The core only needs "send operation, get structured result or error".
//! Implementations decide the wire format.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::SendError;

/// Kind of request sent to the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    /// Read-only query
    Query,
    /// Create an entity
    Create,
    /// Update an entity
    Update,
    /// Delete an entity
    Delete,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestKind::Query => write!(f, "query"),
            RequestKind::Create => write!(f, "create"),
            RequestKind::Update => write!(f, "update"),
            RequestKind::Delete => write!(f, "delete"),
        }
    }
}

/// One request to the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationRequest {
    /// Key the backend uses to de-duplicate replays of the same write
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// Operation name (e.g. "createAppointment", "listPatients")
    pub operation: String,
    /// Query or mutation kind
    pub kind: RequestKind,
    /// Entity kind the request targets
    pub entity_type: String,
    /// Entity id, for mutations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    /// Entity payload for mutations, filter arguments for queries
    #[serde(default)]
    pub payload: Value,
    /// Version the write is based on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_version: Option<u64>,
}

impl OperationRequest {
    /// Mutation request carrying an idempotency key
    pub fn mutation(
        idempotency_key: impl Into<String>,
        kind: RequestKind,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        let entity_type = entity_type.into();
        Self {
            idempotency_key: Some(idempotency_key.into()),
            operation: format!("{}:{}", kind, entity_type),
            kind,
            entity_type,
            entity_id: Some(entity_id.into()),
            payload,
            expected_version: None,
        }
    }

    /// Read-only query
    pub fn query(operation: impl Into<String>, entity_type: impl Into<String>, args: Value) -> Self {
        Self {
            idempotency_key: None,
            operation: operation.into(),
            kind: RequestKind::Query,
            entity_type: entity_type.into(),
            entity_id: None,
            payload: args,
            expected_version: None,
        }
    }

    /// Set the version the write is based on
    pub fn with_expected_version(mut self, version: Option<u64>) -> Self {
        self.expected_version = version;
        self
    }

    /// Whether this request changes server state
    pub fn is_mutation(&self) -> bool {
        self.kind != RequestKind::Query
    }
}

/// Successful backend response
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationResponse {
    /// Server-confirmed entity or query result
    pub data: Value,
    /// Server version after the write
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

/// Something that can deliver operations to the backend
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one request
    async fn send(&self, request: &OperationRequest) -> Result<OperationResponse, SendError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_mutation_request() {
        let request = OperationRequest::mutation(
            "op-1",
            RequestKind::Update,
            "appointment",
            "a1",
            json!({"id": "a1"}),
        )
        .with_expected_version(Some(3));

        assert!(request.is_mutation());
        assert_eq!(request.operation, "update:appointment");

        let wire = serde_json::to_value(&request).unwrap();
        assert_eq!(wire["idempotencyKey"], "op-1");
        assert_eq!(wire["expectedVersion"], 3);
        assert_eq!(wire["kind"], "update");
    }

    #[test]
    fn test_query_request_has_no_idempotency_key() {
        let request = OperationRequest::query("listPatients", "patient", json!({"status": "active"}));
        assert!(!request.is_mutation());

        let wire = serde_json::to_value(&request).unwrap();
        assert!(wire.get("idempotencyKey").is_none());
    }

    #[test]
    fn test_response_defaults() {
        let response: OperationResponse = serde_json::from_str("{}").unwrap();
        assert_eq!(response.data, Value::Null);
        assert_eq!(response.version, None);
    }
}
