//! Entity kinds and payloads mirrored locally for offline access
//!
//! Payloads are a tagged variant per entity kind, so the store can reject
//! malformed records at its boundary instead of accepting arbitrary JSON.
//! Fields beyond the ones the core needs for identity and indexing are kept in
//! `attributes` and passed through untouched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, StorageError};
use crate::kv::collections;

/// Kind of entity mirrored by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// Patient profile
    Patient,
    /// Scheduled appointment
    Appointment,
    /// Uploaded document
    Document,
    /// User-facing notification
    Notification,
    /// Billing payment
    Payment,
}

impl EntityKind {
    /// All kinds, in a stable order
    pub const ALL: [EntityKind; 5] = [
        EntityKind::Patient,
        EntityKind::Appointment,
        EntityKind::Document,
        EntityKind::Notification,
        EntityKind::Payment,
    ];

    /// Name of the collection holding this kind
    pub fn collection(&self) -> &'static str {
        match self {
            EntityKind::Patient => collections::PATIENTS,
            EntityKind::Appointment => collections::APPOINTMENTS,
            EntityKind::Document => collections::DOCUMENTS,
            EntityKind::Notification => collections::NOTIFICATIONS,
            EntityKind::Payment => collections::PAYMENTS,
        }
    }

    /// Secondary indexes maintained for this kind
    pub fn indexes(&self) -> &'static [&'static str] {
        match self {
            EntityKind::Patient => &["email", "status"],
            EntityKind::Appointment => &["patient_id", "provider_id", "status"],
            EntityKind::Document => &["patient_id", "category"],
            EntityKind::Notification => &["recipient_id", "status"],
            EntityKind::Payment => &["patient_id", "status"],
        }
    }

    /// Wire name of this kind
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Patient => "patient",
            EntityKind::Appointment => "appointment",
            EntityKind::Document => "document",
            EntityKind::Notification => "notification",
            EntityKind::Payment => "payment",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        EntityKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| StorageError::Validation(format!("unknown entity type: {}", s)))
    }
}

/// Patient profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patient {
    /// Patient id
    pub id: String,
    /// Display name
    pub full_name: String,
    /// Contact email
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Lifecycle status (e.g. "active", "archived")
    pub status: String,
    /// Pass-through fields
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

/// Scheduled appointment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Appointment {
    /// Appointment id
    pub id: String,
    /// Owning patient
    pub patient_id: String,
    /// Assigned provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    /// Start time
    pub starts_at: DateTime<Utc>,
    /// Lifecycle status (e.g. "scheduled", "cancelled")
    pub status: String,
    /// Pass-through fields
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

/// Uploaded document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Document id
    pub id: String,
    /// Owning patient
    pub patient_id: String,
    /// Document title
    pub title: String,
    /// Category (e.g. "lab-result", "consent")
    pub category: String,
    /// Pass-through fields
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

/// User-facing notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Notification id
    pub id: String,
    /// Receiving user
    pub recipient_id: String,
    /// Message text
    pub message: String,
    /// Delivery status (e.g. "unread", "read")
    pub status: String,
    /// Pass-through fields
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

/// Billing payment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    /// Payment id
    pub id: String,
    /// Paying patient
    pub patient_id: String,
    /// Amount in minor currency units
    pub amount_cents: i64,
    /// ISO currency code
    pub currency: String,
    /// Provider-reported status (e.g. "pending", "succeeded")
    pub status: String,
    /// Pass-through fields
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

/// Tagged payload, one variant per entity kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entity_type", content = "data", rename_all = "snake_case")]
pub enum EntityPayload {
    /// Patient payload
    Patient(Patient),
    /// Appointment payload
    Appointment(Appointment),
    /// Document payload
    Document(Document),
    /// Notification payload
    Notification(Notification),
    /// Payment payload
    Payment(Payment),
}

impl EntityPayload {
    /// Kind of this payload
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityPayload::Patient(_) => EntityKind::Patient,
            EntityPayload::Appointment(_) => EntityKind::Appointment,
            EntityPayload::Document(_) => EntityKind::Document,
            EntityPayload::Notification(_) => EntityKind::Notification,
            EntityPayload::Payment(_) => EntityKind::Payment,
        }
    }

    /// Entity id
    pub fn id(&self) -> &str {
        match self {
            EntityPayload::Patient(p) => &p.id,
            EntityPayload::Appointment(a) => &a.id,
            EntityPayload::Document(d) => &d.id,
            EntityPayload::Notification(n) => &n.id,
            EntityPayload::Payment(p) => &p.id,
        }
    }

    /// Decode an untagged JSON body as the payload of `kind`
    ///
    /// Used for server responses, which carry the bare entity object.
    pub fn from_value(kind: EntityKind, value: Value) -> Result<Self> {
        let payload = match kind {
            EntityKind::Patient => EntityPayload::Patient(serde_json::from_value(value)?),
            EntityKind::Appointment => EntityPayload::Appointment(serde_json::from_value(value)?),
            EntityKind::Document => EntityPayload::Document(serde_json::from_value(value)?),
            EntityKind::Notification => {
                EntityPayload::Notification(serde_json::from_value(value)?)
            }
            EntityKind::Payment => EntityPayload::Payment(serde_json::from_value(value)?),
        };
        payload.validate()?;
        Ok(payload)
    }

    /// Encode the bare entity object (without the kind tag)
    pub fn to_value(&self) -> Result<Value> {
        let value = match self {
            EntityPayload::Patient(p) => serde_json::to_value(p)?,
            EntityPayload::Appointment(a) => serde_json::to_value(a)?,
            EntityPayload::Document(d) => serde_json::to_value(d)?,
            EntityPayload::Notification(n) => serde_json::to_value(n)?,
            EntityPayload::Payment(p) => serde_json::to_value(p)?,
        };
        Ok(value)
    }

    /// Check the fields the core relies on
    pub fn validate(&self) -> Result<()> {
        fn require(kind: EntityKind, field: &str, value: &str) -> Result<()> {
            if value.trim().is_empty() {
                return Err(StorageError::Validation(format!("{} {} must not be empty", kind, field)));
            }
            Ok(())
        }

        let kind = self.kind();
        require(kind, "id", self.id())?;

        match self {
            EntityPayload::Patient(p) => {
                require(kind, "full_name", &p.full_name)?;
                require(kind, "status", &p.status)?;
            }
            EntityPayload::Appointment(a) => {
                require(kind, "patient_id", &a.patient_id)?;
                require(kind, "status", &a.status)?;
            }
            EntityPayload::Document(d) => {
                require(kind, "patient_id", &d.patient_id)?;
                require(kind, "category", &d.category)?;
            }
            EntityPayload::Notification(n) => {
                require(kind, "recipient_id", &n.recipient_id)?;
                require(kind, "status", &n.status)?;
            }
            EntityPayload::Payment(p) => {
                require(kind, "patient_id", &p.patient_id)?;
                require(kind, "status", &p.status)?;
                if p.amount_cents < 0 {
                    return Err(StorageError::Validation(
                        "payment amount_cents must not be negative".to_string(),
                    ));
                }
                if p.currency.len() != 3 {
                    return Err(StorageError::Validation(format!(
                        "payment currency must be a 3-letter code, got '{}'",
                        p.currency
                    )));
                }
            }
        }

        Ok(())
    }

    /// Index name/value pairs for this payload
    pub fn index_entries(&self) -> Vec<(&'static str, String)> {
        let mut entries = Vec::new();
        match self {
            EntityPayload::Patient(p) => {
                if let Some(email) = &p.email {
                    entries.push(("email", email.to_lowercase()));
                }
                entries.push(("status", p.status.clone()));
            }
            EntityPayload::Appointment(a) => {
                entries.push(("patient_id", a.patient_id.clone()));
                if let Some(provider) = &a.provider_id {
                    entries.push(("provider_id", provider.clone()));
                }
                entries.push(("status", a.status.clone()));
            }
            EntityPayload::Document(d) => {
                entries.push(("patient_id", d.patient_id.clone()));
                entries.push(("category", d.category.clone()));
            }
            EntityPayload::Notification(n) => {
                entries.push(("recipient_id", n.recipient_id.clone()));
                entries.push(("status", n.status.clone()));
            }
            EntityPayload::Payment(p) => {
                entries.push(("patient_id", p.patient_id.clone()));
                entries.push(("status", p.status.clone()));
            }
        }
        entries
    }
}

/// Locally stored snapshot of one entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalRecord {
    /// Entity id
    pub id: String,
    /// Entity payload
    pub payload: EntityPayload,
    /// Time of the last local or server-confirmed write
    pub last_sync_at: DateTime<Utc>,
    /// Last server-confirmed version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    /// md5 digest of the payload JSON
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity_proof: Option<String>,
}

impl LocalRecord {
    /// Kind of the stored entity
    pub fn kind(&self) -> EntityKind {
        self.payload.kind()
    }

    /// Digest over the canonical payload encoding
    pub fn compute_proof(payload: &EntityPayload) -> Result<String> {
        let json = serde_json::to_string(payload)?;
        Ok(format!("{:x}", md5::compute(json.as_bytes())))
    }

    /// Verify the stored digest, if any
    pub fn verify(&self) -> Result<()> {
        if let Some(expected) = &self.integrity_proof {
            let computed = Self::compute_proof(&self.payload)?;
            if &computed != expected {
                return Err(StorageError::Corruption(format!(
                    "{} {}: checksum mismatch (expected {}, got {})",
                    self.kind(),
                    self.id,
                    expected,
                    computed
                )));
            }
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_is_tagged() {
        let payload = fixtures::patient("p1", "active");
        let value = serde_json::to_value(&payload).unwrap();

        assert_eq!(value["entity_type"], "patient");
        assert_eq!(value["data"]["id"], "p1");
    }

    #[test]
    fn test_from_value_keeps_extra_attributes() {
        let value = json!({
            "id": "d1",
            "patient_id": "p1",
            "title": "Blood panel",
            "category": "lab-result",
            "page_count": 3
        });

        let payload = EntityPayload::from_value(EntityKind::Document, value).unwrap();
        match &payload {
            EntityPayload::Document(d) => assert_eq!(d.attributes["page_count"], 3),
            other => panic!("unexpected payload {:?}", other),
        }
        assert_eq!(payload.to_value().unwrap()["page_count"], 3);
    }

    #[test]
    fn test_from_value_rejects_wrong_shape() {
        let value = json!({ "id": "x", "title": "missing patient" });
        let result = EntityPayload::from_value(EntityKind::Document, value);
        assert!(matches!(result, Err(StorageError::Serialization(_))));
    }

    #[test]
    fn test_validation_rejects_empty_id() {
        let payload = fixtures::patient("", "active");
        assert!(matches!(payload.validate(), Err(StorageError::Validation(_))));
    }

    #[test]
    fn test_validation_rejects_bad_payment() {
        let payment = EntityPayload::Payment(Payment {
            id: "pay1".to_string(),
            patient_id: "p1".to_string(),
            amount_cents: -5,
            currency: "USD".to_string(),
            status: "pending".to_string(),
            attributes: Map::new(),
        });
        assert!(payment.validate().is_err());
    }

    #[test]
    fn test_kind_round_trips_through_str() {
        for kind in EntityKind::ALL {
            assert_eq!(kind.as_str().parse::<EntityKind>().unwrap(), kind);
        }
        assert!("invoice".parse::<EntityKind>().is_err());
    }

    #[test]
    fn test_record_verify_detects_tampering() {
        let payload = fixtures::patient("p1", "active");
        let mut record = LocalRecord {
            id: "p1".to_string(),
            integrity_proof: Some(LocalRecord::compute_proof(&payload).unwrap()),
            payload,
            last_sync_at: Utc::now(),
            version: None,
        };
        assert!(record.verify().is_ok());

        record.payload = fixtures::patient("p1", "archived");
        assert!(matches!(record.verify(), Err(StorageError::Corruption(_))));
    }
}
