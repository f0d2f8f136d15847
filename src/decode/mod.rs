//! Event schema registry and log decoding.
//!
//! Each known event is described by an [`EventSchema`]; the registry maps the
//! event selector carried in a log's first topic to that schema. Decoding turns
//! the raw payload bytes into a field map checked against the schema, and
//! [`DomainEvent`] lifts that map into a typed variant.

pub mod events;

pub use events::{DomainEvent, DonationReceived};

use crate::domain::{Decimal, RawLog};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

/// Wire type of an event field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Address,
    Decimal,
}

impl FieldKind {
    fn type_name(&self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Address => "address",
            FieldKind::Decimal => "decimal",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
}

impl FieldSpec {
    pub const fn required(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            required: true,
        }
    }

    pub const fn optional(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            required: false,
        }
    }
}

/// Shape of one event as emitted by the funding contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSchema {
    pub name: &'static str,
    pub fields: Vec<FieldSpec>,
}

impl EventSchema {
    pub fn new(name: &'static str, fields: Vec<FieldSpec>) -> Self {
        Self { name, fields }
    }

    /// Canonical signature, e.g. `ProposalRegistered(string round_id,string proposal_id)`.
    pub fn signature(&self) -> String {
        let params: Vec<String> = self
            .fields
            .iter()
            .map(|f| {
                let marker = if f.required { "" } else { "?" };
                format!("{}{} {}", f.kind.type_name(), marker, f.name)
            })
            .collect();
        format!("{}({})", self.name, params.join(","))
    }

    /// Selector carried in the first topic: `0x` + hex(sha256(signature)).
    pub fn selector(&self) -> String {
        let digest = Sha256::digest(self.signature().as_bytes());
        format!("0x{}", hex::encode(digest))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unknown event selector {0}")]
    UnknownSelector(String),
    #[error("payload is not a JSON object: {0}")]
    MalformedPayload(String),
    #[error("{event}: missing field {field}")]
    MissingField { event: String, field: String },
    #[error("{event}: field {field} is not a valid {expected}")]
    InvalidField {
        event: String,
        field: String,
        expected: &'static str,
    },
    #[error("{event}: {reason}")]
    Invalid { event: String, reason: String },
}

/// A log whose payload matched its schema.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedLog {
    pub event_name: &'static str,
    pub payload: BTreeMap<String, serde_json::Value>,
}

/// Maps event selectors to schemas.
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    by_selector: HashMap<String, EventSchema>,
}

impl SchemaRegistry {
    pub fn empty() -> Self {
        Self {
            by_selector: HashMap::new(),
        }
    }

    pub fn register(&mut self, schema: EventSchema) {
        self.by_selector.insert(schema.selector(), schema);
    }

    pub fn schema_for(&self, selector: &str) -> Option<&EventSchema> {
        self.by_selector.get(&selector.to_ascii_lowercase())
    }

    /// Selector of a registered event by name.
    pub fn selector_of(&self, event_name: &str) -> Option<String> {
        self.by_selector
            .iter()
            .find(|(_, s)| s.name == event_name)
            .map(|(sel, _)| sel.clone())
    }

    /// Decode a log's payload against its schema.
    pub fn decode(&self, log: &RawLog) -> Result<DecodedLog, DecodeError> {
        let schema = self
            .schema_for(&log.topic)
            .ok_or_else(|| DecodeError::UnknownSelector(log.topic.clone()))?;

        let value: serde_json::Value = serde_json::from_slice(&log.data)
            .map_err(|e| DecodeError::MalformedPayload(e.to_string()))?;
        let object = value
            .as_object()
            .ok_or_else(|| DecodeError::MalformedPayload("expected object".to_string()))?;

        let mut payload = BTreeMap::new();
        for field in &schema.fields {
            match object.get(field.name) {
                None | Some(serde_json::Value::Null) => {
                    if field.required {
                        return Err(DecodeError::MissingField {
                            event: schema.name.to_string(),
                            field: field.name.to_string(),
                        });
                    }
                }
                Some(v) => {
                    check_kind(schema.name, field, v)?;
                    payload.insert(field.name.to_string(), v.clone());
                }
            }
        }

        Ok(DecodedLog {
            event_name: schema.name,
            payload,
        })
    }
}

impl Default for SchemaRegistry {
    /// Registry with the funding contract's events.
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(EventSchema::new(
            "RoundCreated",
            vec![
                FieldSpec::required("round_id", FieldKind::String),
                FieldSpec::required("matching_pool", FieldKind::Decimal),
            ],
        ));
        registry.register(EventSchema::new(
            "RoundStatusChanged",
            vec![
                FieldSpec::required("round_id", FieldKind::String),
                FieldSpec::required("status", FieldKind::String),
            ],
        ));
        registry.register(EventSchema::new(
            "ProposalRegistered",
            vec![
                FieldSpec::required("round_id", FieldKind::String),
                FieldSpec::required("proposal_id", FieldKind::String),
            ],
        ));
        registry.register(EventSchema::new(
            "DonationReceived",
            vec![
                FieldSpec::required("round_id", FieldKind::String),
                FieldSpec::required("proposal_id", FieldKind::String),
                FieldSpec::required("donor", FieldKind::Address),
                FieldSpec::required("amount", FieldKind::Decimal),
                FieldSpec::optional("trust_score", FieldKind::Decimal),
            ],
        ));
        registry
    }
}

fn check_kind(event: &str, field: &FieldSpec, value: &serde_json::Value) -> Result<(), DecodeError> {
    let invalid = || DecodeError::InvalidField {
        event: event.to_string(),
        field: field.name.to_string(),
        expected: field.kind.type_name(),
    };
    let s = value.as_str().ok_or_else(invalid)?;
    let ok = match field.kind {
        FieldKind::String => !s.trim().is_empty(),
        FieldKind::Address => {
            s.len() > 2 && s.starts_with("0x") && s[2..].chars().all(|c| c.is_ascii_hexdigit())
        }
        // Amounts travel as strings so that no float parser touches them.
        FieldKind::Decimal => Decimal::from_str_canonical(s).is_ok(),
    };
    if ok {
        Ok(())
    } else {
        Err(invalid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ContractAddress, TxHash};

    fn log_with(topic: String, data: serde_json::Value) -> RawLog {
        RawLog {
            tx_hash: TxHash::new("0xaa"),
            tx_index: 0,
            log_index: 0,
            block_number: 1,
            contract_address: ContractAddress::new("0xc0"),
            topic,
            data: serde_json::to_vec(&data).unwrap(),
        }
    }

    #[test]
    fn test_selector_is_stable_and_distinct() {
        let registry = SchemaRegistry::default();
        let a = registry.selector_of("DonationReceived").unwrap();
        let b = registry.selector_of("ProposalRegistered").unwrap();
        assert_ne!(a, b);
        assert_eq!(a.len(), 2 + 64);
        assert_eq!(Some(a.clone()), registry.selector_of("DonationReceived"));
    }

    #[test]
    fn test_signature_marks_optional_fields() {
        let registry = SchemaRegistry::default();
        let sel = registry.selector_of("DonationReceived").unwrap();
        let schema = registry.schema_for(&sel).unwrap();
        assert_eq!(
            schema.signature(),
            "DonationReceived(string round_id,string proposal_id,address donor,decimal amount,decimal? trust_score)"
        );
    }

    #[test]
    fn test_decode_donation() {
        let registry = SchemaRegistry::default();
        let log = log_with(
            registry.selector_of("DonationReceived").unwrap(),
            serde_json::json!({
                "round_id": "r1",
                "proposal_id": "p1",
                "donor": "0xAbC1",
                "amount": "100",
            }),
        );
        let decoded = registry.decode(&log).unwrap();
        assert_eq!(decoded.event_name, "DonationReceived");
        assert_eq!(decoded.payload.len(), 4);
    }

    #[test]
    fn test_unknown_selector_is_decode_error() {
        let registry = SchemaRegistry::default();
        let log = log_with("0xdeadbeef".to_string(), serde_json::json!({}));
        assert!(matches!(
            registry.decode(&log),
            Err(DecodeError::UnknownSelector(_))
        ));
    }

    #[test]
    fn test_missing_required_field() {
        let registry = SchemaRegistry::default();
        let log = log_with(
            registry.selector_of("ProposalRegistered").unwrap(),
            serde_json::json!({ "round_id": "r1" }),
        );
        match registry.decode(&log) {
            Err(DecodeError::MissingField { field, .. }) => assert_eq!(field, "proposal_id"),
            other => panic!("expected MissingField, got {:?}", other),
        }
    }

    #[test]
    fn test_numeric_amount_is_rejected() {
        let registry = SchemaRegistry::default();
        let log = log_with(
            registry.selector_of("RoundCreated").unwrap(),
            serde_json::json!({ "round_id": "r1", "matching_pool": 1000.5 }),
        );
        assert!(matches!(
            registry.decode(&log),
            Err(DecodeError::InvalidField { .. })
        ));
    }

    #[test]
    fn test_non_json_payload() {
        let registry = SchemaRegistry::default();
        let mut log = log_with(
            registry.selector_of("RoundCreated").unwrap(),
            serde_json::json!({}),
        );
        log.data = vec![0xff, 0x00];
        assert!(matches!(
            registry.decode(&log),
            Err(DecodeError::MalformedPayload(_))
        ));
    }
}
