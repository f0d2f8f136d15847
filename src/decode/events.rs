//! Typed funding events, keyed by event name.

use super::{DecodeError, DecodedLog};
use crate::domain::{Decimal, DonorAddress, ProposalId, RoundId, RoundStatus};
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DonationReceived {
    pub round_id: RoundId,
    pub proposal_id: ProposalId,
    pub donor: DonorAddress,
    pub amount: Decimal,
    #[serde(default)]
    pub trust_score: Option<Decimal>,
}

/// Decoded event payloads as a tagged union over the registered event names.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "event")]
pub enum DomainEvent {
    RoundCreated {
        round_id: RoundId,
        matching_pool: Decimal,
    },
    RoundStatusChanged {
        round_id: RoundId,
        status: RoundStatus,
    },
    ProposalRegistered {
        round_id: RoundId,
        proposal_id: ProposalId,
    },
    DonationReceived(DonationReceived),
}

impl DomainEvent {
    /// Lift a schema-checked payload into its variant and enforce value ranges.
    pub fn from_decoded(decoded: &DecodedLog) -> Result<Self, DecodeError> {
        let mut object: serde_json::Map<String, serde_json::Value> = decoded
            .payload
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        object.insert(
            "event".to_string(),
            serde_json::Value::String(decoded.event_name.to_string()),
        );

        let event: DomainEvent = serde_json::from_value(serde_json::Value::Object(object))
            .map_err(|e| DecodeError::Invalid {
                event: decoded.event_name.to_string(),
                reason: e.to_string(),
            })?;
        event.validate()?;
        Ok(event)
    }

    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::RoundCreated { .. } => "RoundCreated",
            DomainEvent::RoundStatusChanged { .. } => "RoundStatusChanged",
            DomainEvent::ProposalRegistered { .. } => "ProposalRegistered",
            DomainEvent::DonationReceived(_) => "DonationReceived",
        }
    }

    fn validate(&self) -> Result<(), DecodeError> {
        let reject = |reason: &str| {
            Err(DecodeError::Invalid {
                event: self.name().to_string(),
                reason: reason.to_string(),
            })
        };
        match self {
            DomainEvent::RoundCreated { matching_pool, .. } if matching_pool.is_negative() => {
                reject("matching_pool must be >= 0")
            }
            DomainEvent::DonationReceived(d) => {
                if !d.amount.is_positive() {
                    return reject("amount must be > 0");
                }
                if let Some(score) = d.trust_score {
                    if score.is_negative() || score > Decimal::one() {
                        return reject("trust_score must be within [0, 1]");
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}
