//! Raw chain logs and their persisted form.

use super::primitives::{BlockNumber, ContractAddress, TimeMs, TxHash};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A log exactly as delivered by the chain source, before decoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLog {
    pub tx_hash: TxHash,
    /// Position of the transaction within its block.
    pub tx_index: u64,
    /// Position of the log within the transaction's log list.
    pub log_index: u64,
    pub block_number: BlockNumber,
    pub contract_address: ContractAddress,
    /// Event selector (first topic).
    pub topic: String,
    /// Encoded event payload.
    pub data: Vec<u8>,
}

impl RawLog {
    pub fn key(&self) -> EventKey {
        EventKey {
            tx_hash: self.tx_hash.clone(),
            log_index: self.log_index,
        }
    }

    pub fn position(&self) -> LogPosition {
        LogPosition {
            block_number: self.block_number,
            tx_index: self.tx_index,
            log_index: self.log_index,
        }
    }
}

/// Idempotency key of an on-chain event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventKey {
    pub tx_hash: TxHash,
    pub log_index: u64,
}

impl std::fmt::Display for EventKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.tx_hash, self.log_index)
    }
}

/// Total order of logs on a chain: block, then transaction, then log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct LogPosition {
    pub block_number: BlockNumber,
    pub tx_index: u64,
    pub log_index: u64,
}

/// Sort logs into chain order. Stable, so equal positions keep delivery order.
pub fn sort_logs_deterministic(logs: &mut [RawLog]) {
    logs.sort_by_key(|l| l.position());
}

/// Persisted record of a log, append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEvent {
    pub id: i64,
    pub tx_hash: TxHash,
    pub log_index: u64,
    pub block_number: BlockNumber,
    pub contract_address: ContractAddress,
    /// `None` when the selector is not in the schema registry.
    pub event_name: Option<String>,
    pub payload: BTreeMap<String, serde_json::Value>,
    pub processed: bool,
    pub error: Option<String>,
    pub received_at: TimeMs,
}
