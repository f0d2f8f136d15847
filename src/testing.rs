//! Builders for encoded funding-contract logs, shared by unit and integration tests.

use crate::decode::SchemaRegistry;
use crate::domain::{BlockNumber, ContractAddress, RawLog, RoundStatus, TxHash};

/// Produces logs for one contract at strictly increasing chain positions.
///
/// Each log gets its own transaction hash and block unless `at_block` pins
/// the next logs to a block.
#[derive(Debug)]
pub struct LogFactory {
    contract: ContractAddress,
    registry: SchemaRegistry,
    next_block: BlockNumber,
    pinned: Option<(BlockNumber, u64)>,
    seq: u64,
}

impl LogFactory {
    pub fn new(contract: &str) -> Self {
        Self {
            contract: ContractAddress::new(contract),
            registry: SchemaRegistry::default(),
            next_block: 1,
            pinned: None,
            seq: 0,
        }
    }

    /// Emit subsequent logs in `block`, as consecutive logs of one transaction.
    pub fn at_block(&mut self, block: BlockNumber) -> &mut Self {
        self.pinned = Some((block, 0));
        self.next_block = self.next_block.max(block + 1);
        self
    }

    /// Go back to one block per log, starting after the highest block used so far.
    pub fn unpin(&mut self) -> &mut Self {
        self.pinned = None;
        self
    }

    pub fn contract(&self) -> &ContractAddress {
        &self.contract
    }

    /// Encode `payload` as event `event_name`.
    pub fn log(&mut self, event_name: &str, payload: serde_json::Value) -> RawLog {
        let topic = self.registry.selector_of(event_name).unwrap_or_default();
        self.raw(topic, payload.to_string().into_bytes())
    }

    /// A log with an arbitrary selector and payload bytes.
    pub fn raw(&mut self, topic: String, data: Vec<u8>) -> RawLog {
        self.seq += 1;
        let (block_number, tx_hash, log_index) = match self.pinned.as_mut() {
            Some((block, idx)) => {
                let log_index = *idx;
                *idx += 1;
                (*block, format!("0x{:064x}", *block), log_index)
            }
            None => {
                let block = self.next_block;
                self.next_block += 1;
                (block, format!("0x{:064x}", 1_000_000 + self.seq), 0)
            }
        };
        RawLog {
            tx_hash: TxHash::new(tx_hash),
            tx_index: 0,
            log_index,
            block_number,
            contract_address: self.contract.clone(),
            topic,
            data,
        }
    }

    pub fn round_created(&mut self, round_id: &str, matching_pool: &str) -> RawLog {
        self.log(
            "RoundCreated",
            serde_json::json!({ "round_id": round_id, "matching_pool": matching_pool }),
        )
    }

    pub fn status(&mut self, round_id: &str, status: RoundStatus) -> RawLog {
        self.log(
            "RoundStatusChanged",
            serde_json::json!({ "round_id": round_id, "status": status.as_str() }),
        )
    }

    pub fn proposal(&mut self, round_id: &str, proposal_id: &str) -> RawLog {
        self.log(
            "ProposalRegistered",
            serde_json::json!({ "round_id": round_id, "proposal_id": proposal_id }),
        )
    }

    pub fn donation(
        &mut self,
        round_id: &str,
        proposal_id: &str,
        donor: &str,
        amount: &str,
        trust_score: Option<&str>,
    ) -> RawLog {
        let mut payload = serde_json::json!({
            "round_id": round_id,
            "proposal_id": proposal_id,
            "donor": donor,
            "amount": amount,
        });
        if let (Some(score), Some(obj)) = (trust_score, payload.as_object_mut()) {
            obj.insert("trust_score".to_string(), serde_json::Value::from(score));
        }
        self.log("DonationReceived", payload)
    }

    /// Create a round, activate it and register its proposals.
    pub fn open_round(&mut self, round_id: &str, matching_pool: &str, proposals: &[&str]) -> Vec<RawLog> {
        let mut logs = vec![
            self.round_created(round_id, matching_pool),
            self.status(round_id, RoundStatus::Active),
        ];
        for p in proposals {
            logs.push(self.proposal(round_id, p));
        }
        logs
    }
}
