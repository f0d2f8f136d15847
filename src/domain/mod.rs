//! Domain types for the funding-round indexer.
//!
//! This module provides:
//! - Lossless numeric handling via the Decimal wrapper
//! - Chain primitives: TxHash, ContractAddress, BlockNumber
//! - Raw log / raw event records and the deterministic log ordering
//! - Rounds, proposals, donations and match results

pub mod decimal;
pub mod event;
pub mod funding;
pub mod primitives;

pub use decimal::Decimal;
pub use event::{sort_logs_deterministic, EventKey, LogPosition, RawEvent, RawLog};
pub use funding::{Donation, MatchResult, Proposal, Round, RoundStatus, RoundStatusParseError};
pub use primitives::{
    BlockNumber, ContractAddress, DonorAddress, ProposalId, RoundId, TimeMs, TxHash,
};
