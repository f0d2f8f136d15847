//! Rounds, proposals, donations and match results.

use super::decimal::Decimal;
use super::primitives::{DonorAddress, ProposalId, RoundId, TimeMs, TxHash};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle of a funding round. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoundStatus {
    Upcoming,
    Active,
    Closed,
}

impl RoundStatus {
    /// Whether `self -> next` is a legal transition.
    ///
    /// Skipping `Active` is allowed; staying in place or going back is not.
    pub fn can_transition_to(self, next: RoundStatus) -> bool {
        next > self
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RoundStatus::Upcoming => "upcoming",
            RoundStatus::Active => "active",
            RoundStatus::Closed => "closed",
        }
    }
}

impl fmt::Display for RoundStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown round status: {0}")]
pub struct RoundStatusParseError(pub String);

impl FromStr for RoundStatus {
    type Err = RoundStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upcoming" => Ok(RoundStatus::Upcoming),
            "active" => Ok(RoundStatus::Active),
            "closed" => Ok(RoundStatus::Closed),
            other => Err(RoundStatusParseError(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Round {
    pub id: RoundId,
    pub matching_pool: Decimal,
    pub status: RoundStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Proposal {
    pub id: ProposalId,
    pub round_id: RoundId,
    /// Denormalized sum of donation amounts, maintained incrementally.
    pub total_donations: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Donation {
    pub donor: DonorAddress,
    pub proposal_id: ProposalId,
    pub round_id: RoundId,
    pub amount: Decimal,
    pub tx_hash: TxHash,
    /// Trust weight in [0, 1], when the source attached one.
    pub trust_score: Option<Decimal>,
    pub created_at: TimeMs,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchResult {
    pub round_id: RoundId,
    pub proposal_id: ProposalId,
    pub amount: Decimal,
    /// Unscaled quadratic score the amount was derived from.
    pub raw_score: Decimal,
    pub version: i64,
    pub weighted: bool,
    pub verified: bool,
    pub computed_at: TimeMs,
}
