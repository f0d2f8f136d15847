//! Manual reorg reconciliation.
//!
//! Blocks past the confirmation depth are treated as final. When an operator
//! learns that such a block was reorganised out anyway, `mark_orphaned`
//! removes the donations derived from it and recomputes the affected running
//! totals. Raw events and the cursor are left as they are.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::db::repo::TotalsMismatch;
use crate::db::Repository;
use crate::domain::{BlockNumber, ContractAddress, Decimal, ProposalId, RoundId};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("invalid block range {from_block}..={to_block}")]
    InvalidRange {
        from_block: BlockNumber,
        to_block: BlockNumber,
    },
    #[error("a reason is required")]
    MissingReason,
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecomputedTotal {
    pub proposal_id: ProposalId,
    pub total_donations: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrphanReport {
    pub contract: ContractAddress,
    pub from_block: BlockNumber,
    pub to_block: BlockNumber,
    pub donations_removed: u64,
    pub recomputed: Vec<RecomputedTotal>,
}

#[derive(Debug, Clone)]
pub struct Reconciler {
    repo: Arc<Repository>,
}

impl Reconciler {
    pub fn new(repo: Arc<Repository>) -> Self {
        Self { repo }
    }

    /// Retract the donation effects of `[from_block, to_block]` for `contract`.
    ///
    /// One transaction: the orphaned range, the deletions, the recomputed
    /// totals and the audit row commit together or not at all.
    pub async fn mark_orphaned(
        &self,
        contract: &ContractAddress,
        from_block: BlockNumber,
        to_block: BlockNumber,
        reason: &str,
    ) -> Result<OrphanReport, ReconcileError> {
        if from_block > to_block {
            return Err(ReconcileError::InvalidRange {
                from_block,
                to_block,
            });
        }
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(ReconcileError::MissingReason);
        }

        let mut tx = self.repo.begin().await?;
        let (removed, affected) =
            Repository::delete_donations_in_blocks_tx(&mut tx, contract, from_block, to_block)
                .await?;

        let mut recomputed = Vec::with_capacity(affected.len());
        for proposal_id in affected {
            let total = Repository::recompute_proposal_total_tx(&mut tx, &proposal_id).await?;
            recomputed.push(RecomputedTotal {
                proposal_id,
                total_donations: total,
            });
        }

        Repository::insert_orphaned_range_tx(
            &mut tx, contract, from_block, to_block, reason, removed,
        )
        .await?;
        Repository::insert_audit_tx(
            &mut tx,
            "blocks_orphaned",
            contract.as_str(),
            &serde_json::json!({
                "fromBlock": from_block,
                "toBlock": to_block,
                "reason": reason,
                "donationsRemoved": removed,
                "recomputed": recomputed,
            }),
        )
        .await?;
        tx.commit().await?;

        warn!(
            contract = %contract,
            from = from_block,
            to = to_block,
            donations_removed = removed,
            proposals = recomputed.len(),
            "Marked blocks orphaned"
        );

        Ok(OrphanReport {
            contract: contract.clone(),
            from_block,
            to_block,
            donations_removed: removed,
            recomputed,
        })
    }

    /// Proposals of `round_id` whose running total disagrees with their donations.
    pub async fn verify_totals(
        &self,
        round_id: &RoundId,
    ) -> Result<Vec<TotalsMismatch>, ReconcileError> {
        let mismatches = self.repo.find_total_mismatches(round_id).await?;
        for m in &mismatches {
            warn!(
                round_id = %round_id,
                proposal_id = %m.proposal_id,
                stored = %m.stored_total,
                recomputed = %m.recomputed_total,
                "Running total drift"
            );
        }
        Ok(mismatches)
    }
}
