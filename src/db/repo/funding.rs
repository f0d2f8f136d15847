//! Round, proposal and donation operations.

use crate::domain::{
    BlockNumber, ContractAddress, Decimal, Donation, DonorAddress, Proposal, ProposalId, Round, RoundId, RoundStatus, TimeMs,
    TxHash,
};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::Row;
use std::collections::BTreeMap;
use tracing::warn;

use super::{decimal_column, now_ms, optional_decimal_column, Repository};

/// A proposal whose stored running total disagrees with its donations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TotalsMismatch {
    pub proposal_id: ProposalId,
    pub stored_total: Decimal,
    pub recomputed_total: Decimal,
}

impl Repository {
    // =========================================================================
    // Rounds
    // =========================================================================

    pub async fn insert_round_tx(
        conn: &mut SqliteConnection,
        round: &Round,
    ) -> Result<bool, sqlx::Error> {
        let now = now_ms();
        let result = sqlx::query(
            r#"
            INSERT INTO rounds (id, matching_pool, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(round.id.as_str())
        .bind(round.matching_pool.to_canonical_string())
        .bind(round.status.as_str())
        .bind(now)
        .bind(now)
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Insert a round outside of event ingestion (fixtures, operator tooling).
    pub async fn insert_round(&self, round: &Round) -> Result<bool, sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        Repository::insert_round_tx(&mut conn, round).await
    }

    pub async fn get_round(&self, round_id: &RoundId) -> Result<Option<Round>, sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        Repository::get_round_tx(&mut conn, round_id).await
    }

    pub async fn get_round_tx(
        conn: &mut SqliteConnection,
        round_id: &RoundId,
    ) -> Result<Option<Round>, sqlx::Error> {
        let row = sqlx::query("SELECT id, matching_pool, status FROM rounds WHERE id = ?")
            .bind(round_id.as_str())
            .fetch_optional(&mut *conn)
            .await?;

        Ok(row.and_then(|r| round_from_row(&r)))
    }

    /// Unconditionally write a round's status; callers enforce the transition rule.
    pub async fn set_round_status_tx(
        conn: &mut SqliteConnection,
        round_id: &RoundId,
        status: RoundStatus,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE rounds SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(now_ms())
            .bind(round_id.as_str())
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    // =========================================================================
    // Proposals
    // =========================================================================

    pub async fn insert_proposal_tx(
        conn: &mut SqliteConnection,
        proposal_id: &ProposalId,
        round_id: &RoundId,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO proposals (id, round_id, total_donations, created_at)
            VALUES (?, ?, '0', ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(proposal_id.as_str())
        .bind(round_id.as_str())
        .bind(now_ms())
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn get_proposal_tx(
        conn: &mut SqliteConnection,
        proposal_id: &ProposalId,
    ) -> Result<Option<Proposal>, sqlx::Error> {
        let row = sqlx::query("SELECT id, round_id, total_donations FROM proposals WHERE id = ?")
            .bind(proposal_id.as_str())
            .fetch_optional(&mut *conn)
            .await?;

        Ok(row.as_ref().map(proposal_from_row))
    }

    pub async fn get_proposal(
        &self,
        proposal_id: &ProposalId,
    ) -> Result<Option<Proposal>, sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        Repository::get_proposal_tx(&mut conn, proposal_id).await
    }

    pub async fn list_proposals(&self, round_id: &RoundId) -> Result<Vec<Proposal>, sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        Repository::list_proposals_tx(&mut conn, round_id).await
    }

    pub async fn list_proposals_tx(
        conn: &mut SqliteConnection,
        round_id: &RoundId,
    ) -> Result<Vec<Proposal>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT id, round_id, total_donations FROM proposals WHERE round_id = ? ORDER BY id ASC",
        )
        .bind(round_id.as_str())
        .fetch_all(&mut *conn)
        .await?;

        Ok(rows.iter().map(proposal_from_row).collect())
    }

    /// Add `amount` to a proposal's running total.
    ///
    /// The sum is computed in Rust: SQLite's arithmetic on TEXT goes through REAL.
    /// Returns `None`, leaving the total untouched, when the sum leaves the decimal range.
    pub async fn add_to_proposal_total_tx(
        conn: &mut SqliteConnection,
        proposal_id: &ProposalId,
        amount: Decimal,
    ) -> Result<Option<Decimal>, sqlx::Error> {
        let current = Repository::get_proposal_tx(conn, proposal_id)
            .await?
            .map(|p| p.total_donations)
            .ok_or(sqlx::Error::RowNotFound)?;
        let Some(updated) = current.checked_add(amount) else {
            return Ok(None);
        };
        Repository::set_proposal_total_tx(conn, proposal_id, updated).await?;
        Ok(Some(updated))
    }

    pub async fn set_proposal_total_tx(
        conn: &mut SqliteConnection,
        proposal_id: &ProposalId,
        total: Decimal,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE proposals SET total_donations = ? WHERE id = ?")
            .bind(total.to_canonical_string())
            .bind(proposal_id.as_str())
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    // =========================================================================
    // Donations
    // =========================================================================

    pub async fn insert_donation_tx(
        conn: &mut SqliteConnection,
        raw_event_id: i64,
        donation: &Donation,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO donations (
                raw_event_id, donor, proposal_id, round_id, amount, tx_hash, trust_score, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(raw_event_id)
        .bind(donation.donor.as_str())
        .bind(donation.proposal_id.as_str())
        .bind(donation.round_id.as_str())
        .bind(donation.amount.to_canonical_string())
        .bind(donation.tx_hash.as_str())
        .bind(donation.trust_score.map(|s| s.to_canonical_string()))
        .bind(donation.created_at.as_ms())
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Committed donations of a round in ingestion order.
    pub async fn query_round_donations(
        &self,
        round_id: &RoundId,
    ) -> Result<Vec<Donation>, sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        Repository::query_round_donations_tx(&mut conn, round_id).await
    }

    pub async fn query_round_donations_tx(
        conn: &mut SqliteConnection,
        round_id: &RoundId,
    ) -> Result<Vec<Donation>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT donor, proposal_id, round_id, amount, tx_hash, trust_score, created_at
            FROM donations
            WHERE round_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(round_id.as_str())
        .fetch_all(&mut *conn)
        .await?;

        Ok(rows.iter().map(donation_from_row).collect())
    }

    /// Recompute every proposal total of a round from its donations and report drift.
    pub async fn find_total_mismatches(
        &self,
        round_id: &RoundId,
    ) -> Result<Vec<TotalsMismatch>, sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        let proposals = Repository::list_proposals_tx(&mut conn, round_id).await?;
        let sums = Repository::sum_donations_by_proposal_tx(&mut conn, round_id).await?;

        Ok(proposals
            .into_iter()
            .filter_map(|p| {
                let recomputed = sums.get(&p.id).copied().unwrap_or_default();
                (recomputed != p.total_donations).then(|| TotalsMismatch {
                    proposal_id: p.id,
                    stored_total: p.total_donations,
                    recomputed_total: recomputed,
                })
            })
            .collect())
    }

    /// Delete donations derived from raw events of `contract` in `[from, to]`.
    ///
    /// Returns the proposals whose totals are now stale. Raw events are kept.
    pub async fn delete_donations_in_blocks_tx(
        conn: &mut SqliteConnection,
        contract: &ContractAddress,
        from_block: BlockNumber,
        to_block: BlockNumber,
    ) -> Result<(u64, Vec<ProposalId>), sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT d.proposal_id
            FROM donations d
            JOIN raw_events e ON e.id = d.raw_event_id
            WHERE e.contract_address = ? AND e.block_number >= ? AND e.block_number <= ?
            ORDER BY d.proposal_id
            "#,
        )
        .bind(contract.as_str())
        .bind(from_block as i64)
        .bind(to_block as i64)
        .fetch_all(&mut *conn)
        .await?;
        let affected = rows
            .iter()
            .map(|r| ProposalId::new(r.get::<String, _>("proposal_id")))
            .collect();

        let removed = sqlx::query(
            r#"
            DELETE FROM donations
            WHERE raw_event_id IN (
                SELECT id FROM raw_events
                WHERE contract_address = ? AND block_number >= ? AND block_number <= ?
            )
            "#,
        )
        .bind(contract.as_str())
        .bind(from_block as i64)
        .bind(to_block as i64)
        .execute(&mut *conn)
        .await?
        .rows_affected();

        Ok((removed, affected))
    }

    /// Recompute a proposal's running total from its remaining donations.
    pub async fn recompute_proposal_total_tx(
        conn: &mut SqliteConnection,
        proposal_id: &ProposalId,
    ) -> Result<Decimal, sqlx::Error> {
        let rows = sqlx::query("SELECT amount FROM donations WHERE proposal_id = ?")
            .bind(proposal_id.as_str())
            .fetch_all(&mut *conn)
            .await?;
        let total = checked_total(proposal_id, rows.iter().map(|r| decimal_column(r, "amount")))?;
        Repository::set_proposal_total_tx(conn, proposal_id, total).await?;
        Ok(total)
    }

    pub async fn insert_orphaned_range_tx(
        conn: &mut SqliteConnection,
        contract: &ContractAddress,
        from_block: BlockNumber,
        to_block: BlockNumber,
        reason: &str,
        donations_removed: u64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO orphaned_blocks (
                contract_address, from_block, to_block, reason, donations_removed, created_at
            ) VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(contract.as_str())
        .bind(from_block as i64)
        .bind(to_block as i64)
        .bind(reason)
        .bind(donations_removed as i64)
        .bind(now_ms())
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn sum_donations_by_proposal_tx(
        conn: &mut SqliteConnection,
        round_id: &RoundId,
    ) -> Result<BTreeMap<ProposalId, Decimal>, sqlx::Error> {
        let donations = Repository::query_round_donations_tx(conn, round_id).await?;
        let mut by_proposal: BTreeMap<ProposalId, Vec<Decimal>> = BTreeMap::new();
        for d in donations {
            by_proposal.entry(d.proposal_id).or_default().push(d.amount);
        }
        by_proposal
            .into_iter()
            .map(|(proposal_id, amounts)| {
                let total = checked_total(&proposal_id, amounts.into_iter())?;
                Ok((proposal_id, total))
            })
            .collect()
    }
}

fn checked_total(
    proposal_id: &ProposalId,
    mut amounts: impl Iterator<Item = Decimal>,
) -> Result<Decimal, sqlx::Error> {
    amounts
        .try_fold(Decimal::zero(), |acc, amount| acc.checked_add(amount))
        .ok_or_else(|| {
            sqlx::Error::Decode(format!("donation total of proposal {proposal_id} overflows").into())
        })
}

fn round_from_row(row: &SqliteRow) -> Option<Round> {
    let id: String = row.get("id");
    let status_str: String = row.get("status");
    let status = match status_str.parse::<RoundStatus>() {
        Ok(s) => s,
        Err(e) => {
            warn!(round_id = %id, error = %e, "Skipping round with unknown status");
            return None;
        }
    };
    Some(Round {
        id: RoundId::new(id),
        matching_pool: decimal_column(row, "matching_pool"),
        status,
    })
}

fn proposal_from_row(row: &SqliteRow) -> Proposal {
    Proposal {
        id: ProposalId::new(row.get::<String, _>("id")),
        round_id: RoundId::new(row.get::<String, _>("round_id")),
        total_donations: decimal_column(row, "total_donations"),
    }
}

fn donation_from_row(row: &SqliteRow) -> Donation {
    Donation {
        donor: DonorAddress::new(row.get::<String, _>("donor")),
        proposal_id: ProposalId::new(row.get::<String, _>("proposal_id")),
        round_id: RoundId::new(row.get::<String, _>("round_id")),
        amount: decimal_column(row, "amount"),
        tx_hash: TxHash::new(row.get::<String, _>("tx_hash")),
        trust_score: optional_decimal_column(row, "trust_score"),
        created_at: TimeMs::new(row.get("created_at")),
    }
}
