//! Match result versions and QF run records.

use crate::domain::{Decimal, MatchResult, ProposalId, RoundId, TimeMs};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::Row;

use super::{decimal_column, Repository};

/// One persisted QF computation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QfRun {
    pub id: String,
    pub round_id: RoundId,
    pub version: i64,
    pub weighted: bool,
    pub matching_pool: Decimal,
    pub total_score: Decimal,
    pub duration_ms: i64,
    pub computed_at: TimeMs,
}

impl Repository {
    /// Highest version ever written for a round, verified rows included.
    pub async fn latest_match_version_tx(
        conn: &mut SqliteConnection,
        round_id: &RoundId,
    ) -> Result<i64, sqlx::Error> {
        let (version,): (Option<i64>,) =
            sqlx::query_as("SELECT MAX(version) FROM match_results WHERE round_id = ?")
                .bind(round_id.as_str())
                .fetch_one(&mut *conn)
                .await?;
        Ok(version.unwrap_or(0))
    }

    /// Drop every unverified result of a round. Returns the number of rows removed.
    pub async fn delete_unverified_matches_tx(
        conn: &mut SqliteConnection,
        round_id: &RoundId,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM match_results WHERE round_id = ? AND verified = 0")
            .bind(round_id.as_str())
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn insert_match_result_tx(
        conn: &mut SqliteConnection,
        result: &MatchResult,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO match_results (
                round_id, proposal_id, version, amount, raw_score, weighted, verified, computed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(result.round_id.as_str())
        .bind(result.proposal_id.as_str())
        .bind(result.version)
        .bind(result.amount.to_canonical_string())
        .bind(result.raw_score.to_canonical_string())
        .bind(result.weighted as i64)
        .bind(result.verified as i64)
        .bind(result.computed_at.as_ms())
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn insert_qf_run_tx(
        conn: &mut SqliteConnection,
        run: &QfRun,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO qf_runs (
                id, round_id, version, weighted, matching_pool, total_score, duration_ms, computed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run.id)
        .bind(run.round_id.as_str())
        .bind(run.version)
        .bind(run.weighted as i64)
        .bind(run.matching_pool.to_canonical_string())
        .bind(run.total_score.to_canonical_string())
        .bind(run.duration_ms)
        .bind(run.computed_at.as_ms())
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Results of the latest version for a round plus every verified row of older versions.
    pub async fn list_match_results(
        &self,
        round_id: &RoundId,
    ) -> Result<Vec<MatchResult>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT round_id, proposal_id, version, amount, raw_score, weighted, verified, computed_at
            FROM match_results
            WHERE round_id = ?
              AND (verified = 1 OR version = (SELECT MAX(version) FROM match_results WHERE round_id = ?))
            ORDER BY version DESC, proposal_id ASC
            "#,
        )
        .bind(round_id.as_str())
        .bind(round_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(match_result_from_row).collect())
    }

    /// Freeze one result against replacement. Returns false if no such row exists.
    pub async fn verify_match_result(
        &self,
        round_id: &RoundId,
        proposal_id: &ProposalId,
        version: i64,
    ) -> Result<bool, sqlx::Error> {
        let mut tx = self.begin().await?;
        let updated = sqlx::query(
            "UPDATE match_results SET verified = 1 WHERE round_id = ? AND proposal_id = ? AND version = ? AND verified = 0",
        )
        .bind(round_id.as_str())
        .bind(proposal_id.as_str())
        .bind(version)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated > 0 {
            Repository::insert_audit_tx(
                &mut tx,
                "match_verified",
                round_id.as_str(),
                &serde_json::json!({ "proposalId": proposal_id.as_str(), "version": version }),
            )
            .await?;
        }
        tx.commit().await?;
        Ok(updated > 0)
    }

    pub async fn list_qf_runs(&self, round_id: &RoundId) -> Result<Vec<QfRun>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT id, round_id, version, weighted, matching_pool, total_score, duration_ms, computed_at
            FROM qf_runs
            WHERE round_id = ?
            ORDER BY version ASC
            "#,
        )
        .bind(round_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| QfRun {
                id: r.get("id"),
                round_id: RoundId::new(r.get::<String, _>("round_id")),
                version: r.get("version"),
                weighted: r.get::<i64, _>("weighted") != 0,
                matching_pool: decimal_column(r, "matching_pool"),
                total_score: decimal_column(r, "total_score"),
                duration_ms: r.get("duration_ms"),
                computed_at: TimeMs::new(r.get("computed_at")),
            })
            .collect())
    }
}

fn match_result_from_row(row: &SqliteRow) -> MatchResult {
    MatchResult {
        round_id: RoundId::new(row.get::<String, _>("round_id")),
        proposal_id: ProposalId::new(row.get::<String, _>("proposal_id")),
        amount: decimal_column(row, "amount"),
        raw_score: decimal_column(row, "raw_score"),
        version: row.get("version"),
        weighted: row.get::<i64, _>("weighted") != 0,
        verified: row.get::<i64, _>("verified") != 0,
        computed_at: TimeMs::new(row.get("computed_at")),
    }
}
