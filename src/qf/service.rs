use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::info;

use super::calculator::{calculate_matches, QfOptions, QfOutcome};
use super::QfError;
use crate::db::repo::QfRun;
use crate::db::Repository;
use crate::domain::{MatchResult, ProposalId, RoundId, TimeMs};
use crate::ingest::KeyedLocks;
use crate::metrics::Metrics;

/// Result of one triggered calculation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QfRunReport {
    pub round_id: RoundId,
    /// Version written, `None` for dry runs.
    pub version: Option<i64>,
    pub dry_run: bool,
    pub duration_ms: u64,
    #[serde(flatten)]
    pub outcome: QfOutcome,
}

/// Runs the calculator against committed donations and versions its results.
///
/// Runs for the same round are serialised; different rounds run concurrently.
#[derive(Debug)]
pub struct QfService {
    repo: Arc<Repository>,
    metrics: Arc<Metrics>,
    round_locks: KeyedLocks<RoundId>,
}

impl QfService {
    pub fn new(repo: Arc<Repository>, metrics: Arc<Metrics>) -> Self {
        Self {
            repo,
            metrics,
            round_locks: KeyedLocks::new(),
        }
    }

    /// Calculate matches for a round and, unless `dry_run`, persist them as a new version.
    ///
    /// Reads and writes happen in one transaction: the new version reflects
    /// exactly the donations it was computed from. Unverified rows of earlier
    /// versions are replaced; verified rows are left untouched.
    pub async fn trigger(
        &self,
        round_id: &RoundId,
        options: QfOptions,
    ) -> Result<QfRunReport, QfError> {
        let _guard = self.round_locks.lock(round_id).await;
        let started = Instant::now();

        let mut tx = self.repo.begin().await?;
        let round = Repository::get_round_tx(&mut tx, round_id)
            .await?
            .ok_or_else(|| QfError::RoundNotFound(round_id.clone()))?;
        let proposals: Vec<ProposalId> = Repository::list_proposals_tx(&mut tx, round_id)
            .await?
            .into_iter()
            .map(|p| p.id)
            .collect();
        let donations = Repository::query_round_donations_tx(&mut tx, round_id).await?;

        let outcome = calculate_matches(&round, &proposals, &donations, options)?;

        let version = if options.dry_run {
            tx.rollback().await?;
            None
        } else {
            let version = Repository::latest_match_version_tx(&mut tx, round_id).await? + 1;
            let replaced = Repository::delete_unverified_matches_tx(&mut tx, round_id).await?;
            let computed_at = TimeMs::now();
            for m in &outcome.matches {
                let result = MatchResult {
                    round_id: round_id.clone(),
                    proposal_id: m.proposal_id.clone(),
                    amount: m.amount,
                    raw_score: m.raw_score,
                    version,
                    weighted: outcome.weighted,
                    verified: false,
                    computed_at,
                };
                Repository::insert_match_result_tx(&mut tx, &result).await?;
            }

            let run = QfRun {
                id: uuid::Uuid::new_v4().to_string(),
                round_id: round_id.clone(),
                version,
                weighted: outcome.weighted,
                matching_pool: outcome.matching_pool,
                total_score: outcome.total_score,
                duration_ms: started.elapsed().as_millis() as i64,
                computed_at,
            };
            Repository::insert_qf_run_tx(&mut tx, &run).await?;
            Repository::insert_audit_tx(
                &mut tx,
                "qf_run",
                round_id.as_str(),
                &serde_json::json!({
                    "runId": run.id,
                    "version": version,
                    "weighted": outcome.weighted,
                    "donations": donations.len(),
                    "totalScore": outcome.total_score,
                    "totalMatched": outcome.total_matched(),
                    "replacedUnverified": replaced,
                }),
            )
            .await?;
            tx.commit().await?;
            Some(version)
        };

        let elapsed = started.elapsed();
        self.metrics.set_last_qf_duration(elapsed);
        info!(
            round_id = %round_id,
            version = ?version,
            dry_run = options.dry_run,
            weighted = outcome.weighted,
            proposals = outcome.matches.len(),
            total_score = %outcome.total_score,
            duration_ms = elapsed.as_millis() as u64,
            "QF calculation finished"
        );

        Ok(QfRunReport {
            round_id: round_id.clone(),
            version,
            dry_run: options.dry_run,
            duration_ms: elapsed.as_millis() as u64,
            outcome,
        })
    }

    pub async fn list_match_results(&self, round_id: &RoundId) -> Result<Vec<MatchResult>, QfError> {
        Ok(self.repo.list_match_results(round_id).await?)
    }

    /// External approval of a result; frozen rows survive later recalculations.
    pub async fn verify_match_result(
        &self,
        round_id: &RoundId,
        proposal_id: &ProposalId,
        version: i64,
    ) -> Result<bool, QfError> {
        Ok(self
            .repo
            .verify_match_result(round_id, proposal_id, version)
            .await?)
    }
}
