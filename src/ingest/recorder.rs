//! The idempotent persistence path shared by backfill and live ingestion.
//!
//! Every log goes through the same steps inside one SQL transaction:
//! raw insert keyed by (tx_hash, log_index), decode, domain effect under a
//! savepoint, processed/error marking. A batch additionally advances the
//! contract's cursor in that same transaction.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use sqlx::sqlite::SqliteConnection;
use sqlx::Connection;
use thiserror::Error;
use tracing::{debug, warn};

use super::locks::KeyedLocks;
use crate::db::repo::NewRawEvent;
use crate::db::{CursorError, Repository};
use crate::decode::{DomainEvent, SchemaRegistry};
use crate::domain::{
    sort_logs_deterministic, BlockNumber, ContractAddress, Donation, RawLog, Round, RoundStatus,
    TimeMs,
};
use crate::metrics::Metrics;

/// Result of recording one log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "lowercase")]
pub enum RecordOutcome {
    /// New event; its domain effect was applied.
    Inserted,
    /// Same (tx_hash, log_index) already recorded. Nothing was written.
    Duplicate,
    /// Stored with an error and `processed = false`; no domain effect.
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error(transparent)]
    Db(#[from] sqlx::Error),
    #[error(transparent)]
    Cursor(#[from] CursorError),
}

/// Counts for a recorded batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub inserted: usize,
    pub duplicates: usize,
    pub rejected: usize,
    /// Cursor after the batch committed.
    pub cursor: BlockNumber,
}

impl BatchSummary {
    fn add(&mut self, outcome: &RecordOutcome) {
        match outcome {
            RecordOutcome::Inserted => self.inserted += 1,
            RecordOutcome::Duplicate => self.duplicates += 1,
            RecordOutcome::Rejected(_) => self.rejected += 1,
        }
    }
}

/// A domain effect that could not be applied. `Rejected` is data, `Db` is I/O.
#[derive(Debug, Error)]
enum EffectError {
    #[error("{0}")]
    Rejected(String),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

pub struct EventRecorder {
    repo: Arc<Repository>,
    registry: Arc<SchemaRegistry>,
    metrics: Arc<Metrics>,
    cursor_locks: KeyedLocks<ContractAddress>,
}

impl EventRecorder {
    pub fn new(
        repo: Arc<Repository>,
        registry: Arc<SchemaRegistry>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            repo,
            registry,
            metrics,
            cursor_locks: KeyedLocks::new(),
        }
    }

    pub fn repo(&self) -> &Arc<Repository> {
        &self.repo
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Record a single log in its own transaction. The cursor is not touched.
    pub async fn record_event(&self, log: &RawLog) -> Result<RecordOutcome, RecordError> {
        let started = Instant::now();
        let mut tx = self.repo.begin().await?;
        let outcome = self.record_in_tx(&mut tx, log).await?;
        tx.commit().await?;

        self.count(&outcome, started.elapsed());
        Ok(outcome)
    }

    /// Record every log of blocks `[from, to]` and advance the cursor, all in
    /// one transaction.
    ///
    /// Logs are applied in chain order regardless of the order they were given in.
    /// Logs of another contract or outside `[from, to]` are dropped with a warning.
    /// The cursor moves to `to` only when the range is contiguous with it
    /// (`from <= cursor + 1`); re-scanning already processed blocks leaves it in
    /// place, and a range beyond a gap is recorded without moving it.
    /// Holds the contract's cursor lock for the duration.
    pub async fn record_batch_and_advance(
        &self,
        contract: &ContractAddress,
        mut logs: Vec<RawLog>,
        from: BlockNumber,
        to: BlockNumber,
    ) -> Result<BatchSummary, RecordError> {
        let given = logs.len();
        logs.retain(|l| {
            &l.contract_address == contract && l.block_number >= from && l.block_number <= to
        });
        if logs.len() < given {
            warn!(
                contract = %contract,
                from = from,
                to = to,
                dropped = given - logs.len(),
                "Dropped logs outside the batch"
            );
        }
        sort_logs_deterministic(&mut logs);
        let _guard = self.cursor_locks.lock(contract).await;

        let mut tx = self.repo.begin().await?;
        let mut outcomes = Vec::with_capacity(logs.len());
        for log in &logs {
            let started = Instant::now();
            let outcome = self.record_in_tx(&mut tx, log).await?;
            outcomes.push((outcome, started.elapsed()));
        }

        let current = Repository::get_cursor_tx(&mut tx, contract)
            .await?
            .map(|c| c.last_processed_block);
        let cursor = match current {
            None => {
                Repository::advance_cursor_tx(&mut tx, contract, to).await?;
                to
            }
            Some(c) if from <= c.saturating_add(1) && to > c => {
                Repository::advance_cursor_tx(&mut tx, contract, to).await?;
                to
            }
            Some(c) => {
                if from > c.saturating_add(1) {
                    warn!(
                        contract = %contract,
                        cursor = c,
                        from = from,
                        to = to,
                        "Range is not contiguous with the cursor, cursor left in place"
                    );
                }
                c
            }
        };
        tx.commit().await?;

        let mut summary = BatchSummary {
            cursor,
            ..BatchSummary::default()
        };
        for (outcome, elapsed) in &outcomes {
            summary.add(outcome);
            self.count(outcome, *elapsed);
        }
        debug!(
            contract = %contract,
            from = from,
            to = to,
            cursor = cursor,
            inserted = summary.inserted,
            duplicates = summary.duplicates,
            rejected = summary.rejected,
            "Recorded batch"
        );
        Ok(summary)
    }

    fn count(&self, outcome: &RecordOutcome, elapsed: Duration) {
        match outcome {
            RecordOutcome::Inserted => self.metrics.inc_processed(),
            RecordOutcome::Duplicate => self.metrics.inc_duplicate(),
            RecordOutcome::Rejected(_) => self.metrics.inc_error(),
        }
        self.metrics.observe_latency(elapsed);
    }

    async fn record_in_tx(
        &self,
        conn: &mut SqliteConnection,
        log: &RawLog,
    ) -> Result<RecordOutcome, RecordError> {
        if log.tx_hash.is_empty() {
            let reason = "log has no transaction hash".to_string();
            Repository::insert_audit_tx(
                conn,
                "invalid_log",
                log.contract_address.as_str(),
                &serde_json::json!({ "block": log.block_number, "logIndex": log.log_index }),
            )
            .await?;
            return Ok(RecordOutcome::Rejected(reason));
        }

        let decoded = self.registry.decode(log);
        let (event_name, payload) = match &decoded {
            Ok(d) => (Some(d.event_name), d.payload.clone()),
            Err(_) => (
                self.registry.schema_for(&log.topic).map(|s| s.name),
                undecoded_payload(&log.data),
            ),
        };

        let raw_id = Repository::insert_raw_event_tx(
            conn,
            &NewRawEvent {
                log,
                event_name,
                payload: &payload,
            },
        )
        .await?;

        let Some(raw_id) = raw_id else {
            Repository::insert_audit_tx(
                conn,
                "duplicate",
                &log.key().to_string(),
                &serde_json::json!({ "block": log.block_number }),
            )
            .await?;
            return Ok(RecordOutcome::Duplicate);
        };

        let event = match decoded.and_then(|d| DomainEvent::from_decoded(&d)) {
            Ok(event) => event,
            Err(e) => return self.reject(conn, raw_id, log, "decode_error", e.to_string()).await,
        };

        let mut savepoint = conn.begin().await?;
        match apply_effect(&mut savepoint, raw_id, log, &event).await {
            Ok(()) => {
                savepoint.commit().await?;
                Repository::mark_raw_event_processed_tx(conn, raw_id).await?;
                Ok(RecordOutcome::Inserted)
            }
            Err(EffectError::Rejected(reason)) => {
                savepoint.rollback().await?;
                self.reject(conn, raw_id, log, "effect_rejected", reason).await
            }
            Err(EffectError::Db(e)) => Err(e.into()),
        }
    }

    async fn reject(
        &self,
        conn: &mut SqliteConnection,
        raw_id: i64,
        log: &RawLog,
        kind: &str,
        reason: String,
    ) -> Result<RecordOutcome, RecordError> {
        warn!(
            contract = %log.contract_address,
            tx_hash = %log.tx_hash,
            log_index = log.log_index,
            block = log.block_number,
            error = %reason,
            "Event stored unprocessed"
        );
        Repository::mark_raw_event_failed_tx(conn, raw_id, &reason).await?;
        Repository::insert_audit_tx(
            conn,
            kind,
            &log.key().to_string(),
            &serde_json::json!({
                "contract": log.contract_address.as_str(),
                "block": log.block_number,
                "error": reason,
            }),
        )
        .await?;
        Ok(RecordOutcome::Rejected(reason))
    }
}

impl std::fmt::Debug for EventRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRecorder").finish_non_exhaustive()
    }
}

/// Payload kept for logs that did not decode, so the bytes stay inspectable.
fn undecoded_payload(data: &[u8]) -> BTreeMap<String, serde_json::Value> {
    let mut payload = BTreeMap::new();
    payload.insert(
        "_raw".to_string(),
        serde_json::Value::String(format!("0x{}", hex::encode(data))),
    );
    payload
}

async fn apply_effect(
    conn: &mut SqliteConnection,
    raw_id: i64,
    log: &RawLog,
    event: &DomainEvent,
) -> Result<(), EffectError> {
    match event {
        DomainEvent::RoundCreated {
            round_id,
            matching_pool,
        } => {
            let round = Round {
                id: round_id.clone(),
                matching_pool: *matching_pool,
                status: RoundStatus::Upcoming,
            };
            if !Repository::insert_round_tx(conn, &round).await? {
                return Err(EffectError::Rejected(format!("round {round_id} already exists")));
            }
        }
        DomainEvent::RoundStatusChanged { round_id, status } => {
            let round = Repository::get_round_tx(conn, round_id)
                .await?
                .ok_or_else(|| EffectError::Rejected(format!("unknown round {round_id}")))?;
            if !round.status.can_transition_to(*status) {
                return Err(EffectError::Rejected(format!(
                    "round {round_id} cannot move from {} to {status}",
                    round.status
                )));
            }
            Repository::set_round_status_tx(conn, round_id, *status).await?;
        }
        DomainEvent::ProposalRegistered {
            round_id,
            proposal_id,
        } => {
            let round = Repository::get_round_tx(conn, round_id)
                .await?
                .ok_or_else(|| EffectError::Rejected(format!("unknown round {round_id}")))?;
            if round.status == RoundStatus::Closed {
                return Err(EffectError::Rejected(format!("round {round_id} is closed")));
            }
            if !Repository::insert_proposal_tx(conn, proposal_id, round_id).await? {
                return Err(EffectError::Rejected(format!(
                    "proposal {proposal_id} already exists"
                )));
            }
        }
        DomainEvent::DonationReceived(d) => {
            let round = Repository::get_round_tx(conn, &d.round_id)
                .await?
                .ok_or_else(|| EffectError::Rejected(format!("unknown round {}", d.round_id)))?;
            if round.status != RoundStatus::Active {
                return Err(EffectError::Rejected(format!(
                    "round {} is {}, donations require an active round",
                    d.round_id, round.status
                )));
            }
            let proposal = Repository::get_proposal_tx(conn, &d.proposal_id)
                .await?
                .ok_or_else(|| {
                    EffectError::Rejected(format!("unknown proposal {}", d.proposal_id))
                })?;
            if proposal.round_id != d.round_id {
                return Err(EffectError::Rejected(format!(
                    "proposal {} belongs to round {}, not {}",
                    d.proposal_id, proposal.round_id, d.round_id
                )));
            }

            let donation = Donation {
                donor: d.donor.clone(),
                proposal_id: d.proposal_id.clone(),
                round_id: d.round_id.clone(),
                amount: d.amount,
                tx_hash: log.tx_hash.clone(),
                trust_score: d.trust_score,
                created_at: TimeMs::now(),
            };
            Repository::insert_donation_tx(conn, raw_id, &donation).await?;
            if Repository::add_to_proposal_total_tx(conn, &d.proposal_id, d.amount)
                .await?
                .is_none()
            {
                return Err(EffectError::Rejected(format!(
                    "running total of proposal {} overflows",
                    d.proposal_id
                )));
            }
        }
    }
    Ok(())
}
