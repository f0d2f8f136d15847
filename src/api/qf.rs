use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::api::AppState;
use crate::db::repo::QfRun;
use crate::domain::{MatchResult, Proposal, ProposalId, Round, RoundId};
use crate::error::AppError;
use crate::qf::{QfOptions, QfRunReport};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerQfRequest {
    /// Falls back to `QF_WEIGHTED`.
    pub weighted: Option<bool>,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundResponse {
    #[serde(flatten)]
    pub round: Round,
    pub proposals: Vec<Proposal>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchesResponse {
    pub round_id: RoundId,
    pub latest_version: Option<i64>,
    pub matches: Vec<MatchResult>,
}

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    pub version: i64,
}

async fn require_round(state: &AppState, round_id: &RoundId) -> Result<Round, AppError> {
    state
        .repo
        .get_round(round_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("round {}", round_id)))
}

pub async fn get_round(
    Path(round_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<RoundResponse>, AppError> {
    let round_id = RoundId::new(round_id);
    let round = require_round(&state, &round_id).await?;
    let proposals = state.repo.list_proposals(&round_id).await?;
    Ok(Json(RoundResponse { round, proposals }))
}

/// `triggerQFCalculation(roundId, {weighted, dryRun})`.
pub async fn trigger_qf(
    Path(round_id): Path<String>,
    State(state): State<AppState>,
    body: Option<Json<TriggerQfRequest>>,
) -> Result<Json<QfRunReport>, AppError> {
    let req = body.map(|Json(b)| b).unwrap_or_default();
    let options = QfOptions {
        weighted: req.weighted.unwrap_or(state.config.qf_weighted),
        dry_run: req.dry_run,
    };
    let report = state.qf.trigger(&RoundId::new(round_id), options).await?;
    Ok(Json(report))
}

/// `listMatchResults(roundId)`: the latest version plus every verified row.
pub async fn list_matches(
    Path(round_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<MatchesResponse>, AppError> {
    let round_id = RoundId::new(round_id);
    require_round(&state, &round_id).await?;
    let matches = state.qf.list_match_results(&round_id).await?;
    let latest_version = matches.iter().map(|m| m.version).max();
    Ok(Json(MatchesResponse {
        round_id,
        latest_version,
        matches,
    }))
}

pub async fn list_runs(
    Path(round_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Vec<QfRun>>, AppError> {
    let round_id = RoundId::new(round_id);
    require_round(&state, &round_id).await?;
    Ok(Json(state.repo.list_qf_runs(&round_id).await?))
}

/// Freeze one result against replacement by later runs.
pub async fn verify_match(
    Path((round_id, proposal_id)): Path<(String, String)>,
    State(state): State<AppState>,
    Json(req): Json<VerifyRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let round_id = RoundId::new(round_id);
    let proposal_id = ProposalId::new(proposal_id);
    let verified = state
        .qf
        .verify_match_result(&round_id, &proposal_id, req.version)
        .await?;
    if !verified {
        return Err(AppError::NotFound(format!(
            "match result {}/{} version {}",
            round_id, proposal_id, req.version
        )));
    }
    Ok(Json(serde_json::json!({
        "roundId": round_id,
        "proposalId": proposal_id,
        "version": req.version,
        "verified": true,
    })))
}
