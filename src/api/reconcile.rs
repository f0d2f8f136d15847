use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::api::{parse_contract, AppState};
use crate::db::repo::TotalsMismatch;
use crate::domain::{BlockNumber, RoundId};
use crate::error::AppError;
use crate::reconcile::OrphanReport;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileRequest {
    pub contract: String,
    pub from_block: BlockNumber,
    pub to_block: BlockNumber,
    pub reason: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TotalsResponse {
    pub round_id: RoundId,
    pub consistent: bool,
    pub mismatches: Vec<TotalsMismatch>,
}

/// Retract donations of blocks later found to be reorganised out.
pub async fn mark_orphaned(
    State(state): State<AppState>,
    Json(req): Json<ReconcileRequest>,
) -> Result<Json<OrphanReport>, AppError> {
    let contract = parse_contract(&req.contract)?;
    let report = state
        .reconciler
        .mark_orphaned(&contract, req.from_block, req.to_block, &req.reason)
        .await?;
    Ok(Json(report))
}

pub async fn verify_totals(
    Path(round_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<TotalsResponse>, AppError> {
    let round_id = RoundId::new(round_id);
    if state.repo.get_round(&round_id).await?.is_none() {
        return Err(AppError::NotFound(format!("round {}", round_id)));
    }
    let mismatches = state.reconciler.verify_totals(&round_id).await?;
    Ok(Json(TotalsResponse {
        consistent: mismatches.is_empty(),
        round_id,
        mismatches,
    }))
}
