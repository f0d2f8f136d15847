use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use tracing::{error, info};

use crate::api::{parse_contract, AppState};
use crate::domain::BlockNumber;
use crate::error::AppError;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillRequest {
    pub contract: String,
    pub from_block: BlockNumber,
    /// Defaults to the confirmed head.
    pub to_block: Option<BlockNumber>,
    /// Return immediately and run the scan in the background.
    #[serde(default)]
    pub background: bool,
}

/// `startBackfill(contract, fromBlock, toBlock)`.
///
/// Runs to completion and returns the report unless `background` is set,
/// in which case the scan is spawned and 202 is returned.
pub async fn start_backfill(
    State(state): State<AppState>,
    Json(req): Json<BackfillRequest>,
) -> Result<Response, AppError> {
    let contract = parse_contract(&req.contract)?;
    let to_block = req.to_block.unwrap_or(BlockNumber::MAX);
    if req.from_block > to_block {
        return Err(AppError::BadRequest("fromBlock must be <= toBlock".into()));
    }

    if req.background {
        let worker = state.backfill.clone();
        let task_contract = contract.clone();
        let from_block = req.from_block;
        tokio::spawn(async move {
            match worker.run(&task_contract, from_block, to_block).await {
                Ok(report) => info!(
                    contract = %task_contract,
                    cursor = ?report.cursor,
                    "Background backfill finished"
                ),
                Err(e) => error!(contract = %task_contract, error = %e, "Background backfill failed"),
            }
        });
        let body = Json(serde_json::json!({
            "status": "started",
            "contract": contract,
            "fromBlock": req.from_block,
            "toBlock": req.to_block,
        }));
        return Ok((StatusCode::ACCEPTED, body).into_response());
    }

    let report = state.backfill.run(&contract, req.from_block, to_block).await?;
    Ok(Json(report).into_response())
}
