use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::api::{parse_contract, AppState};
use crate::db::ChainCursor;
use crate::domain::{BlockNumber, ContractAddress};
use crate::error::AppError;
use crate::ingest::IndexerState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorResponse {
    pub contract_address: ContractAddress,
    pub last_processed_block: Option<BlockNumber>,
    pub updated_at: Option<i64>,
    /// `None` when the chain head could not be read.
    pub chain_head: Option<BlockNumber>,
    pub state: Option<IndexerState>,
}

/// `getCursor(contract)`, with the indexer state derived from the chain head.
pub async fn get_cursor(
    Path(contract): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<CursorResponse>, AppError> {
    let contract = parse_contract(&contract)?;
    let cursor = state.repo.get_cursor(&contract).await?;
    let last = cursor.as_ref().map(|c| c.last_processed_block);

    let chain_head = match state.source.get_chain_head().await {
        Ok(head) => Some(head),
        Err(e) => {
            warn!(contract = %contract, error = %e, "Chain head unavailable for cursor state");
            None
        }
    };
    let depth = state.backfill.config().confirmation_depth;

    Ok(Json(CursorResponse {
        contract_address: contract,
        last_processed_block: last,
        updated_at: cursor.map(|c| c.updated_at.as_ms()),
        chain_head,
        state: chain_head.map(|head| IndexerState::derive(last, head, depth)),
    }))
}

pub async fn list_cursors(
    State(state): State<AppState>,
) -> Result<Json<Vec<ChainCursor>>, AppError> {
    Ok(Json(state.repo.list_cursors().await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetCursorRequest {
    pub block: BlockNumber,
}

/// Operator action for a fresh deployment; refused once events exist.
pub async fn reset_cursor(
    Path(contract): Path<String>,
    State(state): State<AppState>,
    Json(req): Json<ResetCursorRequest>,
) -> Result<Json<ChainCursor>, AppError> {
    let contract = parse_contract(&contract)?;
    let cursor = state
        .repo
        .reset_cursor_for_deployment(&contract, req.block)
        .await?;
    Ok(Json(cursor))
}
