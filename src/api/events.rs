use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::api::{parse_contract, AppState};
use crate::db::repo::FailedRange;
use crate::domain::{BlockNumber, RawEvent};
use crate::error::AppError;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsQuery {
    pub contract: String,
    pub from_block: Option<BlockNumber>,
    pub to_block: Option<BlockNumber>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsResponse {
    pub event_count: usize,
    pub error_count: usize,
    pub events: Vec<RawEvent>,
}

pub async fn get_events(
    Query(params): Query<EventsQuery>,
    State(state): State<AppState>,
) -> Result<Json<EventsResponse>, AppError> {
    let contract = parse_contract(&params.contract)?;
    if let (Some(from), Some(to)) = (params.from_block, params.to_block) {
        if from > to {
            return Err(AppError::BadRequest("fromBlock must be <= toBlock".into()));
        }
    }

    let events = state
        .repo
        .list_raw_events(&contract, params.from_block, params.to_block)
        .await?;
    let error_count = events.iter().filter(|e| e.error.is_some()).count();

    Ok(Json(EventsResponse {
        event_count: events.len(),
        error_count,
        events,
    }))
}

#[derive(Debug, Deserialize)]
pub struct FailedRangesQuery {
    pub contract: String,
}

/// Ranges that exhausted their retries and need operator attention.
pub async fn get_failed_ranges(
    Query(params): Query<FailedRangesQuery>,
    State(state): State<AppState>,
) -> Result<Json<Vec<FailedRange>>, AppError> {
    let contract = parse_contract(&params.contract)?;
    Ok(Json(state.repo.list_failed_ranges(&contract).await?))
}
