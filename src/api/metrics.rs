use axum::extract::State;
use axum::Json;

use crate::api::AppState;
use crate::metrics::MetricsSnapshot;

pub async fn get_metrics(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot())
}
