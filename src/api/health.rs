use axum::extract::State;
use axum::Json;
use serde_json::json;

use crate::api::AppState;
use crate::error::AppError;

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

/// Ready once the store answers; reports the cursors known so far.
pub async fn ready(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    sqlx::query("SELECT 1")
        .execute(state.repo.pool())
        .await
        .map_err(|e| AppError::RetryLater(format!("database not ready: {}", e)))?;
    let cursors = state.repo.list_cursors().await?;
    Ok(Json(json!({
        "status": "ready",
        "contracts": state.config.contracts.len(),
        "cursors": cursors.len(),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_returns_ok() {
        let Json(body) = health().await;
        assert_eq!(body["status"], "ok");
    }
}
