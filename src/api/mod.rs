pub mod backfill;
pub mod cursors;
pub mod events;
pub mod health;
pub mod metrics;
pub mod qf;
pub mod reconcile;

use crate::chain::ChainSource;
use crate::config::Config;
use crate::db::Repository;
use crate::decode::SchemaRegistry;
use crate::domain::ContractAddress;
use crate::error::AppError;
use crate::ingest::{BackfillWorker, EventRecorder};
use crate::metrics::Metrics;
use crate::qf::QfService;
use crate::reconcile::Reconciler;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

/// Shared services behind the command surface. The binary uses the same
/// instances to drive its per-contract indexers.
#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<Repository>,
    pub config: Config,
    pub source: Arc<dyn ChainSource>,
    pub metrics: Arc<Metrics>,
    pub recorder: Arc<EventRecorder>,
    pub backfill: BackfillWorker,
    pub qf: Arc<QfService>,
    pub reconciler: Reconciler,
}

impl AppState {
    pub fn new(repo: Arc<Repository>, config: Config, source: Arc<dyn ChainSource>) -> Self {
        let metrics = Arc::new(Metrics::new());
        let recorder = Arc::new(EventRecorder::new(
            repo.clone(),
            Arc::new(SchemaRegistry::default()),
            metrics.clone(),
        ));
        let backfill = BackfillWorker::new(source.clone(), recorder.clone(), config.ingest_config());
        let qf = Arc::new(QfService::new(repo.clone(), metrics.clone()));
        let reconciler = Reconciler::new(repo.clone());
        Self {
            repo,
            config,
            source,
            metrics,
            recorder,
            backfill,
            qf,
            reconciler,
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health::health))
        .route("/ready", get(health::ready))
        .route("/metrics", get(metrics::get_metrics))
        .route("/v1/backfill", post(backfill::start_backfill))
        .route("/v1/cursors", get(cursors::list_cursors))
        .route("/v1/cursors/:contract", get(cursors::get_cursor))
        .route("/v1/cursors/:contract/reset", post(cursors::reset_cursor))
        .route("/v1/events", get(events::get_events))
        .route("/v1/failed-ranges", get(events::get_failed_ranges))
        .route("/v1/rounds/:round_id", get(qf::get_round))
        .route("/v1/rounds/:round_id/qf", post(qf::trigger_qf))
        .route("/v1/rounds/:round_id/runs", get(qf::list_runs))
        .route("/v1/rounds/:round_id/matches", get(qf::list_matches))
        .route(
            "/v1/rounds/:round_id/matches/:proposal_id/verify",
            post(qf::verify_match),
        )
        .route("/v1/rounds/:round_id/totals", get(reconcile::verify_totals))
        .route("/v1/reconcile", post(reconcile::mark_orphaned))
        .layer(cors)
        .with_state(state)
}

/// Parse a contract address from a request.
pub(crate) fn parse_contract(raw: &str) -> Result<ContractAddress, AppError> {
    let trimmed = raw.trim();
    let valid = trimmed.len() > 2
        && trimmed.starts_with("0x")
        && trimmed[2..].chars().all(|c| c.is_ascii_hexdigit());
    if !valid {
        return Err(AppError::BadRequest(format!(
            "Invalid contract address: {}",
            raw
        )));
    }
    Ok(ContractAddress::new(trimmed))
}
