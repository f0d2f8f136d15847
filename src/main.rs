use anyhow::Context;
use qf_indexer::api::{self, AppState};
use qf_indexer::chain::{ChainSource, JsonRpcChainSource};
use qf_indexer::config::Config;
use qf_indexer::db::{init_db_with_timeout, Repository};
use qf_indexer::ingest::{ContractIndexer, LiveListener};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env().context("invalid configuration")?;
    let port = config.port;

    let pool = init_db_with_timeout(&config.database_path, config.db_timeout)
        .await
        .with_context(|| format!("failed to initialize database at {}", config.database_path))?;
    let repo = Arc::new(Repository::new(pool));

    let source: Arc<dyn ChainSource> = Arc::new(JsonRpcChainSource::new(
        config.chain_rpc_url.clone(),
        config.rpc_timeout,
        config.poll_interval,
    ));
    let state = AppState::new(repo, config.clone(), source.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut indexers = Vec::with_capacity(config.contracts.len());
    for spec in &config.contracts {
        let listener = LiveListener::new(
            source.clone(),
            state.recorder.clone(),
            state.backfill.clone(),
        );
        let indexer = ContractIndexer::new(
            spec.address.clone(),
            spec.deployment_block,
            source.clone(),
            state.backfill.clone(),
            listener,
        );
        tracing::info!(
            contract = %spec.address,
            deployment_block = ?spec.deployment_block,
            "Starting indexer"
        );
        indexers.push(indexer.spawn(shutdown_rx.clone()));
    }

    let app = api::create_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;
    tracing::info!("Server listening on {}", addr);

    let server_shutdown = shutdown_tx.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutdown requested");
            let _ = server_shutdown.send(true);
        })
        .await
        .context("server error")?;

    let _ = shutdown_tx.send(true);
    for handle in indexers {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Indexer task panicked");
        }
    }
    tracing::info!("Shutdown complete");
    Ok(())
}
