use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use super::{BackfillWorker, IndexerState, IngestError, LiveListener};
use crate::chain::ChainSource;
use crate::domain::{BlockNumber, ContractAddress};

/// Drives one contract through `Uninitialized -> CatchingUp -> Live`.
#[derive(Debug)]
pub struct ContractIndexer {
    contract: ContractAddress,
    deployment_block: Option<BlockNumber>,
    source: Arc<dyn ChainSource>,
    backfill: BackfillWorker,
    listener: LiveListener,
}

impl ContractIndexer {
    pub fn new(
        contract: ContractAddress,
        deployment_block: Option<BlockNumber>,
        source: Arc<dyn ChainSource>,
        backfill: BackfillWorker,
        listener: LiveListener,
    ) -> Self {
        Self {
            contract,
            deployment_block,
            source,
            backfill,
            listener,
        }
    }

    pub fn contract(&self) -> &ContractAddress {
        &self.contract
    }

    /// Current state, derived from the durable cursor and the chain head.
    pub async fn state(&self) -> Result<IndexerState, IngestError> {
        let cursor = self
            .backfill
            .repo()
            .get_cursor(&self.contract)
            .await?
            .map(|c| c.last_processed_block);
        let head = self.source.get_chain_head().await?;
        Ok(IndexerState::derive(
            cursor,
            head,
            self.backfill.config().confirmation_depth,
        ))
    }

    /// Seed the cursor on first run, catch up, then tail live until shutdown.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<(), IngestError> {
        let existing = self.backfill.repo().get_cursor(&self.contract).await?;
        if existing.is_none() {
            match self.backfill.seed(&self.contract, self.deployment_block).await? {
                Some(cursor) => info!(
                    contract = %self.contract,
                    cursor = cursor.last_processed_block,
                    "Seeded cursor"
                ),
                None => info!(contract = %self.contract, "No deployment block, scanning from block 0"),
            }
        }

        match self.backfill.catch_up(&self.contract).await {
            Ok(report) => info!(
                contract = %self.contract,
                cursor = ?report.cursor,
                "Caught up, switching to live"
            ),
            // The listener's first session catches up again from the cursor.
            Err(e) if e.is_retryable() => {
                error!(contract = %self.contract, error = %e, "Initial catch-up failed")
            }
            Err(e) => return Err(e),
        }

        self.listener.run(&self.contract, shutdown).await
    }

    /// Run on its own task, logging a terminal error.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run(shutdown).await {
                error!(contract = %self.contract, error = %e, "Indexer stopped with error");
            }
        })
    }
}
