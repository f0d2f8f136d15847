//! Live tail of a contract's logs.
//!
//! Logs from the subscription are buffered per block. When a new head `h` is
//! seen, every block up to `h - confirmation_depth` is finalised in order with
//! one transaction per block. Blocks that were already mined when the
//! subscription opened are read through the backfill path instead, since the
//! subscription never delivers them.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{BackfillWorker, EventRecorder, IngestConfig, IngestError};
use crate::chain::{retry_transient, ChainSource, SubscriptionEvent};
use crate::domain::{BlockNumber, ContractAddress, RawLog};

pub struct LiveListener {
    source: Arc<dyn ChainSource>,
    recorder: Arc<EventRecorder>,
    backfill: BackfillWorker,
    config: IngestConfig,
}

/// Why a subscription session ended.
enum SessionEnd {
    Shutdown,
    Resubscribe,
}

impl LiveListener {
    pub fn new(
        source: Arc<dyn ChainSource>,
        recorder: Arc<EventRecorder>,
        backfill: BackfillWorker,
    ) -> Self {
        let config = backfill.config().clone();
        Self {
            source,
            recorder,
            backfill,
            config,
        }
    }

    /// Tail `contract` until `shutdown` flips to true.
    ///
    /// Before every (re)subscription the listener catches up from the durable
    /// cursor, so blocks missed while disconnected are recovered. Transient
    /// failures lead to a resubscribe; permanent ones end the listener.
    pub async fn run(
        &self,
        contract: &ContractAddress,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), IngestError> {
        let mut sessions = 0u64;
        loop {
            if *shutdown.borrow() {
                info!(contract = %contract, "Listener stopped");
                return Ok(());
            }
            if sessions > 0 {
                self.recorder.metrics().inc_resubscriptions();
            }
            sessions += 1;

            match self.session(contract, &mut shutdown).await {
                Ok(SessionEnd::Shutdown) => {
                    info!(contract = %contract, "Listener stopped");
                    return Ok(());
                }
                Ok(SessionEnd::Resubscribe) => {
                    info!(contract = %contract, "Resubscribing");
                }
                Err(e) if e.is_retryable() => {
                    warn!(contract = %contract, error = %e, "Listener session failed, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.retry.max_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn session(
        &self,
        contract: &ContractAddress,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<SessionEnd, IngestError> {
        self.backfill.catch_up(contract).await?;

        let source = self.source.clone();
        let mut stream = retry_transient(&self.config.retry, "subscribe_logs", || {
            let source = source.clone();
            let contract = contract.clone();
            async move { source.subscribe_logs(&contract).await }
        })
        .await?;

        // Blocks up to this head may have logs the stream will never deliver.
        let source = self.source.clone();
        let subscribed_head = retry_transient(&self.config.retry, "get_chain_head", || {
            let source = source.clone();
            async move { source.get_chain_head().await }
        })
        .await?;
        debug!(contract = %contract, head = subscribed_head, "Subscribed");

        let mut pending: BTreeMap<BlockNumber, Vec<RawLog>> = BTreeMap::new();
        loop {
            let next = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(SessionEnd::Shutdown);
                    }
                    continue;
                }
                next = tokio::time::timeout(self.config.heartbeat_timeout, stream.next()) => next,
            };

            match next {
                Err(_) => {
                    warn!(
                        contract = %contract,
                        timeout_ms = self.config.heartbeat_timeout.as_millis() as u64,
                        "No heartbeat from subscription"
                    );
                    return Ok(SessionEnd::Resubscribe);
                }
                Ok(None) => {
                    warn!(contract = %contract, "Subscription closed");
                    return Ok(SessionEnd::Resubscribe);
                }
                Ok(Some(Err(e))) => {
                    warn!(contract = %contract, error = %e, "Subscription error");
                    return Ok(SessionEnd::Resubscribe);
                }
                Ok(Some(Ok(SubscriptionEvent::Log(log)))) => {
                    if &log.contract_address == contract {
                        pending.entry(log.block_number).or_default().push(log);
                    }
                }
                Ok(Some(Ok(SubscriptionEvent::NewHead(head)))) => {
                    self.finalize(contract, &mut pending, head, subscribed_head)
                        .await?;
                }
            }
        }
    }

    /// Record every confirmed block above the cursor.
    async fn finalize(
        &self,
        contract: &ContractAddress,
        pending: &mut BTreeMap<BlockNumber, Vec<RawLog>>,
        head: BlockNumber,
        subscribed_head: BlockNumber,
    ) -> Result<(), IngestError> {
        let Some(confirmed) = self.config.confirmed_head(head) else {
            return Ok(());
        };
        // First block not yet durable.
        let mut next = self
            .recorder
            .repo()
            .get_cursor(contract)
            .await?
            .map_or(0, |c| c.last_processed_block.saturating_add(1));

        // Mined before the subscription opened: not observable live.
        let unobserved_end = confirmed.min(subscribed_head);
        if next <= unobserved_end {
            let report = self.backfill.run(contract, next, unobserved_end).await?;
            if let Some(cursor) = report.cursor {
                next = cursor + 1;
            }
        }

        if next <= confirmed {
            let blocks: Vec<BlockNumber> = pending
                .range(next..=confirmed)
                .map(|(block, _)| *block)
                .collect();
            for block in blocks {
                if block > next {
                    next = self
                        .recorder
                        .record_batch_and_advance(contract, Vec::new(), next, block - 1)
                        .await?
                        .cursor
                        + 1;
                }
                let logs = pending.remove(&block).unwrap_or_default();
                next = self
                    .recorder
                    .record_batch_and_advance(contract, logs, block, block)
                    .await?
                    .cursor
                    + 1;
            }
            if next <= confirmed {
                next = self
                    .recorder
                    .record_batch_and_advance(contract, Vec::new(), next, confirmed)
                    .await?
                    .cursor
                    + 1;
            }
        }

        // Anything at or below the cursor is already durable.
        *pending = pending.split_off(&next);
        if let Some(cursor) = next.checked_sub(1) {
            self.recorder.metrics().set_cursor_lag(contract, head, cursor);
        }
        Ok(())
    }
}

impl std::fmt::Debug for LiveListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveListener")
            .field("source", &self.source)
            .field("config", &self.config)
            .finish()
    }
}
