//! Range-scanning backfill over historical blocks.

use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info};

use super::{EventRecorder, IngestConfig, IngestError};
use crate::chain::{retry_transient, ChainSource};
use crate::db::{ChainCursor, Repository};
use crate::domain::{BlockNumber, ContractAddress};

/// What a backfill run did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillReport {
    pub contract: Option<ContractAddress>,
    /// Windows fetched and recorded.
    pub windows: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub rejected: usize,
    /// Last block scanned; `None` when the range lay entirely above the confirmed head.
    pub scanned_to: Option<BlockNumber>,
    /// Cursor after the run.
    pub cursor: Option<BlockNumber>,
}

#[derive(Clone)]
pub struct BackfillWorker {
    source: Arc<dyn ChainSource>,
    recorder: Arc<EventRecorder>,
    config: IngestConfig,
}

impl BackfillWorker {
    pub fn new(
        source: Arc<dyn ChainSource>,
        recorder: Arc<EventRecorder>,
        config: IngestConfig,
    ) -> Self {
        Self {
            source,
            recorder,
            config,
        }
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn repo(&self) -> &Repository {
        self.recorder.repo()
    }

    /// First-run cursor: the block before the deployment block.
    ///
    /// Insert-if-absent, so an existing cursor is never moved. Without a
    /// deployment block (or at block 0) nothing is written and the first scan
    /// starts at block 0. Returns the cursor in effect afterwards.
    pub async fn seed(
        &self,
        contract: &ContractAddress,
        deployment_block: Option<BlockNumber>,
    ) -> Result<Option<ChainCursor>, IngestError> {
        match deployment_block {
            Some(block) if block > 0 => Ok(Some(self.repo().seed_cursor(contract, block - 1).await?)),
            _ => Ok(self.repo().get_cursor(contract).await?),
        }
    }

    /// Scan `[from_block, to_block]`, clamped to the confirmed head, in windows
    /// of `batch_size` blocks.
    ///
    /// Each window is fetched with bounded retries and recorded together with
    /// its cursor advance in one transaction, so an interrupted run resumes by
    /// re-requesting the window it was in. A window that exhausts its retries is
    /// stored in `failed_ranges` and ends the run with `IngestError::RangeFailed`.
    pub async fn run(
        &self,
        contract: &ContractAddress,
        from_block: BlockNumber,
        to_block: BlockNumber,
    ) -> Result<BackfillReport, IngestError> {
        if from_block > to_block {
            return Err(IngestError::InvalidRange {
                from_block,
                to_block,
            });
        }

        let source = self.source.clone();
        let head = retry_transient(&self.config.retry, "get_chain_head", || {
            let source = source.clone();
            async move { source.get_chain_head().await }
        })
        .await?;
        let confirmed = self.config.confirmed_head(head);

        // A scan from block 0 creates the cursor with its first window.
        let existing = if from_block > 0 {
            Some(self.repo().seed_cursor(contract, from_block - 1).await?)
        } else {
            self.repo().get_cursor(contract).await?
        };

        let mut report = BackfillReport {
            contract: Some(contract.clone()),
            cursor: existing.map(|c| c.last_processed_block),
            ..BackfillReport::default()
        };
        let end = match confirmed {
            Some(confirmed) if from_block <= confirmed => to_block.min(confirmed),
            _ => {
                info!(
                    contract = %contract,
                    from = from_block,
                    confirmed_head = ?confirmed,
                    "Nothing confirmed to backfill"
                );
                if let Some(cursor) = report.cursor {
                    self.recorder.metrics().set_cursor_lag(contract, head, cursor);
                }
                return Ok(report);
            }
        };

        info!(contract = %contract, from = from_block, to = end, head = head, "Starting backfill");
        let batch = self.config.batch_size.max(1);
        let mut start = from_block;
        loop {
            let window_end = start.saturating_add(batch - 1).min(end);
            let logs = self.fetch_window(contract, start, window_end).await?;
            let summary = self
                .recorder
                .record_batch_and_advance(contract, logs, start, window_end)
                .await?;

            report.windows += 1;
            report.inserted += summary.inserted;
            report.duplicates += summary.duplicates;
            report.rejected += summary.rejected;
            report.scanned_to = Some(window_end);
            report.cursor = Some(summary.cursor);
            self.recorder
                .metrics()
                .set_cursor_lag(contract, head, summary.cursor);

            if window_end >= end {
                break;
            }
            start = window_end + 1;
        }

        info!(
            contract = %contract,
            windows = report.windows,
            inserted = report.inserted,
            duplicates = report.duplicates,
            rejected = report.rejected,
            cursor = ?report.cursor,
            "Backfill complete"
        );
        Ok(report)
    }

    /// Backfill from the durable cursor up to the confirmed head.
    pub async fn catch_up(&self, contract: &ContractAddress) -> Result<BackfillReport, IngestError> {
        let from = match self.repo().get_cursor(contract).await? {
            Some(cursor) => cursor.last_processed_block.saturating_add(1),
            None => 0,
        };
        self.run(contract, from, BlockNumber::MAX).await
    }

    async fn fetch_window(
        &self,
        contract: &ContractAddress,
        from_block: BlockNumber,
        to_block: BlockNumber,
    ) -> Result<Vec<crate::domain::RawLog>, IngestError> {
        let source = self.source.clone();
        let result = retry_transient(&self.config.retry, "get_logs", || {
            let source = source.clone();
            let contract = contract.clone();
            async move { source.get_logs(&contract, from_block, to_block).await }
        })
        .await;

        match result {
            Ok(logs) => Ok(logs),
            Err(e) => {
                error!(
                    contract = %contract,
                    from = from_block,
                    to = to_block,
                    attempts = e.attempts,
                    error = %e.last_error,
                    "Range failed, operator attention required"
                );
                self.recorder.metrics().inc_ranges_failed();
                self.repo()
                    .insert_failed_range(
                        contract,
                        from_block,
                        to_block,
                        e.attempts,
                        &e.last_error.to_string(),
                    )
                    .await?;
                Err(IngestError::RangeFailed {
                    contract: contract.clone(),
                    from_block,
                    to_block,
                    source: e,
                })
            }
        }
    }
}

impl std::fmt::Debug for BackfillWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackfillWorker")
            .field("source", &self.source)
            .field("config", &self.config)
            .finish()
    }
}
