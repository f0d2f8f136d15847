//! Ingestion: the idempotent recorder, backfill worker, live listener and the
//! per-contract supervisor that hands over between them.
//!
//! Per contract the indexer moves `Uninitialized -> CatchingUp -> Live`; the
//! state is derived from the durable cursor and the chain head, never kept in
//! memory.

pub mod backfill;
pub mod listener;
pub mod locks;
pub mod recorder;
pub mod supervisor;

pub use backfill::{BackfillReport, BackfillWorker};
pub use listener::LiveListener;
pub use locks::KeyedLocks;
pub use recorder::{BatchSummary, EventRecorder, RecordError, RecordOutcome};
pub use supervisor::ContractIndexer;

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::chain::{ChainSourceError, RetryError, RetryPolicy};
use crate::db::CursorError;
use crate::domain::{BlockNumber, ContractAddress};

/// Tunables shared by the backfill worker and the live listener.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestConfig {
    /// Blocks per backfill window.
    pub batch_size: u64,
    /// Blocks behind head treated as final.
    pub confirmation_depth: u64,
    pub retry: RetryPolicy,
    /// Resubscribe when the subscription is silent this long.
    pub heartbeat_timeout: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            confirmation_depth: 12,
            retry: RetryPolicy::default(),
            heartbeat_timeout: Duration::from_secs(30),
        }
    }
}

impl IngestConfig {
    /// Highest block considered final for a given head; `None` while the chain
    /// is shorter than the confirmation depth.
    pub fn confirmed_head(&self, head: BlockNumber) -> Option<BlockNumber> {
        head.checked_sub(self.confirmation_depth)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexerState {
    /// No cursor row yet.
    Uninitialized,
    /// Cursor behind the confirmed head; the backfill worker owns the contract.
    CatchingUp,
    /// Cursor at the confirmed head; the live listener owns the contract.
    Live,
}

impl IndexerState {
    pub fn derive(
        cursor: Option<BlockNumber>,
        head: BlockNumber,
        confirmation_depth: u64,
    ) -> Self {
        match cursor {
            None => IndexerState::Uninitialized,
            Some(c) if c < head.saturating_sub(confirmation_depth) => IndexerState::CatchingUp,
            Some(_) => IndexerState::Live,
        }
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    /// A transient chain failure that outlived its retries, or a permanent one.
    #[error("chain source failed for {contract} blocks {from_block}..={to_block}: {source}")]
    RangeFailed {
        contract: ContractAddress,
        from_block: BlockNumber,
        to_block: BlockNumber,
        #[source]
        source: RetryError,
    },
    #[error("chain source error: {0}")]
    Chain(#[from] RetryError),
    #[error("invalid block range {from_block}..={to_block}")]
    InvalidRange {
        from_block: BlockNumber,
        to_block: BlockNumber,
    },
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
    #[error(transparent)]
    Cursor(#[from] CursorError),
}

impl IngestError {
    /// Whether the caller may simply try again later.
    pub fn is_retryable(&self) -> bool {
        match self {
            IngestError::RangeFailed { source, .. } | IngestError::Chain(source) => {
                source.last_error.is_transient()
            }
            IngestError::Db(_) | IngestError::Record(RecordError::Db(_)) => true,
            _ => false,
        }
    }
}

impl From<ChainSourceError> for IngestError {
    fn from(e: ChainSourceError) -> Self {
        IngestError::Chain(RetryError {
            attempts: 1,
            last_error: e,
        })
    }
}
