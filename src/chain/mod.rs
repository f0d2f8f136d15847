//! Chain source abstraction for reading contract logs from a ledger node.

use crate::domain::{BlockNumber, ContractAddress, RawLog};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;

pub mod mock;
pub mod retry;
pub mod rpc;

pub use mock::MockChainSource;
pub use retry::{retry_transient, RetryError, RetryPolicy};
pub use rpc::JsonRpcChainSource;

/// Item delivered by a log subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionEvent {
    /// A log emitted by the subscribed contract.
    Log(RawLog),
    /// The node observed a new chain head. Doubles as the subscription heartbeat.
    NewHead(BlockNumber),
}

pub type LogStream = BoxStream<'static, Result<SubscriptionEvent, ChainSourceError>>;

/// Read access to a ledger node.
///
/// Implementations return logs ordered by (block, transaction index, log index)
/// and only for the requested contract.
#[async_trait]
pub trait ChainSource: Send + Sync + fmt::Debug {
    /// Fetch logs emitted by `contract` in the closed block range `[from_block, to_block]`.
    async fn get_logs(
        &self,
        contract: &ContractAddress,
        from_block: BlockNumber,
        to_block: BlockNumber,
    ) -> Result<Vec<RawLog>, ChainSourceError>;

    /// Subscribe to new logs and heads for `contract`.
    async fn subscribe_logs(&self, contract: &ContractAddress) -> Result<LogStream, ChainSourceError>;

    /// Current chain head block number.
    async fn get_chain_head(&self) -> Result<BlockNumber, ChainSourceError>;
}

/// Error type for chain source operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainSourceError {
    /// Network error (e.g., connection reset, DNS failure)
    NetworkError(String),
    /// Request exceeded its deadline
    Timeout,
    /// HTTP error (e.g., 429 rate limit, 5xx server error)
    HttpError { status: u16, message: String },
    /// JSON-RPC level error returned by the node
    RpcError { code: i64, message: String },
    /// Parsing error (invalid JSON or malformed response)
    ParseError(String),
    /// Subscription stream ended or stopped heart-beating
    Disconnected,
}

impl ChainSourceError {
    /// Whether the failure is worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            ChainSourceError::NetworkError(_)
            | ChainSourceError::Timeout
            | ChainSourceError::Disconnected => true,
            ChainSourceError::HttpError { status, .. } => *status == 429 || *status >= 500,
            ChainSourceError::RpcError { .. } | ChainSourceError::ParseError(_) => false,
        }
    }
}

impl fmt::Display for ChainSourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainSourceError::NetworkError(msg) => write!(f, "Network error: {}", msg),
            ChainSourceError::Timeout => write!(f, "Request timed out"),
            ChainSourceError::HttpError { status, message } => {
                write!(f, "HTTP error {}: {}", status, message)
            }
            ChainSourceError::RpcError { code, message } => {
                write!(f, "RPC error {}: {}", code, message)
            }
            ChainSourceError::ParseError(msg) => write!(f, "Parse error: {}", msg),
            ChainSourceError::Disconnected => write!(f, "Subscription disconnected"),
        }
    }
}

impl std::error::Error for ChainSourceError {}
