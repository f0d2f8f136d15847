pub mod api;
pub mod chain;
pub mod config;
pub mod db;
pub mod decode;
pub mod domain;
pub mod error;
pub mod ingest;
pub mod metrics;
pub mod qf;
pub mod reconcile;
pub mod testing;

pub use chain::{ChainSource, ChainSourceError, JsonRpcChainSource, MockChainSource};
pub use config::Config;
pub use db::{init_db, Repository};
pub use domain::{
    BlockNumber, ContractAddress, Decimal, Donation, MatchResult, RawLog, Round, RoundId,
    RoundStatus, TimeMs,
};
pub use error::AppError;
pub use ingest::{EventRecorder, RecordOutcome};
pub use qf::{QfOptions, QfService};
