//! Quadratic-funding matching: the pure calculator, its fixed-point square
//! root, and the service that runs it against committed donations.

pub mod calculator;
pub mod service;
pub mod sqrt;

pub use calculator::{calculate_matches, ProposalMatch, QfOptions, QfOutcome};
pub use service::{QfRunReport, QfService};
pub use sqrt::sqrt_fixed;

use thiserror::Error;

use crate::domain::{Decimal, RoundId, RoundStatus};

#[derive(Debug, Error)]
pub enum QfError {
    #[error("round {0} not found")]
    RoundNotFound(RoundId),
    #[error("round {round_id} is {status}; matching requires a closed round or a dry run")]
    RoundNotClosed { round_id: RoundId, status: RoundStatus },
    #[error("negative contribution {0}")]
    InvalidAmount(Decimal),
    #[error("decimal overflow computing {0}")]
    Overflow(&'static str),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}
