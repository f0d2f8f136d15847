use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::db::CursorError;
use crate::ingest::{IngestError, RecordError};
use crate::qf::QfError;
use crate::reconcile::ReconcileError;

/// Errors surfaced by the command surface.
///
/// Every variant maps to one error code so callers can tell "retry later"
/// from "data rejected" from "not yet eligible".
#[derive(Debug, Error)]
pub enum AppError {
    /// Transient chain or store failure.
    #[error("Temporarily unavailable: {0}")]
    RetryLater(String),
    /// Malformed request.
    #[error("Bad request: {0}")]
    BadRequest(String),
    /// Well-formed request refused by a data rule.
    #[error("Rejected: {0}")]
    Rejected(String),
    /// Precondition not met yet, e.g. matching an open round.
    #[error("Not yet eligible: {0}")]
    NotYetEligible(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn code(&self) -> &'static str {
        match self {
            AppError::RetryLater(_) => "retry_later",
            AppError::BadRequest(_) | AppError::Rejected(_) => "data_rejected",
            AppError::NotYetEligible(_) => "not_yet_eligible",
            AppError::NotFound(_) => "not_found",
            AppError::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::RetryLater(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Rejected(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::NotYetEligible(_) => StatusCode::CONFLICT,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

fn from_db(err: sqlx::Error) -> AppError {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            AppError::RetryLater(err.to_string())
        }
        sqlx::Error::Database(ref db) if db.message().contains("locked") => {
            AppError::RetryLater(err.to_string())
        }
        other => AppError::Internal(other.to_string()),
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        from_db(err)
    }
}

impl From<CursorError> for AppError {
    fn from(err: CursorError) -> Self {
        match err {
            CursorError::Db(e) => from_db(e),
            other => AppError::Rejected(other.to_string()),
        }
    }
}

impl From<IngestError> for AppError {
    fn from(err: IngestError) -> Self {
        if err.is_retryable() {
            return AppError::RetryLater(err.to_string());
        }
        match err {
            IngestError::InvalidRange { .. } => AppError::BadRequest(err.to_string()),
            IngestError::Cursor(e) | IngestError::Record(RecordError::Cursor(e)) => e.into(),
            IngestError::RangeFailed { .. } | IngestError::Chain(_) => {
                AppError::Rejected(err.to_string())
            }
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl From<QfError> for AppError {
    fn from(err: QfError) -> Self {
        match err {
            QfError::RoundNotFound(_) => AppError::NotFound(err.to_string()),
            QfError::RoundNotClosed { .. } => AppError::NotYetEligible(err.to_string()),
            QfError::InvalidAmount(_) | QfError::Overflow(_) => AppError::Rejected(err.to_string()),
            QfError::Db(e) => from_db(e),
        }
    }
}

impl From<ReconcileError> for AppError {
    fn from(err: ReconcileError) -> Self {
        match err {
            ReconcileError::InvalidRange { .. } | ReconcileError::MissingReason => {
                AppError::BadRequest(err.to_string())
            }
            ReconcileError::Db(e) => from_db(e),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({
            "error": self.to_string(),
            "code": self.code(),
        }));

        (status, body).into_response()
    }
}
