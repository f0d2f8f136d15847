//! Repository layer for database operations.
//!
//! This module provides the `Repository` struct for all database operations.
//! Methods are organized across submodules by domain:
//! - `events.rs` - Raw event log (append-only) and failed ranges
//! - `cursors.rs` - Per-contract chain cursors
//! - `funding.rs` - Rounds, proposals and donations
//! - `matches.rs` - Match result versions and QF runs
//! - `audit.rs` - Audit trail
//!
//! Functions suffixed `_tx` run on a caller-provided connection so that the
//! caller can group them into one transaction.

mod audit;
mod cursors;
mod events;
mod funding;
mod matches;

pub use audit::AuditEntry;
pub use cursors::{ChainCursor, CursorError};
pub use events::{FailedRange, NewRawEvent};
pub use funding::TotalsMismatch;
pub use matches::QfRun;

use crate::domain::Decimal;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::{Row, Sqlite, Transaction};
use tracing::warn;

/// Repository for database operations.
#[derive(Debug, Clone)]
pub struct Repository {
    pool: SqlitePool,
}

impl Repository {
    /// Create a new repository with the given connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Repository { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Start a transaction that takes the database write lock with its first statement.
    ///
    /// sqlx opens SQLite transactions deferred, and a deferred transaction that
    /// read first cannot upgrade after another connection commits
    /// (SQLITE_BUSY_SNAPSHOT). Touching `write_lock` up front makes writers wait
    /// on `busy_timeout` instead.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO write_lock (id, taken_at) VALUES (1, ?)
            ON CONFLICT(id) DO UPDATE SET taken_at = excluded.taken_at
            "#,
        )
        .bind(now_ms())
        .execute(&mut *tx)
        .await?;
        Ok(tx)
    }
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Read a decimal column stored as canonical text.
///
/// Values are written by this crate only, so a parse failure means the row was
/// edited by hand; it is logged and read as zero.
pub(crate) fn decimal_column(row: &SqliteRow, column: &str) -> Decimal {
    let raw: String = row.get(column);
    Decimal::from_str_canonical(&raw).unwrap_or_else(|e| {
        warn!(column = column, value = %raw, error = %e, "Failed to parse decimal column, using default");
        Decimal::default()
    })
}

pub(crate) fn optional_decimal_column(row: &SqliteRow, column: &str) -> Option<Decimal> {
    let raw: Option<String> = row.get(column);
    raw.and_then(|s| Decimal::from_str_canonical(&s).ok())
}
