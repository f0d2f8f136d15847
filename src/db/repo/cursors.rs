//! Chain cursor operations: one authoritative row per monitored contract.

use crate::domain::{BlockNumber, ContractAddress, TimeMs};
use serde::Serialize;
use sqlx::sqlite::SqliteConnection;
use sqlx::Row;
use thiserror::Error;

use super::{now_ms, Repository};

/// Highest block fully processed for a contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainCursor {
    pub contract_address: ContractAddress,
    pub last_processed_block: BlockNumber,
    pub updated_at: TimeMs,
}

#[derive(Debug, Error)]
pub enum CursorError {
    #[error("cursor for {contract} is at {current}, refusing to move it back to {requested}")]
    Regression {
        contract: ContractAddress,
        current: BlockNumber,
        requested: BlockNumber,
    },
    #[error("contract {0} already has recorded events; reset is only allowed for fresh deployments")]
    HasHistory(ContractAddress),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

impl Repository {
    pub async fn get_cursor(
        &self,
        contract: &ContractAddress,
    ) -> Result<Option<ChainCursor>, sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        Repository::get_cursor_tx(&mut conn, contract).await
    }

    pub async fn get_cursor_tx(
        conn: &mut SqliteConnection,
        contract: &ContractAddress,
    ) -> Result<Option<ChainCursor>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT contract_address, last_processed_block, updated_at FROM chain_cursors WHERE contract_address = ?",
        )
        .bind(contract.as_str())
        .fetch_optional(&mut *conn)
        .await?;

        Ok(row.map(|r| ChainCursor {
            contract_address: ContractAddress::new(r.get::<String, _>("contract_address")),
            last_processed_block: r.get::<i64, _>("last_processed_block") as u64,
            updated_at: TimeMs::new(r.get("updated_at")),
        }))
    }

    pub async fn list_cursors(&self) -> Result<Vec<ChainCursor>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT contract_address, last_processed_block, updated_at FROM chain_cursors ORDER BY contract_address",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| ChainCursor {
                contract_address: ContractAddress::new(r.get::<String, _>("contract_address")),
                last_processed_block: r.get::<i64, _>("last_processed_block") as u64,
                updated_at: TimeMs::new(r.get("updated_at")),
            })
            .collect())
    }

    /// Create the cursor row if it does not exist. Returns the cursor now in effect.
    pub async fn seed_cursor(
        &self,
        contract: &ContractAddress,
        block: BlockNumber,
    ) -> Result<ChainCursor, sqlx::Error> {
        let mut tx = self.begin().await?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO chain_cursors (contract_address, last_processed_block, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(contract_address) DO NOTHING
            "#,
        )
        .bind(contract.as_str())
        .bind(block as i64)
        .bind(now_ms())
        .execute(&mut *tx)
        .await?
        .rows_affected()
            > 0;

        if inserted {
            Repository::insert_audit_tx(
                &mut tx,
                "cursor_seeded",
                contract.as_str(),
                &serde_json::json!({ "block": block }),
            )
            .await?;
        }

        let cursor = Repository::get_cursor_tx(&mut tx, contract)
            .await?
            .ok_or(sqlx::Error::RowNotFound)?;
        tx.commit().await?;
        Ok(cursor)
    }

    /// Move the cursor forward to `block` inside the caller's transaction.
    ///
    /// Creates the row when missing. Moving backwards is a `CursorError::Regression`;
    /// advancing to the current value is a no-op.
    pub async fn advance_cursor_tx(
        conn: &mut SqliteConnection,
        contract: &ContractAddress,
        block: BlockNumber,
    ) -> Result<(), CursorError> {
        let updated = sqlx::query(
            r#"
            UPDATE chain_cursors
            SET last_processed_block = ?, updated_at = ?
            WHERE contract_address = ? AND last_processed_block <= ?
            "#,
        )
        .bind(block as i64)
        .bind(now_ms())
        .bind(contract.as_str())
        .bind(block as i64)
        .execute(&mut *conn)
        .await?
        .rows_affected();

        if updated > 0 {
            return Ok(());
        }

        match Repository::get_cursor_tx(conn, contract).await? {
            Some(current) => Err(CursorError::Regression {
                contract: contract.clone(),
                current: current.last_processed_block,
                requested: block,
            }),
            None => {
                sqlx::query(
                    "INSERT INTO chain_cursors (contract_address, last_processed_block, updated_at) VALUES (?, ?, ?)",
                )
                .bind(contract.as_str())
                .bind(block as i64)
                .bind(now_ms())
                .execute(&mut *conn)
                .await?;
                Ok(())
            }
        }
    }

    /// Operator action for a fresh deployment: set the cursor to `block` unconditionally.
    ///
    /// Refused when any raw event is already recorded for the address, so an
    /// indexed history can never be silently rewound.
    pub async fn reset_cursor_for_deployment(
        &self,
        contract: &ContractAddress,
        block: BlockNumber,
    ) -> Result<ChainCursor, CursorError> {
        let mut tx = self.begin().await?;

        let (events,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM raw_events WHERE contract_address = ?")
                .bind(contract.as_str())
                .fetch_one(&mut *tx)
                .await?;
        if events > 0 {
            return Err(CursorError::HasHistory(contract.clone()));
        }

        let previous = Repository::get_cursor_tx(&mut tx, contract).await?;
        sqlx::query(
            r#"
            INSERT INTO chain_cursors (contract_address, last_processed_block, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(contract_address) DO UPDATE SET
                last_processed_block = excluded.last_processed_block,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(contract.as_str())
        .bind(block as i64)
        .bind(now_ms())
        .execute(&mut *tx)
        .await?;

        Repository::insert_audit_tx(
            &mut tx,
            "cursor_reset",
            contract.as_str(),
            &serde_json::json!({
                "from": previous.map(|c| c.last_processed_block),
                "to": block,
            }),
        )
        .await?;

        let cursor = Repository::get_cursor_tx(&mut tx, contract)
            .await?
            .ok_or(sqlx::Error::RowNotFound)?;
        tx.commit().await?;
        Ok(cursor)
    }
}
