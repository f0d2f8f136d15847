//! Raw event log operations.

use crate::domain::{BlockNumber, ContractAddress, RawEvent, RawLog, TimeMs, TxHash};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::Row;
use std::collections::BTreeMap;

use super::{now_ms, Repository};

/// Values written for a newly received log.
#[derive(Debug, Clone)]
pub struct NewRawEvent<'a> {
    pub log: &'a RawLog,
    pub event_name: Option<&'a str>,
    pub payload: &'a BTreeMap<String, serde_json::Value>,
}

/// A block range whose retries were exhausted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedRange {
    pub contract_address: ContractAddress,
    pub from_block: BlockNumber,
    pub to_block: BlockNumber,
    pub attempts: u32,
    pub error: String,
    pub created_at: TimeMs,
}

const RAW_EVENT_COLUMNS: &str = "id, tx_hash, log_index, block_number, contract_address, \
     event_name, payload, processed, error, received_at";

impl Repository {
    /// Insert a raw event keyed by (tx_hash, log_index).
    ///
    /// Returns the new row id, or `None` when the key was already recorded.
    pub async fn insert_raw_event_tx(
        conn: &mut SqliteConnection,
        event: &NewRawEvent<'_>,
    ) -> Result<Option<i64>, sqlx::Error> {
        let payload = serde_json::to_string(event.payload)
            .unwrap_or_else(|_| "{}".to_string());

        let result = sqlx::query(
            r#"
            INSERT INTO raw_events (
                tx_hash, log_index, tx_index, block_number, contract_address,
                topic, event_name, payload, processed, error, received_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, NULL, ?)
            ON CONFLICT(tx_hash, log_index) DO NOTHING
            "#,
        )
        .bind(event.log.tx_hash.as_str())
        .bind(event.log.log_index as i64)
        .bind(event.log.tx_index as i64)
        .bind(event.log.block_number as i64)
        .bind(event.log.contract_address.as_str())
        .bind(event.log.topic.as_str())
        .bind(event.event_name)
        .bind(payload)
        .bind(now_ms())
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        Ok(Some(result.last_insert_rowid()))
    }

    pub async fn mark_raw_event_processed_tx(
        conn: &mut SqliteConnection,
        raw_event_id: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE raw_events SET processed = 1, error = NULL WHERE id = ?")
            .bind(raw_event_id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    pub async fn mark_raw_event_failed_tx(
        conn: &mut SqliteConnection,
        raw_event_id: i64,
        error: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE raw_events SET processed = 0, error = ? WHERE id = ?")
            .bind(error)
            .bind(raw_event_id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// List raw events of a contract in chain order, optionally bounded by block.
    pub async fn list_raw_events(
        &self,
        contract: &ContractAddress,
        from_block: Option<BlockNumber>,
        to_block: Option<BlockNumber>,
    ) -> Result<Vec<RawEvent>, sqlx::Error> {
        let sql = format!(
            r#"
            SELECT {RAW_EVENT_COLUMNS}
            FROM raw_events
            WHERE contract_address = ? AND block_number >= ? AND block_number <= ?
            ORDER BY block_number ASC, tx_index ASC, log_index ASC
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(contract.as_str())
            .bind(from_block.unwrap_or(0) as i64)
            .bind(to_block.map(|b| b as i64).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.iter().map(raw_event_from_row).collect())
    }

    pub async fn get_raw_event(
        &self,
        tx_hash: &TxHash,
        log_index: u64,
    ) -> Result<Option<RawEvent>, sqlx::Error> {
        let sql = format!(
            "SELECT {RAW_EVENT_COLUMNS} FROM raw_events WHERE tx_hash = ? AND log_index = ?"
        );
        let row = sqlx::query(&sql)
            .bind(tx_hash.as_str())
            .bind(log_index as i64)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().map(raw_event_from_row))
    }

    /// Count raw events of a contract; with `errors_only`, only unprocessed ones with an error.
    pub async fn count_raw_events(
        &self,
        contract: &ContractAddress,
        errors_only: bool,
    ) -> Result<i64, sqlx::Error> {
        let sql = if errors_only {
            "SELECT COUNT(*) FROM raw_events WHERE contract_address = ? AND processed = 0 AND error IS NOT NULL"
        } else {
            "SELECT COUNT(*) FROM raw_events WHERE contract_address = ?"
        };
        let (count,): (i64,) = sqlx::query_as(sql)
            .bind(contract.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn insert_failed_range(
        &self,
        contract: &ContractAddress,
        from_block: BlockNumber,
        to_block: BlockNumber,
        attempts: u32,
        error: &str,
    ) -> Result<(), sqlx::Error> {
        let mut tx = self.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO failed_ranges (contract_address, from_block, to_block, attempts, error, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(contract.as_str())
        .bind(from_block as i64)
        .bind(to_block as i64)
        .bind(attempts as i64)
        .bind(error)
        .bind(now_ms())
        .execute(&mut *tx)
        .await?;

        Repository::insert_audit_tx(
            &mut tx,
            "range_failed",
            contract.as_str(),
            &serde_json::json!({
                "fromBlock": from_block,
                "toBlock": to_block,
                "attempts": attempts,
                "error": error,
            }),
        )
        .await?;
        tx.commit().await
    }

    pub async fn list_failed_ranges(
        &self,
        contract: &ContractAddress,
    ) -> Result<Vec<FailedRange>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT contract_address, from_block, to_block, attempts, error, created_at
            FROM failed_ranges
            WHERE contract_address = ?
            ORDER BY id ASC
            "#,
        )
        .bind(contract.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| FailedRange {
                contract_address: ContractAddress::new(r.get::<String, _>("contract_address")),
                from_block: r.get::<i64, _>("from_block") as u64,
                to_block: r.get::<i64, _>("to_block") as u64,
                attempts: r.get::<i64, _>("attempts") as u32,
                error: r.get("error"),
                created_at: TimeMs::new(r.get("created_at")),
            })
            .collect())
    }
}

fn raw_event_from_row(row: &SqliteRow) -> RawEvent {
    let payload_str: String = row.get("payload");
    let payload: BTreeMap<String, serde_json::Value> =
        serde_json::from_str(&payload_str).unwrap_or_default();
    let processed: i64 = row.get("processed");

    RawEvent {
        id: row.get("id"),
        tx_hash: TxHash::new(row.get::<String, _>("tx_hash")),
        log_index: row.get::<i64, _>("log_index") as u64,
        block_number: row.get::<i64, _>("block_number") as u64,
        contract_address: ContractAddress::new(row.get::<String, _>("contract_address")),
        event_name: row.get("event_name"),
        payload,
        processed: processed != 0,
        error: row.get("error"),
        received_at: TimeMs::new(row.get("received_at")),
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::setup_test_db;
    use super::*;

    fn make_log(tx: &str, log_index: u64, block: u64) -> RawLog {
        RawLog {
            tx_hash: TxHash::new(tx),
            tx_index: 0,
            log_index,
            block_number: block,
            contract_address: ContractAddress::new("0xc0"),
            topic: "0x01".to_string(),
            data: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_insert_raw_event_is_idempotent() {
        let (repo, _temp) = setup_test_db().await;
        let log = make_log("0xaa", 0, 10);
        let payload = BTreeMap::new();
        let new_event = NewRawEvent {
            log: &log,
            event_name: Some("RoundCreated"),
            payload: &payload,
        };

        let mut tx = repo.begin().await.unwrap();
        let first = Repository::insert_raw_event_tx(&mut tx, &new_event).await.unwrap();
        let second = Repository::insert_raw_event_tx(&mut tx, &new_event).await.unwrap();
        tx.commit().await.unwrap();

        assert!(first.is_some());
        assert!(second.is_none());
        assert_eq!(repo.count_raw_events(&log.contract_address, false).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_mark_failed_and_list_in_chain_order() {
        let (repo, _temp) = setup_test_db().await;
        let payload = BTreeMap::new();
        let logs = vec![make_log("0xbb", 0, 12), make_log("0xaa", 1, 10), make_log("0xaa", 0, 10)];

        let mut tx = repo.begin().await.unwrap();
        let mut ids = Vec::new();
        for log in &logs {
            let id = Repository::insert_raw_event_tx(
                &mut tx,
                &NewRawEvent {
                    log,
                    event_name: None,
                    payload: &payload,
                },
            )
            .await
            .unwrap()
            .unwrap();
            ids.push(id);
        }
        Repository::mark_raw_event_failed_tx(&mut tx, ids[0], "unknown selector")
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let contract = ContractAddress::new("0xc0");
        let events = repo.list_raw_events(&contract, None, None).await.unwrap();
        let order: Vec<_> = events.iter().map(|e| (e.block_number, e.log_index)).collect();
        assert_eq!(order, vec![(10, 0), (10, 1), (12, 0)]);
        assert_eq!(events[2].error.as_deref(), Some("unknown selector"));
        assert!(!events[2].processed);
        assert_eq!(repo.count_raw_events(&contract, true).await.unwrap(), 1);

        let bounded = repo.list_raw_events(&contract, Some(11), None).await.unwrap();
        assert_eq!(bounded.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_range_roundtrip() {
        let (repo, _temp) = setup_test_db().await;
        let contract = ContractAddress::new("0xc0");
        repo.insert_failed_range(&contract, 100, 199, 5, "timeout")
            .await
            .unwrap();
        let ranges = repo.list_failed_ranges(&contract).await.unwrap();
        assert_eq!(ranges.len(), 1);
        assert_eq!((ranges[0].from_block, ranges[0].to_block), (100, 199));
        assert_eq!(ranges[0].attempts, 5);
    }
}
