//! Append-only audit trail.

use crate::domain::TimeMs;
use serde::Serialize;
use sqlx::sqlite::SqliteConnection;
use sqlx::Row;

use super::{now_ms, Repository};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub kind: String,
    pub subject: String,
    pub detail: serde_json::Value,
    pub created_at: TimeMs,
}

impl Repository {
    /// Write an audit row and mirror it to the `audit` tracing target.
    ///
    /// The row commits with the caller's transaction; the log line is emitted
    /// immediately.
    pub async fn insert_audit_tx(
        conn: &mut SqliteConnection,
        kind: &str,
        subject: &str,
        detail: &serde_json::Value,
    ) -> Result<(), sqlx::Error> {
        tracing::info!(target: "audit", kind = kind, subject = subject, detail = %detail, "audit");

        sqlx::query("INSERT INTO audit_log (kind, subject, detail, created_at) VALUES (?, ?, ?, ?)")
            .bind(kind)
            .bind(subject)
            .bind(detail.to_string())
            .bind(now_ms())
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Most recent audit entries first, optionally filtered by kind.
    pub async fn list_audit(
        &self,
        kind: Option<&str>,
        limit: i64,
    ) -> Result<Vec<AuditEntry>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT kind, subject, detail, created_at
            FROM audit_log
            WHERE (? IS NULL OR kind = ?)
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(kind)
        .bind(kind)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| {
                let detail: String = r.get("detail");
                AuditEntry {
                    kind: r.get("kind"),
                    subject: r.get("subject"),
                    detail: serde_json::from_str(&detail).unwrap_or(serde_json::Value::Null),
                    created_at: TimeMs::new(r.get("created_at")),
                }
            })
            .collect())
    }
}
