//! SQLite-backed replication log
//!
//! For single-host deployments where the log should not depend on any of
//! the replicated nodes being up.

use std::path::Path;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::Mutex;

use super::{join_targets, split_targets, LogEntry, LogId, LogUpdate, NewLogEntry, ReplicationLog};
use crate::error::{Error, Result};

/// Replication log stored in a local SQLite file
pub struct SqliteReplicationLog {
    conn: Mutex<Connection>,
}

const SELECT_COLUMNS: &str = "id, record_key, source_node, sql_text, op_type, target_nodes, \
     status, last_error, txn_stage, retry_count, created_at, last_attempt";

impl SqliteReplicationLog {
    /// Create or open the log database
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS replication_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                record_key TEXT,
                source_node TEXT NOT NULL,
                sql_text TEXT NOT NULL,
                op_type TEXT NOT NULL,
                target_nodes TEXT NOT NULL,
                status TEXT NOT NULL,
                last_error TEXT,
                txn_stage TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                last_attempt TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_replication_log_pending
                ON replication_log(status, source_node, id);
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn parse_time(column: &str, text: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                format!("bad {} timestamp {:?}: {}", column, text, e).into(),
            )
        })
}

fn parse_enum<T: std::str::FromStr<Err = Error>>(text: &str) -> rusqlite::Result<T> {
    text.parse().map_err(|e: Error| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e.to_string().into())
    })
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<LogEntry> {
    let created_at: String = row.get(10)?;
    let last_attempt: Option<String> = row.get(11)?;

    Ok(LogEntry {
        id: row.get(0)?,
        record_key: row.get(1)?,
        source_node: row.get(2)?,
        sql_text: row.get(3)?,
        op_kind: parse_enum(&row.get::<_, String>(4)?)?,
        target_nodes: split_targets(&row.get::<_, String>(5)?),
        status: parse_enum(&row.get::<_, String>(6)?)?,
        last_error: row.get(7)?,
        txn_stage: parse_enum(&row.get::<_, String>(8)?)?,
        retry_count: row.get(9)?,
        created_at: parse_time("created_at", &created_at)?,
        last_attempt: last_attempt
            .as_deref()
            .map(|t| parse_time("last_attempt", t))
            .transpose()?,
    })
}

#[async_trait::async_trait]
impl ReplicationLog for SqliteReplicationLog {
    async fn append(&self, entry: NewLogEntry) -> Result<LogId> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO replication_log
                (record_key, source_node, sql_text, op_type, target_nodes,
                 status, last_error, txn_stage, retry_count, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9)
            "#,
            params![
                entry.record_key,
                entry.source_node,
                entry.sql_text,
                entry.op_kind.as_str(),
                join_targets(&entry.target_nodes),
                entry.status.as_str(),
                entry.last_error,
                entry.txn_stage.as_str(),
                entry.created_at.to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    async fn update(&self, id: LogId, update: LogUpdate) -> Result<()> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            r#"
            UPDATE replication_log
            SET status = ?1, last_error = ?2, retry_count = ?3, last_attempt = ?4
            WHERE id = ?5
            "#,
            params![
                update.status.as_str(),
                update.last_error,
                update.retry_count,
                Utc::now().to_rfc3339(),
                id,
            ],
        )?;

        if changed == 0 {
            return Err(Error::LogWriteFailed(format!("no replication log entry {}", id)));
        }
        Ok(())
    }

    async fn list_pending(&self, source_node: &str, limit: usize) -> Result<Vec<LogEntry>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM replication_log \
             WHERE status = 'PENDING' AND source_node = ?1 ORDER BY id LIMIT ?2",
            SELECT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![source_node, limit as i64], row_to_entry)?;

        let mut entries = Vec::new();
        for result in rows {
            entries.push(result?);
        }

        Ok(entries)
    }

    async fn get(&self, id: LogId) -> Result<Option<LogEntry>> {
        let conn = self.conn.lock().await;
        let entry = conn
            .query_row(
                &format!("SELECT {} FROM replication_log WHERE id = ?1", SELECT_COLUMNS),
                params![id],
                row_to_entry,
            )
            .optional()?;
        Ok(entry)
    }
}
