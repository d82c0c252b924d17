//! Replication log stored on one of the registry nodes.
//!
//! Uses its own lazily-connected pool, so an unreachable log node only
//! degrades retry bookkeeping and never blocks startup or local writes.

use chrono::{DateTime, Utc};
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::Row;
use tokio::sync::OnceCell;

use super::{join_targets, split_targets, LogEntry, LogId, LogUpdate, NewLogEntry, ReplicationLog};
use crate::config::NodeConfig;
use crate::error::{Error, Result};

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS replication_log (
    id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
    record_key VARCHAR(64) NULL,
    source_node VARCHAR(64) NOT NULL,
    sql_text MEDIUMTEXT NOT NULL,
    op_type VARCHAR(16) NOT NULL,
    target_nodes VARCHAR(1024) NOT NULL,
    status VARCHAR(16) NOT NULL,
    last_error TEXT NULL,
    txn_stage VARCHAR(16) NOT NULL,
    retry_count INT UNSIGNED NOT NULL DEFAULT 0,
    created_at DATETIME(6) NOT NULL,
    last_attempt DATETIME(6) NULL,
    INDEX idx_replication_log_pending (status, source_node, id)
)
"#;

const SELECT_COLUMNS: &str = "id, record_key, source_node, sql_text, op_type, target_nodes, \
     status, last_error, txn_stage, retry_count, created_at, last_attempt";

/// Replication log table on a designated node
pub struct MySqlReplicationLog {
    node_id: String,
    pool: MySqlPool,
    schema_ready: OnceCell<()>,
}

fn log_error(node: &str, e: impl std::fmt::Display) -> Error {
    Error::LogWriteFailed(format!("{}: {}", node, e))
}

fn row_to_entry(row: &MySqlRow) -> Result<LogEntry> {
    Ok(LogEntry {
        id: row.try_get("id")?,
        record_key: row.try_get("record_key")?,
        source_node: row.try_get("source_node")?,
        sql_text: row.try_get("sql_text")?,
        op_kind: row.try_get::<String, _>("op_type")?.parse()?,
        target_nodes: split_targets(&row.try_get::<String, _>("target_nodes")?),
        status: row.try_get::<String, _>("status")?.parse()?,
        last_error: row.try_get("last_error")?,
        txn_stage: row.try_get::<String, _>("txn_stage")?.parse()?,
        retry_count: row.try_get("retry_count")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        last_attempt: row.try_get::<Option<DateTime<Utc>>, _>("last_attempt")?,
    })
}

impl MySqlReplicationLog {
    /// Prepare a pool for the log node without connecting yet
    pub fn connect_lazy(node: &NodeConfig) -> Self {
        let options = MySqlConnectOptions::new()
            .host(&node.host)
            .port(node.port)
            .username(&node.user)
            .password(&node.password)
            .database(&node.database);

        let pool = MySqlPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(node.connect_timeout())
            .connect_lazy_with(options);

        Self {
            node_id: node.id.clone(),
            pool,
            schema_ready: OnceCell::new(),
        }
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.schema_ready
            .get_or_try_init(|| async {
                sqlx::query(CREATE_TABLE)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| log_error(&self.node_id, e))?;
                tracing::info!("Replication log table ready on {}", self.node_id);
                Ok::<(), Error>(())
            })
            .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ReplicationLog for MySqlReplicationLog {
    async fn append(&self, entry: NewLogEntry) -> Result<LogId> {
        self.ensure_schema().await?;

        let result = sqlx::query(
            r#"
            INSERT INTO replication_log
                (record_key, source_node, sql_text, op_type, target_nodes,
                 status, last_error, txn_stage, retry_count, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, ?)
            "#,
        )
        .bind(entry.record_key)
        .bind(entry.source_node)
        .bind(entry.sql_text)
        .bind(entry.op_kind.as_str())
        .bind(join_targets(&entry.target_nodes))
        .bind(entry.status.as_str())
        .bind(entry.last_error)
        .bind(entry.txn_stage.as_str())
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| log_error(&self.node_id, e))?;

        Ok(result.last_insert_id() as LogId)
    }

    async fn update(&self, id: LogId, update: LogUpdate) -> Result<()> {
        self.ensure_schema().await?;

        let result = sqlx::query(
            r#"
            UPDATE replication_log
            SET status = ?, last_error = ?, retry_count = ?, last_attempt = ?
            WHERE id = ?
            "#,
        )
        .bind(update.status.as_str())
        .bind(update.last_error)
        .bind(update.retry_count)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| log_error(&self.node_id, e))?;

        // MySQL reports changed rows, so an identical replay can report 0;
        // only a missing id is an error.
        if result.rows_affected() == 0 && self.get(id).await?.is_none() {
            return Err(Error::LogWriteFailed(format!("no replication log entry {}", id)));
        }
        Ok(())
    }

    async fn list_pending(&self, source_node: &str, limit: usize) -> Result<Vec<LogEntry>> {
        self.ensure_schema().await?;

        let rows = sqlx::query(&format!(
            "SELECT {} FROM replication_log \
             WHERE status = 'PENDING' AND source_node = ? ORDER BY id LIMIT ?",
            SELECT_COLUMNS
        ))
        .bind(source_node)
        .bind(limit as u64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| log_error(&self.node_id, e))?;

        rows.iter().map(row_to_entry).collect()
    }

    async fn get(&self, id: LogId) -> Result<Option<LogEntry>> {
        self.ensure_schema().await?;

        let row = sqlx::query(&format!(
            "SELECT {} FROM replication_log WHERE id = ?",
            SELECT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| log_error(&self.node_id, e))?;

        row.as_ref().map(row_to_entry).transpose()
    }
}
