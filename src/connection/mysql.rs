//! MariaDB/MySQL connector
//!
//! One dedicated `MySqlConnection` per [`NodeConnection`]. Local writes use
//! bound parameters; replicated statements arrive pre-rendered and go over
//! the text protocol.
//!
//! Key allocation first locks a per-range row in `wolfshard_key_allocation`;
//! locking the scanned key range alone takes no exclusive lock while the
//! range is still empty.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use sqlx::mysql::{MySqlArguments, MySqlConnectOptions, MySqlConnection, MySqlRow};
use sqlx::query::Query;
use sqlx::{Connection, Executor, MySql, Row};
use tokio::time::timeout;

use super::{ConnectMode, NodeConnection, NodeConnector};
use crate::config::{ColumnKind, NodeConfig, SchemaConfig};
use crate::error::{Error, Result};
use crate::record::sql::{preview, quote_ident};
use crate::record::{Fields, KeyFormat, KeyRange, Record, Value};

/// Per-range allocator rows. Key allocation locks its range's row before
/// scanning, so concurrent inserts into an empty range still serialize.
const CREATE_ALLOCATOR: &str = r#"
CREATE TABLE IF NOT EXISTS wolfshard_key_allocation (
    table_name VARCHAR(64) NOT NULL,
    range_start BIGINT UNSIGNED NOT NULL,
    PRIMARY KEY (table_name, range_start)
)
"#;

/// Creates the allocator row on first use and takes an exclusive lock on it
/// either way; held until the transaction ends.
const CLAIM_ALLOCATOR: &str = "INSERT INTO wolfshard_key_allocation (table_name, range_start) \
     VALUES (?, ?) ON DUPLICATE KEY UPDATE range_start = range_start";

/// Statements run right after connecting, in order
fn setup_statements(mode: ConnectMode) -> Vec<String> {
    match mode {
        ConnectMode::Autocommit => {
            vec!["SET SESSION TRANSACTION ISOLATION LEVEL READ COMMITTED".to_string()]
        }
        ConnectMode::Transactional(level) => vec![
            "SET autocommit = 0".to_string(),
            format!("SET SESSION TRANSACTION ISOLATION LEVEL {}", level.as_sql()),
            "START TRANSACTION".to_string(),
        ],
    }
}

/// Connector for real MariaDB/MySQL nodes
#[derive(Debug, Clone, Default)]
pub struct MySqlConnector {
    /// Nodes known to have the allocator table
    allocators_ready: Arc<Mutex<HashSet<String>>>,
}

impl MySqlConnector {
    pub fn new() -> Self {
        Self::default()
    }

    fn options(node: &NodeConfig) -> MySqlConnectOptions {
        MySqlConnectOptions::new()
            .host(&node.host)
            .port(node.port)
            .username(&node.user)
            .password(&node.password)
            .database(&node.database)
    }

    fn allocator_ready(&self, node: &str) -> bool {
        self.allocators_ready
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(node)
    }

    /// DDL commits implicitly, so this has to run before the transaction starts
    async fn ensure_allocator(&self, node: &NodeConfig, conn: &mut MySqlConnection) -> Result<()> {
        if self.allocator_ready(&node.id) {
            return Ok(());
        }
        conn.execute(CREATE_ALLOCATOR)
            .await
            .map_err(|e| Error::unreachable(&node.id, e))?;
        self.allocators_ready
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(node.id.clone());
        Ok(())
    }
}

#[async_trait::async_trait]
impl NodeConnector for MySqlConnector {
    async fn connect(&self, node: &NodeConfig, mode: ConnectMode) -> Result<Box<dyn NodeConnection>> {
        let options = Self::options(node);
        let mut conn = match timeout(node.connect_timeout(), MySqlConnection::connect_with(&options)).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => return Err(Error::unreachable(&node.id, e)),
            Err(_) => {
                return Err(Error::unreachable(
                    &node.id,
                    format!("connect timed out after {}s", node.connect_timeout_secs),
                ))
            }
        };

        if mode.is_transactional() {
            self.ensure_allocator(node, &mut conn).await?;
        }
        for statement in setup_statements(mode) {
            conn.execute(statement.as_str())
                .await
                .map_err(|e| Error::unreachable(&node.id, e))?;
        }

        tracing::debug!("Opened {:?} connection to {}", mode, node.id);

        Ok(Box::new(MySqlNodeConnection {
            node_id: node.id.clone(),
            mode,
            conn,
        }))
    }
}

/// A single MariaDB connection bound to one node
pub struct MySqlNodeConnection {
    node_id: String,
    mode: ConnectMode,
    conn: MySqlConnection,
}

fn bind_value<'q>(
    query: Query<'q, MySql, MySqlArguments>,
    value: &Value,
) -> Query<'q, MySql, MySqlArguments> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Int(i) => query.bind(*i),
        Value::Float(f) => query.bind(*f),
        Value::Text(s) => query.bind(s.clone()),
    }
}

fn decode_record(schema: &SchemaConfig, row: &MySqlRow) -> Result<Record> {
    let key: String = row.try_get(schema.key_column.as_str())?;
    let mut fields = Fields::new();
    for column in &schema.columns {
        let name = column.name.as_str();
        let value = match column.kind {
            ColumnKind::Text => row.try_get::<Option<String>, _>(name)?.map(Value::Text),
            ColumnKind::Int => row.try_get::<Option<i64>, _>(name)?.map(Value::Int),
            ColumnKind::Float => row.try_get::<Option<f64>, _>(name)?.map(Value::Float),
        };
        fields.insert(column.name.clone(), value.unwrap_or(Value::Null));
    }
    Ok(Record::new(key, fields))
}

fn locking_clause(mode: ConnectMode, requested: bool) -> &'static str {
    if requested && mode.is_transactional() {
        " FOR UPDATE"
    } else {
        ""
    }
}

#[async_trait::async_trait]
impl NodeConnection for MySqlNodeConnection {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    fn mode(&self) -> ConnectMode {
        self.mode
    }

    async fn ping(&mut self) -> Result<()> {
        self.conn
            .ping()
            .await
            .map_err(|e| Error::unreachable(&self.node_id, e))
    }

    async fn max_suffix(&mut self, schema: &SchemaConfig, range: KeyRange) -> Result<Option<u64>> {
        if self.mode.is_transactional() {
            sqlx::query(CLAIM_ALLOCATOR)
                .bind(schema.table.clone())
                .bind(range.start)
                .execute(&mut self.conn)
                .await?;
        }

        let format = KeyFormat::from_schema(schema);
        // Keys are fixed-width, so the lexical range matches the numeric one
        // and the scan stays on the primary key index.
        let sql = format!(
            "SELECT MAX(CAST(SUBSTRING({key}, {start}) AS UNSIGNED)) AS max_suffix \
             FROM {table} WHERE {key} BETWEEN ? AND ?{lock}",
            key = quote_ident(&schema.key_column),
            start = format.prefix().len() + 1,
            table = quote_ident(&schema.table),
            lock = locking_clause(self.mode, true),
        );

        let row = sqlx::query(&sql)
            .bind(format.format(range.start))
            .bind(format.format(range.end))
            .fetch_one(&mut self.conn)
            .await?;

        Ok(row.try_get::<Option<u64>, _>("max_suffix")?)
    }

    async fn fetch(&mut self, schema: &SchemaConfig, key: &str, for_update: bool) -> Result<Option<Record>> {
        let mut columns = vec![quote_ident(&schema.key_column)];
        columns.extend(schema.columns.iter().map(|c| quote_ident(&c.name)));

        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ?{}",
            columns.join(", "),
            quote_ident(&schema.table),
            quote_ident(&schema.key_column),
            locking_clause(self.mode, for_update),
        );

        let row = sqlx::query(&sql)
            .bind(key.to_string())
            .fetch_optional(&mut self.conn)
            .await?;

        row.map(|r| decode_record(schema, &r)).transpose()
    }

    async fn insert(&mut self, schema: &SchemaConfig, record: &Record) -> Result<()> {
        let mut columns = vec![quote_ident(&schema.key_column)];
        let mut values = Vec::new();
        for column in &schema.columns {
            if let Some(value) = record.fields.get(&column.name) {
                columns.push(quote_ident(&column.name));
                values.push(value);
            }
        }

        let placeholders = vec!["?"; columns.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(&schema.table),
            columns.join(", "),
            placeholders
        );

        let mut query = sqlx::query(&sql).bind(record.key.clone());
        for value in values {
            query = bind_value(query, value);
        }
        query.execute(&mut self.conn).await?;
        Ok(())
    }

    async fn update(&mut self, schema: &SchemaConfig, key: &str, changes: &Fields) -> Result<u64> {
        let assignments: Vec<String> = changes
            .keys()
            .map(|name| format!("{} = ?", quote_ident(name)))
            .collect();
        let sql = format!(
            "UPDATE {} SET {} WHERE {} = ?",
            quote_ident(&schema.table),
            assignments.join(", "),
            quote_ident(&schema.key_column)
        );

        let mut query = sqlx::query(&sql);
        for value in changes.values() {
            query = bind_value(query, value);
        }
        let result = query.bind(key.to_string()).execute(&mut self.conn).await?;
        Ok(result.rows_affected())
    }

    async fn delete(&mut self, schema: &SchemaConfig, key: &str) -> Result<u64> {
        let sql = format!(
            "DELETE FROM {} WHERE {} = ?",
            quote_ident(&schema.table),
            quote_ident(&schema.key_column)
        );
        let result = sqlx::query(&sql)
            .bind(key.to_string())
            .execute(&mut self.conn)
            .await?;
        Ok(result.rows_affected())
    }

    async fn execute_text(&mut self, sql: &str) -> Result<u64> {
        tracing::debug!("Executing on {}: {}", self.node_id, preview(sql, 100));
        let result = self.conn.execute(sql).await.map_err(|e| {
            Error::QueryExecution(format!("Failed to execute '{}...': {}", preview(sql, 50), e))
        })?;
        Ok(result.rows_affected())
    }

    async fn commit(&mut self) -> Result<()> {
        if self.mode.is_transactional() {
            self.conn.execute("COMMIT").await?;
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        if self.mode.is_transactional() {
            self.conn.execute("ROLLBACK").await?;
        }
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let MySqlNodeConnection { node_id, conn, .. } = *self;
        conn.close().await.map_err(|e| Error::unreachable(&node_id, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::IsolationLevel;

    #[test]
    fn test_transactional_setup_starts_transaction_last() {
        let statements = setup_statements(ConnectMode::Transactional(IsolationLevel::Serializable));
        assert_eq!(statements[0], "SET autocommit = 0");
        assert_eq!(statements[1], "SET SESSION TRANSACTION ISOLATION LEVEL SERIALIZABLE");
        assert_eq!(statements.last().map(String::as_str), Some("START TRANSACTION"));

        assert_eq!(
            setup_statements(ConnectMode::Autocommit),
            vec!["SET SESSION TRANSACTION ISOLATION LEVEL READ COMMITTED"]
        );
    }

    #[test]
    fn test_allocator_claim_locks_existing_rows() {
        assert!(CLAIM_ALLOCATOR.contains("ON DUPLICATE KEY UPDATE"));
        assert!(CREATE_ALLOCATOR.contains("PRIMARY KEY (table_name, range_start)"));
        assert_eq!(CLAIM_ALLOCATOR.matches('?').count(), 2);
    }

    #[test]
    fn test_locking_clause_only_in_transactions() {
        let txn = ConnectMode::Transactional(IsolationLevel::ReadCommitted);
        assert_eq!(locking_clause(txn, true), " FOR UPDATE");
        assert_eq!(locking_clause(txn, false), "");
        assert_eq!(locking_clause(ConnectMode::Autocommit, true), "");
    }

    #[test]
    fn test_allocator_readiness_is_per_node() {
        let connector = MySqlConnector::new();
        connector.allocators_ready.lock().unwrap().insert("node1".into());
        assert!(connector.allocator_ready("node1"));
        assert!(!connector.allocator_ready("node2"));
        // Clones share the cache
        assert!(connector.clone().allocator_ready("node1"));
    }
}
