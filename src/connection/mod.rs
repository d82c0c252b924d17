//! Connection Manager
//!
//! Opens transactional and read-only connections to registry nodes.
//! Backends implement [`NodeConnector`]; the session layer decides when a
//! connection is reused, bound to a transaction, or invalidated.

mod memory;
mod mysql;

pub use memory::MemoryConnector;
pub use mysql::MySqlConnector;

use serde::{Deserialize, Serialize};

use crate::config::{NodeConfig, SchemaConfig};
use crate::error::{Error, Result};
use crate::record::{Fields, KeyRange, Record};

/// Transaction isolation level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum IsolationLevel {
    #[serde(rename = "READ UNCOMMITTED")]
    ReadUncommitted,
    #[default]
    #[serde(rename = "READ COMMITTED")]
    ReadCommitted,
    #[serde(rename = "REPEATABLE READ")]
    RepeatableRead,
    #[serde(rename = "SERIALIZABLE")]
    Serializable,
}

impl IsolationLevel {
    /// SQL spelling, as used in `SET SESSION TRANSACTION ISOLATION LEVEL`
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

impl std::fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_sql())
    }
}

impl std::str::FromStr for IsolationLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().replace(['_', '-'], " ").to_uppercase();
        match normalized.as_str() {
            "READ UNCOMMITTED" => Ok(IsolationLevel::ReadUncommitted),
            "READ COMMITTED" => Ok(IsolationLevel::ReadCommitted),
            "REPEATABLE READ" => Ok(IsolationLevel::RepeatableRead),
            "SERIALIZABLE" => Ok(IsolationLevel::Serializable),
            _ => Err(Error::Validation(format!("unknown isolation level {:?}", s))),
        }
    }
}

/// How a connection is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectMode {
    /// Autocommit, READ COMMITTED; used for reads and remote applies
    Autocommit,
    /// Autocommit off, transaction begun at the given isolation level
    Transactional(IsolationLevel),
}

impl ConnectMode {
    pub fn is_transactional(&self) -> bool {
        matches!(self, ConnectMode::Transactional(_))
    }
}

/// An open connection to one node
#[async_trait::async_trait]
pub trait NodeConnection: Send {
    /// Node this connection is bound to
    fn node_id(&self) -> &str;

    /// Mode the connection was opened with
    fn mode(&self) -> ConnectMode;

    /// Round-trip check
    async fn ping(&mut self) -> Result<()>;

    /// Highest key suffix present inside `range`.
    ///
    /// On a transactional connection the scanned range stays locked until
    /// commit or rollback, which serializes concurrent key allocation.
    async fn max_suffix(&mut self, schema: &SchemaConfig, range: KeyRange) -> Result<Option<u64>>;

    /// Fetch one record by key, optionally locking it
    async fn fetch(&mut self, schema: &SchemaConfig, key: &str, for_update: bool) -> Result<Option<Record>>;

    /// Insert a new record (parameterized)
    async fn insert(&mut self, schema: &SchemaConfig, record: &Record) -> Result<()>;

    /// Update columns of one record (parameterized); returns affected rows
    async fn update(&mut self, schema: &SchemaConfig, key: &str, changes: &Fields) -> Result<u64>;

    /// Delete one record (parameterized); returns affected rows
    async fn delete(&mut self, schema: &SchemaConfig, key: &str) -> Result<u64>;

    /// Execute a self-contained SQL statement; returns affected rows
    async fn execute_text(&mut self, sql: &str) -> Result<u64>;

    /// Commit the open transaction (no-op in autocommit mode).
    ///
    /// An error here means the transaction did not commit.
    async fn commit(&mut self) -> Result<()>;

    /// Roll back the open transaction (no-op in autocommit mode)
    async fn rollback(&mut self) -> Result<()>;

    /// Release the connection. Runs after commit or rollback; a failure
    /// here says nothing about the outcome of the transaction.
    async fn close(self: Box<Self>) -> Result<()>;
}

/// Opens connections to registry nodes
#[async_trait::async_trait]
pub trait NodeConnector: Send + Sync {
    /// Open a new connection; connect, auth and timeout failures surface as
    /// [`Error::NodeUnreachable`]
    async fn connect(&self, node: &NodeConfig, mode: ConnectMode) -> Result<Box<dyn NodeConnection>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isolation_level_parsing() {
        assert_eq!("read committed".parse::<IsolationLevel>().unwrap(), IsolationLevel::ReadCommitted);
        assert_eq!("REPEATABLE_READ".parse::<IsolationLevel>().unwrap(), IsolationLevel::RepeatableRead);
        assert_eq!("Serializable".parse::<IsolationLevel>().unwrap(), IsolationLevel::Serializable);
        assert!("snapshot".parse::<IsolationLevel>().is_err());
    }

    #[test]
    fn test_isolation_level_serde_names() {
        let json = serde_json::to_string(&IsolationLevel::ReadUncommitted).unwrap();
        assert_eq!(json, "\"READ UNCOMMITTED\"");
        let level: IsolationLevel = serde_json::from_str("\"SERIALIZABLE\"").unwrap();
        assert_eq!(level, IsolationLevel::Serializable);
        assert_eq!(IsolationLevel::default(), IsolationLevel::ReadCommitted);
    }
}
