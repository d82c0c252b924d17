//! Replication Log
//!
//! Durable record of every cross-node propagation: the statement, where it
//! had to go, whether it got there, and what went wrong. Entries are written
//! once per logical write and updated in place on every retry; this module
//! never deletes them.

mod mysql;
mod sqlite;

pub use mysql::MySqlReplicationLog;
pub use sqlite::SqliteReplicationLog;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cluster::NodeId;
use crate::error::{Error, Result};

/// Replication log entry identifier
pub type LogId = i64;

/// Kind of write that produced an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OpKind {
    Insert,
    Update,
    Delete,
    Other,
}

/// Replication status of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogStatus {
    Pending,
    Replicated,
}

/// Whether the entry was written before or after the local commit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxnStage {
    PreCommit,
    PostCommit,
}

macro_rules! string_enum {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $text,)+
                }
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.pad(self.as_str())
            }
        }

        impl std::str::FromStr for $ty {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                match s.to_ascii_uppercase().as_str() {
                    $($text => Ok($ty::$variant),)+
                    other => Err(Error::Validation(format!(
                        concat!("invalid ", stringify!($ty), " {:?}"),
                        other
                    ))),
                }
            }
        }
    };
}

string_enum!(OpKind {
    Insert => "INSERT",
    Update => "UPDATE",
    Delete => "DELETE",
    Other => "OTHER",
});

string_enum!(LogStatus {
    Pending => "PENDING",
    Replicated => "REPLICATED",
});

string_enum!(TxnStage {
    PreCommit => "PRE_COMMIT",
    PostCommit => "POST_COMMIT",
});

/// Entry to append
#[derive(Debug, Clone, PartialEq)]
pub struct NewLogEntry {
    pub record_key: Option<String>,
    pub source_node: NodeId,
    pub sql_text: String,
    pub op_kind: OpKind,
    pub target_nodes: Vec<NodeId>,
    pub status: LogStatus,
    pub last_error: Option<String>,
    pub txn_stage: TxnStage,
    pub created_at: DateTime<Utc>,
}

/// Stored entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: LogId,
    pub record_key: Option<String>,
    pub source_node: NodeId,
    pub sql_text: String,
    pub op_kind: OpKind,
    pub target_nodes: Vec<NodeId>,
    pub status: LogStatus,
    pub last_error: Option<String>,
    pub txn_stage: TxnStage,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_attempt: Option<DateTime<Utc>>,
}

/// In-place update of an entry after a replication attempt.
///
/// `retry_count` is the absolute attempt number rather than a delta, so
/// replaying the same update leaves the entry unchanged apart from its
/// last-attempt stamp.
#[derive(Debug, Clone, PartialEq)]
pub struct LogUpdate {
    pub status: LogStatus,
    pub last_error: Option<String>,
    pub retry_count: u32,
}

/// Serialize a target list for storage
pub fn join_targets(targets: &[NodeId]) -> String {
    targets.join(",")
}

/// Parse a stored target list
pub fn split_targets(stored: &str) -> Vec<NodeId> {
    stored
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Durable store of replication attempts
#[async_trait::async_trait]
pub trait ReplicationLog: Send + Sync {
    /// Append a new entry; fails with [`Error::LogWriteFailed`] when the store is unreachable
    async fn append(&self, entry: NewLogEntry) -> Result<LogId>;

    /// Update status, error and retry count of an entry; stamps the attempt time
    async fn update(&self, id: LogId, update: LogUpdate) -> Result<()>;

    /// Pending entries originating at `source_node`, oldest first
    async fn list_pending(&self, source_node: &str, limit: usize) -> Result<Vec<LogEntry>>;

    /// Fetch one entry
    async fn get(&self, id: LogId) -> Result<Option<LogEntry>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enum_round_trip_strings() {
        assert_eq!(OpKind::Insert.as_str(), "INSERT");
        assert_eq!("post_commit".parse::<TxnStage>().unwrap(), TxnStage::PostCommit);
        assert_eq!("REPLICATED".parse::<LogStatus>().unwrap(), LogStatus::Replicated);
        assert!("DONE".parse::<LogStatus>().is_err());
        assert_eq!(
            serde_json::to_string(&TxnStage::PreCommit).unwrap(),
            "\"PRE_COMMIT\""
        );
    }

    #[test]
    fn test_target_list_serialization() {
        let targets = vec!["node2".to_string(), "node3".to_string()];
        assert_eq!(join_targets(&targets), "node2,node3");
        assert_eq!(split_targets("node2,node3"), targets);
        assert!(split_targets("").is_empty());
    }
}
