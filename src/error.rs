//! WolfShard Error Types

use thiserror::Error;

/// Result type alias for WolfShard operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfShard error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Write path errors
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Key range exhausted on node {node}: next suffix {next} exceeds ceiling {ceiling}")]
    RangeExhausted { node: String, next: u64, ceiling: u64 },

    #[error("Record not found: {0}")]
    RecordNotFound(String),

    #[error("Local write failed on {node}: {reason}")]
    LocalWriteFailed { node: String, reason: String },

    #[error("Session already has an open transaction on {active}, cannot open one on {requested}")]
    SessionBusy { active: String, requested: String },

    // Node errors
    #[error("Node unreachable: {node}: {reason}")]
    NodeUnreachable { node: String, reason: String },

    #[error("Unknown node: {0}")]
    UnknownNode(String),

    // Replication errors
    #[error("Replication failed on {}", failed.join(", "))]
    ReplicationTargetFailed { failed: Vec<String> },

    #[error("Replication log write failed: {0}")]
    LogWriteFailed(String),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Query execution failed: {0}")]
    QueryExecution(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build a `NodeUnreachable` from anything displayable
    pub fn unreachable(node: &str, reason: impl std::fmt::Display) -> Self {
        Error::NodeUnreachable {
            node: node.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Build a `LocalWriteFailed` from anything displayable
    pub fn local(node: &str, reason: impl std::fmt::Display) -> Self {
        Error::LocalWriteFailed {
            node: node.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::NodeUnreachable { .. }
                | Error::ReplicationTargetFailed { .. }
                | Error::LogWriteFailed(_)
        )
    }

    /// Check if this error means the write had no effect before any connection was used
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Error::Validation(_) | Error::UnknownNode(_) | Error::SessionBusy { .. }
        )
    }

    /// Short machine-readable code, used by the HTTP API
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) | Error::ConfigParse(_) => "CONFIG",
            Error::Validation(_) => "VALIDATION",
            Error::RangeExhausted { .. } => "RANGE_EXHAUSTED",
            Error::RecordNotFound(_) => "NOT_FOUND",
            Error::LocalWriteFailed { .. } => "LOCAL_WRITE_FAILED",
            Error::SessionBusy { .. } => "SESSION_BUSY",
            Error::NodeUnreachable { .. } => "NODE_UNREACHABLE",
            Error::UnknownNode(_) => "UNKNOWN_NODE",
            Error::ReplicationTargetFailed { .. } => "REPLICATION_TARGET_FAILED",
            Error::LogWriteFailed(_) => "LOG_WRITE_FAILED",
            Error::Database(_) => "DATABASE",
            Error::QueryExecution(_) => "QUERY_EXECUTION",
            Error::Io(_) => "IO",
            Error::Internal(_) => "INTERNAL",
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::LogWriteFailed(format!("SQLite error: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::unreachable("node2", "timed out").is_retryable());
        assert!(Error::LogWriteFailed("down".into()).is_retryable());
        assert!(!Error::Validation("empty title".into()).is_retryable());
        assert!(!Error::local("node1", "duplicate key").is_retryable());
    }

    #[test]
    fn test_replication_failure_message() {
        let err = Error::ReplicationTargetFailed {
            failed: vec!["node2".into(), "node3".into()],
        };
        assert_eq!(err.to_string(), "Replication failed on node2, node3");
        assert_eq!(err.code(), "REPLICATION_TARGET_FAILED");
    }
}
