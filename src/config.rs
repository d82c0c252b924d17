//! WolfShard Configuration
//!
//! This module provides configuration structures for the partitioned
//! write coordinator: the node registry, the replicated table's schema,
//! the partitioning rule and the replication log location.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::connection::IsolationLevel;

/// Main WolfShard configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolfShardConfig {
    /// Node this process acts for by default
    pub node: LocalNodeConfig,

    /// Node registry
    pub nodes: Vec<NodeConfig>,

    /// Replicated table layout
    pub schema: SchemaConfig,

    /// Partitioning rule
    pub partition: PartitionConfig,

    /// Replication log and recovery configuration
    pub replication: ReplicationConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Default node for this process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalNodeConfig {
    /// Node identifier (must exist in `nodes`)
    pub id: String,
}

/// Connection parameters for one node
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct NodeConfig {
    /// Unique node identifier
    pub id: String,

    /// MariaDB host
    pub host: String,

    /// MariaDB port
    #[serde(default = "default_db_port")]
    pub port: u16,

    /// Database user
    pub user: String,

    /// Database password
    pub password: String,

    /// Database (schema) name
    pub database: String,

    /// Index of the key range this node mints in
    pub range_index: u64,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

/// Column type of a replicated column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnKind {
    Text,
    Int,
    Float,
}

/// A non-key column of the replicated table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnConfig {
    pub name: String,
    pub kind: ColumnKind,
}

/// Replicated table layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaConfig {
    /// Table name
    pub table: String,

    /// Primary key column holding the minted record key
    pub key_column: String,

    /// Column whose first letter selects the secondary node group
    pub route_column: String,

    /// Two-letter key prefix
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Number of digits in the zero-padded key suffix
    #[serde(default = "default_key_width")]
    pub key_width: usize,

    /// Non-key columns
    pub columns: Vec<ColumnConfig>,
}

/// Partitioning rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionConfig {
    /// Designated primary node
    pub primary: String,

    /// Size of each node's key range
    #[serde(default = "default_range_size")]
    pub range_size: u64,

    /// Last letter (inclusive) routed to the lower group
    #[serde(default = "default_boundary")]
    pub boundary: char,

    /// Secondary nodes for route attributes up to the boundary
    #[serde(default)]
    pub lower_group: Vec<String>,

    /// Secondary nodes for route attributes past the boundary
    #[serde(default)]
    pub upper_group: Vec<String>,
}

/// Where the replication log lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogBackend {
    /// A table on one of the registry nodes
    Node,
    /// A local SQLite file
    Sqlite,
}

/// Replication log and recovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Replication log backend
    #[serde(default = "default_log_backend")]
    pub log_backend: LogBackend,

    /// Node holding the replication log table (node backend)
    #[serde(default)]
    pub log_node: Option<String>,

    /// SQLite file path (sqlite backend)
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: PathBuf,

    /// Maximum pending entries per recovery pass
    #[serde(default = "default_recovery_batch")]
    pub recovery_batch: usize,

    /// Run a recovery pass for the local node at startup
    #[serde(default = "default_true")]
    pub recover_on_startup: bool,

    /// Seconds between background recovery passes (0 = disabled)
    #[serde(default)]
    pub sweep_interval_secs: u64,

    /// Isolation level for sessions that don't pick one
    #[serde(default)]
    pub default_isolation: IsolationLevel,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable HTTP API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,

    /// Close sessions unused for this many seconds (0 = never)
    #[serde(default = "default_session_idle_timeout")]
    pub session_idle_timeout_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_db_port() -> u16 {
    3306
}

fn default_connect_timeout() -> u64 {
    3
}

fn default_key_prefix() -> String {
    "tt".to_string()
}

fn default_key_width() -> usize {
    7
}

fn default_range_size() -> u64 {
    1_000_000
}

fn default_boundary() -> char {
    'M'
}

fn default_log_backend() -> LogBackend {
    LogBackend::Node
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("/var/lib/wolfshard/replication.db")
}

fn default_recovery_batch() -> usize {
    1000
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "0.0.0.0:8090".to_string()
}

fn default_session_idle_timeout() -> u64 {
    300
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_address(),
            session_idle_timeout_secs: default_session_idle_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl NodeConfig {
    /// Connection timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl ApiConfig {
    /// Idle time after which a session is closed, if expiry is enabled
    pub fn session_idle_timeout(&self) -> Option<Duration> {
        match self.session_idle_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

impl WolfShardConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfShardConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error::Config;

        if self.nodes.is_empty() {
            return Err(Config("at least one [[nodes]] entry is required".into()));
        }

        let mut ids = HashSet::new();
        let mut ranges = HashSet::new();
        for node in &self.nodes {
            if node.id.is_empty() {
                return Err(Config("nodes.id cannot be empty".into()));
            }
            if node.host.is_empty() {
                return Err(Config(format!("nodes.host cannot be empty for {}", node.id)));
            }
            if !ids.insert(node.id.as_str()) {
                return Err(Config(format!("duplicate node id {}", node.id)));
            }
            if !ranges.insert(node.range_index) {
                return Err(Config(format!(
                    "duplicate range_index {} (node {})",
                    node.range_index, node.id
                )));
            }
        }

        let known = |id: &str, field: &str| -> crate::Result<()> {
            if ids.contains(id) {
                Ok(())
            } else {
                Err(Config(format!("{} references unknown node {}", field, id)))
            }
        };

        known(&self.node.id, "node.id")?;
        known(&self.partition.primary, "partition.primary")?;
        for id in self.partition.lower_group.iter().chain(&self.partition.upper_group) {
            known(id, "partition group")?;
        }

        if self.replication.log_backend == LogBackend::Node {
            match &self.replication.log_node {
                Some(id) => known(id, "replication.log_node")?,
                None => {
                    return Err(Config(
                        "replication.log_node is required when log_backend = \"node\"".into(),
                    ))
                }
            }
        }

        let prefix = &self.schema.key_prefix;
        if prefix.len() != 2 || !prefix.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(Config(format!("schema.key_prefix must be two letters, got {:?}", prefix)));
        }
        if self.schema.key_width == 0 || self.schema.key_width > 18 {
            return Err(Config("schema.key_width must be between 1 and 18".into()));
        }
        if self.schema.table.is_empty() || self.schema.key_column.is_empty() {
            return Err(Config("schema.table and schema.key_column are required".into()));
        }
        if !self.schema.columns.iter().any(|c| c.name == self.schema.route_column) {
            return Err(Config(format!(
                "schema.route_column {} is not listed in schema.columns",
                self.schema.route_column
            )));
        }

        if self.partition.range_size == 0 {
            return Err(Config("partition.range_size must be positive".into()));
        }
        let capacity = 10u64.pow(self.schema.key_width as u32);
        let highest = self.nodes.iter().map(|n| n.range_index).max().unwrap_or(0);
        match highest
            .checked_add(1)
            .and_then(|n| n.checked_mul(self.partition.range_size))
        {
            Some(top) if top <= capacity => {}
            _ => {
                return Err(Config(format!(
                    "range_index {} does not fit in {} key digits",
                    highest, self.schema.key_width
                )))
            }
        }

        if !self.partition.boundary.is_ascii_alphabetic() {
            return Err(Config("partition.boundary must be a letter".into()));
        }

        Ok(())
    }

    /// Interval between background recovery passes, if enabled
    pub fn sweep_interval(&self) -> Option<Duration> {
        match self.replication.sweep_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Render a sample configuration for `wolfshard init`
    pub fn sample(node_id: &str) -> String {
        format!(
            r#"# WolfShard configuration

[node]
id = "{node_id}"

[[nodes]]
id = "node1"
host = "10.0.0.1"
port = 3306
user = "wolfshard"
password = "changeme"
database = "titles_db"
range_index = 0

[[nodes]]
id = "node2"
host = "10.0.0.2"
port = 3306
user = "wolfshard"
password = "changeme"
database = "titles_db"
range_index = 1

[[nodes]]
id = "node3"
host = "10.0.0.3"
port = 3306
user = "wolfshard"
password = "changeme"
database = "titles_db"
range_index = 2

[schema]
table = "titles"
key_column = "tconst"
route_column = "primary_title"
key_prefix = "tt"
key_width = 7
columns = [
    {{ name = "primary_title", kind = "text" }},
    {{ name = "start_year", kind = "int" }},
    {{ name = "genres", kind = "text" }},
]

[partition]
primary = "node1"
range_size = 1000000
boundary = "M"
lower_group = ["node2"]
upper_group = ["node3"]

[replication]
log_backend = "node"
log_node = "node1"
recovery_batch = 1000
recover_on_startup = true
sweep_interval_secs = 60
default_isolation = "READ COMMITTED"

[api]
enabled = true
bind_address = "0.0.0.0:8090"
session_idle_timeout_secs = 300

[logging]
level = "info"
format = "pretty"
"#
        )
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Three-node configuration used across the crate's tests
    pub(crate) fn three_node_config() -> WolfShardConfig {
        WolfShardConfig::from_str(&WolfShardConfig::sample("node1")).unwrap()
    }

    #[test]
    fn test_parse_sample_config() {
        let config = three_node_config();
        assert_eq!(config.node.id, "node1");
        assert_eq!(config.nodes.len(), 3);
        assert_eq!(config.nodes[0].connect_timeout_secs, 3);
        assert_eq!(config.schema.columns.len(), 3);
        assert_eq!(config.partition.boundary, 'M');
        assert_eq!(config.replication.default_isolation, IsolationLevel::ReadCommitted);
        assert_eq!(config.sweep_interval(), Some(Duration::from_secs(60)));
        assert_eq!(config.api.session_idle_timeout(), Some(Duration::from_secs(300)));
    }

    #[test]
    fn test_session_expiry_can_be_disabled() {
        let toml = WolfShardConfig::sample("node1")
            .replace("session_idle_timeout_secs = 300", "session_idle_timeout_secs = 0");
        let config = WolfShardConfig::from_str(&toml).unwrap();
        assert_eq!(config.api.session_idle_timeout(), None);
    }

    #[test]
    fn test_rejects_unknown_group_member() {
        let toml = WolfShardConfig::sample("node1").replace(r#"upper_group = ["node3"]"#, r#"upper_group = ["node9"]"#);
        let err = WolfShardConfig::from_str(&toml).unwrap_err();
        assert!(err.to_string().contains("node9"));
    }

    #[test]
    fn test_rejects_duplicate_range() {
        let toml = WolfShardConfig::sample("node1").replace("range_index = 2", "range_index = 1");
        assert!(WolfShardConfig::from_str(&toml).is_err());
    }

    #[test]
    fn test_rejects_range_wider_than_key() {
        let toml = WolfShardConfig::sample("node1").replace("key_width = 7", "key_width = 6");
        let err = WolfShardConfig::from_str(&toml).unwrap_err();
        assert!(err.to_string().contains("does not fit"));
    }

    #[test]
    fn test_sqlite_backend_needs_no_log_node() {
        let toml = WolfShardConfig::sample("node2")
            .replace(r#"log_backend = "node""#, r#"log_backend = "sqlite""#)
            .replace(r#"log_node = "node1""#, "");
        let config = WolfShardConfig::from_str(&toml).unwrap();
        assert_eq!(config.replication.log_backend, LogBackend::Sqlite);
        assert_eq!(config.node.id, "node2");
    }
}
