//! WolfShard - Partitioned MariaDB Write Coordinator
//!
//! Applies writes to the node a client session is bound to, then replicates
//! each committed change to the other nodes that should hold a copy, as
//! chosen by a static partitioning rule. Every fan-out is recorded in a
//! durable replication log so that targets which were down can be caught up
//! later, across restarts if need be.
//!
//! # Architecture
//!
//! There is no leader and no quorum. Each node mints keys in its own numeric
//! range and replication is best-effort and asynchronous with respect to the
//! client: a write succeeds once it commits locally, and nodes may briefly
//! disagree until pending replications are retried.
//!
//! # Features
//!
//! - Range-partitioned key allocation serialized inside the local transaction
//! - Partition routing by key range and by the first letter of a route column
//! - Deferred replication: nothing leaves a node before its local commit
//! - Idempotent replicated statements (full-row upserts, delete by key)
//! - Replication log on a designated node or in a local SQLite file
//! - Recovery sweeps at startup, on demand and on a timer
//! - HTTP API for sessions, writes, reads and replication status

pub mod api;
pub mod cluster;
pub mod config;
pub mod connection;
pub mod error;
pub mod log;
pub mod record;
pub mod replication;
pub mod session;

pub use config::WolfShardConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::cluster::{NodeHealth, NodeId, NodeRegistry, PartitionRouter};
    pub use crate::config::WolfShardConfig;
    pub use crate::connection::{IsolationLevel, MemoryConnector, MySqlConnector, NodeConnector};
    pub use crate::error::{Error, Result};
    pub use crate::log::{LogEntry, LogStatus, ReplicationLog};
    pub use crate::record::{Fields, Record, Value};
    pub use crate::replication::{CommitReport, WriteCoordinator, WriteRequest, WriteResult};
    pub use crate::session::Session;
}
