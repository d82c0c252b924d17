//! Session Context
//!
//! Per-client state passed to every coordinator call: the one open
//! read-write transaction, the write intents staged inside it, and the
//! read connections cached per node.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use serde::Serialize;
use tokio::time::Instant;
use uuid::Uuid;

use crate::cluster::NodeId;
use crate::config::NodeConfig;
use crate::connection::{ConnectMode, IsolationLevel, NodeConnection, NodeConnector};
use crate::error::{Error, Result};
use crate::log::OpKind;

/// A local write waiting for its transaction to commit before it is replicated
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WriteIntent {
    pub op_kind: OpKind,
    pub record_key: Option<String>,
    /// Self-contained statement applied on remote targets
    pub sql_text: String,
    /// Every node that should hold the change, the source included
    pub targets: BTreeSet<NodeId>,
    pub source_node: NodeId,
}

impl WriteIntent {
    /// Targets other than the node that executed the write locally
    pub fn remote_targets(&self) -> Vec<NodeId> {
        self.targets
            .iter()
            .filter(|t| **t != self.source_node)
            .cloned()
            .collect()
    }
}

/// Client session
pub struct Session {
    id: Uuid,
    node: NodeId,
    isolation: IsolationLevel,
    last_used: Instant,
    txn: Option<Box<dyn NodeConnection>>,
    staged: Vec<WriteIntent>,
    readers: HashMap<NodeId, Box<dyn NodeConnection>>,
}

impl Session {
    pub fn new(node: impl Into<NodeId>, isolation: IsolationLevel) -> Self {
        Self {
            id: Uuid::new_v4(),
            node: node.into(),
            isolation,
            last_used: Instant::now(),
            txn: None,
            staged: Vec::new(),
            readers: HashMap::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Node the session writes to
    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    /// Mark the session as used by a client
    pub fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    /// Time since the last [`touch`](Self::touch)
    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    /// Change the isolation level used by the next transaction
    pub fn set_isolation(&mut self, isolation: IsolationLevel) -> Result<()> {
        if let Some(txn) = &self.txn {
            return Err(Error::SessionBusy {
                active: txn.node_id().to_string(),
                requested: format!("isolation {}", isolation),
            });
        }
        self.isolation = isolation;
        Ok(())
    }

    pub fn in_transaction(&self) -> bool {
        self.txn.is_some()
    }

    /// Node of the open transaction, if any
    pub fn transaction_node(&self) -> Option<&str> {
        self.txn.as_ref().map(|t| t.node_id())
    }

    /// The open transaction on `node`, opening one if the session has none.
    ///
    /// Re-acquiring on the same node returns the same connection; asking for
    /// another node while a transaction is open fails with `SessionBusy`.
    pub async fn transaction(
        &mut self,
        connector: &dyn NodeConnector,
        node: &NodeConfig,
    ) -> Result<&mut Box<dyn NodeConnection>> {
        let active = self.transaction_node().map(str::to_string);
        if let Some(active) = active {
            if active != node.id {
                return Err(Error::SessionBusy {
                    active,
                    requested: node.id.clone(),
                });
            }
        } else {
            let conn = connector
                .connect(node, ConnectMode::Transactional(self.isolation))
                .await?;
            tracing::debug!(
                "Session {} began {} transaction on {}",
                self.id,
                self.isolation,
                node.id
            );
            self.txn = Some(conn);
        }

        self.txn
            .as_mut()
            .ok_or_else(|| Error::Internal("transaction vanished after open".into()))
    }

    /// Cached autocommit read connection for `node`
    pub async fn reader(
        &mut self,
        connector: &dyn NodeConnector,
        node: &NodeConfig,
    ) -> Result<&mut Box<dyn NodeConnection>> {
        if !self.readers.contains_key(&node.id) {
            let conn = connector.connect(node, ConnectMode::Autocommit).await?;
            self.readers.insert(node.id.clone(), conn);
        }

        self.readers
            .get_mut(&node.id)
            .ok_or_else(|| Error::Internal("read connection vanished after open".into()))
    }

    /// Drop a single cached read connection
    pub fn evict_reader(&mut self, node: &str) {
        self.readers.remove(node);
    }

    /// Drop every cached read connection so later reads see committed state
    pub fn invalidate_reads(&mut self) {
        if !self.readers.is_empty() {
            tracing::debug!("Session {} dropped {} read connections", self.id, self.readers.len());
        }
        self.readers.clear();
    }

    pub fn cached_readers(&self) -> usize {
        self.readers.len()
    }

    pub fn stage(&mut self, intent: WriteIntent) {
        self.staged.push(intent);
    }

    pub fn staged(&self) -> &[WriteIntent] {
        &self.staged
    }

    /// Detach the open transaction and its staged intents
    pub fn take_transaction(&mut self) -> (Option<Box<dyn NodeConnection>>, Vec<WriteIntent>) {
        (self.txn.take(), std::mem::take(&mut self.staged))
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("node", &self.node)
            .field("isolation", &self.isolation)
            .field("transaction_node", &self.transaction_node())
            .field("staged", &self.staged.len())
            .field("readers", &self.readers.len())
            .finish()
    }
}
