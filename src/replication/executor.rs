//! Replication Executor
//!
//! Applies one self-contained statement to a set of target nodes. Every
//! target gets its own short-lived autocommit connection and runs
//! concurrently with the others; a failure on one never skips the rest.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use serde::Serialize;

use crate::cluster::{NodeId, NodeRegistry};
use crate::connection::{ConnectMode, NodeConnector};
use crate::error::Result;
use crate::record::sql::preview;

/// Per-target result of one fan-out
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplicationOutcome {
    pub succeeded: BTreeSet<NodeId>,
    pub failed: BTreeSet<NodeId>,
    pub errors: BTreeMap<NodeId, String>,
}

impl ReplicationOutcome {
    /// True when no target failed
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// Per-node errors joined into one line, as stored in the log
    pub fn error_summary(&self) -> Option<String> {
        if self.errors.is_empty() {
            return None;
        }
        Some(
            self.errors
                .iter()
                .map(|(node, err)| format!("{}: {}", node, err))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

/// Fans statements out to target nodes
#[derive(Clone)]
pub struct ReplicationExecutor {
    registry: NodeRegistry,
    connector: Arc<dyn NodeConnector>,
}

impl ReplicationExecutor {
    pub fn new(registry: NodeRegistry, connector: Arc<dyn NodeConnector>) -> Self {
        Self {
            registry,
            connector,
        }
    }

    /// Apply `sql` on every target except `source`.
    ///
    /// At-least-once: a target that applied the statement on an earlier
    /// attempt applies it again.
    pub async fn apply(&self, source: &str, targets: &[NodeId], sql: &str) -> ReplicationOutcome {
        let remote: BTreeSet<&NodeId> = targets.iter().filter(|t| t.as_str() != source).collect();

        let attempts = remote.into_iter().map(|target| async move {
            let result = self.apply_one(target, sql).await;
            (target.clone(), result)
        });

        let mut outcome = ReplicationOutcome::default();
        for (target, result) in futures::future::join_all(attempts).await {
            match result {
                Ok(affected) => {
                    tracing::debug!(
                        "Replicated to {} ({} rows): {}",
                        target,
                        affected,
                        preview(sql, 80)
                    );
                    outcome.succeeded.insert(target);
                }
                Err(e) => {
                    tracing::warn!("Replication to {} failed: {}", target, e);
                    outcome.errors.insert(target.clone(), e.to_string());
                    outcome.failed.insert(target);
                }
            }
        }

        outcome
    }

    async fn apply_one(&self, target: &str, sql: &str) -> Result<u64> {
        let node = self.registry.get(target)?;
        let mut conn = self.connector.connect(node, ConnectMode::Autocommit).await?;
        let affected = conn.execute_text(sql).await?;
        conn.commit().await?;
        if let Err(e) = conn.close().await {
            tracing::warn!("Applied on {} but closing the connection failed: {}", target, e);
        }
        Ok(affected)
    }
}
