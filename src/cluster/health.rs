//! Node health checks
//!
//! Reachability is informational only. A node reported unreachable here may
//! accept the next write and vice versa; nothing on the write path consults
//! these results.

use std::collections::BTreeMap;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;

use super::registry::{NodeId, NodeRegistry};
use crate::connection::{ConnectMode, NodeConnector};

/// Check result for one node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeHealth {
    Reachable,
    Unreachable,
}

impl std::fmt::Display for NodeHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeHealth::Reachable => write!(f, "Reachable"),
            NodeHealth::Unreachable => write!(f, "Unreachable"),
        }
    }
}

/// Check every registry node concurrently
pub async fn check_all(
    registry: &NodeRegistry,
    connector: &dyn NodeConnector,
) -> BTreeMap<NodeId, NodeHealth> {
    let checks = registry.nodes().map(|node| async move {
        // Connect timeout plus one more for the round trip
        let budget = node.connect_timeout() + Duration::from_secs(1);
        let outcome = timeout(budget, async {
            let mut conn = connector.connect(node, ConnectMode::Autocommit).await?;
            conn.ping().await?;
            conn.close().await
        })
        .await;

        let health = match outcome {
            Ok(Ok(())) => NodeHealth::Reachable,
            Ok(Err(e)) => {
                tracing::debug!("Health check for {} failed: {}", node.id, e);
                NodeHealth::Unreachable
            }
            Err(_) => {
                tracing::debug!("Health check for {} timed out", node.id);
                NodeHealth::Unreachable
            }
        };
        (node.id.clone(), health)
    });

    futures::future::join_all(checks).await.into_iter().collect()
}
