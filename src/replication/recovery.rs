//! Recovery Sweeper
//!
//! Re-executes PENDING log entries against their recorded targets. Runs at
//! startup, on demand, and optionally on a fixed interval. It only reads and
//! updates existing entries, so it can run alongside ordinary writes.

use std::sync::Arc;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::executor::ReplicationExecutor;
use crate::cluster::NodeId;
use crate::error::Result;
use crate::log::{LogEntry, LogStatus, LogUpdate, ReplicationLog};

/// Summary of one recovery pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    /// Entries attempted
    pub processed: usize,
    /// Entries now REPLICATED
    pub recovered: usize,
    /// Entries still PENDING after this attempt
    pub still_pending: usize,
    /// Entries whose log update could not be written
    pub failed: usize,
}

pub struct RecoverySweeper {
    log: Arc<dyn ReplicationLog>,
    executor: ReplicationExecutor,
    batch: usize,
}

impl RecoverySweeper {
    pub fn new(log: Arc<dyn ReplicationLog>, executor: ReplicationExecutor, batch: usize) -> Self {
        Self {
            log,
            executor,
            batch: batch.max(1),
        }
    }

    /// One pass over the oldest pending entries written by `node`.
    ///
    /// Fails only if the pending list itself can't be read.
    pub async fn recover(&self, node: &str) -> Result<RecoveryReport> {
        let entries = self.log.list_pending(node, self.batch).await?;
        let mut report = RecoveryReport::default();

        for entry in entries {
            report.processed += 1;
            match self.retry_entry(&entry).await {
                Ok(LogStatus::Replicated) => report.recovered += 1,
                Ok(LogStatus::Pending) => report.still_pending += 1,
                Err(e) => {
                    tracing::warn!("Could not record retry of log entry {}: {}", entry.id, e);
                    report.failed += 1;
                }
            }
        }

        if report.processed > 0 {
            tracing::info!(
                "Recovery for {}: {} processed, {} recovered, {} still pending, {} failed",
                node,
                report.processed,
                report.recovered,
                report.still_pending,
                report.failed
            );
        }
        Ok(report)
    }

    async fn retry_entry(&self, entry: &LogEntry) -> Result<LogStatus> {
        let outcome = self
            .executor
            .apply(&entry.source_node, &entry.target_nodes, &entry.sql_text)
            .await;

        let status = if outcome.is_complete() {
            LogStatus::Replicated
        } else {
            LogStatus::Pending
        };
        let attempt = entry.retry_count + 1;
        tracing::debug!(
            "Retry {} of log entry {} ({:?}): {}",
            attempt,
            entry.id,
            entry.record_key,
            status
        );

        self.log
            .update(
                entry.id,
                LogUpdate {
                    status,
                    last_error: outcome.error_summary(),
                    retry_count: attempt,
                },
            )
            .await?;
        Ok(status)
    }

    /// Run a pass for `node` every `every` until `shutdown` flips to true
    pub fn spawn_periodic(
        self: Arc<Self>,
        node: NodeId,
        every: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // The first tick completes immediately; startup recovery runs separately
            ticker.tick().await;
            tracing::info!("Recovery sweeps for {} every {:?}", node, every);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.recover(&node).await {
                            tracing::warn!("Recovery sweep for {} failed: {}", node, e);
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            tracing::info!("Recovery sweeps for {} stopped", node);
        })
    }
}
