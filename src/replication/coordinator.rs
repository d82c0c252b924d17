//! Write Coordinator
//!
//! Runs every write through the same path: validate, execute locally inside
//! the session's transaction, stage the replicated form, and fan out only
//! after the local commit succeeded. Replication failures never turn into
//! write failures; they are logged as PENDING for the recovery sweeper.

use std::collections::BTreeMap;
use std::sync::Arc;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::executor::ReplicationExecutor;
use super::recovery::{RecoveryReport, RecoverySweeper};
use crate::cluster::{check_all, NodeHealth, NodeId, NodeRegistry, PartitionRouter};
use crate::config::{NodeConfig, SchemaConfig, WolfShardConfig};
use crate::connection::{IsolationLevel, NodeConnection, NodeConnector};
use crate::error::{Error, Result};
use crate::log::{LogEntry, LogId, LogStatus, NewLogEntry, OpKind, ReplicationLog, TxnStage};
use crate::record::sql::{render_delete, render_upsert};
use crate::record::{Fields, KeyFormat, Record};
use crate::session::{Session, WriteIntent};

/// A write submitted by a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteRequest {
    pub op: OpKind,
    /// Required for UPDATE and DELETE; must be absent for INSERT
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub fields: Fields,
    /// Self-contained statement for OTHER writes
    #[serde(default)]
    pub statement: Option<String>,
}

impl WriteRequest {
    pub fn insert(fields: Fields) -> Self {
        Self {
            op: OpKind::Insert,
            key: None,
            fields,
            statement: None,
        }
    }

    pub fn update(key: impl Into<String>, fields: Fields) -> Self {
        Self {
            op: OpKind::Update,
            key: Some(key.into()),
            fields,
            statement: None,
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            op: OpKind::Delete,
            key: Some(key.into()),
            fields: Fields::new(),
            statement: None,
        }
    }

    /// Caller-rendered statement, replicated verbatim.
    ///
    /// `fields` may carry the route attribute to pick the secondary group.
    pub fn other(key: Option<String>, statement: impl Into<String>, fields: Fields) -> Self {
        Self {
            op: OpKind::Other,
            key,
            fields,
            statement: Some(statement.into()),
        }
    }
}

/// Local outcome of a submitted write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteResult {
    pub op: OpKind,
    pub key: Option<String>,
    /// Key minted by an INSERT
    pub new_key: Option<String>,
    /// Nodes the write will be replicated to once committed
    pub targets: Vec<NodeId>,
}

/// Replication outcome for one target of one write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetOutcome {
    Replicated,
    Pending,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetReport {
    pub record_key: Option<String>,
    pub target: NodeId,
    pub outcome: TargetOutcome,
    pub error: Option<String>,
}

/// Result of committing a session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommitReport {
    pub committed_locally: bool,
    pub replication: Vec<TargetReport>,
    pub log_entries: Vec<LogId>,
    /// Non-fatal problems, such as an unreachable replication log
    pub warnings: Vec<String>,
}

impl CommitReport {
    /// True when every target of every write was reached
    pub fn fully_replicated(&self) -> bool {
        self.replication
            .iter()
            .all(|r| r.outcome == TargetOutcome::Replicated)
    }
}

/// Orchestrates local writes, commit-time fan-out and the replication log
pub struct WriteCoordinator {
    schema: SchemaConfig,
    key_format: KeyFormat,
    registry: NodeRegistry,
    router: PartitionRouter,
    connector: Arc<dyn NodeConnector>,
    log: Arc<dyn ReplicationLog>,
    executor: ReplicationExecutor,
    sweeper: Arc<RecoverySweeper>,
    default_node: NodeId,
    default_isolation: IsolationLevel,
    pending_limit: usize,
}

/// Keep connectivity errors as they are; anything else from the local node
/// fails the write
fn local_failure(node: &str, e: Error) -> Error {
    match e {
        Error::NodeUnreachable { .. } | Error::LocalWriteFailed { .. } => e,
        other => Error::local(node, other),
    }
}

impl WriteCoordinator {
    pub fn new(
        config: &WolfShardConfig,
        connector: Arc<dyn NodeConnector>,
        log: Arc<dyn ReplicationLog>,
    ) -> Self {
        let registry = NodeRegistry::from_config(config);
        let router = PartitionRouter::new(config, registry.clone());
        let executor = ReplicationExecutor::new(registry.clone(), Arc::clone(&connector));
        let sweeper = Arc::new(RecoverySweeper::new(
            Arc::clone(&log),
            executor.clone(),
            config.replication.recovery_batch,
        ));

        Self {
            schema: config.schema.clone(),
            key_format: KeyFormat::from_schema(&config.schema),
            registry,
            router,
            connector,
            log,
            executor,
            sweeper,
            default_node: config.node.id.clone(),
            default_isolation: config.replication.default_isolation,
            pending_limit: config.replication.recovery_batch,
        }
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn router(&self) -> &PartitionRouter {
        &self.router
    }

    pub fn schema(&self) -> &SchemaConfig {
        &self.schema
    }

    pub fn default_node(&self) -> &str {
        &self.default_node
    }

    pub fn sweeper(&self) -> Arc<RecoverySweeper> {
        Arc::clone(&self.sweeper)
    }

    /// Start a session writing to `node` (the configured node by default)
    pub fn open_session(&self, node: Option<&str>, isolation: Option<IsolationLevel>) -> Result<Session> {
        let node = node.unwrap_or(&self.default_node);
        self.registry.get(node)?;
        Ok(Session::new(node, isolation.unwrap_or(self.default_isolation)))
    }

    /// End a session, rolling back anything still open
    pub async fn close_session(&self, session: &mut Session) -> Result<()> {
        if session.in_transaction() || !session.staged().is_empty() {
            tracing::info!("Session {} closed with an open transaction, rolling back", session.id());
            self.rollback_session(session).await?;
        }
        session.invalidate_reads();
        Ok(())
    }

    fn validate(&self, request: &WriteRequest) -> Result<()> {
        let key = request.key.as_deref().map(str::trim);

        match request.op {
            OpKind::Insert => {
                if key.is_some() {
                    return Err(Error::Validation(
                        "INSERT must not carry a key; keys are minted by the writing node".into(),
                    ));
                }
                if request.fields.is_empty() {
                    return Err(Error::Validation("INSERT needs at least one field".into()));
                }
            }
            OpKind::Update | OpKind::Delete => {
                let key = key.filter(|k| !k.is_empty()).ok_or_else(|| {
                    Error::Validation(format!("{} needs a record key", request.op))
                })?;
                if self.key_format.parse(key).is_none() {
                    return Err(Error::Validation(format!("malformed record key {:?}", key)));
                }
                if request.op == OpKind::Update && request.fields.is_empty() {
                    return Err(Error::Validation("UPDATE needs at least one field".into()));
                }
            }
            OpKind::Other => {
                let statement = request.statement.as_deref().map(str::trim).unwrap_or("");
                if statement.is_empty() {
                    return Err(Error::Validation("OTHER needs a statement".into()));
                }
            }
        }

        for (name, value) in &request.fields {
            if *name == self.schema.key_column {
                return Err(Error::Validation(format!("key column {} cannot be written", name)));
            }
            let column = self
                .schema
                .columns
                .iter()
                .find(|c| c.name == *name)
                .ok_or_else(|| Error::Validation(format!("unknown column {}", name)))?;
            if !value.fits(column.kind) {
                return Err(Error::Validation(format!(
                    "value {} does not fit {:?} column {}",
                    value, column.kind, name
                )));
            }
        }

        Ok(())
    }

    /// Execute a write inside the session's transaction and stage its
    /// replicated form.
    ///
    /// Nothing leaves the local node until [`commit_session`](Self::commit_session).
    /// On a local failure the transaction stays open for the caller to roll back.
    pub async fn submit_write(&self, session: &mut Session, request: WriteRequest) -> Result<WriteResult> {
        self.validate(&request)?;

        let node_id = session.node().to_string();
        let node = self.registry.get(&node_id)?;
        let txn = session.transaction(self.connector.as_ref(), node).await?;
        let conn: &mut dyn NodeConnection = &mut **txn;

        let op = request.op;
        let key = request.key.map(|k| k.trim().to_string());
        let (intent, new_key) = match op {
            OpKind::Insert => {
                let intent = self.local_insert(conn, node, request.fields).await?;
                let minted = intent.record_key.clone();
                (intent, minted)
            }
            OpKind::Update => {
                let key = key.clone().unwrap_or_default();
                (self.local_update(conn, node, key, request.fields).await?, None)
            }
            OpKind::Delete => {
                let key = key.clone().unwrap_or_default();
                (self.local_delete(conn, node, key).await?, None)
            }
            OpKind::Other => {
                let statement = request.statement.unwrap_or_default();
                (
                    self.local_other(conn, node, key.clone(), statement, &request.fields)
                        .await?,
                    None,
                )
            }
        };

        tracing::debug!(
            "Session {} staged {} of {:?} for {:?}",
            session.id(),
            op,
            intent.record_key,
            intent.targets
        );

        let result = WriteResult {
            op,
            key: intent.record_key.clone(),
            new_key,
            targets: intent.targets.iter().cloned().collect(),
        };
        session.stage(intent);
        Ok(result)
    }

    async fn local_insert(
        &self,
        conn: &mut dyn NodeConnection,
        node: &NodeConfig,
        fields: Fields,
    ) -> Result<WriteIntent> {
        let range = self.registry.range_of(&node.id)?;
        let current_max = conn
            .max_suffix(&self.schema, range)
            .await
            .map_err(|e| local_failure(&node.id, e))?;

        let suffix = range.next_after(current_max).map_err(|next| Error::RangeExhausted {
            node: node.id.clone(),
            next,
            ceiling: range.end,
        })?;

        let record = Record::new(self.key_format.format(suffix), fields);
        conn.insert(&self.schema, &record)
            .await
            .map_err(|e| local_failure(&node.id, e))?;

        Ok(WriteIntent {
            op_kind: OpKind::Insert,
            record_key: Some(record.key.clone()),
            sql_text: render_upsert(&self.schema, &record),
            targets: self.router.targets(&record),
            source_node: node.id.clone(),
        })
    }

    async fn local_update(
        &self,
        conn: &mut dyn NodeConnection,
        node: &NodeConfig,
        key: String,
        changes: Fields,
    ) -> Result<WriteIntent> {
        let existing = conn
            .fetch(&self.schema, &key, true)
            .await
            .map_err(|e| local_failure(&node.id, e))?
            .ok_or_else(|| Error::RecordNotFound(key.clone()))?;

        conn.update(&self.schema, &key, &changes)
            .await
            .map_err(|e| local_failure(&node.id, e))?;

        // Ship the whole post-image so a target that never held the row,
        // or lost an earlier write, still converges.
        let updated = existing.merged(&changes);
        let mut targets = self.router.targets(&existing);
        targets.extend(self.router.targets(&updated));

        Ok(WriteIntent {
            op_kind: OpKind::Update,
            record_key: Some(key),
            sql_text: render_upsert(&self.schema, &updated),
            targets,
            source_node: node.id.clone(),
        })
    }

    async fn local_delete(
        &self,
        conn: &mut dyn NodeConnection,
        node: &NodeConfig,
        key: String,
    ) -> Result<WriteIntent> {
        let existing = conn
            .fetch(&self.schema, &key, true)
            .await
            .map_err(|e| local_failure(&node.id, e))?
            .ok_or_else(|| Error::RecordNotFound(key.clone()))?;

        conn.delete(&self.schema, &key)
            .await
            .map_err(|e| local_failure(&node.id, e))?;

        Ok(WriteIntent {
            op_kind: OpKind::Delete,
            sql_text: render_delete(&self.schema, &key),
            targets: self.router.targets(&existing),
            record_key: Some(key),
            source_node: node.id.clone(),
        })
    }

    async fn local_other(
        &self,
        conn: &mut dyn NodeConnection,
        node: &NodeConfig,
        key: Option<String>,
        statement: String,
        fields: &Fields,
    ) -> Result<WriteIntent> {
        conn.execute_text(&statement)
            .await
            .map_err(|e| local_failure(&node.id, e))?;

        let route = fields
            .get(&self.schema.route_column)
            .and_then(|v| v.as_text());

        Ok(WriteIntent {
            op_kind: OpKind::Other,
            targets: self.router.targets_for(key.as_deref(), route),
            record_key: key,
            sql_text: statement,
            source_node: node.id.clone(),
        })
    }

    /// Commit the local transaction, then replicate every staged write in
    /// submission order and record each outcome as a POST_COMMIT log entry.
    ///
    /// Only a failed local commit is an error. Unreachable targets leave the
    /// entry PENDING; an unreachable log is reported in `warnings`.
    pub async fn commit_session(&self, session: &mut Session) -> Result<CommitReport> {
        let (txn, intents) = session.take_transaction();
        let Some(mut txn) = txn else {
            session.invalidate_reads();
            return Ok(CommitReport::default());
        };

        let source = txn.node_id().to_string();
        let committed = txn.commit().await;
        session.invalidate_reads();

        let mut report = CommitReport::default();
        if let Err(e) = committed {
            if let Err(close_err) = txn.close().await {
                tracing::debug!("Closing failed transaction on {}: {}", source, close_err);
            }
            return Err(Error::local(&source, e));
        }
        report.committed_locally = true;

        // The commit is durable at this point; a failed close must not hide it
        if let Err(e) = txn.close().await {
            tracing::warn!("Committed on {} but closing the connection failed: {}", source, e);
            report.warnings.push(e.to_string());
        }

        tracing::info!(
            "Session {} committed {} writes on {}",
            session.id(),
            intents.len(),
            source
        );

        for intent in intents {
            self.replicate(intent, &mut report).await;
        }
        Ok(report)
    }

    async fn replicate(&self, intent: WriteIntent, report: &mut CommitReport) {
        let remote = intent.remote_targets();
        let outcome = self
            .executor
            .apply(&intent.source_node, &remote, &intent.sql_text)
            .await;

        for target in &remote {
            let error = outcome.errors.get(target).cloned();
            report.replication.push(TargetReport {
                record_key: intent.record_key.clone(),
                target: target.clone(),
                outcome: if error.is_some() {
                    TargetOutcome::Pending
                } else {
                    TargetOutcome::Replicated
                },
                error,
            });
        }

        let status = if outcome.is_complete() {
            LogStatus::Replicated
        } else {
            tracing::warn!(
                "{} of {:?} pending on {:?}",
                intent.op_kind,
                intent.record_key,
                outcome.failed
            );
            LogStatus::Pending
        };

        let entry = NewLogEntry {
            record_key: intent.record_key.clone(),
            source_node: intent.source_node,
            sql_text: intent.sql_text,
            op_kind: intent.op_kind,
            target_nodes: remote,
            status,
            last_error: outcome.error_summary(),
            txn_stage: TxnStage::PostCommit,
            created_at: Utc::now(),
        };

        match self.log.append(entry).await {
            Ok(id) => report.log_entries.push(id),
            Err(e) => {
                tracing::warn!(
                    "Committed {} of {:?} but could not record replication: {}",
                    intent.op_kind,
                    intent.record_key,
                    e
                );
                report.warnings.push(e.to_string());
            }
        }
    }

    /// Discard staged writes and roll back the local transaction.
    /// Nothing is replicated and nothing is logged.
    pub async fn rollback_session(&self, session: &mut Session) -> Result<()> {
        let (txn, intents) = session.take_transaction();
        session.invalidate_reads();

        if !intents.is_empty() {
            tracing::debug!("Session {} discarded {} staged writes", session.id(), intents.len());
        }
        if let Some(mut txn) = txn {
            let node = txn.node_id().to_string();
            let rolled_back = txn.rollback().await;
            if let Err(e) = txn.close().await {
                tracing::debug!("Closing rolled back transaction on {}: {}", node, e);
            }
            rolled_back.map_err(|e| Error::local(&node, e))?;
            tracing::info!("Session {} rolled back on {}", session.id(), node);
        }
        Ok(())
    }

    /// Read a record from `node` (the session's node by default).
    ///
    /// Uses the open transaction's view when it is on that node, otherwise the
    /// session's cached read connection, which only sees committed data.
    pub async fn read(&self, session: &mut Session, node: Option<&str>, key: &str) -> Result<Option<Record>> {
        let node_id = node.unwrap_or(session.node()).to_string();
        let node = self.registry.get(&node_id)?;

        if session.transaction_node() == Some(node_id.as_str()) {
            let txn = session.transaction(self.connector.as_ref(), node).await?;
            return txn.fetch(&self.schema, key, false).await;
        }

        let result = match session.reader(self.connector.as_ref(), node).await {
            Ok(reader) => reader.fetch(&self.schema, key, false).await,
            Err(e) => Err(e),
        };
        if result.is_err() {
            session.evict_reader(&node_id);
        }
        result
    }

    /// PENDING entries written by `node`, oldest first
    pub async fn list_pending_replications(&self, node: &str) -> Result<Vec<LogEntry>> {
        self.registry.get(node)?;
        self.log.list_pending(node, self.pending_limit).await
    }

    /// Re-run the pending replications written by `node`
    pub async fn retry_pending(&self, node: &str) -> Result<RecoveryReport> {
        self.registry.get(node)?;
        self.sweeper.recover(node).await
    }

    /// Reachability of every node; informational only
    pub async fn node_health(&self) -> BTreeMap<NodeId, NodeHealth> {
        check_all(&self.registry, self.connector.as_ref()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::MemoryConnector;
    use crate::log::SqliteReplicationLog;
    use crate::record::Value;
    use crate::replication::testing::{harness, titled_fields, Harness};

    #[tokio::test]
    async fn test_insert_apple_replicates_to_lower_group() {
        let Harness { coordinator, nodes, log, _dir } = harness();
        let mut session = coordinator.open_session(None, None).unwrap();

        let result = coordinator
            .submit_write(&mut session, WriteRequest::insert(titled_fields("Apple")))
            .await
            .unwrap();
        let key = result.new_key.clone().unwrap();
        assert_eq!(key, "tt0000000");
        assert_eq!(result.targets, vec!["node1".to_string(), "node2".to_string()]);

        // Nothing is visible or replicated before commit
        assert!(nodes.row("node1", &key).is_none());
        assert!(nodes.applied("node2").is_empty());

        let before_commit = Utc::now();
        let report = coordinator.commit_session(&mut session).await.unwrap();
        assert!(report.committed_locally);
        assert!(report.fully_replicated());
        assert!(report.warnings.is_empty());
        assert_eq!(report.replication.len(), 1);
        assert_eq!(report.replication[0].target, "node2");

        assert!(nodes.row("node1", &key).is_some());
        assert_eq!(nodes.row("node2", &key).unwrap().route_value("primary_title"), Some("Apple"));
        assert!(nodes.row("node3", &key).is_none());

        let entry = log.get(report.log_entries[0]).await.unwrap().unwrap();
        assert_eq!(entry.target_nodes, vec!["node2".to_string()]);
        assert_eq!(entry.status, LogStatus::Replicated);
        assert_eq!(entry.txn_stage, TxnStage::PostCommit);
        assert_eq!(entry.source_node, "node1");
        assert!(entry.last_error.is_none());
        assert!(entry.created_at >= before_commit);
    }

    #[tokio::test]
    async fn test_zebra_with_target_down_is_pending_until_retried() {
        let Harness { coordinator, nodes, log, _dir } = harness();
        nodes.set_reachable("node3", false);
        let mut session = coordinator.open_session(Some("node1"), None).unwrap();

        let key = coordinator
            .submit_write(&mut session, WriteRequest::insert(titled_fields("Zebra")))
            .await
            .unwrap()
            .new_key
            .unwrap();
        let report = coordinator.commit_session(&mut session).await.unwrap();

        assert!(report.committed_locally);
        assert!(!report.fully_replicated());
        assert_eq!(report.replication[0].outcome, TargetOutcome::Pending);
        assert!(nodes.row("node1", &key).is_some());

        let pending = coordinator.list_pending_replications("node1").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].record_key.as_deref(), Some(key.as_str()));
        assert_eq!(pending[0].target_nodes, vec!["node3".to_string()]);
        assert!(pending[0].last_error.is_some());

        nodes.set_reachable("node3", true);
        let retried = coordinator.retry_pending("node1").await.unwrap();
        assert_eq!(retried.recovered, 1);
        assert_eq!(retried.still_pending, 0);

        let entry = log.get(pending[0].id).await.unwrap().unwrap();
        assert_eq!(entry.status, LogStatus::Replicated);
        assert_eq!(entry.retry_count, 1);
        assert!(entry.last_error.is_none());
        assert!(nodes.row("node3", &key).is_some());
        assert!(coordinator.list_pending_replications("node1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_sessions_mint_sequential_keys() {
        let Harness { coordinator, nodes, _dir, .. } = harness();
        let coordinator = Arc::new(coordinator);

        let insert = |title: &'static str| {
            let coordinator = Arc::clone(&coordinator);
            async move {
                let mut session = coordinator.open_session(Some("node2"), None).unwrap();
                let result = coordinator
                    .submit_write(&mut session, WriteRequest::insert(titled_fields(title)))
                    .await
                    .unwrap();
                tokio::task::yield_now().await;
                coordinator.commit_session(&mut session).await.unwrap();
                result.new_key.unwrap()
            }
        };

        let (a, b) = tokio::join!(insert("Kiwi"), insert("Lime"));
        let mut keys = vec![a, b];
        keys.sort();
        assert_eq!(keys, vec!["tt1000000".to_string(), "tt1000001".to_string()]);
        assert_eq!(nodes.rows("node2").len(), 2);
    }

    #[tokio::test]
    async fn test_range_exhausted_inserts_nothing() {
        let Harness { coordinator, nodes, log, _dir } = harness();
        nodes.seed("node1", Record::new("tt0999999", titled_fields("Last")));
        let mut session = coordinator.open_session(None, None).unwrap();

        let err = coordinator
            .submit_write(&mut session, WriteRequest::insert(titled_fields("Apple")))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::RangeExhausted { next: 1_000_000, ceiling: 999_999, .. }
        ));
        assert!(session.staged().is_empty());

        coordinator.rollback_session(&mut session).await.unwrap();
        assert_eq!(nodes.rows("node1").len(), 1);
        assert!(nodes.rows("node2").is_empty());
        assert!(nodes.rows("node3").is_empty());
        assert!(log.list_pending("node1", 10).await.unwrap().is_empty());
        assert!(log.get(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rollback_never_replicates_or_logs() {
        let Harness { coordinator, nodes, log, _dir } = harness();
        let mut session = coordinator.open_session(None, None).unwrap();

        coordinator
            .submit_write(&mut session, WriteRequest::insert(titled_fields("Apple")))
            .await
            .unwrap();
        coordinator
            .submit_write(&mut session, WriteRequest::insert(titled_fields("Zebra")))
            .await
            .unwrap();
        assert_eq!(session.staged().len(), 2);

        coordinator.rollback_session(&mut session).await.unwrap();
        assert!(!session.in_transaction());
        for node in ["node1", "node2", "node3"] {
            assert!(nodes.rows(node).is_empty());
            assert!(nodes.applied(node).is_empty());
        }
        assert_eq!(nodes.connect_count("node2"), 0);
        assert!(log.get(1).await.unwrap().is_none());

        // Committing afterwards has nothing to do
        let report = coordinator.commit_session(&mut session).await.unwrap();
        assert!(!report.committed_locally);
        assert!(report.log_entries.is_empty());
    }

    #[tokio::test]
    async fn test_validation_touches_no_connection() {
        let Harness { coordinator, nodes, _dir, .. } = harness();
        let mut session = coordinator.open_session(None, None).unwrap();

        let mut wrong_type = Fields::new();
        wrong_type.insert("start_year".into(), Value::Text("1999".into()));
        let mut unknown = Fields::new();
        unknown.insert("director".into(), Value::Text("Someone".into()));

        let invalid = vec![
            WriteRequest::insert(Fields::new()),
            WriteRequest::insert(wrong_type),
            WriteRequest::insert(unknown),
            WriteRequest::update("tt0000001", Fields::new()),
            WriteRequest::update("not-a-key", titled_fields("Apple")),
            WriteRequest::delete("  "),
            WriteRequest::other(None, "  ", Fields::new()),
            WriteRequest {
                key: Some("tt0000001".into()),
                ..WriteRequest::insert(titled_fields("Apple"))
            },
        ];
        for request in invalid {
            let err = coordinator.submit_write(&mut session, request).await.unwrap_err();
            assert!(matches!(err, Error::Validation(_)), "unexpected {:?}", err);
            assert!(err.is_rejection());
        }
        assert_eq!(nodes.connect_count("node1"), 0);
        assert!(!session.in_transaction());
    }

    #[tokio::test]
    async fn test_update_ships_post_image_to_old_and_new_groups() {
        let Harness { coordinator, nodes, log, _dir } = harness();
        let mut session = coordinator.open_session(None, None).unwrap();
        let key = coordinator
            .submit_write(&mut session, WriteRequest::insert(titled_fields("Apple")))
            .await
            .unwrap()
            .new_key
            .unwrap();
        coordinator.commit_session(&mut session).await.unwrap();

        let mut changes = Fields::new();
        changes.insert("primary_title".into(), Value::Text("Zebra".into()));
        let result = coordinator
            .submit_write(&mut session, WriteRequest::update(key.clone(), changes))
            .await
            .unwrap();
        assert_eq!(result.targets, vec!["node1", "node2", "node3"]);

        let report = coordinator.commit_session(&mut session).await.unwrap();
        let entry = log.get(report.log_entries[0]).await.unwrap().unwrap();
        assert_eq!(entry.op_kind, OpKind::Update);
        assert_eq!(entry.target_nodes, vec!["node2".to_string(), "node3".to_string()]);

        for node in ["node1", "node2", "node3"] {
            let row = nodes.row(node, &key).unwrap();
            assert_eq!(row.route_value("primary_title"), Some("Zebra"));
            assert_eq!(row.fields["start_year"], Value::Int(2001));
        }
    }

    #[tokio::test]
    async fn test_delete_replicates_and_missing_rows_fail() {
        let Harness { coordinator, nodes, _dir, .. } = harness();
        let mut session = coordinator.open_session(None, None).unwrap();
        let key = coordinator
            .submit_write(&mut session, WriteRequest::insert(titled_fields("Apple")))
            .await
            .unwrap()
            .new_key
            .unwrap();
        coordinator.commit_session(&mut session).await.unwrap();
        assert!(nodes.row("node2", &key).is_some());

        coordinator
            .submit_write(&mut session, WriteRequest::delete(key.clone()))
            .await
            .unwrap();
        coordinator.commit_session(&mut session).await.unwrap();
        assert!(nodes.row("node1", &key).is_none());
        assert!(nodes.row("node2", &key).is_none());

        let err = coordinator
            .submit_write(&mut session, WriteRequest::delete(key.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RecordNotFound(k) if k == key));
        coordinator.rollback_session(&mut session).await.unwrap();
    }

    #[tokio::test]
    async fn test_other_statement_is_replicated_verbatim() {
        let Harness { coordinator, nodes, log, _dir } = harness();
        let mut session = coordinator.open_session(None, None).unwrap();
        let statement = "UPDATE `titles` SET `genres` = 'Drama' WHERE `tconst` = 'tt0000001'";

        let result = coordinator
            .submit_write(
                &mut session,
                WriteRequest::other(Some("tt0000001".into()), statement, titled_fields("Apple")),
            )
            .await
            .unwrap();
        assert_eq!(result.targets, vec!["node1", "node2"]);

        let report = coordinator.commit_session(&mut session).await.unwrap();
        assert_eq!(nodes.applied("node1"), vec![statement.to_string()]);
        assert_eq!(nodes.applied("node2"), vec![statement.to_string()]);

        let entry = log.get(report.log_entries[0]).await.unwrap().unwrap();
        assert_eq!(entry.op_kind, OpKind::Other);
        assert_eq!(entry.sql_text, statement);
    }

    #[tokio::test]
    async fn test_unreachable_log_is_only_a_warning() {
        struct UnreachableLog;

        #[async_trait::async_trait]
        impl ReplicationLog for UnreachableLog {
            async fn append(&self, _entry: NewLogEntry) -> Result<LogId> {
                Err(Error::LogWriteFailed("node1: connection refused".into()))
            }
            async fn update(&self, _id: LogId, _update: crate::log::LogUpdate) -> Result<()> {
                Err(Error::LogWriteFailed("node1: connection refused".into()))
            }
            async fn list_pending(&self, _source_node: &str, _limit: usize) -> Result<Vec<LogEntry>> {
                Err(Error::LogWriteFailed("node1: connection refused".into()))
            }
            async fn get(&self, _id: LogId) -> Result<Option<LogEntry>> {
                Ok(None)
            }
        }

        let config = crate::config::tests::three_node_config();
        let nodes = MemoryConnector::new(["node1", "node2", "node3"]);
        let coordinator = WriteCoordinator::new(&config, Arc::new(nodes.clone()), Arc::new(UnreachableLog));
        let mut session = coordinator.open_session(None, None).unwrap();

        let key = coordinator
            .submit_write(&mut session, WriteRequest::insert(titled_fields("Apple")))
            .await
            .unwrap()
            .new_key
            .unwrap();
        let report = coordinator.commit_session(&mut session).await.unwrap();

        assert!(report.committed_locally);
        assert!(report.log_entries.is_empty());
        assert_eq!(report.warnings.len(), 1);
        assert!(nodes.row("node1", &key).is_some());
        assert!(nodes.row("node2", &key).is_some());
        assert!(matches!(
            coordinator.retry_pending("node1").await,
            Err(Error::LogWriteFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_reads_follow_transaction_then_commit() {
        let Harness { coordinator, _dir, .. } = harness();
        let mut session = coordinator.open_session(None, None).unwrap();
        let key = coordinator
            .submit_write(&mut session, WriteRequest::insert(titled_fields("Apple")))
            .await
            .unwrap()
            .new_key
            .unwrap();

        // Own transaction sees its write; other nodes don't yet
        assert!(coordinator.read(&mut session, None, &key).await.unwrap().is_some());
        assert!(coordinator.read(&mut session, Some("node2"), &key).await.unwrap().is_none());
        assert_eq!(session.cached_readers(), 1);

        coordinator.commit_session(&mut session).await.unwrap();
        assert_eq!(session.cached_readers(), 0);
        assert!(coordinator.read(&mut session, Some("node2"), &key).await.unwrap().is_some());
        assert!(coordinator.read(&mut session, None, &key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_close_failure_after_commit_still_replicates_and_logs() {
        let Harness { coordinator, nodes, log, _dir } = harness();
        nodes.set_failing_close("node1", true);
        let mut session = coordinator.open_session(None, None).unwrap();

        let key = coordinator
            .submit_write(&mut session, WriteRequest::insert(titled_fields("Apple")))
            .await
            .unwrap()
            .new_key
            .unwrap();
        let report = coordinator.commit_session(&mut session).await.unwrap();

        assert!(report.committed_locally);
        assert!(report.fully_replicated());
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("node1"));
        assert!(nodes.row("node1", &key).is_some());
        assert!(nodes.row("node2", &key).is_some());

        let entry = log.get(report.log_entries[0]).await.unwrap().unwrap();
        assert_eq!(entry.txn_stage, TxnStage::PostCommit);
        assert_eq!(entry.status, LogStatus::Replicated);
        assert_eq!(entry.record_key.as_deref(), Some(key.as_str()));
    }

    #[tokio::test]
    async fn test_rollback_invalidates_cached_reads() {
        let Harness { coordinator, nodes, _dir, .. } = harness();
        let mut session = coordinator.open_session(None, None).unwrap();

        coordinator
            .submit_write(&mut session, WriteRequest::insert(titled_fields("Apple")))
            .await
            .unwrap();
        coordinator.read(&mut session, Some("node2"), "tt0000000").await.unwrap();
        coordinator.read(&mut session, Some("node3"), "tt0000000").await.unwrap();
        assert_eq!(session.cached_readers(), 2);
        assert_eq!(nodes.connect_count("node2"), 1);

        coordinator.rollback_session(&mut session).await.unwrap();
        assert_eq!(session.cached_readers(), 0);

        assert!(coordinator
            .read(&mut session, Some("node2"), "tt0000000")
            .await
            .unwrap()
            .is_none());
        assert_eq!(nodes.connect_count("node2"), 2);
        assert_eq!(session.cached_readers(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_local_node_fails_the_write() {
        let Harness { coordinator, nodes, _dir, .. } = harness();
        nodes.set_reachable("node1", false);
        let mut session = coordinator.open_session(None, None).unwrap();

        let err = coordinator
            .submit_write(&mut session, WriteRequest::insert(titled_fields("Apple")))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NodeUnreachable { ref node, .. } if node == "node1"));
        assert!(!session.in_transaction());
        assert!(coordinator.open_session(Some("node9"), None).is_err());

        let health = coordinator.node_health().await;
        assert_eq!(health["node1"], NodeHealth::Unreachable);
        assert_eq!(health["node2"], NodeHealth::Reachable);
    }

    #[tokio::test]
    async fn test_sqlite_log_keeps_sources_apart() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(SqliteReplicationLog::open(&dir.path().join("log.db")).unwrap());
        let config = crate::config::tests::three_node_config();
        let nodes = MemoryConnector::new(["node1", "node2", "node3"]);
        nodes.set_reachable("node3", false);
        let coordinator = WriteCoordinator::new(&config, Arc::new(nodes.clone()), log.clone());

        for node in ["node1", "node2"] {
            let mut session = coordinator.open_session(Some(node), None).unwrap();
            coordinator
                .submit_write(&mut session, WriteRequest::insert(titled_fields("Zebra")))
                .await
                .unwrap();
            coordinator.commit_session(&mut session).await.unwrap();
        }

        let from_node2 = coordinator.list_pending_replications("node2").await.unwrap();
        assert_eq!(from_node2.len(), 1);
        assert_eq!(from_node2[0].record_key.as_deref(), Some("tt1000000"));
        // Source excluded; primary and upper group remain
        assert_eq!(from_node2[0].target_nodes, vec!["node1".to_string(), "node3".to_string()]);
        assert!(nodes.row("node1", "tt1000000").is_some());
    }
}
