//! In-process connector
//!
//! Each node is a map of committed rows plus the history of statements
//! applied over the text protocol. Transactional connections keep their
//! changes in an overlay until commit and take the node's write lock on the
//! first locking read or write, standing in for the allocator row lock the
//! MariaDB connector takes, so key allocation serializes the same way.
//! Nodes can be taken down and brought back to simulate outages.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;

use super::{ConnectMode, NodeConnection, NodeConnector};
use crate::cluster::NodeRegistry;
use crate::config::{NodeConfig, SchemaConfig};
use crate::error::{Error, Result};
use crate::record::{Fields, KeyFormat, KeyRange, Record, Value};

#[derive(Default)]
struct MemoryState {
    rows: BTreeMap<String, Record>,
    applied: Vec<String>,
}

struct MemoryNode {
    id: String,
    state: Mutex<MemoryState>,
    write_lock: Arc<tokio::sync::Mutex<()>>,
    reachable: AtomicBool,
    rejecting: AtomicBool,
    failing_close: AtomicBool,
    connects: AtomicUsize,
}

impl MemoryNode {
    fn new(id: String) -> Self {
        Self {
            id,
            state: Mutex::new(MemoryState::default()),
            write_lock: Arc::new(tokio::sync::Mutex::new(())),
            reachable: AtomicBool::new(true),
            rejecting: AtomicBool::new(false),
            failing_close: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
        }
    }

    fn ensure_up(&self) -> Result<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::unreachable(&self.id, "connection refused"))
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        // A panicking test thread must not wedge the remaining assertions
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Connector backed by in-process nodes
#[derive(Clone, Default)]
pub struct MemoryConnector {
    nodes: Arc<BTreeMap<String, Arc<MemoryNode>>>,
}

impl MemoryConnector {
    /// Create one empty node per id
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let nodes = ids
            .into_iter()
            .map(|id| {
                let id = id.into();
                (id.clone(), Arc::new(MemoryNode::new(id)))
            })
            .collect();
        Self {
            nodes: Arc::new(nodes),
        }
    }

    /// One empty node per registry entry
    pub fn from_registry(registry: &NodeRegistry) -> Self {
        Self::new(registry.ids().map(str::to_string))
    }

    fn node(&self, id: &str) -> Result<&Arc<MemoryNode>> {
        self.nodes
            .get(id)
            .ok_or_else(|| Error::UnknownNode(id.to_string()))
    }

    /// Take a node down or bring it back
    pub fn set_reachable(&self, id: &str, reachable: bool) {
        if let Ok(node) = self.node(id) {
            node.reachable.store(reachable, Ordering::SeqCst);
        }
    }

    /// Make a reachable node fail every text statement
    pub fn set_rejecting(&self, id: &str, rejecting: bool) {
        if let Ok(node) = self.node(id) {
            node.rejecting.store(rejecting, Ordering::SeqCst);
        }
    }

    /// Make every connection to a node fail on close, after any commit
    pub fn set_failing_close(&self, id: &str, failing: bool) {
        if let Ok(node) = self.node(id) {
            node.failing_close.store(failing, Ordering::SeqCst);
        }
    }

    /// Insert a committed row directly
    pub fn seed(&self, id: &str, record: Record) {
        if let Ok(node) = self.node(id) {
            node.state().rows.insert(record.key.clone(), record);
        }
    }

    /// Committed row by key
    pub fn row(&self, id: &str, key: &str) -> Option<Record> {
        self.node(id).ok()?.state().rows.get(key).cloned()
    }

    /// All committed rows in key order
    pub fn rows(&self, id: &str) -> Vec<Record> {
        self.node(id)
            .map(|n| n.state().rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Text statements committed on a node, in order
    pub fn applied(&self, id: &str) -> Vec<String> {
        self.node(id)
            .map(|n| n.state().applied.clone())
            .unwrap_or_default()
    }

    /// Number of successful connects to a node
    pub fn connect_count(&self, id: &str) -> usize {
        self.node(id)
            .map(|n| n.connects.load(Ordering::SeqCst))
            .unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl NodeConnector for MemoryConnector {
    async fn connect(&self, node: &NodeConfig, mode: ConnectMode) -> Result<Box<dyn NodeConnection>> {
        let target = self
            .nodes
            .get(&node.id)
            .ok_or_else(|| Error::unreachable(&node.id, "no such host"))?;
        target.ensure_up()?;
        target.connects.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(MemoryConnection {
            node: Arc::clone(target),
            mode,
            lock: None,
            overlay: BTreeMap::new(),
            staged_text: Vec::new(),
        }))
    }
}

/// Connection to an in-process node
pub struct MemoryConnection {
    node: Arc<MemoryNode>,
    mode: ConnectMode,
    lock: Option<OwnedMutexGuard<()>>,
    overlay: BTreeMap<String, Option<Record>>,
    staged_text: Vec<String>,
}

impl MemoryConnection {
    async fn ensure_locked(&mut self) {
        if self.mode.is_transactional() && self.lock.is_none() {
            let lock = Arc::clone(&self.node.write_lock).lock_owned().await;
            self.lock = Some(lock);
        }
    }

    fn view(&self, key: &str) -> Option<Record> {
        match self.overlay.get(key) {
            Some(staged) => staged.clone(),
            None => self.node.state().rows.get(key).cloned(),
        }
    }

    fn put(&mut self, key: &str, record: Option<Record>) {
        if self.mode.is_transactional() {
            self.overlay.insert(key.to_string(), record);
            return;
        }
        let mut state = self.node.state();
        match record {
            Some(r) => state.rows.insert(key.to_string(), r),
            None => state.rows.remove(key),
        };
    }

    fn apply_parsed(&mut self, statement: &Replicated) -> u64 {
        match statement {
            Replicated::Upsert(record) => {
                let merged = match self.view(&record.key) {
                    Some(existing) => existing.merged(&record.fields),
                    None => record.clone(),
                };
                self.put(&record.key, Some(merged));
                1
            }
            Replicated::Delete(key) => {
                if self.view(key).is_some() {
                    self.put(key, None);
                    1
                } else {
                    0
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl NodeConnection for MemoryConnection {
    fn node_id(&self) -> &str {
        &self.node.id
    }

    fn mode(&self) -> ConnectMode {
        self.mode
    }

    async fn ping(&mut self) -> Result<()> {
        self.node.ensure_up()
    }

    async fn max_suffix(&mut self, schema: &SchemaConfig, range: KeyRange) -> Result<Option<u64>> {
        self.node.ensure_up()?;
        self.ensure_locked().await;

        let format = KeyFormat::from_schema(schema);
        let mut keys: Vec<String> = self.node.state().rows.keys().cloned().collect();
        keys.extend(self.overlay.keys().cloned());

        Ok(keys
            .iter()
            .filter(|k| self.view(k).is_some())
            .filter_map(|k| format.parse(k))
            .filter(|s| range.contains(*s))
            .max())
    }

    async fn fetch(&mut self, _schema: &SchemaConfig, key: &str, for_update: bool) -> Result<Option<Record>> {
        self.node.ensure_up()?;
        if for_update {
            self.ensure_locked().await;
        }
        Ok(self.view(key))
    }

    async fn insert(&mut self, _schema: &SchemaConfig, record: &Record) -> Result<()> {
        self.node.ensure_up()?;
        self.ensure_locked().await;
        if self.view(&record.key).is_some() {
            return Err(Error::QueryExecution(format!(
                "Duplicate entry '{}' for key 'PRIMARY'",
                record.key
            )));
        }
        self.put(&record.key, Some(record.clone()));
        Ok(())
    }

    async fn update(&mut self, _schema: &SchemaConfig, key: &str, changes: &Fields) -> Result<u64> {
        self.node.ensure_up()?;
        self.ensure_locked().await;
        match self.view(key) {
            Some(existing) => {
                self.put(key, Some(existing.merged(changes)));
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn delete(&mut self, _schema: &SchemaConfig, key: &str) -> Result<u64> {
        self.node.ensure_up()?;
        self.ensure_locked().await;
        if self.view(key).is_none() {
            return Ok(0);
        }
        self.put(key, None);
        Ok(1)
    }

    async fn execute_text(&mut self, sql: &str) -> Result<u64> {
        self.node.ensure_up()?;
        if self.node.rejecting.load(Ordering::SeqCst) {
            return Err(Error::QueryExecution(format!(
                "{} rejected statement",
                self.node.id
            )));
        }
        self.ensure_locked().await;

        let affected = match parse_replicated(sql) {
            Some(statement) => self.apply_parsed(&statement),
            None => 0,
        };

        if self.mode.is_transactional() {
            self.staged_text.push(sql.to_string());
        } else {
            self.node.state().applied.push(sql.to_string());
        }
        Ok(affected)
    }

    async fn commit(&mut self) -> Result<()> {
        self.node.ensure_up()?;
        {
            let mut state = self.node.state();
            for (key, record) in std::mem::take(&mut self.overlay) {
                match record {
                    Some(r) => state.rows.insert(key, r),
                    None => state.rows.remove(&key),
                };
            }
            state.applied.append(&mut self.staged_text);
        }
        self.lock = None;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.overlay.clear();
        self.staged_text.clear();
        self.lock = None;
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        if self.node.failing_close.load(Ordering::SeqCst) {
            return Err(Error::unreachable(&self.node.id, "connection reset while closing"));
        }
        Ok(())
    }
}

/// Effect of a statement produced by `record::sql`
#[derive(Debug, Clone, PartialEq)]
enum Replicated {
    Upsert(Record),
    Delete(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Word(String),
    Punct(char),
}

fn tokenize(sql: &str) -> Option<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {}
            '`' => {
                let mut ident = String::new();
                loop {
                    match chars.next()? {
                        '`' if chars.peek() == Some(&'`') => {
                            chars.next();
                            ident.push('`');
                        }
                        '`' => break,
                        other => ident.push(other),
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            '\'' => {
                let mut literal = String::new();
                loop {
                    match chars.next()? {
                        '\\' => literal.push(match chars.next()? {
                            '0' => '\0',
                            'n' => '\n',
                            'r' => '\r',
                            'Z' => '\x1a',
                            other => other,
                        }),
                        '\'' => break,
                        other => literal.push(other),
                    }
                }
                tokens.push(Token::Str(literal));
            }
            '(' | ')' | ',' | '=' => tokens.push(Token::Punct(c)),
            _ => {
                let mut word = c.to_string();
                while let Some(&next) = chars.peek() {
                    if next.is_alphanumeric() || matches!(next, '.' | '-' | '+' | '_') {
                        word.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Word(word));
            }
        }
    }
    Some(tokens)
}

fn literal_value(token: &Token) -> Option<Value> {
    match token {
        Token::Str(s) => Some(Value::Text(s.clone())),
        Token::Word(w) if w.eq_ignore_ascii_case("NULL") => Some(Value::Null),
        Token::Word(w) => w
            .parse::<i64>()
            .map(Value::Int)
            .or_else(|_| w.parse::<f64>().map(Value::Float))
            .ok(),
        _ => None,
    }
}

fn is_word(token: Option<&Token>, expected: &str) -> bool {
    matches!(token, Some(Token::Word(w)) if w.eq_ignore_ascii_case(expected))
}

fn parse_replicated(sql: &str) -> Option<Replicated> {
    let tokens = tokenize(sql)?;
    let mut it = tokens.iter();

    match it.next() {
        Some(Token::Word(w)) if w.eq_ignore_ascii_case("INSERT") => {
            if !is_word(it.next(), "INTO") {
                return None;
            }
            let Some(Token::Ident(_table)) = it.next() else {
                return None;
            };

            let mut columns = Vec::new();
            if it.next() != Some(&Token::Punct('(')) {
                return None;
            }
            loop {
                match it.next()? {
                    Token::Ident(name) => columns.push(name.clone()),
                    Token::Punct(',') => {}
                    Token::Punct(')') => break,
                    _ => return None,
                }
            }

            if !is_word(it.next(), "VALUES") || it.next() != Some(&Token::Punct('(')) {
                return None;
            }
            let mut values = Vec::new();
            loop {
                match it.next()? {
                    Token::Punct(',') => {}
                    Token::Punct(')') => break,
                    token => values.push(literal_value(token)?),
                }
            }

            if columns.len() != values.len() || columns.is_empty() {
                return None;
            }
            let mut pairs = columns.into_iter().zip(values);
            let (_, key) = pairs.next()?;
            let key = key.as_text()?.to_string();
            Some(Replicated::Upsert(Record::new(key, pairs.collect())))
        }
        Some(Token::Word(w)) if w.eq_ignore_ascii_case("DELETE") => {
            if !is_word(it.next(), "FROM") {
                return None;
            }
            let Some(Token::Ident(_table)) = it.next() else {
                return None;
            };
            if !is_word(it.next(), "WHERE") {
                return None;
            }
            let Some(Token::Ident(_column)) = it.next() else {
                return None;
            };
            if it.next() != Some(&Token::Punct('=')) {
                return None;
            }
            match it.next()? {
                Token::Str(key) => Some(Replicated::Delete(key.clone())),
                _ => None,
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::three_node_config;
    use crate::connection::IsolationLevel;
    use crate::record::sql::{render_delete, render_upsert};

    fn node_config(id: &str) -> NodeConfig {
        three_node_config()
            .nodes
            .into_iter()
            .find(|n| n.id == id)
            .unwrap()
    }

    fn titled(key: &str, title: &str) -> Record {
        let mut fields = Fields::new();
        fields.insert("primary_title".into(), Value::Text(title.into()));
        Record::new(key, fields)
    }

    #[test]
    fn test_parse_rendered_statements() {
        let schema = three_node_config().schema;
        let record = titled("tt0000001", "It's \"quoted\"\n");
        let upsert = render_upsert(&schema, &record);
        assert_eq!(parse_replicated(&upsert), Some(Replicated::Upsert(record)));

        let delete = render_delete(&schema, "tt0000001");
        assert_eq!(parse_replicated(&delete), Some(Replicated::Delete("tt0000001".into())));

        assert_eq!(parse_replicated("UPDATE titles SET x = 1"), None);
    }

    #[tokio::test]
    async fn test_transaction_invisible_until_commit() {
        let connector = MemoryConnector::new(["node1"]);
        let schema = three_node_config().schema;
        let node = node_config("node1");

        let mut txn = connector
            .connect(&node, ConnectMode::Transactional(IsolationLevel::ReadCommitted))
            .await
            .unwrap();
        txn.insert(&schema, &titled("tt0000001", "Apple")).await.unwrap();
        assert!(connector.row("node1", "tt0000001").is_none());
        assert!(txn.fetch(&schema, "tt0000001", false).await.unwrap().is_some());

        txn.commit().await.unwrap();
        assert!(connector.row("node1", "tt0000001").is_some());
        txn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_rollback_discards_changes() {
        let connector = MemoryConnector::new(["node1"]);
        let schema = three_node_config().schema;
        let node = node_config("node1");

        let mut txn = connector
            .connect(&node, ConnectMode::Transactional(IsolationLevel::Serializable))
            .await
            .unwrap();
        txn.insert(&schema, &titled("tt0000001", "Apple")).await.unwrap();
        txn.rollback().await.unwrap();
        assert!(connector.rows("node1").is_empty());
        txn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_commit_releases_write_lock() {
        let connector = MemoryConnector::new(["node1"]);
        let schema = three_node_config().schema;
        let node = node_config("node1");
        let mode = ConnectMode::Transactional(IsolationLevel::ReadCommitted);

        let mut first = connector.connect(&node, mode).await.unwrap();
        first.insert(&schema, &titled("tt0000001", "Apple")).await.unwrap();
        first.commit().await.unwrap();

        // The committed connection is still open but no longer blocks writers
        let mut second = connector.connect(&node, mode).await.unwrap();
        second.insert(&schema, &titled("tt0000002", "Pear")).await.unwrap();
        second.commit().await.unwrap();
        assert_eq!(connector.rows("node1").len(), 2);

        connector.set_failing_close("node1", true);
        assert!(matches!(first.close().await, Err(Error::NodeUnreachable { .. })));
        second.close().await.unwrap_err();
    }

    #[tokio::test]
    async fn test_text_upsert_is_idempotent() {
        let connector = MemoryConnector::new(["node2"]);
        let schema = three_node_config().schema;
        let node = node_config("node2");
        let sql = render_upsert(&schema, &titled("tt0000001", "Apple"));

        let mut conn = connector.connect(&node, ConnectMode::Autocommit).await.unwrap();
        conn.execute_text(&sql).await.unwrap();
        conn.execute_text(&sql).await.unwrap();

        assert_eq!(connector.rows("node2").len(), 1);
        assert_eq!(connector.applied("node2").len(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_node() {
        let connector = MemoryConnector::new(["node3"]);
        connector.set_reachable("node3", false);
        let result = connector.connect(&node_config("node3"), ConnectMode::Autocommit).await;
        assert!(matches!(result, Err(Error::NodeUnreachable { .. })));
        assert_eq!(connector.connect_count("node3"), 0);
    }

    #[tokio::test]
    async fn test_max_suffix_sees_overlay() {
        let connector = MemoryConnector::new(["node2"]);
        let schema = three_node_config().schema;
        let node = node_config("node2");
        connector.seed("node2", titled("tt1000004", "Apple"));
        connector.seed("node2", titled("tt0000009", "Pear"));

        let mut txn = connector
            .connect(&node, ConnectMode::Transactional(IsolationLevel::ReadCommitted))
            .await
            .unwrap();
        let range = KeyRange::for_index(1, 1_000_000);
        assert_eq!(txn.max_suffix(&schema, range).await.unwrap(), Some(1_000_004));

        txn.insert(&schema, &titled("tt1000005", "Kiwi")).await.unwrap();
        assert_eq!(txn.max_suffix(&schema, range).await.unwrap(), Some(1_000_005));
        txn.rollback().await.unwrap();
    }
}
