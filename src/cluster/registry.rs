//! Node Registry
//!
//! Static lookup from node identifier to connection parameters and key
//! range. Built once from configuration and never mutated.

use std::collections::BTreeMap;

use crate::config::{NodeConfig, WolfShardConfig};
use crate::error::{Error, Result};
use crate::record::KeyRange;

/// Node identifier
pub type NodeId = String;

/// Read-only node registry
#[derive(Debug, Clone)]
pub struct NodeRegistry {
    nodes: BTreeMap<NodeId, NodeConfig>,
    range_size: u64,
}

impl NodeRegistry {
    pub fn new(nodes: Vec<NodeConfig>, range_size: u64) -> Self {
        Self {
            nodes: nodes.into_iter().map(|n| (n.id.clone(), n)).collect(),
            range_size,
        }
    }

    pub fn from_config(config: &WolfShardConfig) -> Self {
        Self::new(config.nodes.clone(), config.partition.range_size)
    }

    /// Look up a node
    pub fn get(&self, id: &str) -> Result<&NodeConfig> {
        self.nodes
            .get(id)
            .ok_or_else(|| Error::UnknownNode(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// All node ids in sorted order
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(|k| k.as_str())
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeConfig> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Key range a node mints in
    pub fn range_of(&self, id: &str) -> Result<KeyRange> {
        let node = self.get(id)?;
        Ok(KeyRange::for_index(node.range_index, self.range_size))
    }

    /// Node owning the range a key suffix falls in
    pub fn owner_of(&self, suffix: u64) -> Option<&str> {
        let index = suffix / self.range_size;
        self.nodes
            .values()
            .find(|n| n.range_index == index)
            .map(|n| n.id.as_str())
    }
}
