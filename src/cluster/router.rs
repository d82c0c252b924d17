//! Partition Router
//!
//! Maps a record to the set of nodes that should hold a copy:
//! the designated primary, the home node that minted its key, and one
//! secondary group chosen by the first letter of the route attribute.

use std::collections::BTreeSet;

use super::registry::{NodeId, NodeRegistry};
use crate::config::WolfShardConfig;
use crate::record::{KeyFormat, Record};

/// Secondary group selected by the route attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteGroup {
    /// Attribute starts at or before the boundary letter
    Lower,
    /// Attribute starts after the boundary letter
    Upper,
}

/// Deterministic record-to-nodes mapping
#[derive(Debug, Clone)]
pub struct PartitionRouter {
    primary: NodeId,
    boundary: char,
    lower_group: Vec<NodeId>,
    upper_group: Vec<NodeId>,
    route_column: String,
    key_format: KeyFormat,
    registry: NodeRegistry,
}

impl PartitionRouter {
    pub fn new(config: &WolfShardConfig, registry: NodeRegistry) -> Self {
        Self {
            primary: config.partition.primary.clone(),
            boundary: config.partition.boundary.to_ascii_uppercase(),
            lower_group: config.partition.lower_group.clone(),
            upper_group: config.partition.upper_group.clone(),
            route_column: config.schema.route_column.clone(),
            key_format: KeyFormat::from_schema(&config.schema),
            registry,
        }
    }

    /// Group for a route attribute; `None` when the attribute is empty.
    ///
    /// The uppercased first character is compared to the boundary by code
    /// point, with no locale collation. Digits land in the lower group;
    /// accented and non-Latin letters sort above `Z` and land in the upper
    /// group.
    pub fn group_for(&self, route_value: &str) -> Option<RouteGroup> {
        let first = route_value.trim().chars().next()?;
        let folded = first.to_uppercase().next().unwrap_or(first);
        if folded <= self.boundary {
            Some(RouteGroup::Lower)
        } else {
            Some(RouteGroup::Upper)
        }
    }

    /// Node that minted a key, if the key parses and its range is assigned
    pub fn home_of(&self, key: &str) -> Option<&str> {
        let suffix = self.key_format.parse(key)?;
        self.registry.owner_of(suffix)
    }

    /// All nodes that should hold a record with the given key and route attribute.
    ///
    /// Always contains the primary; contains the home node whenever the key
    /// maps to one. Never fails.
    pub fn targets_for(&self, key: Option<&str>, route_value: Option<&str>) -> BTreeSet<NodeId> {
        let mut targets = BTreeSet::new();
        targets.insert(self.primary.clone());

        if let Some(home) = key.and_then(|k| self.home_of(k)) {
            targets.insert(home.to_string());
        }

        let group = match route_value.and_then(|v| self.group_for(v)) {
            Some(RouteGroup::Lower) => &self.lower_group,
            Some(RouteGroup::Upper) => &self.upper_group,
            None => return targets,
        };
        targets.extend(group.iter().cloned());
        targets
    }

    /// Targets for a full record
    pub fn targets(&self, record: &Record) -> BTreeSet<NodeId> {
        self.targets_for(Some(&record.key), record.route_value(&self.route_column))
    }
}
