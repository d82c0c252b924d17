//! Cluster Module
//!
//! Static cluster topology: the node registry, the partitioning rule and
//! reachability checks.

mod registry;
mod router;
mod health;

pub use registry::{NodeId, NodeRegistry};
pub use router::{PartitionRouter, RouteGroup};
pub use health::{check_all, NodeHealth};
