//! Replication Module
//!
//! Commit-time fan-out of local writes and the retry path for fan-outs
//! that did not reach every target.

mod coordinator;
mod executor;
mod recovery;

pub use coordinator::{
    CommitReport, TargetOutcome, TargetReport, WriteCoordinator, WriteRequest, WriteResult,
};
pub use executor::{ReplicationExecutor, ReplicationOutcome};
pub use recovery::{RecoveryReport, RecoverySweeper};
