//! # consensus
//!
//! why: keep the store and membership logic independent of the engine driving replication
//! relations: implemented by raft::RaftEngine, consumed by Store and Membership
//! what: Consensus trait

use std::time::Duration;

use kvdb_core::{ClusterMember, NodeState};
use kvdb_storage::SnapshotMeta;

use crate::error::Result;

/// What the store needs from a consensus engine.
///
/// Implemented by [`crate::raft::RaftEngine`]. Every call may be made from any
/// thread; the engine serializes them internally.
pub trait Consensus: Send + Sync {
    fn state(&self) -> NodeState;

    /// current leader, `None` while unknown
    fn leader(&self) -> Option<ClusterMember>;

    /// replicate `data` as a command entry and wait until it has been applied
    /// locally, or until `timeout`
    fn apply(&self, data: Vec<u8>, timeout: Duration) -> Result<()>;

    /// add or re-address a voting member
    fn add_voter(&self, member: ClusterMember, timeout: Duration) -> Result<()>;

    fn remove_server(&self, id: &str, timeout: Duration) -> Result<()>;

    /// the voting members as last applied on this node
    fn configuration(&self) -> Result<Vec<ClusterMember>>;

    /// persist a snapshot of the applied state and compact the log behind it
    fn snapshot(&self) -> Result<SnapshotMeta>;

    /// stop the engine; later calls fail with `Error::Shutdown`
    fn shutdown(&self) -> Result<()>;
}
