//! # node
//!
//! why: name the roles a node can be in and the identity of each cluster member
//! relations: NodeState is reported by the raft host, ClusterMember flows through membership
//! what: NodeState enum, ClusterMember struct, deterministic raft id derivation

use std::fmt;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// The roles a node can be in, as seen by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    /// Passive state - accepts entries from a leader, votes when asked
    Follower,
    /// Requesting votes to become leader (pre-vote included)
    Candidate,
    /// Accepts mutations and replicates them
    Leader,
    /// The consensus worker has stopped
    Shutdown,
}

impl Default for NodeState {
    fn default() -> Self {
        Self::Follower
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Follower => "Follower",
            Self::Candidate => "Candidate",
            Self::Leader => "Leader",
            Self::Shutdown => "Shutdown",
        };
        f.write_str(name)
    }
}

/// A voting member, identified by id and network address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterMember {
    pub id: String,
    pub address: String,
}

impl ClusterMember {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
        }
    }

    /// Numeric id used on the consensus wire.
    pub fn raft_id(&self) -> u64 {
        raft_id(&self.id)
    }
}

impl fmt::Display for ClusterMember {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.address)
    }
}

/// First 8 bytes of SHA-1(node id), big-endian. Every node computes the
/// same value for the same id; 0 is reserved by raft for "no node".
pub fn raft_id(node_id: &str) -> u64 {
    let digest = Sha1::digest(node_id.as_bytes());
    let mut num = [0u8; 8];
    num.copy_from_slice(&digest[..8]);
    match u64::from_be_bytes(num) {
        0 => 1,
        id => id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_state_is_follower() {
        assert_eq!(NodeState::default(), NodeState::Follower);
    }

    #[test]
    fn raft_id_is_stable_and_distinct() {
        let a = ClusterMember::new("node0", "127.0.0.1:0");
        let moved = ClusterMember::new("node0", "127.0.0.1:9");
        let b = ClusterMember::new("node1", "127.0.0.1:0");

        assert_eq!(a.raft_id(), moved.raft_id());
        assert_ne!(a.raft_id(), b.raft_id());
        assert_ne!(a.raft_id(), 0);
    }

    #[test]
    fn member_displays_as_id_at_address() {
        assert_eq!(ClusterMember::new("n1", "a1").to_string(), "n1@a1");
    }
}
