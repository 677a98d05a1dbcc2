//! # error
//!
//! why: callers need to tell a redirect (not leader) from an ambiguous timeout or a hard failure
//! relations: returned by every public kvdb operation, wraps kvdb-storage and raft-rs errors
//! what: Error, Result

use std::io;
use std::time::Duration;

use kvdb_core::{ClusterMember, CodecError};
use kvdb_storage::StoreError;
use thiserror::Error;

/// Errors returned by the replicated store and its consensus host.
#[derive(Debug, Error)]
pub enum Error {
    /// Mutations and membership changes are only accepted by the leader.
    #[error("node is not the leader (leader: {})", describe(leader))]
    NotLeader { leader: Option<ClusterMember> },

    /// The outcome is unknown; the entry may still commit later.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Storage(#[from] StoreError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("consensus: {0}")]
    Raft(#[from] raft::Error),

    /// A membership step failed part way; earlier steps stay committed.
    #[error("membership change for {member} failed: {source}")]
    Membership {
        member: ClusterMember,
        #[source]
        source: Box<Error>,
    },

    /// A voter in the configuration with no recorded id or address.
    #[error("voter {0:#x} has no known id or address")]
    UnknownMember(u64),

    #[error("snapshot: {0}")]
    Snapshot(String),

    #[error("nothing new to snapshot")]
    NothingToSnapshot,

    #[error("invalid config: {0}")]
    Config(String),

    #[error("consensus worker has shut down")]
    Shutdown,

    #[error(transparent)]
    Io(#[from] io::Error),
}

fn describe(leader: &Option<ClusterMember>) -> String {
    match leader {
        Some(member) => member.to_string(),
        None => "unknown".to_string(),
    }
}

impl Error {
    pub fn not_leader(leader: Option<ClusterMember>) -> Self {
        Self::NotLeader { leader }
    }

    pub fn is_not_leader(&self) -> bool {
        match self {
            Self::NotLeader { .. } => true,
            Self::Membership { source, .. } => source.is_not_leader(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_leader_names_the_leader() {
        let err = Error::not_leader(Some(ClusterMember::new("node0", "127.0.0.1:7000")));
        assert_eq!(err.to_string(), "node is not the leader (leader: node0@127.0.0.1:7000)");
        assert!(Error::not_leader(None).to_string().ends_with("(leader: unknown)"));
    }
}
