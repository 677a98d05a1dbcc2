//! # membership
//!
//! why: join and re-address nodes without leaving two members behind one id or address
//! relations: called by Store, drives any Consensus engine
//! what: Membership manager (add_node, remove_node, leader, node_list, snapshot)

use std::sync::Arc;
use std::time::Duration;

use kvdb_core::ClusterMember;
use kvdb_storage::SnapshotMeta;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::consensus::Consensus;
use crate::error::{Error, Result};

/// Membership operations, run against the leader's view of the configuration.
///
/// Changes made through one manager are serialized. Two managers (other
/// processes, or a leader change mid-operation) can still both read the same
/// configuration before either writes.
pub struct Membership<C> {
    engine: Arc<C>,
    timeout: Duration,
    changes: Mutex<()>,
}

impl<C: Consensus> Membership<C> {
    pub fn new(engine: Arc<C>, timeout: Duration) -> Self {
        Self {
            engine,
            timeout,
            changes: Mutex::new(()),
        }
    }

    /// Make `(id, address)` a voter.
    ///
    /// A member already known under `id` is re-addressed in place, since the
    /// consensus id is derived from `id` alone. A member holding `address`
    /// under another id is removed first.
    pub fn add_node(&self, id: &str, address: &str) -> Result<()> {
        let _guard = self.changes.lock();

        let members = self.engine.configuration()?;
        if members.iter().any(|m| m.id == id && m.address == address) {
            info!(node = id, address, "node already a member, ignoring join request");
            return Ok(());
        }

        for stale in members.iter().filter(|m| m.id != id && m.address == address) {
            info!(member = %stale, "removing conflicting member");
            self.remove(stale)?;
        }

        let member = ClusterMember::new(id, address);
        self.engine
            .add_voter(member.clone(), self.timeout)
            .map_err(|err| membership_error(member.clone(), err))?;
        info!(member = %member, "node joined");
        Ok(())
    }

    /// remove the member with `id`; unknown ids are not an error
    pub fn remove_node(&self, id: &str) -> Result<()> {
        let _guard = self.changes.lock();

        let members = self.engine.configuration()?;
        match members.iter().find(|m| m.id == id) {
            Some(member) => {
                self.remove(member)?;
                info!(member = %member, "node removed");
                Ok(())
            }
            None => {
                info!(node = id, "node is not a member, nothing to remove");
                Ok(())
            }
        }
    }

    pub fn leader(&self) -> Option<ClusterMember> {
        self.engine.leader()
    }

    pub fn node_list(&self) -> Result<Vec<ClusterMember>> {
        self.engine.configuration()
    }

    pub fn snapshot(&self) -> Result<SnapshotMeta> {
        self.engine.snapshot()
    }

    fn remove(&self, member: &ClusterMember) -> Result<()> {
        self.engine
            .remove_server(&member.id, self.timeout)
            .map_err(|err| {
                warn!(member = %member, %err, "failed to remove member");
                membership_error(member.clone(), err)
            })
    }
}

fn membership_error(member: ClusterMember, err: Error) -> Error {
    match err {
        Error::NotLeader { .. } => err,
        other => Error::Membership {
            member,
            source: Box::new(other),
        },
    }
}
