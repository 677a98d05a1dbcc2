//! # transport
//!
//! why: the raft worker must hand outbound messages to something that reaches peers
//! relations: called by raft::node for every outbound message, delivers into RaftEngine::receive
//! what: Transport trait, NoopTransport, LocalNetwork + LocalTransport (in-process routing)

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use kvdb_core::ClusterMember;
use parking_lot::RwLock;
use raft::prelude::Message;

use super::node::RaftEngine;
use crate::error::{Error, Result};

/// Outbound half of the peer network.
///
/// `send` is called from the consensus worker and must not block on the
/// receiving node. Delivery is best-effort: raft retries on its own.
pub trait Transport: Send + Sync {
    fn send(&self, to: &ClusterMember, msg: Message) -> Result<()>;
}

/// Drops every message. Enough for a single-node cluster.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTransport;

impl Transport for NoopTransport {
    fn send(&self, _to: &ClusterMember, _msg: Message) -> Result<()> {
        Ok(())
    }
}

/// Engines living in the same process, keyed by member address.
#[derive(Default)]
pub struct LocalNetwork {
    routes: RwLock<HashMap<String, RaftEngine>>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// transport for the node reachable at `local.address`
    pub fn endpoint(self: &Arc<Self>, local: ClusterMember) -> LocalTransport {
        LocalTransport {
            network: Arc::clone(self),
            local,
        }
    }

    pub fn register(&self, engine: RaftEngine) {
        let address = engine.member().address.clone();
        self.routes.write().insert(address, engine);
    }

    /// messages to `address` are dropped from now on
    pub fn unregister(&self, address: &str) {
        self.routes.write().remove(address);
    }
}

/// One node's view of a [`LocalNetwork`].
pub struct LocalTransport {
    network: Arc<LocalNetwork>,
    local: ClusterMember,
}

impl Transport for LocalTransport {
    fn send(&self, to: &ClusterMember, msg: Message) -> Result<()> {
        let engine = self.network.routes.read().get(&to.address).cloned();
        match engine {
            Some(engine) => engine.receive(self.local.clone(), msg),
            None => Err(Error::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("no route to {to}"),
            ))),
        }
    }
}
