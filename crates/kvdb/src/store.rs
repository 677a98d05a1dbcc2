//! # store
//!
//! why: the surface an HTTP or CLI layer talks to
//! relations: owns the Fsm, a Consensus engine and the Membership manager
//! what: Store facade, KeyValue and ClusterAdmin traits

use std::fs;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use kvdb_core::{ClusterMember, Command, NodeState, StateMachine};
use kvdb_storage::{FileSnapshotStore, Options, SledStore, SnapshotMeta};
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::consensus::Consensus;
use crate::error::{Error, Result};
use crate::fsm::Fsm;
use crate::membership::Membership;
use crate::raft::{RaftEngine, RaftStorage, Transport};

const LEADER_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// key/value operations
pub trait KeyValue {
    /// local read, `None` when absent
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;
    fn keys(&self) -> Vec<String>;
}

/// cluster management operations
pub trait ClusterAdmin {
    fn add_node(&self, id: &str, address: &str) -> Result<()>;
    fn leader(&self) -> Option<ClusterMember>;
    fn node_list(&self) -> Result<Vec<ClusterMember>>;
    fn snapshot(&self) -> Result<SnapshotMeta>;
}

/// A replicated string map.
///
/// Reads are served from the local state machine. Writes go through the
/// consensus engine and only succeed on the leader.
pub struct Store<C: Consensus = RaftEngine> {
    node_id: String,
    fsm: Arc<Fsm>,
    engine: Arc<C>,
    membership: Membership<C>,
    apply_timeout: Duration,
}

impl Store<RaftEngine> {
    /// open (or create) the node's data directory and start consensus
    pub fn open(config: NodeConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.data_dir)?;

        let mut options = Options::new(config.log_path());
        options.no_sync = config.no_sync;
        options.lock_timeout = config.lock_timeout();
        let log = Arc::new(SledStore::with_options(options)?);
        let snapshots = FileSnapshotStore::new(config.snapshot_dir(), config.retain_snapshots)?;
        let storage = RaftStorage::open(log, snapshots)?;

        let fsm = Arc::new(Fsm::new());
        let state_machine: Arc<dyn StateMachine> = fsm.clone();
        let engine = RaftEngine::start(&config, storage, state_machine, transport)?;

        info!(
            node = %config.node_id,
            address = %config.address,
            data_dir = %config.data_dir.display(),
            "store opened"
        );
        Ok(Self::with_engine(
            config.node_id.clone(),
            fsm,
            Arc::new(engine),
            config.apply_timeout(),
        ))
    }
}

impl<C: Consensus> Store<C> {
    /// assemble a store around an already running engine that applies to `fsm`
    pub fn with_engine(
        node_id: impl Into<String>,
        fsm: Arc<Fsm>,
        engine: Arc<C>,
        apply_timeout: Duration,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            fsm,
            membership: Membership::new(Arc::clone(&engine), apply_timeout),
            engine,
            apply_timeout,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn engine(&self) -> &C {
        &self.engine
    }

    pub fn state(&self) -> NodeState {
        self.engine.state()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.fsm.get(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.fsm.keys()
    }

    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        self.replicate(Command::set(key, value))
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        self.replicate(Command::delete(key))
    }

    fn replicate(&self, command: Command) -> Result<()> {
        match self.engine.state() {
            NodeState::Leader => {}
            NodeState::Shutdown => return Err(Error::Shutdown),
            _ => return Err(Error::not_leader(self.engine.leader())),
        }
        let data = command.encode()?;
        debug!(key = command.key(), "replicating command");
        self.engine.apply(data, self.apply_timeout)
    }

    pub fn add_node(&self, id: &str, address: &str) -> Result<()> {
        self.membership.add_node(id, address)
    }

    pub fn remove_node(&self, id: &str) -> Result<()> {
        self.membership.remove_node(id)
    }

    pub fn leader(&self) -> Option<ClusterMember> {
        self.membership.leader()
    }

    pub fn node_list(&self) -> Result<Vec<ClusterMember>> {
        self.membership.node_list()
    }

    pub fn snapshot(&self) -> Result<SnapshotMeta> {
        self.membership.snapshot()
    }

    /// block until a leader is known
    pub fn wait_for_leader(&self, timeout: Duration) -> Result<ClusterMember> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(leader) = self.engine.leader() {
                return Ok(leader);
            }
            if self.engine.state() == NodeState::Shutdown {
                return Err(Error::Shutdown);
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout(timeout));
            }
            thread::sleep(LEADER_POLL_INTERVAL);
        }
    }

    pub fn shutdown(&self) -> Result<()> {
        info!(node = %self.node_id, "shutting down store");
        self.engine.shutdown()
    }
}

impl<C: Consensus> Drop for Store<C> {
    fn drop(&mut self) {
        if let Err(err) = self.engine.shutdown() {
            warn!(node = %self.node_id, %err, "engine did not shut down cleanly");
        }
    }
}

impl<C: Consensus> KeyValue for Store<C> {
    fn get(&self, key: &str) -> Option<String> {
        Store::get(self, key)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        Store::set(self, key, value)
    }

    fn delete(&self, key: &str) -> Result<()> {
        Store::delete(self, key)
    }

    fn keys(&self) -> Vec<String> {
        Store::keys(self)
    }
}

impl<C: Consensus> ClusterAdmin for Store<C> {
    fn add_node(&self, id: &str, address: &str) -> Result<()> {
        Store::add_node(self, id, address)
    }

    fn leader(&self) -> Option<ClusterMember> {
        Store::leader(self)
    }

    fn node_list(&self) -> Result<Vec<ClusterMember>> {
        Store::node_list(self)
    }

    fn snapshot(&self) -> Result<SnapshotMeta> {
        Store::snapshot(self)
    }
}
