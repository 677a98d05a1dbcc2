//! # node
//!
//! why: drive a raft-rs RawNode from one thread and expose it as a Consensus engine
//! relations: owns RaftStorage and the state machine, sends through a Transport, used by Store
//! what: RaftEngine (cloneable handle), RaftNode (worker loop), proposal tracking

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::Write;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use kvdb_core::{node::raft_id, ClusterMember, CodecError, LogEntry, NodeState, StateMachine};
use kvdb_storage::{LogStore, SnapshotMeta, StableStore, StoreError};
use parking_lot::{Mutex, RwLock};
use protobuf::Message as _;
use raft::prelude::*;
use raft::StateRole;
use slog::o;
use tracing::{debug, error, info, warn};

use super::storage::{decode_snapshot_data, RaftStorage};
use super::transport::Transport;
use crate::config::NodeConfig;
use crate::consensus::Consensus;
use crate::error::{Error, Result};

type Reply<T> = Sender<Result<T>>;

enum Request {
    Propose { data: Vec<u8>, reply: Reply<()> },
    ChangeMembers { change: MemberChange, reply: Reply<()> },
    Configuration { reply: Reply<Vec<ClusterMember>> },
    Snapshot { reply: Reply<SnapshotMeta> },
    Step {
        from: Option<ClusterMember>,
        msg: Message,
    },
    Shutdown,
}

enum MemberChange {
    Add(ClusterMember),
    Remove(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProposalKind {
    Command,
    Configuration,
}

/// a proposal waiting for its entry to be applied
struct Pending {
    index: u64,
    term: u64,
    kind: ProposalKind,
    reply: Reply<()>,
}

/// last state published by the worker
#[derive(Debug, Clone, Default)]
struct Status {
    state: NodeState,
    leader: Option<ClusterMember>,
    term: u64,
    applied: u64,
}

// -- RaftEngine --

/// Handle to a running consensus worker. Cheap to clone.
#[derive(Clone)]
pub struct RaftEngine {
    member: ClusterMember,
    requests: Sender<Request>,
    status: Arc<RwLock<Status>>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl RaftEngine {
    /// Restore the state machine from the newest snapshot, bootstrap if asked
    /// to, and spawn the worker thread.
    pub fn start<S>(
        config: &NodeConfig,
        storage: RaftStorage<S>,
        fsm: Arc<dyn StateMachine>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self>
    where
        S: LogStore + StableStore + 'static,
    {
        let member = ClusterMember::new(&config.node_id, &config.address);
        let id = member.raft_id();

        let mut members: BTreeMap<u64, ClusterMember> = storage
            .members()?
            .unwrap_or_default()
            .into_iter()
            .map(|m| (m.raft_id(), m))
            .collect();

        let mut applied = 0;
        if let Some(latest) = storage.snapshots().latest()? {
            let (meta, mut file) = storage.snapshots().open(&latest.id)?;
            fsm.restore(&mut file)?;
            if members.is_empty() {
                members = meta.members.iter().map(|m| (m.raft_id(), m.clone())).collect();
            }
            applied = meta.index;
            info!(id = %meta.id, index = meta.index, term = meta.term, "restored state machine from snapshot");
        } else if config.bootstrap && !storage.is_initialized() {
            let meta = SnapshotMeta::new(1, 1, vec![id], vec![], vec![member.clone()]);
            let sink = storage.snapshots().create(meta.clone())?;
            fsm.snapshot()?.persist(Box::new(sink))?;
            storage.install_snapshot(&meta)?;
            members.insert(id, member.clone());
            applied = meta.index;
            info!(member = %member, "bootstrapped single-voter cluster");
        }

        let raft_config = Config {
            id,
            election_tick: config.election_tick,
            heartbeat_tick: config.heartbeat_tick,
            applied,
            max_inflight_msgs: 256,
            ..Default::default()
        };
        raft_config.validate()?;

        // raft-rs wants an slog logger; everything we log goes through tracing
        let logger = slog::Logger::root(slog::Discard, o!());
        let mut raw = RawNode::new(&raft_config, storage.clone(), &logger)?;

        if storage.conf_state().voters == [id] {
            info!(member = %member, "sole voter, campaigning");
            raw.campaign()?;
        }

        let (requests_tx, requests_rx) = unbounded();
        let status = Arc::new(RwLock::new(Status::default()));

        let node = RaftNode {
            raw,
            storage,
            fsm,
            transport,
            members,
            peers: HashMap::new(),
            requests: requests_rx,
            pending: VecDeque::new(),
            status: Arc::clone(&status),
            tick_interval: config.tick_interval(),
            snapshot_threshold: config.snapshot_threshold,
            trailing_logs: config.trailing_logs,
            applied,
            last_snapshot_index: applied,
            last_leader: raft::INVALID_ID,
        };

        let worker = thread::Builder::new()
            .name(format!("raft-{}", config.node_id))
            .spawn(move || node.run())?;

        Ok(Self {
            member,
            requests: requests_tx,
            status,
            worker: Arc::new(Mutex::new(Some(worker))),
        })
    }

    pub fn member(&self) -> &ClusterMember {
        &self.member
    }

    pub fn term(&self) -> u64 {
        self.status.read().term
    }

    /// index of the last entry applied to the state machine
    pub fn applied_index(&self) -> u64 {
        self.status.read().applied
    }

    /// deliver a message received from a peer
    pub fn step(&self, msg: Message) -> Result<()> {
        self.requests
            .send(Request::Step { from: None, msg })
            .map_err(|_| Error::Shutdown)
    }

    /// deliver a message from a peer whose identity the transport knows; its
    /// address is remembered so replies reach it before it is a known member
    pub fn receive(&self, from: ClusterMember, msg: Message) -> Result<()> {
        self.requests
            .send(Request::Step {
                from: Some(from),
                msg,
            })
            .map_err(|_| Error::Shutdown)
    }

    fn call<T>(
        &self,
        timeout: Option<Duration>,
        request: impl FnOnce(Reply<T>) -> Request,
    ) -> Result<T> {
        let (tx, rx) = bounded(1);
        self.requests
            .send(request(tx))
            .map_err(|_| Error::Shutdown)?;
        match timeout {
            Some(timeout) => match rx.recv_timeout(timeout) {
                Ok(result) => result,
                Err(RecvTimeoutError::Timeout) => Err(Error::Timeout(timeout)),
                Err(RecvTimeoutError::Disconnected) => Err(Error::Shutdown),
            },
            None => rx.recv().map_err(|_| Error::Shutdown)?,
        }
    }

    fn ensure_leader(&self) -> Result<()> {
        let status = self.status.read();
        match status.state {
            NodeState::Leader => Ok(()),
            NodeState::Shutdown => Err(Error::Shutdown),
            _ => Err(Error::not_leader(status.leader.clone())),
        }
    }
}

impl Consensus for RaftEngine {
    fn state(&self) -> NodeState {
        self.status.read().state
    }

    fn leader(&self) -> Option<ClusterMember> {
        self.status.read().leader.clone()
    }

    fn apply(&self, data: Vec<u8>, timeout: Duration) -> Result<()> {
        self.ensure_leader()?;
        self.call(Some(timeout), |reply| Request::Propose { data, reply })
    }

    fn add_voter(&self, member: ClusterMember, timeout: Duration) -> Result<()> {
        self.ensure_leader()?;
        self.call(Some(timeout), |reply| Request::ChangeMembers {
            change: MemberChange::Add(member),
            reply,
        })
    }

    fn remove_server(&self, id: &str, timeout: Duration) -> Result<()> {
        self.ensure_leader()?;
        let id = id.to_string();
        self.call(Some(timeout), |reply| Request::ChangeMembers {
            change: MemberChange::Remove(id),
            reply,
        })
    }

    fn configuration(&self) -> Result<Vec<ClusterMember>> {
        self.call(None, |reply| Request::Configuration { reply })
    }

    fn snapshot(&self) -> Result<SnapshotMeta> {
        self.call(None, |reply| Request::Snapshot { reply })
    }

    fn shutdown(&self) -> Result<()> {
        // the worker may already be gone
        let _ = self.requests.send(Request::Shutdown);
        if let Some(worker) = self.worker.lock().take() {
            worker.join().map_err(|_| Error::Shutdown)?;
        }
        Ok(())
    }
}

// -- RaftNode --

/// The consensus worker. Owns the RawNode and is the only caller of
/// `StateMachine::apply`.
struct RaftNode<S: LogStore + StableStore> {
    raw: RawNode<RaftStorage<S>>,
    storage: RaftStorage<S>,
    fsm: Arc<dyn StateMachine>,
    transport: Arc<dyn Transport>,
    /// raft id -> member, for every voter we know an address for
    members: BTreeMap<u64, ClusterMember>,
    /// addresses learned from inbound traffic
    peers: HashMap<u64, ClusterMember>,
    requests: Receiver<Request>,
    pending: VecDeque<Pending>,
    status: Arc<RwLock<Status>>,
    tick_interval: Duration,
    snapshot_threshold: u64,
    trailing_logs: u64,
    applied: u64,
    last_snapshot_index: u64,
    last_leader: u64,
}

impl<S: LogStore + StableStore> RaftNode<S> {
    fn run(mut self) {
        let mut last_tick = Instant::now();
        loop {
            if let Err(err) = self.on_ready() {
                error!(%err, "failed to process raft ready, stopping consensus worker");
                break;
            }
            self.after_ready();

            let wait = self.tick_interval.saturating_sub(last_tick.elapsed());
            match self.requests.recv_timeout(wait) {
                Ok(Request::Shutdown) => break,
                Ok(request) => self.handle(request),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            if last_tick.elapsed() >= self.tick_interval {
                self.raw.tick();
                last_tick = Instant::now();
            }
        }

        for pending in self.pending.drain(..) {
            let _ = pending.reply.send(Err(Error::Shutdown));
        }
        let mut status = self.status.write();
        status.state = NodeState::Shutdown;
        status.leader = None;
        info!("consensus worker stopped");
    }

    fn handle(&mut self, request: Request) {
        match request {
            Request::Propose { data, reply } => match self.propose(data) {
                Ok((index, term)) => self.pending.push_back(Pending {
                    index,
                    term,
                    kind: ProposalKind::Command,
                    reply,
                }),
                Err(err) => {
                    let _ = reply.send(Err(err));
                }
            },
            Request::ChangeMembers { change, reply } => match self.propose_change(change) {
                Ok(Some((index, term))) => self.pending.push_back(Pending {
                    index,
                    term,
                    kind: ProposalKind::Configuration,
                    reply,
                }),
                Ok(None) => {
                    let _ = reply.send(Ok(()));
                }
                Err(err) => {
                    let _ = reply.send(Err(err));
                }
            },
            Request::Configuration { reply } => {
                let _ = reply.send(self.configuration());
            }
            Request::Snapshot { reply } => {
                let _ = reply.send(self.take_snapshot());
            }
            Request::Step { from, msg } => {
                if let Some(peer) = from {
                    if peer.raft_id() == msg.from {
                        self.peers.insert(msg.from, peer);
                    }
                }
                let sender = msg.from;
                if let Err(err) = self.raw.step(msg) {
                    debug!(from = sender, %err, "dropped raft message");
                }
            }
            Request::Shutdown => {}
        }
    }

    fn is_leader(&self) -> bool {
        self.raw.raft.state == StateRole::Leader
    }

    fn address_of(&self, id: u64) -> Option<&ClusterMember> {
        self.members.get(&id).or_else(|| self.peers.get(&id))
    }

    fn leader(&self) -> Option<ClusterMember> {
        match self.raw.raft.leader_id {
            raft::INVALID_ID => None,
            id => self.address_of(id).cloned(),
        }
    }

    fn not_leader(&self) -> Error {
        Error::not_leader(self.leader())
    }

    /// `(index, term)` of the entry the last successful proposal appended
    fn last_proposed(&self) -> (u64, u64) {
        (self.raw.raft.raft_log.last_index(), self.raw.raft.term)
    }

    fn propose(&mut self, data: Vec<u8>) -> Result<(u64, u64)> {
        if !self.is_leader() {
            return Err(self.not_leader());
        }
        self.raw.propose(vec![], data)?;
        Ok(self.last_proposed())
    }

    fn propose_change(&mut self, change: MemberChange) -> Result<Option<(u64, u64)>> {
        if !self.is_leader() {
            return Err(self.not_leader());
        }
        if self.raw.raft.pending_conf_index > self.raw.raft.raft_log.applied {
            return Err(Error::Raft(raft::Error::ConfChangeError(
                "a configuration change is already in progress".into(),
            )));
        }

        let voters = self.storage.conf_state().voters;
        let mut cc = ConfChange::default();
        let member = match change {
            MemberChange::Add(member) => {
                cc.set_change_type(ConfChangeType::AddNode);
                member
            }
            MemberChange::Remove(id) => {
                let node_id = raft_id(&id);
                if !voters.contains(&node_id) {
                    return Ok(None);
                }
                if voters.len() == 1 {
                    return Err(Error::Raft(raft::Error::ConfChangeError(
                        "cannot remove the last voter".into(),
                    )));
                }
                cc.set_change_type(ConfChangeType::RemoveNode);
                self.members
                    .get(&node_id)
                    .cloned()
                    .unwrap_or_else(|| ClusterMember::new(id, ""))
            }
        };
        cc.node_id = member.raft_id();
        let context = serde_json::to_vec(&member).map_err(StoreError::from)?;
        cc.context = context.clone().into();

        info!(change = ?cc.get_change_type(), member = %member, "proposing configuration change");
        self.raw.propose_conf_change(context, cc)?;
        Ok(Some(self.last_proposed()))
    }

    /// voters with their addresses, sorted; a voter we hold no identity for is an error
    fn configuration(&self) -> Result<Vec<ClusterMember>> {
        let mut members = self
            .storage
            .conf_state()
            .voters
            .iter()
            .map(|id| self.members.get(id).cloned().ok_or(Error::UnknownMember(*id)))
            .collect::<Result<Vec<_>>>()?;
        members.sort();
        Ok(members)
    }

    fn on_ready(&mut self) -> Result<()> {
        if !self.raw.has_ready() {
            return Ok(());
        }
        let mut ready = self.raw.ready();

        self.send(ready.take_messages());

        if !ready.snapshot().is_empty() {
            self.install_snapshot(ready.snapshot())?;
        }

        self.apply_committed(ready.take_committed_entries())?;

        if !ready.entries().is_empty() {
            self.storage.append(ready.entries())?;
        }
        if let Some(hs) = ready.hs() {
            self.storage.set_hard_state(hs)?;
        }

        self.send(ready.take_persisted_messages());

        let mut light = self.raw.advance(ready);
        if let Some(commit) = light.commit_index() {
            self.storage.set_commit(commit)?;
        }
        self.send(light.take_messages());
        self.apply_committed(light.take_committed_entries())?;
        self.raw.advance_apply();
        Ok(())
    }

    fn send(&self, messages: Vec<Message>) {
        for msg in messages {
            let Some(member) = self.address_of(msg.to) else {
                debug!(to = msg.to, "no address for peer, dropping message");
                continue;
            };
            if let Err(err) = self.transport.send(member, msg) {
                debug!(to = %member, %err, "failed to send raft message");
            }
        }
    }

    fn apply_committed(&mut self, entries: Vec<Entry>) -> Result<()> {
        for entry in entries {
            let entry_type = entry.get_entry_type();
            let mut outcome = Ok(());
            match entry_type {
                EntryType::EntryNormal if entry.data.is_empty() => {}
                EntryType::EntryNormal => {
                    let log_entry = LogEntry::new(entry.term, entry.index, entry.data.to_vec());
                    self.apply_command(&log_entry);
                }
                EntryType::EntryConfChange => {
                    if let Some(rejected) = self.apply_conf_change(&entry)? {
                        outcome = Err(Error::Raft(rejected));
                    }
                }
                EntryType::EntryConfChangeV2 => {
                    warn!(index = entry.index, "ignoring joint configuration change");
                }
            }
            self.applied = entry.index;
            self.resolve(entry.index, entry.term, entry_type, outcome);
        }
        Ok(())
    }

    fn apply_command(&self, entry: &LogEntry) {
        let fsm = &self.fsm;
        if panic::catch_unwind(AssertUnwindSafe(|| fsm.apply(entry))).is_err() {
            error!(
                index = entry.index,
                term = entry.term,
                "state machine failed to apply a committed entry, aborting"
            );
            std::process::abort();
        }
    }

    /// Apply a committed membership change. A change raft refuses is skipped
    /// and returned so its proposer can be told; the worker keeps running.
    fn apply_conf_change(&mut self, entry: &Entry) -> Result<Option<raft::Error>> {
        let mut cc = ConfChange::default();
        cc.merge_from_bytes(&entry.data)
            .map_err(|err| CodecError::Malformed(err.to_string()))?;
        let conf_state = match self.raw.apply_conf_change(&cc) {
            Ok(conf_state) => conf_state,
            Err(err) => {
                warn!(
                    index = entry.index,
                    change = ?cc.get_change_type(),
                    node = cc.node_id,
                    %err,
                    "skipping rejected configuration change"
                );
                return Ok(Some(err));
            }
        };

        let member: Option<ClusterMember> = serde_json::from_slice(&cc.context).ok();
        match cc.get_change_type() {
            ConfChangeType::AddNode | ConfChangeType::AddLearnerNode => {
                if let Some(member) = member {
                    self.members.insert(cc.node_id, member);
                }
            }
            ConfChangeType::RemoveNode => {
                self.members.remove(&cc.node_id);
            }
        }

        self.storage.set_conf_state(&conf_state)?;
        let members: Vec<ClusterMember> = self.members.values().cloned().collect();
        self.storage.set_members(&members)?;
        info!(
            index = entry.index,
            change = ?cc.get_change_type(),
            node = cc.node_id,
            voters = ?conf_state.voters,
            "applied configuration change"
        );
        Ok(None)
    }

    /// answer every proposal at or below `index`; the one that produced the
    /// entry gets `outcome`
    fn resolve(&mut self, index: u64, term: u64, entry_type: EntryType, outcome: Result<()>) {
        let mut outcome = Some(outcome);
        while self.pending.front().map_or(false, |p| p.index <= index) {
            let Some(pending) = self.pending.pop_front() else {
                break;
            };
            let result = if pending.index != index || pending.term != term {
                Err(self.not_leader())
            } else {
                match (pending.kind, entry_type) {
                    (ProposalKind::Command, EntryType::EntryNormal)
                    | (ProposalKind::Configuration, EntryType::EntryConfChange) => {
                        outcome.take().unwrap_or(Ok(()))
                    }
                    _ => Err(Error::Raft(raft::Error::ProposalDropped)),
                }
            };
            let _ = pending.reply.send(result);
        }
    }

    fn install_snapshot(&mut self, snapshot: &Snapshot) -> Result<()> {
        let metadata = snapshot.get_metadata();
        let (members, state) = decode_snapshot_data(&snapshot.data)?;
        let conf_state = metadata.get_conf_state();
        let meta = SnapshotMeta::new(
            metadata.index,
            metadata.term,
            conf_state.voters.clone(),
            conf_state.learners.clone(),
            members.clone(),
        );

        self.fsm.restore(&mut &state[..])?;

        let mut sink = self.storage.snapshots().create(meta.clone())?;
        sink.write_all(state)?;
        sink.finish()?;
        self.storage.install_snapshot(&meta)?;

        self.members = members.into_iter().map(|m| (m.raft_id(), m)).collect();
        self.applied = meta.index;
        self.last_snapshot_index = meta.index;
        info!(index = meta.index, term = meta.term, "installed snapshot from leader");
        Ok(())
    }

    fn take_snapshot(&mut self) -> Result<SnapshotMeta> {
        let index = self.applied;
        if index == 0 || index <= self.last_snapshot_index {
            return Err(Error::NothingToSnapshot);
        }
        let term = self.raw.raft.raft_log.term(index)?;
        let conf_state = self.storage.conf_state();
        let meta = SnapshotMeta::new(
            index,
            term,
            conf_state.voters,
            conf_state.learners,
            self.members.values().cloned().collect(),
        );

        let snapshot = self.fsm.snapshot()?;
        let sink = self.storage.snapshots().create(meta.clone())?;
        snapshot.persist(Box::new(sink))?;
        self.storage.mark_snapshot(index, term);
        self.last_snapshot_index = index;

        let compact_to = index.saturating_sub(self.trailing_logs);
        if compact_to > 0 {
            self.storage.compact(compact_to)?;
        }

        let (stored, _) = self.storage.snapshots().open(&meta.id)?;
        info!(id = %stored.id, index, term, size = stored.size, "snapshot taken");
        Ok(stored)
    }

    fn after_ready(&mut self) {
        if !self.is_leader() && !self.pending.is_empty() {
            let leader = self.leader();
            for pending in self.pending.drain(..) {
                let _ = pending.reply.send(Err(Error::not_leader(leader.clone())));
            }
        }

        let requested = self.storage.take_snapshot_request();
        if requested
            || (self.snapshot_threshold > 0
                && self.applied >= self.last_snapshot_index + self.snapshot_threshold)
        {
            match self.take_snapshot() {
                Ok(_) | Err(Error::NothingToSnapshot) => {}
                Err(err) => warn!(%err, "automatic snapshot failed"),
            }
        }

        self.publish();
    }

    fn publish(&mut self) {
        let leader_id = self.raw.raft.leader_id;
        if leader_id != self.last_leader {
            match leader_id {
                raft::INVALID_ID => info!(term = self.raw.raft.term, "leader unknown"),
                id if id == self.raw.raft.id => {
                    info!(term = self.raw.raft.term, "became leader")
                }
                id => info!(leader = id, term = self.raw.raft.term, "following leader"),
            }
            self.last_leader = leader_id;
        }

        let state = match self.raw.raft.state {
            StateRole::Leader => NodeState::Leader,
            StateRole::Candidate | StateRole::PreCandidate => NodeState::Candidate,
            StateRole::Follower => NodeState::Follower,
        };
        let mut status = self.status.write();
        status.state = state;
        status.leader = self.leader();
        status.term = self.raw.raft.term;
        status.applied = self.applied;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::Fsm;
    use crate::raft::NoopTransport;
    use kvdb_storage::{FileSnapshotStore, InMemoryStore};
    use tempfile::tempdir;

    #[test]
    fn voter_without_identity_is_reported() {
        let dir = tempdir().unwrap();
        let config = NodeConfig::new("node0", "127.0.0.1:7000", dir.path());
        let node0 = ClusterMember::new("node0", "127.0.0.1:7000");
        let snapshots = FileSnapshotStore::new(config.snapshot_dir(), 2).unwrap();
        let storage = RaftStorage::open(Arc::new(InMemoryStore::new()), snapshots).unwrap();
        storage
            .set_conf_state(&ConfState::from((vec![node0.raft_id(), 42], vec![])))
            .unwrap();
        storage.set_members(&[node0]).unwrap();

        let engine = RaftEngine::start(
            &config,
            storage,
            Arc::new(Fsm::new()),
            Arc::new(NoopTransport),
        )
        .unwrap();

        assert!(matches!(engine.configuration(), Err(Error::UnknownMember(42))));
        engine.shutdown().unwrap();
    }
}
