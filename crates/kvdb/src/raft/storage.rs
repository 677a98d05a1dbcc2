//! # storage
//!
//! why: raft-rs reads its log, hard state and snapshots through `raft::Storage`
//! relations: wraps a kvdb-storage LogStore + StableStore and FileSnapshotStore, owned by raft::node
//! what: RaftStorage adapter, entry conversion, snapshot data framing

use std::io::Read;
use std::sync::Arc;

use kvdb_core::{ClusterMember, CodecError, LogEntry, LogType};
use kvdb_storage::{FileSnapshotStore, LogStore, SnapshotMeta, StableStore, StoreError};
use parking_lot::RwLock;
use protobuf::Message as _;
use raft::prelude::*;
use raft::{GetEntriesContext, RaftState, Storage, StorageError};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};

pub const KEY_CURRENT_TERM: &[u8] = b"CurrentTerm";
pub const KEY_LAST_VOTE: &[u8] = b"LastVoteCand";
pub const KEY_COMMIT_INDEX: &[u8] = b"CommitIndex";
pub const KEY_CONF_STATE: &[u8] = b"ConfState";
pub const KEY_MEMBERS: &[u8] = b"Members";

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredConf {
    voters: Vec<u64>,
    #[serde(default)]
    learners: Vec<u64>,
}

struct Core {
    hard_state: HardState,
    conf_state: ConfState,
    snapshot_index: u64,
    snapshot_term: u64,
    /// a peer needs a snapshot newer than the stored one
    snapshot_requested: bool,
}

/// `raft::Storage` over a durable log store and a snapshot directory.
///
/// The consensus worker is the only writer. Clones share state.
pub struct RaftStorage<S> {
    log: Arc<S>,
    snapshots: FileSnapshotStore,
    core: Arc<RwLock<Core>>,
}

impl<S> Clone for RaftStorage<S> {
    fn clone(&self) -> Self {
        Self {
            log: Arc::clone(&self.log),
            snapshots: self.snapshots.clone(),
            core: Arc::clone(&self.core),
        }
    }
}

impl<S: LogStore + StableStore> RaftStorage<S> {
    /// load hard state, configuration and the latest snapshot position
    pub fn open(log: Arc<S>, snapshots: FileSnapshotStore) -> Result<Self> {
        let latest = snapshots.latest()?;
        let (snapshot_index, snapshot_term) = latest
            .as_ref()
            .map(|meta| (meta.index, meta.term))
            .unwrap_or((0, 0));

        let mut hard_state = HardState::default();
        hard_state.term = optional_u64(&*log, KEY_CURRENT_TERM)?.unwrap_or(0).max(snapshot_term);
        hard_state.vote = optional_u64(&*log, KEY_LAST_VOTE)?.unwrap_or(0);
        hard_state.commit = optional_u64(&*log, KEY_COMMIT_INDEX)?.unwrap_or(0).max(snapshot_index);

        let conf_state = match optional(&*log, KEY_CONF_STATE)? {
            Some(bytes) => {
                let stored: StoredConf = serde_json::from_slice(&bytes).map_err(StoreError::from)?;
                ConfState::from((stored.voters, stored.learners))
            }
            None => latest
                .map(|meta| ConfState::from((meta.voters, meta.learners)))
                .unwrap_or_default(),
        };

        debug!(
            term = hard_state.term,
            commit = hard_state.commit,
            snapshot_index,
            voters = ?conf_state.voters,
            "loaded raft state"
        );

        Ok(Self {
            log,
            snapshots,
            core: Arc::new(RwLock::new(Core {
                hard_state,
                conf_state,
                snapshot_index,
                snapshot_term,
                snapshot_requested: false,
            })),
        })
    }

    pub fn log(&self) -> &S {
        &self.log
    }

    pub fn snapshots(&self) -> &FileSnapshotStore {
        &self.snapshots
    }

    /// a configuration or snapshot has been persisted before
    pub fn is_initialized(&self) -> bool {
        let core = self.core.read();
        !core.conf_state.voters.is_empty() || core.snapshot_index > 0
    }

    pub fn hard_state(&self) -> HardState {
        self.core.read().hard_state.clone()
    }

    pub fn conf_state(&self) -> ConfState {
        self.core.read().conf_state.clone()
    }

    /// `(index, term)` of the newest snapshot, `(0, 0)` without one
    pub fn snapshot_position(&self) -> (u64, u64) {
        let core = self.core.read();
        (core.snapshot_index, core.snapshot_term)
    }

    /// persisted member addresses, `None` if never written
    pub fn members(&self) -> Result<Option<Vec<ClusterMember>>> {
        match optional(&*self.log, KEY_MEMBERS)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(StoreError::from)?)),
            None => Ok(None),
        }
    }

    pub fn set_members(&self, members: &[ClusterMember]) -> Result<()> {
        let bytes = serde_json::to_vec(members).map_err(StoreError::from)?;
        self.log.set(KEY_MEMBERS, &bytes)?;
        Ok(())
    }

    /// append entries, dropping any stored tail they conflict with
    pub fn append(&self, entries: &[Entry]) -> Result<()> {
        let Some(first) = entries.first() else {
            return Ok(());
        };
        if first.index <= self.core.read().snapshot_index {
            return Err(Error::Raft(raft::Error::Store(StorageError::Compacted)));
        }

        let converted = entries.iter().map(to_log_entry).collect::<Result<Vec<_>>>()?;

        let last = self.log.last_index()?;
        if last >= first.index {
            debug!(from = first.index, to = last, "truncating conflicting log tail");
            self.log.delete_range(first.index, last)?;
        }
        self.log.store_logs(&converted)?;
        Ok(())
    }

    pub fn set_hard_state(&self, hs: &HardState) -> Result<()> {
        self.log.set_u64(KEY_CURRENT_TERM, hs.term)?;
        self.log.set_u64(KEY_LAST_VOTE, hs.vote)?;
        self.log.set_u64(KEY_COMMIT_INDEX, hs.commit)?;
        self.core.write().hard_state = hs.clone();
        Ok(())
    }

    pub fn set_commit(&self, commit: u64) -> Result<()> {
        self.log.set_u64(KEY_COMMIT_INDEX, commit)?;
        self.core.write().hard_state.commit = commit;
        Ok(())
    }

    pub fn set_conf_state(&self, cs: &ConfState) -> Result<()> {
        let stored = StoredConf {
            voters: cs.voters.clone(),
            learners: cs.learners.clone(),
        };
        let bytes = serde_json::to_vec(&stored).map_err(StoreError::from)?;
        self.log.set(KEY_CONF_STATE, &bytes)?;
        self.core.write().conf_state = cs.clone();
        Ok(())
    }

    /// Replace the whole log with a snapshot already saved in the snapshot store.
    pub fn install_snapshot(&self, meta: &SnapshotMeta) -> Result<()> {
        let first = self.log.first_index()?;
        let last = self.log.last_index()?;
        if last > 0 {
            self.log.delete_range(first, last)?;
        }

        self.set_conf_state(&ConfState::from((meta.voters.clone(), meta.learners.clone())))?;
        self.set_members(&meta.members)?;

        let mut hs = self.hard_state();
        hs.term = hs.term.max(meta.term);
        hs.commit = hs.commit.max(meta.index);
        self.set_hard_state(&hs)?;

        let mut core = self.core.write();
        core.snapshot_index = meta.index;
        core.snapshot_term = meta.term;
        Ok(())
    }

    /// record a locally taken snapshot; the log is left alone
    pub fn mark_snapshot(&self, index: u64, term: u64) {
        let mut core = self.core.write();
        core.snapshot_index = index;
        core.snapshot_term = term;
    }

    /// true once per request for a fresher snapshot
    pub fn take_snapshot_request(&self) -> bool {
        std::mem::take(&mut self.core.write().snapshot_requested)
    }

    /// delete stored entries up to and including `index`
    pub fn compact(&self, index: u64) -> Result<()> {
        let first = self.log.first_index()?;
        if first == 0 || index < first {
            return Ok(());
        }
        debug!(from = first, to = index, "compacting log");
        self.log.delete_range(first, index)?;
        Ok(())
    }
}

impl<S: LogStore + StableStore> Storage for RaftStorage<S> {
    fn initial_state(&self) -> raft::Result<RaftState> {
        let core = self.core.read();
        Ok(RaftState {
            hard_state: core.hard_state.clone(),
            conf_state: core.conf_state.clone(),
        })
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        _context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>> {
        let max_size = max_size.into();
        if low < self.first_index()? {
            return Err(raft::Error::Store(StorageError::Compacted));
        }
        if high > self.last_index()? + 1 {
            return Err(raft::Error::Store(StorageError::Unavailable));
        }

        let mut entries = Vec::new();
        let mut total_size: u64 = 0;
        for index in low..high {
            let entry = match self.log.get_log(index) {
                Ok(entry) => to_raft_entry(&entry),
                Err(StoreError::NotFound) => {
                    return Err(raft::Error::Store(StorageError::Unavailable))
                }
                Err(err) => return Err(storage_error(err)),
            };
            total_size += u64::from(entry.compute_size());
            if let Some(max) = max_size {
                if !entries.is_empty() && total_size > max {
                    break;
                }
            }
            entries.push(entry);
        }
        Ok(entries)
    }

    fn term(&self, idx: u64) -> raft::Result<u64> {
        let (snapshot_index, snapshot_term) = self.snapshot_position();
        if idx == snapshot_index {
            return Ok(snapshot_term);
        }
        if idx < self.first_index()? {
            return Err(raft::Error::Store(StorageError::Compacted));
        }
        if idx > self.last_index()? {
            return Err(raft::Error::Store(StorageError::Unavailable));
        }
        match self.log.get_log(idx) {
            Ok(entry) => Ok(entry.term),
            Err(StoreError::NotFound) => Err(raft::Error::Store(StorageError::Unavailable)),
            Err(err) => Err(storage_error(err)),
        }
    }

    fn first_index(&self) -> raft::Result<u64> {
        let stored = self.log.first_index().map_err(storage_error)?;
        Ok(match stored {
            0 => self.core.read().snapshot_index + 1,
            index => index,
        })
    }

    fn last_index(&self) -> raft::Result<u64> {
        let stored = self.log.last_index().map_err(storage_error)?;
        Ok(stored.max(self.core.read().snapshot_index))
    }

    fn snapshot(&self, request_index: u64, to: u64) -> raft::Result<Snapshot> {
        // raft-rs treats anything but "temporarily unavailable" as fatal
        let unavailable = || raft::Error::Store(StorageError::SnapshotTemporarilyUnavailable);

        let latest = match self.snapshots.latest() {
            Ok(latest) => latest,
            Err(err) => {
                warn!(%err, "cannot list snapshots");
                return Err(unavailable());
            }
        };
        let meta = match latest {
            Some(meta) if meta.index >= request_index => meta,
            _ => return Err(unavailable()),
        };
        if !meta.voters.contains(&to) && !meta.learners.contains(&to) {
            debug!(to, index = meta.index, "latest snapshot predates peer, requesting a new one");
            self.core.write().snapshot_requested = true;
            return Err(unavailable());
        }

        match self.load_snapshot(&meta.id) {
            Ok(snapshot) => Ok(snapshot),
            Err(err) => {
                warn!(id = %meta.id, %err, "cannot load snapshot");
                Err(unavailable())
            }
        }
    }
}

impl<S> RaftStorage<S> {
    /// read a stored snapshot back into raft's wire form
    fn load_snapshot(&self, id: &str) -> Result<Snapshot> {
        let (meta, mut file) = self.snapshots.open(id)?;
        let mut state = Vec::new();
        file.read_to_end(&mut state)?;
        let data = encode_snapshot_data(&meta.members, &state)?;

        let mut snapshot = Snapshot::default();
        snapshot.mut_metadata().index = meta.index;
        snapshot.mut_metadata().term = meta.term;
        snapshot
            .mut_metadata()
            .set_conf_state(ConfState::from((meta.voters, meta.learners)));
        snapshot.data = data.into();
        Ok(snapshot)
    }
}

fn storage_error(err: StoreError) -> raft::Error {
    raft::Error::Store(StorageError::Other(Box::new(err)))
}

fn optional<S: StableStore + ?Sized>(store: &S, key: &[u8]) -> Result<Option<Vec<u8>>> {
    match store.get(key) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.is_not_found() => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn optional_u64<S: StableStore + ?Sized>(store: &S, key: &[u8]) -> Result<Option<u64>> {
    match store.get_u64(key) {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.is_not_found() => Ok(None),
        Err(err) => Err(err.into()),
    }
}

// -- entry conversion --

pub fn to_log_entry(entry: &Entry) -> Result<LogEntry> {
    let log_type = match entry.get_entry_type() {
        EntryType::EntryNormal if entry.data.is_empty() => LogType::NoOp,
        EntryType::EntryNormal => LogType::Command,
        EntryType::EntryConfChange => LogType::Configuration,
        EntryType::EntryConfChangeV2 => {
            return Err(Error::Raft(raft::Error::ConfChangeError(
                "joint configuration changes are not supported".into(),
            )))
        }
    };
    Ok(LogEntry::new(entry.term, entry.index, entry.data.to_vec()).with_type(log_type))
}

pub fn to_raft_entry(entry: &LogEntry) -> Entry {
    let mut out = Entry::default();
    out.set_entry_type(match entry.log_type {
        LogType::Configuration => EntryType::EntryConfChange,
        LogType::Command | LogType::NoOp | LogType::Barrier => EntryType::EntryNormal,
    });
    out.term = entry.term;
    out.index = entry.index;
    out.data = entry.data.clone().into();
    out
}

// -- snapshot data framing --
//
// [members json length, 8 bytes big-endian][members json][state machine bytes]

pub fn encode_snapshot_data(members: &[ClusterMember], state: &[u8]) -> Result<Vec<u8>> {
    let members = serde_json::to_vec(members).map_err(StoreError::from)?;
    let mut buf = Vec::with_capacity(8 + members.len() + state.len());
    buf.extend_from_slice(&(members.len() as u64).to_be_bytes());
    buf.extend_from_slice(&members);
    buf.extend_from_slice(state);
    Ok(buf)
}

pub fn decode_snapshot_data(data: &[u8]) -> Result<(Vec<ClusterMember>, &[u8])> {
    if data.len() < 8 {
        return Err(Error::Codec(CodecError::Truncated { len: data.len() }));
    }
    let declared = kvdb_core::log::read_u64(&data[..8]);
    let rest = &data[8..];
    if declared > rest.len() as u64 {
        return Err(Error::Codec(CodecError::LengthOverflow {
            declared,
            available: rest.len(),
        }));
    }
    let (members, state) = rest.split_at(declared as usize);
    let members = serde_json::from_slice(members)
        .map_err(|err| Error::Snapshot(format!("member list: {err}")))?;
    Ok((members, state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvdb_storage::InMemoryStore;
    use std::io::Write;
    use tempfile::tempdir;

    fn storage() -> (tempfile::TempDir, RaftStorage<InMemoryStore>) {
        let dir = tempdir().unwrap();
        let snapshots = FileSnapshotStore::new(dir.path(), 2).unwrap();
        let storage = RaftStorage::open(Arc::new(InMemoryStore::new()), snapshots).unwrap();
        (dir, storage)
    }

    fn entry(index: u64, term: u64, data: &[u8]) -> Entry {
        to_raft_entry(&LogEntry::new(term, index, data.to_vec()))
    }

    #[test]
    fn fresh_storage_is_empty() {
        let (_dir, storage) = storage();

        assert!(!storage.is_initialized());
        assert_eq!(storage.first_index().unwrap(), 1);
        assert_eq!(storage.last_index().unwrap(), 0);
        assert_eq!(storage.term(0).unwrap(), 0);
    }

    #[test]
    fn append_truncates_conflicting_tail() {
        let (_dir, storage) = storage();
        storage
            .append(&[entry(1, 1, b"a"), entry(2, 1, b"b"), entry(3, 1, b"c")])
            .unwrap();

        storage.append(&[entry(2, 2, b"x")]).unwrap();

        assert_eq!(storage.last_index().unwrap(), 2);
        assert_eq!(storage.term(2).unwrap(), 2);
        let entries = storage
            .entries(1, 3, None, GetEntriesContext::empty(false))
            .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].data.to_vec(), b"x".to_vec());
    }

    #[test]
    fn entries_respect_max_size_but_return_one() {
        let (_dir, storage) = storage();
        storage.append(&[entry(1, 1, b"a"), entry(2, 1, b"b")]).unwrap();

        let entries = storage
            .entries(1, 3, Some(0), GetEntriesContext::empty(false))
            .unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn hard_and_conf_state_survive_reopen() {
        let dir = tempdir().unwrap();
        let log = Arc::new(InMemoryStore::new());
        let snapshots = FileSnapshotStore::new(dir.path(), 2).unwrap();
        {
            let storage = RaftStorage::open(Arc::clone(&log), snapshots.clone()).unwrap();
            let mut hs = HardState::default();
            hs.term = 3;
            hs.vote = 7;
            hs.commit = 0;
            storage.set_hard_state(&hs).unwrap();
            storage.set_conf_state(&ConfState::from((vec![7, 9], vec![]))).unwrap();
        }

        let storage = RaftStorage::open(log, snapshots).unwrap();
        let state = storage.initial_state().unwrap();
        assert_eq!(state.hard_state.term, 3);
        assert_eq!(state.hard_state.vote, 7);
        assert_eq!(state.conf_state.voters, vec![7, 9]);
        assert!(storage.is_initialized());
    }

    #[test]
    fn snapshot_covers_the_log() {
        let (_dir, storage) = storage();
        storage.append(&[entry(1, 1, b"a"), entry(2, 1, b"b")]).unwrap();

        let member = ClusterMember::new("node0", "127.0.0.1:0");
        let meta = SnapshotMeta::new(5, 2, vec![member.raft_id()], vec![], vec![member.clone()]);
        let mut sink = storage.snapshots().create(meta.clone()).unwrap();
        sink.write_all(b"{}").unwrap();
        sink.finish().unwrap();
        storage.install_snapshot(&meta).unwrap();

        assert_eq!(storage.first_index().unwrap(), 6);
        assert_eq!(storage.last_index().unwrap(), 5);
        assert_eq!(storage.term(5).unwrap(), 2);
        assert!(matches!(
            storage.term(2),
            Err(raft::Error::Store(StorageError::Compacted))
        ));
        assert_eq!(storage.members().unwrap(), Some(vec![member.clone()]));

        let snapshot = storage.snapshot(0, member.raft_id()).unwrap();
        assert_eq!(snapshot.get_metadata().index, 5);
        let (members, state) = decode_snapshot_data(&snapshot.data).unwrap();
        assert_eq!(members, vec![member]);
        assert_eq!(state, b"{}");
    }

    #[test]
    fn compact_keeps_trailing_entries() {
        let (_dir, storage) = storage();
        let entries: Vec<Entry> = (1..=6).map(|i| entry(i, 1, b"e")).collect();
        storage.append(&entries).unwrap();
        storage.mark_snapshot(6, 1);

        storage.compact(4).unwrap();

        assert_eq!(storage.first_index().unwrap(), 5);
        assert_eq!(storage.last_index().unwrap(), 6);
        assert_eq!(storage.term(6).unwrap(), 1);
    }

    #[test]
    fn snapshot_without_the_peer_is_requested_again() {
        let (_dir, storage) = storage();
        let meta = SnapshotMeta::new(1, 1, vec![1], vec![], vec![]);
        storage.snapshots().create(meta).unwrap().finish().unwrap();

        assert!(matches!(
            storage.snapshot(0, 2),
            Err(raft::Error::Store(StorageError::SnapshotTemporarilyUnavailable))
        ));
        assert!(storage.take_snapshot_request());
        assert!(!storage.take_snapshot_request());
        assert!(storage.snapshot(0, 1).is_ok());
    }

    #[test]
    fn no_snapshot_is_temporarily_unavailable() {
        let (_dir, storage) = storage();
        assert!(matches!(
            storage.snapshot(0, 0),
            Err(raft::Error::Store(StorageError::SnapshotTemporarilyUnavailable))
        ));
    }

    #[test]
    fn entry_types_map_to_log_types() {
        let noop = to_log_entry(&entry(1, 1, b"")).unwrap();
        assert_eq!(noop.log_type, LogType::NoOp);

        let mut conf = Entry::default();
        conf.set_entry_type(EntryType::EntryConfChange);
        conf.index = 2;
        conf.data = b"cc".to_vec().into();
        let stored = to_log_entry(&conf).unwrap();
        assert_eq!(stored.log_type, LogType::Configuration);
        assert_eq!(to_raft_entry(&stored).get_entry_type(), EntryType::EntryConfChange);
    }

    #[test]
    fn truncated_snapshot_data_is_rejected() {
        assert!(matches!(
            decode_snapshot_data(&[0, 0, 0]),
            Err(Error::Codec(CodecError::Truncated { .. }))
        ));
        assert!(matches!(
            decode_snapshot_data(&[0, 0, 0, 0, 0, 0, 0, 9, b'[']),
            Err(Error::Codec(CodecError::LengthOverflow { .. }))
        ));
    }
}
