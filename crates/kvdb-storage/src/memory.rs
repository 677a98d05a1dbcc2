//! # memory
//!
//! why: a store with the same contract as sled but nothing on disk, for tests and scratch nodes
//! relations: implements LogStore + StableStore from lib.rs, used by kvdb::raft::storage tests
//! what: InMemoryStore

use std::collections::{BTreeMap, HashMap};

use kvdb_core::LogEntry;
use parking_lot::RwLock;

use crate::{LogStore, Result, StableStore, StoreError};

/// in-memory storage for testing
///
/// stores all state in memory, no persistence across restarts
#[derive(Default)]
pub struct InMemoryStore {
    logs: RwLock<BTreeMap<u64, LogEntry>>,
    stable: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
}

impl InMemoryStore {
    /// create a new in-memory storage
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogStore for InMemoryStore {
    fn first_index(&self) -> Result<u64> {
        Ok(self.logs.read().keys().next().copied().unwrap_or(0))
    }

    fn last_index(&self) -> Result<u64> {
        Ok(self.logs.read().keys().next_back().copied().unwrap_or(0))
    }

    fn get_log(&self, index: u64) -> Result<LogEntry> {
        self.logs.read().get(&index).cloned().ok_or(StoreError::NotFound)
    }

    fn store_logs(&self, entries: &[LogEntry]) -> Result<()> {
        let mut logs = self.logs.write();
        for entry in entries {
            logs.insert(entry.index, entry.clone());
        }
        Ok(())
    }

    fn delete_range(&self, min: u64, max: u64) -> Result<()> {
        if min > max {
            return Ok(());
        }
        let mut logs = self.logs.write();
        let doomed: Vec<u64> = logs.range(min..=max).map(|(index, _)| *index).collect();
        for index in doomed {
            logs.remove(&index);
        }
        Ok(())
    }
}

impl StableStore for InMemoryStore {
    fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.stable.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.stable.read().get(key).cloned().ok_or(StoreError::NotFound)
    }
}
