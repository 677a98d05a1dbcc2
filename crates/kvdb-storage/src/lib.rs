//! # kvdb-storage
//!
//! why: provide crash-durable persistence for the replicated log and consensus metadata
//! relations: consumed by the raft host in kvdb, entry layout defined in kvdb-core
//! what: LogStore/StableStore traits, SledStore, InMemoryStore, FileSnapshotStore

pub mod error;
pub mod memory;
pub mod sled_store;
pub mod snapshot;

use kvdb_core::LogEntry;

pub use error::{Result, StoreError};
pub use memory::InMemoryStore;
pub use sled_store::{Options, SledStore};
pub use snapshot::{FileSnapshotSink, FileSnapshotStore, SnapshotMeta};

/// trait for durable storage of the replicated log
///
/// the consensus host is the only writer. indices are dense and start at 1;
/// entries only ever disappear through `delete_range`.
pub trait LogStore: Send + Sync {
    /// lowest stored index, 0 for an empty log
    fn first_index(&self) -> Result<u64>;

    /// highest stored index, 0 for an empty log
    fn last_index(&self) -> Result<u64>;

    /// exact lookup, `StoreError::NotFound` if absent
    fn get_log(&self, index: u64) -> Result<LogEntry>;

    fn store_log(&self, entry: &LogEntry) -> Result<()> {
        self.store_logs(std::slice::from_ref(entry))
    }

    /// append entries; all of them become durable together or none do
    fn store_logs(&self, entries: &[LogEntry]) -> Result<()>;

    /// remove every entry with `min <= index <= max`
    fn delete_range(&self, min: u64, max: u64) -> Result<()>;
}

/// trait for small consensus bookkeeping values (term, vote, configuration)
pub trait StableStore: Send + Sync {
    fn set(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// `StoreError::NotFound` for a key never set
    fn get(&self, key: &[u8]) -> Result<Vec<u8>>;

    fn set_u64(&self, key: &[u8], value: u64) -> Result<()> {
        self.set(key, &value.to_be_bytes())
    }

    fn get_u64(&self, key: &[u8]) -> Result<u64> {
        decode_u64(&self.get(key)?)
    }
}

/// 8-byte big-endian key, so byte order matches numeric order
pub fn index_key(index: u64) -> [u8; 8] {
    index.to_be_bytes()
}

pub fn decode_u64(bytes: &[u8]) -> Result<u64> {
    if bytes.len() != 8 {
        return Err(StoreError::Corrupt(format!(
            "expected 8 byte integer, found {} bytes",
            bytes.len()
        )));
    }
    Ok(kvdb_core::log::read_u64(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_keys_sort_numerically() {
        let mut keys = vec![index_key(256), index_key(2), index_key(1 << 40), index_key(1)];
        keys.sort();
        assert_eq!(keys, vec![index_key(1), index_key(2), index_key(256), index_key(1 << 40)]);
    }

    #[test]
    fn decode_u64_rejects_wrong_width() {
        assert!(matches!(decode_u64(&[1, 2, 3]), Err(StoreError::Corrupt(_))));
        assert_eq!(decode_u64(&7u64.to_be_bytes()).unwrap(), 7);
    }
}
