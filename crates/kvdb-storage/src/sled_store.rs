//! # sled_store
//!
//! why: keep the replicated log and consensus metadata in one embedded transactional engine
//! relations: implements LogStore + StableStore from lib.rs, used by kvdb::raft::storage
//! what: SledStore, open Options, lock-wait on open, read-only guard

use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use kvdb_core::LogEntry;
use sled::{Batch, IVec};
use tracing::{debug, warn};

use crate::{decode_u64, index_key, LogStore, Result, StableStore, StoreError};

/// key space holding `index -> encoded LogEntry`
const LOG_TREE: &str = "logs";
/// key space holding consensus metadata
const STABLE_TREE: &str = "stable";

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// How a [`SledStore`] is opened.
#[derive(Debug, Clone)]
pub struct Options {
    /// Directory of the sled database
    pub path: PathBuf,
    /// Skip flushing to disk after every write. Use [`SledStore::sync`] to
    /// force a durability barrier.
    pub no_sync: bool,
    /// Reject every mutation and skip key space creation
    pub read_only: bool,
    /// How long to wait for another handle to release the database lock
    pub lock_timeout: Duration,
}

impl Options {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            no_sync: false,
            read_only: false,
            lock_timeout: Duration::from_secs(1),
        }
    }
}

/// sled-backed log and stable store
///
/// stores both key spaces in a single database:
/// - `logs`: 8-byte big-endian index -> encoded entry
/// - `stable`: arbitrary key -> arbitrary bytes
pub struct SledStore {
    db: sled::Db,
    logs: sled::Tree,
    stable: sled::Tree,
    path: PathBuf,
    no_sync: bool,
    read_only: bool,
}

impl SledStore {
    /// open read-write with default options, creating the database if needed
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        Self::with_options(Options::new(path))
    }

    pub fn with_options(options: Options) -> Result<Self> {
        let db = open_db(&options.path, options.lock_timeout)?;

        let (logs, stable) = if options.read_only {
            (existing_tree(&db, LOG_TREE)?, existing_tree(&db, STABLE_TREE)?)
        } else {
            // open_tree creates missing trees and leaves existing ones alone
            let logs = db.open_tree(LOG_TREE)?;
            let stable = db.open_tree(STABLE_TREE)?;
            db.flush()?;
            (logs, stable)
        };

        debug!(
            path = %options.path.display(),
            read_only = options.read_only,
            no_sync = options.no_sync,
            "opened log store"
        );

        Ok(Self {
            db,
            logs,
            stable,
            path: options.path,
            no_sync: options.no_sync,
            read_only: options.read_only,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// number of entries currently stored
    pub fn log_count(&self) -> usize {
        self.logs.len()
    }

    /// force everything written so far onto disk
    pub fn sync(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    /// flush and release the database lock
    pub fn close(self) -> Result<()> {
        if !self.read_only {
            self.db.flush()?;
        }
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        Ok(())
    }

    /// make an applied batch durable unless the caller opted out
    fn commit(&self) -> Result<()> {
        if !self.no_sync {
            self.db.flush()?;
        }
        Ok(())
    }
}

/// retry the exclusive file lock until `lock_timeout` has passed
fn open_db(path: &Path, lock_timeout: Duration) -> Result<sled::Db> {
    let started = Instant::now();
    let mut warned = false;
    loop {
        match sled::Config::new().path(path).open() {
            Ok(db) => return Ok(db),
            Err(sled::Error::Io(err)) if is_lock_error(&err) => {
                let waited = started.elapsed();
                if waited >= lock_timeout {
                    return Err(StoreError::ResourceBusy {
                        path: path.to_path_buf(),
                        waited,
                    });
                }
                if !warned {
                    warn!(path = %path.display(), "database locked, waiting");
                    warned = true;
                }
                thread::sleep(LOCK_RETRY_INTERVAL);
            }
            Err(err) => return Err(err.into()),
        }
    }
}

/// sled 0.34 wraps a failed exclusive file lock in an `Other` io error whose
/// message starts with this text. Nothing else in its open path uses it.
const SLED_LOCK_MESSAGE: &str = "could not acquire lock";

/// only a held database lock is retried; every other io error fails the open
fn is_lock_error(err: &io::Error) -> bool {
    match err.kind() {
        io::ErrorKind::WouldBlock => true,
        io::ErrorKind::Other => err.to_string().starts_with(SLED_LOCK_MESSAGE),
        _ => false,
    }
}

fn existing_tree(db: &sled::Db, name: &str) -> Result<sled::Tree> {
    let wanted = IVec::from(name);
    if !db.tree_names().contains(&wanted) {
        return Err(StoreError::Corrupt(format!("key space {name} missing")));
    }
    Ok(db.open_tree(name)?)
}

fn key_to_index(key: &[u8]) -> Result<u64> {
    decode_u64(key).map_err(|_| StoreError::Corrupt(format!("log key of {} bytes", key.len())))
}

// -- LogStore --

impl LogStore for SledStore {
    fn first_index(&self) -> Result<u64> {
        match self.logs.first()? {
            Some((key, _)) => key_to_index(&key),
            None => Ok(0),
        }
    }

    fn last_index(&self) -> Result<u64> {
        match self.logs.last()? {
            Some((key, _)) => key_to_index(&key),
            None => Ok(0),
        }
    }

    fn get_log(&self, index: u64) -> Result<LogEntry> {
        let value = self.logs.get(index_key(index))?.ok_or(StoreError::NotFound)?;
        Ok(LogEntry::decode(&value)?)
    }

    fn store_logs(&self, entries: &[LogEntry]) -> Result<()> {
        self.ensure_writable()?;
        if entries.is_empty() {
            return Ok(());
        }

        let mut batch = Batch::default();
        for entry in entries {
            batch.insert(&index_key(entry.index)[..], entry.encode());
        }
        self.logs.apply_batch(batch)?;
        self.commit()
    }

    fn delete_range(&self, min: u64, max: u64) -> Result<()> {
        self.ensure_writable()?;
        if min > max {
            return Ok(());
        }

        // seek to min and walk forward; nothing is removed unless the whole scan succeeds
        let mut batch = Batch::default();
        let mut removed = 0usize;
        for item in self.logs.range(index_key(min)..=index_key(max)) {
            let (key, _) = item?;
            batch.remove(key);
            removed += 1;
        }
        if removed == 0 {
            return Ok(());
        }

        self.logs.apply_batch(batch)?;
        debug!(min, max, removed, "deleted log range");
        self.commit()
    }
}

// -- StableStore --

impl StableStore for SledStore {
    fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.ensure_writable()?;
        self.stable.insert(key, value)?;
        self.commit()
    }

    fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.stable
            .get(key)?
            .map(|value| value.to_vec())
            .ok_or(StoreError::NotFound)
    }
}
