//! # snapshot
//!
//! why: keep full-state snapshots on disk so the log can be compacted and nodes can recover
//! relations: written through kvdb-core's SnapshotSink by the fsm, read by the raft host
//! what: SnapshotMeta, FileSnapshotStore, FileSnapshotSink (temp dir + atomic rename)

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use kvdb_core::{ClusterMember, SnapshotSink};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{Result, StoreError};

const META_FILE: &str = "meta.json";
const STATE_FILE: &str = "state.bin";
const TMP_SUFFIX: &str = ".tmp";

/// Everything needed to resume from a snapshot besides the state bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub id: String,
    /// Last log index covered
    pub index: u64,
    /// Term of the entry at `index`
    pub term: u64,
    pub voters: Vec<u64>,
    #[serde(default)]
    pub learners: Vec<u64>,
    #[serde(default)]
    pub members: Vec<ClusterMember>,
    /// Size of the state bytes, filled in on close
    #[serde(default)]
    pub size: u64,
}

impl SnapshotMeta {
    pub fn new(
        index: u64,
        term: u64,
        voters: Vec<u64>,
        learners: Vec<u64>,
        members: Vec<ClusterMember>,
    ) -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        Self {
            id: format!("{term}-{index}-{millis}"),
            index,
            term,
            voters,
            learners,
            members,
            size: 0,
        }
    }
}

/// directory of snapshots, one sub-directory each:
///
/// ```text
/// <dir>/<term>-<index>-<millis>/meta.json
/// <dir>/<term>-<index>-<millis>/state.bin
/// ```
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    dir: PathBuf,
    retain: usize,
}

impl FileSnapshotStore {
    /// create the store, keeping at most `retain` (at least 1) snapshots
    pub fn new(dir: impl Into<PathBuf>, retain: usize) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            retain: retain.max(1),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// start writing a snapshot; it becomes visible to `list` only on close
    pub fn create(&self, meta: SnapshotMeta) -> Result<FileSnapshotSink> {
        let tmp_dir = self.dir.join(format!("{}{TMP_SUFFIX}", meta.id));
        let final_dir = self.dir.join(&meta.id);
        fs::create_dir_all(&tmp_dir)?;
        let file = File::create(tmp_dir.join(STATE_FILE))?;

        debug!(id = %meta.id, index = meta.index, term = meta.term, "creating snapshot");
        Ok(FileSnapshotSink {
            meta,
            tmp_dir,
            final_dir,
            writer: BufWriter::new(file),
            written: 0,
            store: self.clone(),
        })
    }

    /// completed snapshots, newest first
    pub fn list(&self) -> Result<Vec<SnapshotMeta>> {
        let mut metas = Vec::new();
        for dirent in fs::read_dir(&self.dir)? {
            let dirent = dirent?;
            if !dirent.file_type()?.is_dir() {
                continue;
            }
            let name = dirent.file_name();
            if name.to_string_lossy().ends_with(TMP_SUFFIX) {
                continue;
            }
            match read_meta(&dirent.path()) {
                Ok(meta) => metas.push(meta),
                Err(err) => warn!(dir = %dirent.path().display(), %err, "skipping unreadable snapshot"),
            }
        }
        metas.sort_by(|a, b| (b.index, b.term).cmp(&(a.index, a.term)));
        Ok(metas)
    }

    pub fn latest(&self) -> Result<Option<SnapshotMeta>> {
        Ok(self.list()?.into_iter().next())
    }

    /// metadata plus a reader positioned at the start of the state bytes
    pub fn open(&self, id: &str) -> Result<(SnapshotMeta, File)> {
        let dir = self.dir.join(id);
        let meta = read_meta(&dir)?;
        let file = File::open(dir.join(STATE_FILE)).map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => StoreError::NotFound,
            _ => StoreError::Io(err),
        })?;
        Ok((meta, file))
    }

    /// drop everything beyond the newest `retain` snapshots
    fn reap(&self) -> Result<()> {
        for stale in self.list()?.into_iter().skip(self.retain) {
            debug!(id = %stale.id, "reaping snapshot");
            fs::remove_dir_all(self.dir.join(&stale.id))?;
        }
        Ok(())
    }
}

fn read_meta(dir: &Path) -> Result<SnapshotMeta> {
    let contents = fs::read(dir.join(META_FILE)).map_err(|err| match err.kind() {
        io::ErrorKind::NotFound => StoreError::NotFound,
        _ => StoreError::Io(err),
    })?;
    Ok(serde_json::from_slice(&contents)?)
}

/// in-progress snapshot written to `<id>.tmp/` and renamed on close
pub struct FileSnapshotSink {
    meta: SnapshotMeta,
    tmp_dir: PathBuf,
    final_dir: PathBuf,
    writer: BufWriter<File>,
    written: u64,
    store: FileSnapshotStore,
}

impl FileSnapshotSink {
    pub fn meta(&self) -> &SnapshotMeta {
        &self.meta
    }

    /// sync the state, write meta.json, then rename into place
    pub fn finish(mut self) -> io::Result<SnapshotMeta> {
        self.writer.flush()?;
        let file = self.writer.into_inner().map_err(|err| err.into_error())?;
        file.sync_all()?;

        self.meta.size = self.written;
        let json = serde_json::to_vec_pretty(&self.meta)?;
        let mut meta_file = File::create(self.tmp_dir.join(META_FILE))?;
        meta_file.write_all(&json)?;
        meta_file.sync_all()?;

        fs::rename(&self.tmp_dir, &self.final_dir)?;
        debug!(id = %self.meta.id, size = self.meta.size, "snapshot complete");

        if let Err(err) = self.store.reap() {
            warn!(%err, "failed to reap old snapshots");
        }
        Ok(self.meta)
    }
}

impl Write for FileSnapshotSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.writer.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

impl SnapshotSink for FileSnapshotSink {
    fn id(&self) -> &str {
        &self.meta.id
    }

    fn close(self: Box<Self>) -> io::Result<()> {
        (*self).finish().map(|_| ())
    }

    fn cancel(self: Box<Self>) -> io::Result<()> {
        let tmp_dir = self.tmp_dir.clone();
        drop(self);
        debug!(dir = %tmp_dir.display(), "snapshot cancelled");
        fs::remove_dir_all(tmp_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn unfinished_snapshot_is_invisible() {
        let dir = tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path(), 2).unwrap();

        let mut sink = store.create(SnapshotMeta::new(5, 1, vec![1], vec![], vec![])).unwrap();
        sink.write_all(b"{}").unwrap();

        assert!(store.list().unwrap().is_empty());
        sink.finish().unwrap();
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn cancel_removes_temp_dir() {
        let dir = tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path(), 2).unwrap();

        let sink = store.create(SnapshotMeta::new(5, 1, vec![1], vec![], vec![])).unwrap();
        let tmp = sink.tmp_dir.clone();
        Box::new(sink).cancel().unwrap();

        assert!(!tmp.exists());
        assert!(store.list().unwrap().is_empty());
    }
}
