//! # fsm
//!
//! why: turn committed commands into the replicated key/value map
//! relations: driven by the raft worker through kvdb-core's StateMachine trait, read by Store
//! what: Fsm (live map), MapSnapshot (detached copy written to a SnapshotSink)

use std::collections::{BTreeMap, HashMap};
use std::io::{self, Read};

use kvdb_core::{Command, FsmSnapshot, LogEntry, LogType, SnapshotSink, StateMachine};
use parking_lot::Mutex;
use tracing::{debug, info};

/// The replicated string map.
#[derive(Debug, Default)]
pub struct Fsm {
    map: Mutex<HashMap<String, String>>,
}

impl Fsm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.map.lock().get(key).cloned()
    }

    /// all keys, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.map.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }
}

impl StateMachine for Fsm {
    /// # Panics
    ///
    /// When a command entry cannot be decoded. Every replica applies the same
    /// log, so a payload this node cannot understand means it has diverged.
    fn apply(&self, entry: &LogEntry) {
        if entry.log_type != LogType::Command {
            return;
        }
        let command = match Command::decode(&entry.data) {
            Ok(command) => command,
            Err(err) => panic!(
                "state machine diverged: entry {} (term {}) is not a valid command: {}",
                entry.index, entry.term, err
            ),
        };

        let mut map = self.map.lock();
        match command {
            Command::Set { key, value } => {
                map.insert(key, value);
            }
            Command::Delete { key } => {
                map.remove(&key);
            }
        }
    }

    fn snapshot(&self) -> io::Result<Box<dyn FsmSnapshot>> {
        let copy: BTreeMap<String, String> = self
            .map
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(Box::new(MapSnapshot { map: copy }))
    }

    fn restore(&self, reader: &mut dyn Read) -> io::Result<()> {
        let restored: HashMap<String, String> = serde_json::from_reader(reader)?;
        info!(keys = restored.len(), "restoring state machine from snapshot");
        *self.map.lock() = restored;
        Ok(())
    }
}

/// Owned copy of the map taken under the lock.
pub struct MapSnapshot {
    map: BTreeMap<String, String>,
}

impl FsmSnapshot for MapSnapshot {
    fn persist(&self, mut sink: Box<dyn SnapshotSink>) -> io::Result<()> {
        if let Err(err) = serde_json::to_writer(&mut sink, &self.map) {
            sink.cancel()?;
            return Err(err.into());
        }
        debug!(id = sink.id(), keys = self.map.len(), "state machine snapshot written");
        sink.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Arc;

    /// sink that keeps the bytes in memory and records how it ended
    #[derive(Clone, Default)]
    struct MemorySink {
        bytes: Arc<Mutex<Vec<u8>>>,
        outcome: Arc<Mutex<Option<&'static str>>>,
    }

    impl Write for MemorySink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.bytes.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SnapshotSink for MemorySink {
        fn id(&self) -> &str {
            "memory"
        }

        fn close(self: Box<Self>) -> io::Result<()> {
            *self.outcome.lock() = Some("closed");
            Ok(())
        }

        fn cancel(self: Box<Self>) -> io::Result<()> {
            *self.outcome.lock() = Some("cancelled");
            Ok(())
        }
    }

    fn command(index: u64, command: Command) -> LogEntry {
        LogEntry::new(1, index, command.encode().unwrap())
    }

    #[test]
    fn set_and_delete() {
        let fsm = Fsm::new();
        fsm.apply(&command(1, Command::set("a", "1")));
        fsm.apply(&command(2, Command::set("b", "2")));
        fsm.apply(&command(3, Command::delete("a")));
        fsm.apply(&command(4, Command::delete("missing")));

        assert_eq!(fsm.get("a"), None);
        assert_eq!(fsm.get("b"), Some("2".to_string()));
        assert_eq!(fsm.keys(), vec!["b".to_string()]);
    }

    #[test]
    fn empty_value_is_distinct_from_absent() {
        let fsm = Fsm::new();
        fsm.apply(&command(1, Command::set("k", "")));
        assert_eq!(fsm.get("k"), Some(String::new()));
    }

    #[test]
    fn non_command_entries_are_ignored() {
        let fsm = Fsm::new();
        fsm.apply(&LogEntry::new(1, 1, vec![]).with_type(LogType::NoOp));
        fsm.apply(&LogEntry::new(1, 2, b"junk".to_vec()).with_type(LogType::Configuration));
        assert!(fsm.is_empty());
    }

    #[test]
    #[should_panic(expected = "state machine diverged")]
    fn unknown_op_panics() {
        let fsm = Fsm::new();
        let mut data = vec![kvdb_core::command::COMMAND_VERSION];
        data.extend_from_slice(br#"{"op":"incr","key":"k"}"#);
        fsm.apply(&LogEntry::new(1, 1, data));
    }

    #[test]
    fn snapshot_is_detached_from_live_map() {
        let fsm = Fsm::new();
        fsm.apply(&command(1, Command::set("k", "before")));
        let snapshot = fsm.snapshot().unwrap();
        fsm.apply(&command(2, Command::set("k", "after")));

        let sink = MemorySink::default();
        snapshot.persist(Box::new(sink.clone())).unwrap();

        assert_eq!(*sink.outcome.lock(), Some("closed"));
        assert_eq!(sink.bytes.lock().as_slice(), br#"{"k":"before"}"#);
    }

    #[test]
    fn restore_replaces_everything() {
        let fsm = Fsm::new();
        fsm.apply(&command(1, Command::set("stale", "x")));

        fsm.restore(&mut &br#"{"a":"1","b":"2"}"#[..]).unwrap();

        assert_eq!(fsm.keys(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(fsm.get("stale"), None);
    }

    #[test]
    fn commands_apply_in_log_order() {
        let deleted = Fsm::new();
        deleted.apply(&command(1, Command::set("k", "1")));
        deleted.apply(&command(2, Command::set("k", "2")));
        deleted.apply(&command(3, Command::delete("k")));
        assert_eq!(deleted.get("k"), None);

        let rewritten = Fsm::new();
        rewritten.apply(&command(1, Command::set("k", "1")));
        rewritten.apply(&command(2, Command::delete("k")));
        rewritten.apply(&command(3, Command::set("k", "2")));
        assert_eq!(rewritten.get("k"), Some("2".to_string()));
    }

    #[test]
    fn snapshot_restores_into_fresh_fsm() {
        let source = Fsm::new();
        source.apply(&command(1, Command::set("a", "1")));
        source.apply(&command(2, Command::set("empty", "")));
        source.apply(&command(3, Command::set("b", "2")));
        source.apply(&command(4, Command::delete("b")));

        let sink = MemorySink::default();
        source.snapshot().unwrap().persist(Box::new(sink.clone())).unwrap();

        let fresh = Fsm::new();
        let bytes = sink.bytes.lock().clone();
        fresh.restore(&mut bytes.as_slice()).unwrap();

        assert_eq!(fresh.keys(), source.keys());
        assert_eq!(fresh.get("a"), Some("1".to_string()));
        assert_eq!(fresh.get("empty"), Some(String::new()));
        assert_eq!(fresh.get("b"), None);
        assert_eq!(fresh.len(), 2);
    }

    #[test]
    fn malformed_restore_keeps_live_map() {
        let fsm = Fsm::new();
        fsm.apply(&command(1, Command::set("k", "v")));

        assert!(fsm.restore(&mut &b"{not json"[..]).is_err());
        assert_eq!(fsm.get("k"), Some("v".to_string()));
    }
}
