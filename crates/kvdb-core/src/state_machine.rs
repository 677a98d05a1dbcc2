//! # state_machine
//!
//! why: the contract a consensus host drives to turn committed entries into state
//! relations: implemented by kvdb::fsm, sinks implemented by kvdb-storage::snapshot
//! what: StateMachine, FsmSnapshot and SnapshotSink traits

use std::io::{self, Read, Write};

use crate::log::LogEntry;

/// Application state driven by the consensus host.
///
/// `apply` is called once per committed command entry, in index order, and
/// never concurrently with itself.
pub trait StateMachine: Send + Sync {
    fn apply(&self, entry: &LogEntry);

    /// Capture the current state. The returned value must not share memory
    /// with the live state.
    fn snapshot(&self) -> io::Result<Box<dyn FsmSnapshot>>;

    /// Replace all state with the contents of a stream written by
    /// [`FsmSnapshot::persist`].
    fn restore(&self, reader: &mut dyn Read) -> io::Result<()>;
}

/// A point-in-time copy ready to be written out.
pub trait FsmSnapshot: Send {
    /// Write the snapshot into `sink` and close it, cancelling it on failure.
    fn persist(&self, sink: Box<dyn SnapshotSink>) -> io::Result<()>;
}

/// Destination for snapshot bytes. Nothing is visible until `close`.
pub trait SnapshotSink: Write + Send {
    fn id(&self) -> &str;

    fn close(self: Box<Self>) -> io::Result<()>;

    fn cancel(self: Box<Self>) -> io::Result<()>;
}
