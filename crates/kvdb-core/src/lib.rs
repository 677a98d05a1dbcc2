//! # kvdb-core
//!
//! why: share the types every layer of the replicated store agrees on
//! relations: used by kvdb-storage for persistence, by kvdb for the state machine and raft host
//! what: log entries and their byte layout, the replicated command, cluster members, fsm traits

pub mod command;
pub mod error;
pub mod log;
pub mod node;
pub mod state_machine;

pub use command::Command;
pub use error::CodecError;
pub use log::{LogEntry, LogType};
pub use node::{ClusterMember, NodeState};
pub use state_machine::{FsmSnapshot, SnapshotSink, StateMachine};
