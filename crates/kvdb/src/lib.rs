//! # kvdb
//!
//! why: a small replicated key/value store on top of raft consensus
//! relations: types from kvdb-core, persistence from kvdb-storage, consensus from raft-rs
//! what: Store facade, state machine, membership manager, raft host, node config

pub mod config;
pub mod consensus;
pub mod error;
pub mod fsm;
pub mod membership;
pub mod raft;
pub mod store;

pub use config::NodeConfig;
pub use consensus::Consensus;
pub use error::{Error, Result};
pub use fsm::Fsm;
pub use membership::Membership;
pub use store::{ClusterAdmin, KeyValue, Store};

pub use kvdb_core::{ClusterMember, Command, NodeState};
pub use kvdb_storage::SnapshotMeta;
