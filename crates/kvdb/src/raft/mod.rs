//! # raft
//!
//! why: host the raft-rs consensus engine behind the store
//! relations: implements crate::consensus::Consensus, persists through kvdb-storage
//! what: RaftStorage adapter, RaftEngine worker and handle, peer Transport

pub mod node;
pub mod storage;
pub mod transport;

pub use node::RaftEngine;
pub use storage::RaftStorage;
pub use transport::{LocalNetwork, LocalTransport, NoopTransport, Transport};
