//! # config
//!
//! why: one place for every knob a node is started with
//! relations: consumed by Store::open and the raft host
//! what: NodeConfig, TOML loading, validation

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Node configuration, usually read from a `kvdb.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Stable identity of this node within the cluster
    pub node_id: String,
    /// Address peers use to reach this node
    pub address: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Form a single-voter cluster when no configuration has been persisted
    #[serde(default)]
    pub bootstrap: bool,
    #[serde(default = "default_apply_timeout")]
    pub apply_timeout_ms: u64,
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_ms: u64,
    #[serde(default)]
    pub no_sync: bool,
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_election_tick")]
    pub election_tick: usize,
    #[serde(default = "default_heartbeat_tick")]
    pub heartbeat_tick: usize,
    /// Applied entries between automatic snapshots, 0 disables them
    #[serde(default = "default_snapshot_threshold")]
    pub snapshot_threshold: u64,
    /// Entries kept behind a snapshot so slow followers can catch up from the log
    #[serde(default = "default_trailing_logs")]
    pub trailing_logs: u64,
    #[serde(default = "default_retain_snapshots")]
    pub retain_snapshots: usize,
}

// -- default value functions --

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_apply_timeout() -> u64 {
    10_000
}

fn default_lock_timeout() -> u64 {
    1_000
}

fn default_tick_interval() -> u64 {
    100
}

fn default_election_tick() -> usize {
    10
}

fn default_heartbeat_tick() -> usize {
    3
}

fn default_snapshot_threshold() -> u64 {
    8192
}

fn default_trailing_logs() -> u64 {
    10240
}

fn default_retain_snapshots() -> usize {
    2
}

impl NodeConfig {
    /// config with every optional field at its default
    pub fn new(
        node_id: impl Into<String>,
        address: impl Into<String>,
        data_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            address: address.into(),
            data_dir: data_dir.into(),
            bootstrap: false,
            apply_timeout_ms: default_apply_timeout(),
            lock_timeout_ms: default_lock_timeout(),
            no_sync: false,
            tick_interval_ms: default_tick_interval(),
            election_tick: default_election_tick(),
            heartbeat_tick: default_heartbeat_tick(),
            snapshot_threshold: default_snapshot_threshold(),
            trailing_logs: default_trailing_logs(),
            retain_snapshots: default_retain_snapshots(),
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            return Err(Error::Config("node_id must not be empty".into()));
        }
        if self.address.trim().is_empty() {
            return Err(Error::Config("address must not be empty".into()));
        }
        if self.tick_interval_ms == 0 || self.election_tick == 0 || self.heartbeat_tick == 0 {
            return Err(Error::Config("tick settings must be positive".into()));
        }
        if self.heartbeat_tick >= self.election_tick {
            return Err(Error::Config(format!(
                "heartbeat_tick ({}) must be less than election_tick ({})",
                self.heartbeat_tick, self.election_tick
            )));
        }
        Ok(())
    }

    pub fn apply_timeout(&self) -> Duration {
        Duration::from_millis(self.apply_timeout_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// `<data_dir>/raft.db`
    pub fn log_path(&self) -> PathBuf {
        self.data_dir.join("raft.db")
    }

    /// `<data_dir>/snapshots`
    pub fn snapshot_dir(&self) -> PathBuf {
        self.data_dir.join("snapshots")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_fills_defaults() {
        let config = NodeConfig::from_toml_str(
            r#"
            node_id = "node0"
            address = "127.0.0.1:7000"
            "#,
        )
        .unwrap();

        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert!(!config.bootstrap);
        assert_eq!(config.apply_timeout(), Duration::from_secs(10));
        assert_eq!(config.lock_timeout(), Duration::from_secs(1));
        assert_eq!(config.election_tick, 10);
        assert_eq!(config.heartbeat_tick, 3);
        assert_eq!(config.snapshot_threshold, 8192);
        assert_eq!(config.trailing_logs, 10240);
        assert_eq!(config.retain_snapshots, 2);
    }

    #[test]
    fn toml_overrides() {
        let config = NodeConfig::from_toml_str(
            r#"
            node_id = "node1"
            address = "10.0.0.2:7000"
            data_dir = "/var/lib/kvdb"
            bootstrap = true
            no_sync = true
            snapshot_threshold = 0
            "#,
        )
        .unwrap();

        assert!(config.bootstrap && config.no_sync);
        assert_eq!(config.snapshot_threshold, 0);
        assert_eq!(config.log_path(), PathBuf::from("/var/lib/kvdb/raft.db"));
        assert_eq!(config.snapshot_dir(), PathBuf::from("/var/lib/kvdb/snapshots"));
    }

    #[test]
    fn missing_identity_is_rejected() {
        assert!(matches!(
            NodeConfig::from_toml_str(r#"address = "a""#),
            Err(Error::Config(_))
        ));
        assert!(NodeConfig::new("", "a", "d").validate().is_err());
        assert!(NodeConfig::new("n", " ", "d").validate().is_err());
    }

    #[test]
    fn heartbeat_must_be_shorter_than_election() {
        let mut config = NodeConfig::new("n", "a", "d");
        config.heartbeat_tick = config.election_tick;
        assert!(config.validate().is_err());

        config.heartbeat_tick = 1;
        config.tick_interval_ms = 0;
        assert!(config.validate().is_err());
    }
}
