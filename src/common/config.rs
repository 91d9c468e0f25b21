//! Configuration for payledger nodes
//!
//! Values come from (lowest to highest priority) built-in defaults, an optional
//! TOML file, `PAYLEDGER_*` environment variables and finally CLI flags applied
//! by the binaries.

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node ID (unique, stable identifier)
    pub node_id: String,

    /// Address the line-protocol server binds to
    pub bind_addr: SocketAddr,

    /// Address peers use to reach this node (defaults to `bind_addr`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advertise_addr: Option<String>,

    /// Directory holding the WAL, id index, commit index and snapshot
    pub data_dir: PathBuf,

    /// Other cluster members
    #[serde(default)]
    pub peers: Vec<PeerConfig>,

    #[serde(default)]
    pub election: ElectionConfig,

    #[serde(default)]
    pub replication: ReplicationConfig,

    #[serde(default)]
    pub ledger: LedgerConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "node-1".to_string(),
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 7001)),
            advertise_addr: None,
            data_dir: PathBuf::from("./data/node-1"),
            peers: Vec::new(),
            election: ElectionConfig::default(),
            replication: ReplicationConfig::default(),
            ledger: LedgerConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from defaults, an optional TOML file and the environment.
    ///
    /// Nested keys use a double underscore, e.g. `PAYLEDGER_ELECTION__HEARTBEAT_INTERVAL_MS`.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&NodeConfig::default())?);

        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(true));
        } else {
            builder = builder.add_source(config::File::with_name("payledger").required(false));
        }

        let loaded: NodeConfig = builder
            .add_source(
                config::Environment::with_prefix("PAYLEDGER")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;

        Ok(loaded)
    }

    /// Address advertised to peers and clients
    pub fn advertised(&self) -> String {
        self.advertise_addr
            .clone()
            .unwrap_or_else(|| self.bind_addr.to_string())
    }

    /// Total number of nodes in the cluster, including this one
    pub fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id.is_empty() || self.node_id.contains(char::is_whitespace) {
            return Err(Error::InvalidConfig(
                "node_id must be non-empty and contain no whitespace".into(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        seen.insert(self.node_id.as_str());
        for peer in &self.peers {
            if !seen.insert(peer.id.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate node id in cluster: {}",
                    peer.id
                )));
            }
            if peer.addr == self.advertised() {
                return Err(Error::InvalidConfig(format!(
                    "peer {} uses this node's own address {}",
                    peer.id, peer.addr
                )));
            }
        }

        self.election.validate()?;
        self.replication.validate()?;
        self.ledger.validate()?;
        Ok(())
    }
}

/// A statically known cluster member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub id: String,
    pub addr: String,
}

impl FromStr for PeerConfig {
    type Err = Error;

    /// Parses `id=host:port`
    fn from_str(s: &str) -> Result<Self> {
        let (id, addr) = s
            .split_once('=')
            .ok_or_else(|| Error::InvalidConfig(format!("peer must be id=host:port, got {s}")))?;
        let (id, addr) = (id.trim(), addr.trim());
        if id.is_empty() || addr.is_empty() || !addr.contains(':') {
            return Err(Error::InvalidConfig(format!(
                "peer must be id=host:port, got {s}"
            )));
        }
        Ok(Self {
            id: id.to_string(),
            addr: addr.to_string(),
        })
    }
}

/// Election timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionConfig {
    /// Minimum election timeout in milliseconds
    #[serde(default = "default_election_timeout_min")]
    pub election_timeout_min_ms: u64,

    /// Maximum election timeout in milliseconds
    #[serde(default = "default_election_timeout_max")]
    pub election_timeout_max_ms: u64,

    /// Heartbeat interval in milliseconds, well below the election timeout
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// Timeout for a single vote request or heartbeat
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_ms: u64,
}

fn default_election_timeout_min() -> u64 {
    600
}
fn default_election_timeout_max() -> u64 {
    1200
}
fn default_heartbeat_interval() -> u64 {
    300
}
fn default_rpc_timeout() -> u64 {
    250
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            election_timeout_min_ms: default_election_timeout_min(),
            election_timeout_max_ms: default_election_timeout_max(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            rpc_timeout_ms: default_rpc_timeout(),
        }
    }
}

impl ElectionConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    /// Draw a fresh election timeout uniformly from the configured range
    pub fn random_election_timeout(&self) -> Duration {
        use rand::Rng;
        let ms = rand::thread_rng()
            .gen_range(self.election_timeout_min_ms..=self.election_timeout_max_ms);
        Duration::from_millis(ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.election_timeout_min_ms >= self.election_timeout_max_ms {
            return Err(Error::InvalidConfig(
                "election_timeout_min must be less than election_timeout_max".into(),
            ));
        }
        if self.heartbeat_interval_ms == 0
            || self.heartbeat_interval_ms >= self.election_timeout_min_ms
        {
            return Err(Error::InvalidConfig(
                "heartbeat_interval must be non-zero and less than election_timeout_min".into(),
            ));
        }
        if self.rpc_timeout_ms == 0 {
            return Err(Error::InvalidConfig("rpc_timeout must be non-zero".into()));
        }
        Ok(())
    }
}

/// Replication and peer-contact settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Connect + response timeout for one peer contact
    #[serde(default = "default_peer_timeout")]
    pub peer_timeout_ms: u64,

    /// How often peer liveness is probed
    #[serde(default = "default_probe_interval")]
    pub probe_interval_ms: u64,
}

fn default_peer_timeout() -> u64 {
    1000
}
fn default_probe_interval() -> u64 {
    2000
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            peer_timeout_ms: default_peer_timeout(),
            probe_interval_ms: default_probe_interval(),
        }
    }
}

impl ReplicationConfig {
    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.peer_timeout_ms == 0 || self.probe_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "peer_timeout and probe_interval must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Ledger storage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// WAL entries allowed before committed entries are moved into the snapshot
    #[serde(default = "default_snapshot_threshold")]
    pub snapshot_threshold: usize,

    /// How often the id index file is rewritten without duplicates
    #[serde(default = "default_id_compaction_interval")]
    pub id_compaction_interval_secs: u64,
}

fn default_snapshot_threshold() -> usize {
    100
}
fn default_id_compaction_interval() -> u64 {
    60
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            snapshot_threshold: default_snapshot_threshold(),
            id_compaction_interval_secs: default_id_compaction_interval(),
        }
    }
}

impl LedgerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.snapshot_threshold == 0 {
            return Err(Error::InvalidConfig(
                "snapshot_threshold must be non-zero".into(),
            ));
        }
        if self.id_compaction_interval_secs == 0 {
            return Err(Error::InvalidConfig(
                "id_compaction_interval_secs must be non-zero".into(),
            ));
        }
        Ok(())
    }
}
