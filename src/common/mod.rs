//! Common utilities and types shared across payledger

pub mod config;
pub mod error;
pub mod events;
pub mod utils;

pub use config::{ElectionConfig, LedgerConfig, NodeConfig, PeerConfig, ReplicationConfig};
pub use error::{Error, Result};
pub use events::{ChannelEvents, ClusterEvent, ClusterEventKind, ClusterEvents, NoopEvents};
pub use utils::{is_valid_token, write_atomic};
