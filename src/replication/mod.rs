//! Quorum replication
//!
//! - `peer_client`: line-protocol client used for every peer contact
//! - `liveness`: cached peer health from periodic probes
//! - `coordinator`: fan-out with ack counting, and content-checked catch-up of
//!   lagging peers

pub mod coordinator;
pub mod liveness;
pub mod peer_client;

pub use coordinator::{
    first_mismatch, quorum_size, CatchUpReport, ReplicationCoordinator, ReplicationReport,
};
pub use liveness::{HealthChange, LivenessTracker, PeerHealth};
pub use peer_client::PeerClient;
