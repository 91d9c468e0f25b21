//! # payledger
//!
//! A fault-tolerant replicated payment ledger:
//! - Leader election with randomized timeouts and heartbeats
//! - Durable, idempotent ledger (fsynced WAL, id index, commit index, snapshots)
//! - Quorum replication with catch-up of lagging followers
//! - Payment routing: the leader commits, everyone else forwards
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//!   client ── PAY ──► any node ──forward──► leader
//!                                            │ append + fsync
//!                                            │ REPLSEQ (concurrent)
//!                        ┌───────────────────┼───────────────────┐
//!                        ▼                   ▼                   ▼
//!                   follower A          follower B           ...
//!                    + WAL               + WAL
//!                                            │
//!                    quorum of ACKs ──► commit index ──► OK
//! ```
//!
//! ## Usage
//!
//! ### Start a three node cluster
//! ```bash
//! payledger-node serve --id n1 --bind 127.0.0.1:7001 --data ./data/n1 \
//!   --peer n2=127.0.0.1:7002 --peer n3=127.0.0.1:7003
//! payledger-node serve --id n2 --bind 127.0.0.1:7002 --data ./data/n2 \
//!   --peer n1=127.0.0.1:7001 --peer n3=127.0.0.1:7003
//! payledger-node serve --id n3 --bind 127.0.0.1:7003 --data ./data/n3 \
//!   --peer n1=127.0.0.1:7001 --peer n2=127.0.0.1:7002
//! ```
//!
//! ### Use the CLI
//! ```bash
//! payledger --node 127.0.0.1:7002 pay 100 --id tx1
//! payledger --node 127.0.0.1:7001 status
//! payledger --node 127.0.0.1:7001 wal --from 0
//! payledger --node 127.0.0.1:7001 stop
//! ```

pub mod common;
pub mod consensus;
pub mod ledger;
pub mod replication;
pub mod server;

// Re-export commonly used types
pub use common::{Error, NodeConfig, Result};
pub use consensus::RaftNode;
pub use ledger::Ledger;
pub use server::{NodeHandle, PaymentNode};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
