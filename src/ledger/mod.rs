//! Durable payment ledger
//!
//! - Text WAL, fsynced on every append
//! - Payment id index for duplicate detection
//! - Durable commit index
//! - Snapshot of the committed prefix once the WAL grows

pub mod compaction;
pub mod entry;
pub mod index;
pub mod store;
pub mod wal;

pub use compaction::CompactionManager;
pub use entry::LedgerEntry;
pub use store::{CommitPoint, FollowerAppend, Ledger, SharedLedger};
