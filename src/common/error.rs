//! Error types for payledger

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Ledger Errors ===
    #[error("Corrupted data: {0}")]
    Corrupted(String),

    #[error("WAL error: {0}")]
    Wal(String),

    #[error("Sequence conflict at {sequence}: existing={existing:?} incoming={incoming:?}")]
    SequenceConflict {
        sequence: u64,
        existing: String,
        incoming: String,
    },

    #[error("Sequence {sequence} out of range (log length {len})")]
    OutOfRange { sequence: u64, len: u64 },

    // === Network Errors ===
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Configuration source error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Transport failures worth retrying against the same peer
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::ConnectionFailed(_) | Error::Io(_)
        )
    }

    /// Data-integrity failures that must stay operator-visible
    pub fn is_integrity_violation(&self) -> bool {
        matches!(
            self,
            Error::SequenceConflict { .. } | Error::Corrupted(_) | Error::Wal(_)
        )
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Internal(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Internal(s)
    }
}
