//! Ledger entry and its single-line text form `seq id payload`

use crate::common::{is_valid_token, Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One recorded payment command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub sequence: u64,
    pub payment_id: String,
    pub payload: String,
}

impl LedgerEntry {
    pub fn new(sequence: u64, payment_id: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            sequence,
            payment_id: payment_id.into(),
            payload: payload.into(),
        }
    }

    /// Check the entry can round-trip through the line format
    pub fn validate(&self) -> Result<()> {
        if !is_valid_token(&self.payment_id) {
            return Err(Error::Protocol(format!(
                "invalid payment id {:?}",
                self.payment_id
            )));
        }
        if self.payload.contains(['\n', '\r']) {
            return Err(Error::Protocol("payload must be a single line".into()));
        }
        Ok(())
    }
}

impl fmt::Display for LedgerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.sequence, self.payment_id, self.payload)
    }
}

impl FromStr for LedgerEntry {
    type Err = Error;

    fn from_str(line: &str) -> Result<Self> {
        let mut parts = line.splitn(3, ' ');
        let (Some(seq), Some(id), Some(payload)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::Corrupted(format!("malformed entry line {line:?}")));
        };
        let sequence = seq
            .parse()
            .map_err(|_| Error::Corrupted(format!("bad sequence in {line:?}")))?;
        if id.is_empty() {
            return Err(Error::Corrupted(format!("empty payment id in {line:?}")));
        }
        Ok(Self::new(sequence, id, payload))
    }
}
