//! Line protocol
//!
//! Every connection carries one request line and its response. Requests:
//!
//! ```text
//! PAY <amount> <id>                  OK | ERR NoLeader | ERR ReplicationFailed | ERR BadFormat
//! REPLSEQ <seq> <id> <payload>       ACK | ERR Behind <len> | ERR Conflict <seq> | ERR Inactive | ERR
//! REPL <id> <payload>                ACK | ERR
//! WALGET <from>                      <seq> <id> <payload> lines, then END
//! VOTE <candidate> <term>            GRANT <term> | DENY <term>
//! HEARTBEAT <leader> <term> [<commit> <digest>]  ACK <term> | NACK <term>
//! STATUS                             one JSON line
//! STOP | START                       OK
//! ```

use crate::common::{is_valid_token, Error, Result};
use crate::consensus::state::Role;
use crate::consensus::transport::{Heartbeat, HeartbeatReply, VoteReply};
use crate::ledger::{CommitPoint, LedgerEntry};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Terminates a `WALGET` listing
pub const WAL_END: &str = "END";
pub const OK: &str = "OK";
pub const UNKNOWN_REQUEST: &str = "ERR Unknown request";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Pay { amount: String, payment_id: String },
    ReplSeq(LedgerEntry),
    Repl { payment_id: String, payload: String },
    WalGet { from: u64 },
    Vote { candidate: String, term: u64 },
    Heartbeat(Heartbeat),
    Status,
    Stop,
    Start,
}

/// Why a request line was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    Unknown,
    BadFormat(&'static str),
}

impl ParseError {
    /// Response line sent back for this error
    pub fn reply(&self) -> &'static str {
        match self {
            ParseError::Unknown => UNKNOWN_REQUEST,
            ParseError::BadFormat("PAY") => "ERR BadFormat",
            ParseError::BadFormat(_) => "ERR",
        }
    }
}

impl FromStr for Request {
    type Err = ParseError;

    fn from_str(line: &str) -> std::result::Result<Self, ParseError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let (command, rest) = match line.split_once(' ') {
            Some((command, rest)) => (command, rest),
            None => (line.trim(), ""),
        };

        match command {
            "PAY" => {
                let bad = ParseError::BadFormat("PAY");
                let parts: Vec<&str> = line.split_whitespace().collect();
                if parts.len() != 3 || !is_valid_token(parts[2]) {
                    return Err(bad);
                }
                Ok(Request::Pay {
                    amount: parts[1].to_string(),
                    payment_id: parts[2].to_string(),
                })
            }
            "REPLSEQ" => {
                let bad = ParseError::BadFormat("REPLSEQ");
                let entry: LedgerEntry = rest.parse().map_err(|_| bad)?;
                entry.validate().map_err(|_| bad)?;
                Ok(Request::ReplSeq(entry))
            }
            "REPL" => {
                let bad = ParseError::BadFormat("REPL");
                let (id, payload) = rest.split_once(' ').ok_or(bad)?;
                if !is_valid_token(id) {
                    return Err(bad);
                }
                Ok(Request::Repl {
                    payment_id: id.to_string(),
                    payload: payload.to_string(),
                })
            }
            "WALGET" => {
                let from = rest
                    .trim()
                    .parse()
                    .map_err(|_| ParseError::BadFormat("WALGET"))?;
                Ok(Request::WalGet { from })
            }
            "VOTE" => {
                let bad = ParseError::BadFormat("VOTE");
                let parts: Vec<&str> = rest.split_whitespace().collect();
                let [candidate, term] = parts[..] else {
                    return Err(bad);
                };
                Ok(Request::Vote {
                    candidate: candidate.to_string(),
                    term: term.parse().map_err(|_| bad)?,
                })
            }
            "HEARTBEAT" => {
                let bad = ParseError::BadFormat("HEARTBEAT");
                let parts: Vec<&str> = rest.split_whitespace().collect();
                let (leader, term, commit) = match parts[..] {
                    [leader, term] => (leader, term, None),
                    [leader, term, sequence, digest] => {
                        let sequence = sequence.parse().map_err(|_| bad)?;
                        let commit = CommitPoint {
                            sequence,
                            digest: digest.to_string(),
                        };
                        (leader, term, Some(commit))
                    }
                    _ => return Err(bad),
                };
                Ok(Request::Heartbeat(Heartbeat {
                    leader_id: leader.to_string(),
                    term: term.parse().map_err(|_| bad)?,
                    commit,
                }))
            }
            "STATUS" if rest.trim().is_empty() => Ok(Request::Status),
            "STOP" if rest.trim().is_empty() => Ok(Request::Stop),
            "START" if rest.trim().is_empty() => Ok(Request::Start),
            _ => Err(ParseError::Unknown),
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::Pay { amount, payment_id } => write!(f, "PAY {} {}", amount, payment_id),
            Request::ReplSeq(entry) => write!(f, "REPLSEQ {}", entry),
            Request::Repl {
                payment_id,
                payload,
            } => write!(f, "REPL {} {}", payment_id, payload),
            Request::WalGet { from } => write!(f, "WALGET {}", from),
            Request::Vote { candidate, term } => write!(f, "VOTE {} {}", candidate, term),
            Request::Heartbeat(hb) => match &hb.commit {
                Some(commit) => write!(
                    f,
                    "HEARTBEAT {} {} {} {}",
                    hb.leader_id, hb.term, commit.sequence, commit.digest
                ),
                None => write!(f, "HEARTBEAT {} {}", hb.leader_id, hb.term),
            },
            Request::Status => f.write_str("STATUS"),
            Request::Stop => f.write_str("STOP"),
            Request::Start => f.write_str("START"),
        }
    }
}

/// Response to `PAY`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayReply {
    Ok,
    NoLeader,
    ReplicationFailed,
    BadFormat,
}

impl fmt::Display for PayReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PayReply::Ok => OK,
            PayReply::NoLeader => "ERR NoLeader",
            PayReply::ReplicationFailed => "ERR ReplicationFailed",
            PayReply::BadFormat => "ERR BadFormat",
        })
    }
}

impl FromStr for PayReply {
    type Err = Error;

    fn from_str(line: &str) -> Result<Self> {
        match line.trim() {
            OK => Ok(PayReply::Ok),
            "ERR NoLeader" => Ok(PayReply::NoLeader),
            "ERR ReplicationFailed" => Ok(PayReply::ReplicationFailed),
            "ERR BadFormat" => Ok(PayReply::BadFormat),
            other => Err(Error::Protocol(format!("unexpected PAY reply {other:?}"))),
        }
    }
}

/// Response to `REPLSEQ` and `REPL`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicateReply {
    Ack,
    Behind { len: u64 },
    Conflict { sequence: u64 },
    Inactive,
    Rejected,
}

impl ReplicateReply {
    pub fn is_ack(&self) -> bool {
        matches!(self, ReplicateReply::Ack)
    }
}

impl fmt::Display for ReplicateReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicateReply::Ack => f.write_str("ACK"),
            ReplicateReply::Behind { len } => write!(f, "ERR Behind {}", len),
            ReplicateReply::Conflict { sequence } => write!(f, "ERR Conflict {}", sequence),
            ReplicateReply::Inactive => f.write_str("ERR Inactive"),
            ReplicateReply::Rejected => f.write_str("ERR"),
        }
    }
}

impl FromStr for ReplicateReply {
    type Err = Error;

    fn from_str(line: &str) -> Result<Self> {
        let bad = || Error::Protocol(format!("unexpected replication reply {line:?}"));
        let parts: Vec<&str> = line.split_whitespace().collect();
        match parts[..] {
            ["ACK"] => Ok(ReplicateReply::Ack),
            ["ERR"] => Ok(ReplicateReply::Rejected),
            ["ERR", "Inactive"] => Ok(ReplicateReply::Inactive),
            ["ERR", "Behind", len] => Ok(ReplicateReply::Behind {
                len: len.parse().map_err(|_| bad())?,
            }),
            ["ERR", "Conflict", seq] => Ok(ReplicateReply::Conflict {
                sequence: seq.parse().map_err(|_| bad())?,
            }),
            _ => Err(bad()),
        }
    }
}

impl fmt::Display for VoteReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verdict = if self.granted { "GRANT" } else { "DENY" };
        write!(f, "{} {}", verdict, self.term)
    }
}

impl FromStr for VoteReply {
    type Err = Error;

    fn from_str(line: &str) -> Result<Self> {
        let bad = || Error::Protocol(format!("unexpected vote reply {line:?}"));
        let (verdict, term) = line.trim().split_once(' ').ok_or_else(bad)?;
        let granted = match verdict {
            "GRANT" => true,
            "DENY" => false,
            _ => return Err(bad()),
        };
        Ok(VoteReply {
            granted,
            term: term.parse().map_err(|_| bad())?,
        })
    }
}

impl fmt::Display for HeartbeatReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verdict = if self.accepted { "ACK" } else { "NACK" };
        write!(f, "{} {}", verdict, self.term)
    }
}

impl FromStr for HeartbeatReply {
    type Err = Error;

    fn from_str(line: &str) -> Result<Self> {
        let bad = || Error::Protocol(format!("unexpected heartbeat reply {line:?}"));
        let (verdict, term) = line.trim().split_once(' ').ok_or_else(bad)?;
        let accepted = match verdict {
            "ACK" => true,
            "NACK" => false,
            _ => return Err(bad()),
        };
        Ok(HeartbeatReply {
            accepted,
            term: term.parse().map_err(|_| bad())?,
        })
    }
}

/// Reply to `STATUS`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node_id: String,
    pub addr: String,
    pub role: Role,
    pub term: u64,
    /// Leader's node id, if known
    pub leader: Option<String>,
    pub active: bool,
    pub ledger_len: u64,
    pub commit_index: Option<u64>,
    pub wal_len: usize,
    pub at: DateTime<Utc>,
}
