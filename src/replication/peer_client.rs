//! Client for the line protocol
//!
//! Each call opens a connection, writes one request line and reads the reply.
//! The whole exchange (connect included) is bounded by the client timeout.

use crate::common::{Error, Result};
use crate::consensus::transport::{Heartbeat, HeartbeatReply, VoteReply};
use crate::ledger::LedgerEntry;
use crate::server::protocol::{NodeStatus, PayReply, ReplicateReply, Request, OK, WAL_END};
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

#[derive(Debug, Clone)]
pub struct PeerClient {
    timeout: Duration,
}

impl PeerClient {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn bounded<T>(&self, addr: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| Error::Timeout(format!("{} did not answer within {:?}", addr, self.timeout)))?
    }

    async fn connect(addr: &str, request: &Request) -> Result<BufReader<TcpStream>> {
        let mut stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::ConnectionFailed(format!("{}: {}", addr, e)))?;
        stream
            .write_all(format!("{}\n", request).as_bytes())
            .await?;
        stream.flush().await?;
        Ok(BufReader::new(stream))
    }

    /// Send `request` and return the first response line
    pub async fn call(&self, addr: &str, request: &Request) -> Result<String> {
        self.bounded(addr, async {
            let mut reader = Self::connect(addr, request).await?;
            let mut line = String::new();
            if reader.read_line(&mut line).await? == 0 {
                return Err(Error::Protocol(format!("{} closed without replying", addr)));
            }
            Ok(line.trim_end_matches(['\r', '\n']).to_string())
        })
        .await
    }

    /// Send an entry at its sequence (`REPLSEQ`)
    pub async fn push_entry(&self, addr: &str, entry: &LedgerEntry) -> Result<ReplicateReply> {
        self.call(addr, &Request::ReplSeq(entry.clone()))
            .await?
            .parse()
    }

    /// Read the peer's log from `from` (`WALGET`)
    pub async fn fetch_wal(&self, addr: &str, from: u64) -> Result<Vec<LedgerEntry>> {
        self.bounded(addr, async {
            let mut reader = Self::connect(addr, &Request::WalGet { from }).await?;
            let mut entries: Vec<LedgerEntry> = Vec::new();
            let mut line = String::new();
            loop {
                line.clear();
                if reader.read_line(&mut line).await? == 0 {
                    return Err(Error::Protocol(format!(
                        "{} closed the WAL listing before {}",
                        addr, WAL_END
                    )));
                }
                let line = line.trim_end_matches(['\r', '\n']);
                if line == WAL_END {
                    return Ok(entries);
                }
                entries.push(line.parse()?);
            }
        })
        .await
    }

    pub async fn request_vote(&self, addr: &str, candidate: &str, term: u64) -> Result<VoteReply> {
        let request = Request::Vote {
            candidate: candidate.to_string(),
            term,
        };
        self.call(addr, &request).await?.parse()
    }

    pub async fn heartbeat(&self, addr: &str, heartbeat: &Heartbeat) -> Result<HeartbeatReply> {
        self.call(addr, &Request::Heartbeat(heartbeat.clone()))
            .await?
            .parse()
    }

    pub async fn status(&self, addr: &str) -> Result<NodeStatus> {
        let line = self.call(addr, &Request::Status).await?;
        Ok(serde_json::from_str(&line)?)
    }

    /// Relay a payment to another node and return its verdict
    pub async fn forward_pay(&self, addr: &str, amount: &str, payment_id: &str) -> Result<PayReply> {
        let request = Request::Pay {
            amount: amount.to_string(),
            payment_id: payment_id.to_string(),
        };
        self.call(addr, &request).await?.parse()
    }

    /// Send `STOP` or `START`
    pub async fn admin(&self, addr: &str, request: Request) -> Result<()> {
        let reply = self.call(addr, &request).await?;
        if reply == OK {
            Ok(())
        } else {
            Err(Error::Protocol(format!("{} answered {:?} to {}", addr, reply, request)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn one_shot_server(reply: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            reader.get_mut().write_all(reply.as_bytes()).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_push_entry_parses_behind() {
        let addr = one_shot_server("ERR Behind 3\n").await;
        let client = PeerClient::new(Duration::from_secs(2));
        let reply = client
            .push_entry(&addr, &LedgerEntry::new(5, "tx5", "10"))
            .await
            .unwrap();
        assert_eq!(reply, ReplicateReply::Behind { len: 3 });
    }

    #[tokio::test]
    async fn test_fetch_wal_reads_until_end() {
        let addr = one_shot_server("0 tx0 10\n1 tx1 20 EUR\nEND\n").await;
        let client = PeerClient::new(Duration::from_secs(2));
        let entries = client.fetch_wal(&addr, 0).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].payload, "20 EUR");
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let client = PeerClient::new(Duration::from_millis(100));
        let err = client.status(&addr).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn test_unreachable_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let client = PeerClient::new(Duration::from_secs(1));
        let err = client.request_vote(&addr, "n1", 1).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
