//! Election transports
//!
//! [`TcpTransport`] speaks the line protocol to real peers. [`LocalNetwork`]
//! delivers calls in-process to registered [`RaftNode`]s and can cut links,
//! which is how the election tests partition a cluster.

use crate::common::{Error, Result};
use crate::consensus::raft_node::RaftNode;
use crate::ledger::CommitPoint;
use crate::replication::PeerClient;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

/// Leader heartbeat, optionally carrying the leader's commit point
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Heartbeat {
    pub leader_id: String,
    pub term: u64,
    pub commit: Option<CommitPoint>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoteReply {
    pub granted: bool,
    pub term: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatReply {
    pub accepted: bool,
    pub term: u64,
}

#[async_trait]
pub trait ElectionTransport: Send + Sync + 'static {
    async fn request_vote(&self, peer: &str, candidate: &str, term: u64) -> Result<VoteReply>;

    async fn send_heartbeat(&self, peer: &str, heartbeat: &Heartbeat) -> Result<HeartbeatReply>;
}

/// Election RPCs over the line protocol
#[derive(Debug, Clone)]
pub struct TcpTransport {
    client: PeerClient,
}

impl TcpTransport {
    pub fn new(rpc_timeout: Duration) -> Self {
        Self {
            client: PeerClient::new(rpc_timeout),
        }
    }
}

#[async_trait]
impl ElectionTransport for TcpTransport {
    async fn request_vote(&self, peer: &str, candidate: &str, term: u64) -> Result<VoteReply> {
        self.client.request_vote(peer, candidate, term).await
    }

    async fn send_heartbeat(&self, peer: &str, heartbeat: &Heartbeat) -> Result<HeartbeatReply> {
        self.client.heartbeat(peer, heartbeat).await
    }
}

#[derive(Default)]
struct NetworkInner {
    nodes: HashMap<String, Weak<RaftNode>>,
    isolated: HashSet<String>,
    cut: HashSet<(String, String)>,
}

/// In-process network of election nodes, addressed by name
#[derive(Default, Clone)]
pub struct LocalNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport whose calls originate from `addr`
    pub fn transport(&self, addr: impl Into<String>) -> Arc<LocalTransport> {
        Arc::new(LocalTransport {
            network: self.clone(),
            from: addr.into(),
        })
    }

    pub fn register(&self, addr: impl Into<String>, node: &Arc<RaftNode>) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.nodes.insert(addr.into(), Arc::downgrade(node));
        }
    }

    /// Drop every link to and from `addr`
    pub fn isolate(&self, addr: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.isolated.insert(addr.to_string());
        }
    }

    /// Drop the link between `a` and `b` in both directions
    pub fn cut(&self, a: &str, b: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.cut.insert((a.to_string(), b.to_string()));
            inner.cut.insert((b.to_string(), a.to_string()));
        }
    }

    pub fn heal(&self, addr: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.isolated.remove(addr);
            inner.cut.retain(|(a, b)| a != addr && b != addr);
        }
    }

    pub fn heal_all(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.isolated.clear();
            inner.cut.clear();
        }
    }

    fn route(&self, from: &str, to: &str) -> Result<Arc<RaftNode>> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| Error::Internal("local network lock poisoned".into()))?;
        let blocked = inner.isolated.contains(from)
            || inner.isolated.contains(to)
            || inner.cut.contains(&(from.to_string(), to.to_string()));
        if blocked {
            return Err(Error::ConnectionFailed(format!("{} -> {} partitioned", from, to)));
        }
        inner
            .nodes
            .get(to)
            .and_then(Weak::upgrade)
            .ok_or_else(|| Error::ConnectionFailed(format!("{} is not on the network", to)))
    }
}

pub struct LocalTransport {
    network: LocalNetwork,
    from: String,
}

#[async_trait]
impl ElectionTransport for LocalTransport {
    async fn request_vote(&self, peer: &str, candidate: &str, term: u64) -> Result<VoteReply> {
        let node = self.network.route(&self.from, peer)?;
        let reply = node.handle_vote_request(candidate, term);
        // The reply travels back over the same link
        self.network.route(peer, &self.from)?;
        Ok(reply)
    }

    async fn send_heartbeat(&self, peer: &str, heartbeat: &Heartbeat) -> Result<HeartbeatReply> {
        let node = self.network.route(&self.from, peer)?;
        let reply = node.handle_heartbeat(heartbeat);
        self.network.route(peer, &self.from)?;
        Ok(reply)
    }
}
