//! Test harness for cluster integration tests.
//!
//! - `TestCluster`: real nodes on ephemeral localhost ports, driven through the
//!   line protocol.
//! - `ElectionCluster`: election nodes only, wired through a `LocalNetwork` so
//!   links can be cut.

#![allow(dead_code)]

use payledger::common::{
    ElectionConfig, LedgerConfig, NodeConfig, NoopEvents, PeerConfig, ReplicationConfig,
};
use payledger::consensus::{ClusterView, LocalNetwork, RaftNode};
use payledger::ledger::LedgerEntry;
use payledger::replication::PeerClient;
use payledger::server::protocol::Request;
use payledger::server::{NodeHandle, PayReply, PaymentNode};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;

pub fn fast_election() -> ElectionConfig {
    ElectionConfig {
        election_timeout_min_ms: 300,
        election_timeout_max_ms: 600,
        heartbeat_interval_ms: 100,
        rpc_timeout_ms: 100,
    }
}

/// Poll `check` every 25ms until it holds or `limit` passes
pub async fn eventually<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

pub struct TestNode {
    pub id: String,
    pub addr: String,
    pub handle: NodeHandle,
    server: tokio::task::JoinHandle<payledger::Result<()>>,
}

impl TestNode {
    pub fn is_leader(&self) -> bool {
        self.handle.raft().is_leader()
    }

    pub fn term(&self) -> u64 {
        self.handle.raft().current_term()
    }

    pub fn ledger_len(&self) -> u64 {
        self.handle.ledger().lock().unwrap().len()
    }

    pub fn commit_index(&self) -> Option<u64> {
        self.handle.ledger().lock().unwrap().commit_index()
    }

    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.handle.ledger().lock().unwrap().entries_from(0)
    }
}

pub struct TestCluster {
    pub nodes: Vec<TestNode>,
    pub client: PeerClient,
    _dir: TempDir,
}

impl TestCluster {
    pub async fn new(size: usize) -> Self {
        assert!(size >= 1, "cluster must have at least 1 node");
        let dir = TempDir::new().unwrap();

        let mut listeners = Vec::with_capacity(size);
        for _ in 0..size {
            listeners.push(TcpListener::bind("127.0.0.1:0").await.unwrap());
        }
        let members: Vec<PeerConfig> = listeners
            .iter()
            .enumerate()
            .map(|(i, l)| PeerConfig {
                id: format!("n{}", i + 1),
                addr: l.local_addr().unwrap().to_string(),
            })
            .collect();

        let mut nodes = Vec::with_capacity(size);
        for (listener, me) in listeners.into_iter().zip(members.iter()) {
            let config = NodeConfig {
                node_id: me.id.clone(),
                bind_addr: me.addr.parse().unwrap(),
                advertise_addr: Some(me.addr.clone()),
                data_dir: dir.path().join(&me.id),
                peers: members.iter().filter(|p| p.id != me.id).cloned().collect(),
                election: fast_election(),
                replication: ReplicationConfig {
                    peer_timeout_ms: 500,
                    probe_interval_ms: 200,
                },
                ledger: LedgerConfig::default(),
                log_level: "debug".into(),
            };

            let node =
                PaymentNode::with_listener(config, listener, Arc::new(NoopEvents)).unwrap();
            let handle = node.handle();
            let server = tokio::spawn(node.serve());
            nodes.push(TestNode {
                id: me.id.clone(),
                addr: me.addr.clone(),
                handle,
                server,
            });
        }

        Self {
            nodes,
            client: PeerClient::new(Duration::from_secs(5)),
            _dir: dir,
        }
    }

    /// Index of the single active leader, once every active node follows it
    pub async fn wait_for_leader(&self, limit: Duration) -> Option<usize> {
        let mut found = None;
        let settled = eventually(limit, || {
            let leader = self.current_leader();
            found = leader;
            let agreed = leader.map_or(false, |l| {
                let leader_id = self.nodes[l].id.clone();
                self.nodes.iter().all(|n| {
                    let raft = n.handle.raft();
                    !raft.is_active() || raft.leader_id().as_deref() == Some(leader_id.as_str())
                })
            });
            async move { agreed }
        })
        .await;
        if settled {
            found
        } else {
            None
        }
    }

    pub fn current_leader(&self) -> Option<usize> {
        let leaders: Vec<usize> = (0..self.nodes.len())
            .filter(|&i| self.nodes[i].is_leader())
            .collect();
        match leaders[..] {
            [one] => Some(one),
            _ => None,
        }
    }

    pub async fn pay(&self, node: usize, amount: &str, id: &str) -> PayReply {
        self.client
            .forward_pay(&self.nodes[node].addr, amount, id)
            .await
            .unwrap()
    }

    pub async fn stop_node(&self, node: usize) {
        self.client
            .admin(&self.nodes[node].addr, Request::Stop)
            .await
            .unwrap();
    }

    pub async fn start_node(&self, node: usize) {
        self.client
            .admin(&self.nodes[node].addr, Request::Start)
            .await
            .unwrap();
    }

    pub async fn wait_for_len(&self, node: usize, len: u64, limit: Duration) -> bool {
        eventually(limit, || {
            let done = self.nodes[node].ledger_len() == len;
            async move { done }
        })
        .await
    }
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        for node in &self.nodes {
            node.handle.shutdown();
            node.server.abort();
        }
    }
}

pub struct ElectionCluster {
    pub network: LocalNetwork,
    pub nodes: Vec<Arc<RaftNode>>,
}

impl ElectionCluster {
    /// Nodes named n1..nN, registered but not started
    pub fn new(size: usize) -> Self {
        let network = LocalNetwork::new();
        let names: Vec<String> = (1..=size).map(|i| format!("n{i}")).collect();

        let nodes = names
            .iter()
            .map(|name| {
                let peers = names
                    .iter()
                    .filter(|p| *p != name)
                    .map(|p| PeerConfig {
                        id: p.clone(),
                        addr: p.clone(),
                    })
                    .collect();
                let view = Arc::new(ClusterView::new(name, name, peers));
                let node = Arc::new(RaftNode::new(
                    view,
                    fast_election(),
                    network.transport(name.as_str()),
                ));
                network.register(name.as_str(), &node);
                node
            })
            .collect();

        Self { network, nodes }
    }

    pub fn start_all(&self) {
        for node in &self.nodes {
            node.start();
        }
    }

    pub fn leaders(&self) -> Vec<usize> {
        (0..self.nodes.len())
            .filter(|&i| self.nodes[i].is_leader())
            .collect()
    }

    /// Wait until exactly one node among `among` leads
    pub async fn wait_for_leader_among(&self, among: &[usize], limit: Duration) -> Option<usize> {
        let mut found = None;
        let ok = eventually(limit, || {
            let leaders: Vec<usize> = among
                .iter()
                .copied()
                .filter(|&i| self.nodes[i].is_leader())
                .collect();
            let single = leaders.len() == 1;
            if single {
                found = Some(leaders[0]);
            }
            async move { single }
        })
        .await;
        if ok {
            found
        } else {
            None
        }
    }

    pub async fn wait_for_leader(&self, limit: Duration) -> Option<usize> {
        let all: Vec<usize> = (0..self.nodes.len()).collect();
        self.wait_for_leader_among(&all, limit).await
    }
}

impl Drop for ElectionCluster {
    fn drop(&mut self) {
        for node in &self.nodes {
            node.stop();
        }
    }
}
