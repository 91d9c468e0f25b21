//! Cluster membership
//!
//! [`ClusterView`] is the static member list, built once from configuration.
//! [`MembershipProvider`] is what the router asks to find peers and the leader.

use crate::common::{NodeConfig, PeerConfig};
use crate::consensus::raft_node::RaftNode;
use crate::replication::LivenessTracker;
use std::sync::Arc;

/// This node plus its statically configured peers
#[derive(Debug, Clone)]
pub struct ClusterView {
    node_id: String,
    addr: String,
    peers: Vec<PeerConfig>,
}

impl ClusterView {
    pub fn new(node_id: impl Into<String>, addr: impl Into<String>, peers: Vec<PeerConfig>) -> Self {
        Self {
            node_id: node_id.into(),
            addr: addr.into(),
            peers,
        }
    }

    pub fn from_config(config: &NodeConfig) -> Self {
        Self::new(&config.node_id, config.advertised(), config.peers.clone())
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn peers(&self) -> &[PeerConfig] {
        &self.peers
    }

    /// Peer addresses in configuration order
    pub fn peer_addrs(&self) -> Vec<String> {
        self.peers.iter().map(|p| p.addr.clone()).collect()
    }

    /// Address of any member, this node included
    pub fn address_of(&self, node_id: &str) -> Option<&str> {
        if node_id == self.node_id {
            return Some(&self.addr);
        }
        self.peers
            .iter()
            .find(|p| p.id == node_id)
            .map(|p| p.addr.as_str())
    }

    pub fn id_of(&self, addr: &str) -> Option<&str> {
        if addr == self.addr {
            return Some(&self.node_id);
        }
        self.peers
            .iter()
            .find(|p| p.addr == addr)
            .map(|p| p.id.as_str())
    }

    pub fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }
}

pub trait MembershipProvider: Send + Sync {
    /// Every known peer address, excluding this node
    fn list_peers(&self) -> Vec<String>;

    /// Address of the current leader, if one is known
    fn current_leader(&self) -> Option<String>;

    fn is_reachable(&self, addr: &str) -> bool;
}

/// Static view + election leader + liveness cache
pub struct ClusterMembership {
    view: Arc<ClusterView>,
    raft: Arc<RaftNode>,
    liveness: Arc<LivenessTracker>,
}

impl ClusterMembership {
    pub fn new(view: Arc<ClusterView>, raft: Arc<RaftNode>, liveness: Arc<LivenessTracker>) -> Self {
        Self {
            view,
            raft,
            liveness,
        }
    }
}

impl MembershipProvider for ClusterMembership {
    fn list_peers(&self) -> Vec<String> {
        self.view.peer_addrs()
    }

    fn current_leader(&self) -> Option<String> {
        let leader = self.raft.leader_id()?;
        match self.view.address_of(&leader) {
            Some(addr) => Some(addr.to_string()),
            None => {
                tracing::warn!("Leader {} is not in the cluster view", leader);
                None
            }
        }
    }

    fn is_reachable(&self, addr: &str) -> bool {
        self.liveness.is_reachable(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view() -> ClusterView {
        ClusterView::new(
            "n1",
            "127.0.0.1:7001",
            vec![
                "n2=127.0.0.1:7002".parse().unwrap(),
                "n3=127.0.0.1:7003".parse().unwrap(),
            ],
        )
    }

    #[test]
    fn test_lookup_both_ways() {
        let view = view();
        assert_eq!(view.cluster_size(), 3);
        assert_eq!(view.address_of("n3"), Some("127.0.0.1:7003"));
        assert_eq!(view.address_of("n1"), Some("127.0.0.1:7001"));
        assert_eq!(view.id_of("127.0.0.1:7002"), Some("n2"));
        assert_eq!(view.address_of("n9"), None);
    }

    #[test]
    fn test_peer_addrs_exclude_self_and_keep_order() {
        assert_eq!(
            view().peer_addrs(),
            vec!["127.0.0.1:7002".to_string(), "127.0.0.1:7003".to_string()]
        );
    }
}
