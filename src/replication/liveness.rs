//! Peer liveness cache, refreshed by `STATUS` probes

use crate::replication::PeerClient;
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerHealth {
    Alive,
    /// Answers but has been stopped
    Inactive,
    Unreachable,
}

/// A probe result that differs from the cached one
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthChange {
    pub addr: String,
    pub previous: Option<PeerHealth>,
    pub current: PeerHealth,
}

impl HealthChange {
    /// Peer just became usable for replication
    pub fn came_alive(&self) -> bool {
        self.current == PeerHealth::Alive
    }
}

pub struct LivenessTracker {
    client: PeerClient,
    health: Mutex<HashMap<String, PeerHealth>>,
}

impl LivenessTracker {
    pub fn new(client: PeerClient) -> Self {
        Self {
            client,
            health: Mutex::new(HashMap::new()),
        }
    }

    pub fn health(&self, addr: &str) -> Option<PeerHealth> {
        self.health
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(addr)
            .copied()
    }

    /// Unknown peers count as reachable
    pub fn is_reachable(&self, addr: &str) -> bool {
        self.health(addr) != Some(PeerHealth::Unreachable)
    }

    /// Replication skips peers known to be down or stopped
    pub fn should_skip(&self, addr: &str) -> bool {
        matches!(
            self.health(addr),
            Some(PeerHealth::Unreachable | PeerHealth::Inactive)
        )
    }

    /// Store `current`, returning the change if it differs from the cache
    pub fn record(&self, addr: &str, current: PeerHealth) -> Option<HealthChange> {
        let previous = self
            .health
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(addr.to_string(), current);
        if previous == Some(current) {
            return None;
        }

        match current {
            PeerHealth::Alive => tracing::info!("Peer {} is alive", addr),
            PeerHealth::Inactive => tracing::info!("Peer {} is inactive", addr),
            PeerHealth::Unreachable => tracing::warn!("Peer {} is unreachable", addr),
        }
        Some(HealthChange {
            addr: addr.to_string(),
            previous,
            current,
        })
    }

    pub async fn probe(&self, addr: &str) -> PeerHealth {
        match self.client.status(addr).await {
            Ok(status) if status.active => PeerHealth::Alive,
            Ok(_) => PeerHealth::Inactive,
            Err(e) => {
                tracing::debug!("Probe of {} failed: {}", addr, e);
                PeerHealth::Unreachable
            }
        }
    }

    /// Probe every peer concurrently and return what changed
    pub async fn probe_all(&self, peers: &[String]) -> Vec<HealthChange> {
        let probes = peers.iter().map(|addr| async move { (addr, self.probe(addr).await) });
        join_all(probes)
            .await
            .into_iter()
            .filter_map(|(addr, health)| self.record(addr, health))
            .collect()
    }

    /// Snapshot of the cache, sorted by address
    pub fn snapshot(&self) -> Vec<(String, PeerHealth)> {
        let mut all: Vec<_> = self
            .health
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(addr, health)| (addr.clone(), *health))
            .collect();
        all.sort();
        all
    }
}
