//! Replication coordinator
//!
//! Pushes each new entry to every known peer at its sequence and counts acks.
//! Peers that fall behind are brought back in line by catch-up: fetch the
//! peer's log, check it is a prefix of ours, then resend everything after it
//! in order. A peer holding entries we do not is left alone and reported as
//! diverged.
//!
//! Only peers whose log has been checked this way get plain pushes. Any other
//! peer is caught up first, so an ack always means the peer holds our prefix.

use crate::common::Result;
use crate::consensus::ClusterView;
use crate::ledger::{LedgerEntry, SharedLedger};
use crate::replication::{LivenessTracker, PeerClient, PeerHealth};
use crate::server::protocol::ReplicateReply;
use futures_util::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

/// Acks needed out of all known nodes (peers plus the leader)
pub fn quorum_size(peer_count: usize) -> usize {
    (peer_count + 1) / 2 + 1
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicationReport {
    /// Acknowledgments, the leader's own included
    pub acks: usize,
    pub needed: usize,
    /// Peers that answered `ERR Behind`
    pub behind: Vec<String>,
    /// Peers skipped, unreachable or refusing
    pub missed: Vec<String>,
}

impl ReplicationReport {
    pub fn has_quorum(&self) -> bool {
        self.acks >= self.needed
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CatchUpReport {
    /// Entries the peer held before catch-up
    pub peer_len: u64,
    pub sent: usize,
    pub failed: usize,
    /// First sequence where the peer's log differs from ours
    pub conflict: Option<u64>,
}

impl CatchUpReport {
    /// Peer now holds exactly our log
    pub fn is_complete(&self) -> bool {
        self.conflict.is_none() && self.failed == 0
    }
}

/// What we last learned about a peer's log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeerLog {
    /// A prefix of ours, pushes can go straight through
    Verified,
    Diverged { sequence: u64 },
}

/// First sequence where `remote` is not a prefix of `local`
pub fn first_mismatch(local: &[LedgerEntry], remote: &[LedgerEntry]) -> Option<u64> {
    remote
        .iter()
        .enumerate()
        .find(|(i, entry)| local.get(*i) != Some(*entry))
        .map(|(i, _)| i as u64)
}

pub struct ReplicationCoordinator {
    view: Arc<ClusterView>,
    ledger: SharedLedger,
    client: PeerClient,
    liveness: Arc<LivenessTracker>,
    catching_up: Mutex<HashSet<String>>,
    logs: Mutex<HashMap<String, PeerLog>>,
}

impl ReplicationCoordinator {
    pub fn new(
        view: Arc<ClusterView>,
        ledger: SharedLedger,
        client: PeerClient,
        liveness: Arc<LivenessTracker>,
    ) -> Self {
        Self {
            view,
            ledger,
            client,
            liveness,
            catching_up: Mutex::new(HashSet::new()),
            logs: Mutex::new(HashMap::new()),
        }
    }

    /// Send `entry` to all peers concurrently and count acknowledgments
    pub async fn replicate_and_count(&self, entry: &LedgerEntry) -> ReplicationReport {
        let peers = self.view.peer_addrs();
        let mut report = ReplicationReport {
            acks: 1,
            needed: quorum_size(peers.len()),
            ..Default::default()
        };

        let mut targets = Vec::with_capacity(peers.len());
        for peer in peers {
            if self.liveness.should_skip(&peer) {
                tracing::debug!("Skipping {} for sequence {}: marked down", peer, entry.sequence);
                report.missed.push(peer);
            } else {
                targets.push(peer);
            }
        }

        let pushes = targets.into_iter().map(|peer| async move {
            let reply = if self.peer_log(&peer) == Some(PeerLog::Verified) {
                self.client.push_entry(&peer, entry).await
            } else {
                self.catch_up_through(&peer, entry.sequence).await
            };
            (peer, reply)
        });

        for (peer, reply) in join_all(pushes).await {
            if !matches!(reply, Ok(ReplicateReply::Ack | ReplicateReply::Conflict { .. })) {
                self.set_peer_log(&peer, None);
            }
            match reply {
                Ok(ReplicateReply::Ack) => report.acks += 1,
                Ok(ReplicateReply::Behind { len }) => {
                    tracing::warn!(
                        "Peer {} is behind (has {} entries, sent sequence {})",
                        peer,
                        len,
                        entry.sequence
                    );
                    report.behind.push(peer);
                }
                Ok(ReplicateReply::Conflict { sequence }) => {
                    tracing::error!(
                        "Peer {} holds a different entry at sequence {}",
                        peer,
                        sequence
                    );
                    self.set_peer_log(&peer, Some(PeerLog::Diverged { sequence }));
                    report.missed.push(peer);
                }
                Ok(ReplicateReply::Inactive) => {
                    tracing::warn!("Peer {} is stopped, sequence {} not applied", peer, entry.sequence);
                    self.liveness.record(&peer, PeerHealth::Inactive);
                    report.missed.push(peer);
                }
                Ok(other) => {
                    tracing::warn!("Peer {} refused sequence {}: {}", peer, entry.sequence, other);
                    report.missed.push(peer);
                }
                Err(e) => {
                    tracing::warn!("Missed ack from {} for sequence {}: {}", peer, entry.sequence, e);
                    if e.is_retryable() {
                        self.liveness.record(&peer, PeerHealth::Unreachable);
                    }
                    report.missed.push(peer);
                }
            }
        }

        tracing::debug!(
            "Sequence {} replicated: {}/{} acks",
            entry.sequence,
            report.acks,
            report.needed
        );
        report
    }

    fn entries_from(&self, index: u64) -> Vec<LedgerEntry> {
        self.ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries_from(index)
    }

    fn peer_log(&self, peer: &str) -> Option<PeerLog> {
        self.logs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer)
            .copied()
    }

    fn set_peer_log(&self, peer: &str, log: Option<PeerLog>) {
        let mut logs = self.logs.lock().unwrap_or_else(PoisonError::into_inner);
        match log {
            Some(log) => logs.insert(peer.to_string(), log),
            None => logs.remove(peer),
        };
    }

    /// Peers last seen holding entries that contradict our log, with the
    /// first differing sequence
    pub fn diverged_peers(&self) -> Vec<(String, u64)> {
        let logs = self.logs.lock().unwrap_or_else(PoisonError::into_inner);
        let mut diverged: Vec<(String, u64)> = logs
            .iter()
            .filter_map(|(peer, log)| match log {
                PeerLog::Diverged { sequence } => Some((peer.clone(), *sequence)),
                PeerLog::Verified => None,
            })
            .collect();
        diverged.sort();
        diverged
    }

    /// Catch up a peer whose log is unchecked, answering as a push of
    /// `sequence` would
    async fn catch_up_through(&self, peer: &str, sequence: u64) -> Result<ReplicateReply> {
        let report = self.catch_up(peer).await?;
        Ok(match report.conflict {
            Some(sequence) => ReplicateReply::Conflict { sequence },
            None if report.failed > 0 => ReplicateReply::Behind {
                len: report.peer_len + report.sent as u64,
            },
            None => {
                tracing::debug!("Peer {} verified through sequence {}", peer, sequence);
                ReplicateReply::Ack
            }
        })
    }

    /// Check the peer's log against ours, then resend every entry it is
    /// missing, in order.
    ///
    /// Nothing is sent to a peer whose log is not a prefix of ours. Otherwise
    /// stops at the first entry the peer does not acknowledge; the rest are
    /// counted as failed.
    pub async fn catch_up(&self, peer: &str) -> Result<CatchUpReport> {
        let remote = self.client.fetch_wal(peer, 0).await?;
        let peer_len = remote.len() as u64;
        let mut report = CatchUpReport {
            peer_len,
            ..Default::default()
        };

        if let Some(sequence) = first_mismatch(&self.entries_from(0), &remote) {
            let held = remote
                .get(sequence as usize)
                .map(|entry| entry.to_string())
                .unwrap_or_default();
            tracing::error!(
                "Peer {} diverges at sequence {} (holds {:?}), not catching up",
                peer,
                sequence,
                held
            );
            self.set_peer_log(peer, Some(PeerLog::Diverged { sequence }));
            report.conflict = Some(sequence);
            return Ok(report);
        }

        let mut next = peer_len;
        loop {
            let pending = self.entries_from(next);
            if pending.is_empty() {
                break;
            }
            let total = pending.len();

            for (i, entry) in pending.iter().enumerate() {
                match self.client.push_entry(peer, entry).await {
                    Ok(reply) if reply.is_ack() => report.sent += 1,
                    Ok(reply) => {
                        tracing::warn!(
                            "Catch-up of {} stopped at sequence {}: {}",
                            peer,
                            entry.sequence,
                            reply
                        );
                        report.failed += total - i;
                        self.set_peer_log(peer, None);
                        return Ok(report);
                    }
                    Err(e) => {
                        tracing::warn!(
                            "Catch-up of {} stopped at sequence {}: {}",
                            peer,
                            entry.sequence,
                            e
                        );
                        report.failed += total - i;
                        self.set_peer_log(peer, None);
                        return Ok(report);
                    }
                }
                next = entry.sequence + 1;
            }
        }

        self.set_peer_log(peer, Some(PeerLog::Verified));

        if report.sent > 0 {
            tracing::info!(
                "Caught up {}: sent {} entries from sequence {}",
                peer,
                report.sent,
                peer_len
            );
        }
        Ok(report)
    }

    /// Catch up every peer concurrently
    pub async fn catch_up_all(&self) -> Vec<(String, Result<CatchUpReport>)> {
        let runs = self.view.peer_addrs().into_iter().map(|peer| async move {
            let result = self.catch_up(&peer).await;
            if let Err(e) = &result {
                tracing::warn!("Catch-up of {} failed: {}", peer, e);
            }
            (peer, result)
        });
        join_all(runs).await
    }

    /// Catch up `peer` in the background unless a run is already going
    pub fn spawn_catch_up(self: &Arc<Self>, peer: String) {
        {
            let mut running = self.catching_up.lock().unwrap_or_else(PoisonError::into_inner);
            if !running.insert(peer.clone()) {
                return;
            }
        }

        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = coordinator.catch_up(&peer).await {
                tracing::warn!("Background catch-up of {} failed: {}", peer, e);
            }
            coordinator
                .catching_up
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&peer);
        });
    }

    pub fn liveness(&self) -> &Arc<LivenessTracker> {
        &self.liveness
    }
}
