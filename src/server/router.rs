//! Payment request router
//!
//! On the leader a payment goes append → replicate → commit, one payment at a
//! time so followers receive sequences in order. A retried id that is still
//! uncommitted goes through replicate → commit again instead of being
//! reported as done. Elsewhere it is forwarded to whoever the election module
//! says leads.

use crate::consensus::{MembershipProvider, RaftNode};
use crate::ledger::{LedgerEntry, SharedLedger};
use crate::replication::{PeerClient, ReplicationCoordinator};
use crate::server::protocol::PayReply;
use std::sync::{Arc, PoisonError};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentOutcome {
    Accepted,
    /// Payment id already recorded and committed; reported as success
    Duplicate,
    NoLeader,
    ReplicationFailed,
}

impl PaymentOutcome {
    pub fn reply(&self) -> PayReply {
        match self {
            PaymentOutcome::Accepted | PaymentOutcome::Duplicate => PayReply::Ok,
            PaymentOutcome::NoLeader => PayReply::NoLeader,
            PaymentOutcome::ReplicationFailed => PayReply::ReplicationFailed,
        }
    }
}

impl From<PayReply> for PaymentOutcome {
    fn from(reply: PayReply) -> Self {
        match reply {
            PayReply::Ok => PaymentOutcome::Accepted,
            PayReply::ReplicationFailed => PaymentOutcome::ReplicationFailed,
            PayReply::NoLeader | PayReply::BadFormat => PaymentOutcome::NoLeader,
        }
    }
}

pub struct PaymentRouter {
    self_addr: String,
    raft: Arc<RaftNode>,
    ledger: SharedLedger,
    coordinator: Arc<ReplicationCoordinator>,
    membership: Arc<dyn MembershipProvider>,
    client: PeerClient,
    write_path: Mutex<()>,
}

impl PaymentRouter {
    pub fn new(
        self_addr: impl Into<String>,
        raft: Arc<RaftNode>,
        ledger: SharedLedger,
        coordinator: Arc<ReplicationCoordinator>,
        membership: Arc<dyn MembershipProvider>,
        client: PeerClient,
    ) -> Self {
        Self {
            self_addr: self_addr.into(),
            raft,
            ledger,
            coordinator,
            membership,
            client,
            write_path: Mutex::new(()),
        }
    }

    pub async fn handle_pay(&self, amount: &str, payment_id: &str) -> PaymentOutcome {
        if !self.raft.is_active() {
            return PaymentOutcome::NoLeader;
        }

        if self.raft.is_leader() {
            let _write = self.write_path.lock().await;
            // Leadership may have moved while we waited
            if self.raft.is_leader() {
                return self.pay_as_leader(amount, payment_id).await;
            }
        }

        self.forward(amount, payment_id).await
    }

    async fn pay_as_leader(&self, amount: &str, payment_id: &str) -> PaymentOutcome {
        let appended = {
            let mut ledger = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
            match ledger.append_as_leader(payment_id, amount) {
                Ok(Some(sequence)) => Ok(LedgerEntry::new(sequence, payment_id, amount)),
                Ok(None) => match ledger.sequence_of(payment_id) {
                    Some(sequence) if ledger.is_committed(sequence) => {
                        return PaymentOutcome::Duplicate
                    }
                    Some(sequence) => ledger.entry(sequence).cloned().ok_or(sequence),
                    // Indexed id with no entry in the log
                    None => return PaymentOutcome::Duplicate,
                },
                Err(e) => {
                    tracing::error!("Append of {} failed: {}", payment_id, e);
                    return PaymentOutcome::ReplicationFailed;
                }
            }
        };

        let entry = match appended {
            Ok(entry) => entry,
            Err(sequence) => {
                tracing::error!("Sequence {} for {} missing from the log", sequence, payment_id);
                return PaymentOutcome::ReplicationFailed;
            }
        };
        if entry.payload != amount {
            tracing::warn!(
                "Retry of {} with payload {:?} differs from recorded {:?}",
                payment_id,
                amount,
                entry.payload
            );
        }
        self.commit_entry(entry).await
    }

    /// Replicate `entry` and commit it once a quorum holds it
    async fn commit_entry(&self, entry: LedgerEntry) -> PaymentOutcome {
        let payment_id = entry.payment_id.as_str();
        let report = self.coordinator.replicate_and_count(&entry).await;
        if !report.has_quorum() {
            tracing::warn!(
                "Sequence {} ({}) not committed: {}/{} acks",
                entry.sequence,
                payment_id,
                report.acks,
                report.needed
            );
            self.coordinator.catch_up_all().await;
            return PaymentOutcome::ReplicationFailed;
        }

        let committed = self
            .ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .advance_commit_index(entry.sequence);
        if let Err(e) = committed {
            tracing::error!("Commit of sequence {} failed: {}", entry.sequence, e);
            return PaymentOutcome::ReplicationFailed;
        }

        for peer in report.behind {
            self.coordinator.spawn_catch_up(peer);
        }

        tracing::info!(
            "Committed {} at sequence {} ({}/{} acks)",
            payment_id,
            entry.sequence,
            report.acks,
            report.needed
        );
        PaymentOutcome::Accepted
    }

    async fn forward(&self, amount: &str, payment_id: &str) -> PaymentOutcome {
        let Some(leader) = self.membership.current_leader() else {
            tracing::debug!("No leader known, refusing {}", payment_id);
            return PaymentOutcome::NoLeader;
        };
        if leader == self.self_addr {
            return PaymentOutcome::NoLeader;
        }

        match self.client.forward_pay(&leader, amount, payment_id).await {
            Ok(reply) => {
                tracing::debug!("Forwarded {} to {}: {}", payment_id, leader, reply);
                reply.into()
            }
            Err(e) => {
                tracing::warn!("Forwarding {} to {} failed: {}", payment_id, leader, e);
                PaymentOutcome::NoLeader
            }
        }
    }
}
