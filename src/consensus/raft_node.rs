//! Election node
//!
//! Wraps [`ElectionState`] with the timers and RPC fan-out that drive it:
//!
//! - a randomized election timer, re-armed on every granted vote, accepted
//!   heartbeat and lost election
//! - a heartbeat loop while leader
//! - a watch channel publishing who leads
//!
//! Timer firings carry a generation number; re-arming bumps it so a firing
//! that raced with a reset is ignored. The state mutex is never held across an
//! `.await`.

use crate::common::{ClusterEvents, ElectionConfig, NoopEvents};
use crate::consensus::membership::ClusterView;
use crate::consensus::state::{ElectionState, Role};
use crate::consensus::term_store::TermStore;
use crate::consensus::transport::{ElectionTransport, Heartbeat, HeartbeatReply, VoteReply};
use crate::ledger::SharedLedger;
use futures_util::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Published view of leadership
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Leadership {
    pub term: u64,
    pub role: Role,
    pub leader_id: Option<String>,
    pub active: bool,
}

impl Leadership {
    fn of(state: &ElectionState) -> Self {
        Self {
            term: state.current_term,
            role: state.role,
            leader_id: state.current_leader.clone(),
            active: state.active,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }
}

#[derive(Default)]
struct Timers {
    election: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    election_generation: u64,
}

struct ElectionGuard<'a>(&'a AtomicBool);

impl Drop for ElectionGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct RaftNode {
    node_id: String,
    view: Arc<ClusterView>,
    config: ElectionConfig,
    state: Mutex<ElectionState>,
    term_store: Mutex<TermStore>,
    transport: Arc<dyn ElectionTransport>,
    events: Arc<dyn ClusterEvents>,
    ledger: Option<SharedLedger>,
    timers: Mutex<Timers>,
    election_running: AtomicBool,
    leadership: watch::Sender<Leadership>,
}

impl RaftNode {
    pub fn new(
        view: Arc<ClusterView>,
        config: ElectionConfig,
        transport: Arc<dyn ElectionTransport>,
    ) -> Self {
        let state = ElectionState::new(view.node_id());
        let (leadership, _) = watch::channel(Leadership::of(&state));
        Self {
            node_id: view.node_id().to_string(),
            view,
            config,
            state: Mutex::new(state),
            term_store: Mutex::new(TermStore::in_memory()),
            transport,
            events: Arc::new(NoopEvents),
            ledger: None,
            timers: Mutex::new(Timers::default()),
            election_running: AtomicBool::new(false),
            leadership,
        }
    }

    pub fn with_events(mut self, events: Arc<dyn ClusterEvents>) -> Self {
        self.events = events;
        self
    }

    /// Heartbeats will carry this ledger's commit index, and accepted
    /// heartbeats advance it.
    pub fn with_ledger(mut self, ledger: SharedLedger) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Persist term and vote through `store`, resuming from what it holds
    pub fn with_term_store(mut self, mut store: TermStore) -> crate::common::Result<Self> {
        if let Some(saved) = store.load()? {
            let state = ElectionState::restore(&self.node_id, saved.current_term, saved.voted_for);
            self.leadership.send_replace(Leadership::of(&state));
            self.state = Mutex::new(state);
        }
        self.term_store = Mutex::new(store);
        Ok(self)
    }

    /// Activate as Follower and arm the election timer. No-op if active.
    pub fn start(self: &Arc<Self>) {
        let term = {
            let mut state = lock(&self.state);
            if !state.activate() {
                return;
            }
            self.publish(&state);
            state.current_term
        };

        tracing::info!("Node {} started as follower (term: {})", self.node_id, term);
        self.events
            .on_log_message(&self.node_id, &format!("started in term {}", term));
        self.reset_election_timer();
    }

    /// Deactivate and cancel all timers. The ledger is untouched.
    pub fn stop(&self) {
        let deactivated = {
            let mut state = lock(&self.state);
            let deactivated = state.deactivate();
            if deactivated {
                self.publish(&state);
            }
            deactivated
        };
        self.cancel_timers();

        if deactivated {
            tracing::info!("Node {} stopped", self.node_id);
            self.events.on_log_message(&self.node_id, "stopped");
        }
    }

    pub fn handle_vote_request(self: &Arc<Self>, candidate: &str, term: u64) -> VoteReply {
        let (decision, demoted) = {
            let mut state = lock(&self.state);
            let was_leader = state.is_leader();
            let decision = state.handle_vote_request(candidate, term);
            self.persist(&state);
            self.publish(&state);
            (decision, was_leader && !state.is_leader())
        };

        if demoted {
            self.cancel_heartbeat();
            tracing::info!(
                "Node {} stepping down: vote request from {} carries term {}",
                self.node_id,
                candidate,
                term
            );
        }
        if decision.granted || demoted {
            self.reset_election_timer();
        }

        VoteReply {
            granted: decision.granted,
            term: decision.term,
        }
    }

    pub fn handle_heartbeat(self: &Arc<Self>, heartbeat: &Heartbeat) -> HeartbeatReply {
        let (decision, demoted) = {
            let mut state = lock(&self.state);
            let was_leader = state.is_leader();
            let decision = state.handle_heartbeat(&heartbeat.leader_id, heartbeat.term);
            self.persist(&state);
            self.publish(&state);
            (decision, was_leader && !state.is_leader())
        };

        if !decision.accepted {
            tracing::debug!(
                "Node {} rejected heartbeat from {} (term {} < {})",
                self.node_id,
                heartbeat.leader_id,
                heartbeat.term,
                decision.term
            );
            return HeartbeatReply {
                accepted: false,
                term: decision.term,
            };
        }

        if demoted {
            self.cancel_heartbeat();
        }
        self.reset_election_timer();

        if let (Some(commit), Some(ledger)) = (&heartbeat.commit, &self.ledger) {
            let mut ledger = lock(ledger);
            match ledger.follow_commit(commit) {
                Ok(_) => {}
                Err(e) if e.is_integrity_violation() => tracing::error!(
                    "Node {} diverges from leader {} at commit {}: {}",
                    self.node_id,
                    heartbeat.leader_id,
                    commit.sequence,
                    e
                ),
                Err(e) => tracing::warn!(
                    "Node {} could not follow commit {}: {}",
                    self.node_id,
                    commit.sequence,
                    e
                ),
            }
        }

        HeartbeatReply {
            accepted: true,
            term: decision.term,
        }
    }

    fn reset_election_timer(self: &Arc<Self>) {
        if !self.is_active() {
            return;
        }
        let timeout = self.config.random_election_timeout();
        let node = Arc::downgrade(self);

        let mut timers = lock(&self.timers);
        timers.election_generation += 1;
        let generation = timers.election_generation;
        if let Some(handle) = timers.election.take() {
            handle.abort();
        }
        timers.election = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(node) = node.upgrade() {
                // Detached: re-arming the timer aborts this task
                tokio::spawn(async move { node.on_election_timeout(generation).await });
            }
        }));
    }

    fn cancel_election_timer(&self) {
        let mut timers = lock(&self.timers);
        timers.election_generation += 1;
        if let Some(handle) = timers.election.take() {
            handle.abort();
        }
    }

    fn cancel_heartbeat(&self) {
        if let Some(handle) = lock(&self.timers).heartbeat.take() {
            handle.abort();
        }
    }

    fn cancel_timers(&self) {
        self.cancel_election_timer();
        self.cancel_heartbeat();
    }

    async fn on_election_timeout(self: Arc<Self>, generation: u64) {
        if lock(&self.timers).election_generation != generation {
            tracing::debug!("Node {} ignoring stale election timer", self.node_id);
            return;
        }
        self.run_election().await;
    }

    async fn run_election(self: &Arc<Self>) {
        if self.election_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let _guard = ElectionGuard(&self.election_running);

        let term = {
            let mut state = lock(&self.state);
            if !state.active || state.is_leader() {
                return;
            }
            let term = state.become_candidate();
            self.persist(&state);
            self.publish(&state);
            term
        };
        self.events
            .on_log_message(&self.node_id, &format!("starting election for term {}", term));

        let rpc_timeout = self.config.rpc_timeout();
        let peers = self.view.peer_addrs();
        let requests = peers.iter().map(|peer| {
            let transport = self.transport.clone();
            let candidate = self.node_id.clone();
            async move {
                let reply = tokio::time::timeout(
                    rpc_timeout,
                    transport.request_vote(peer, &candidate, term),
                )
                .await;
                (peer, reply)
            }
        });
        let replies = join_all(requests).await;

        let won = {
            let mut state = lock(&self.state);
            for (peer, reply) in replies {
                match reply {
                    Ok(Ok(reply)) if reply.term > state.current_term => {
                        state.observe_term(reply.term);
                    }
                    Ok(Ok(reply)) if reply.granted => {
                        let voter = self.view.id_of(peer).unwrap_or(peer.as_str());
                        state.add_vote(voter, term);
                    }
                    Ok(Ok(_)) => {
                        tracing::debug!("Node {} denied vote for term {}", peer, term);
                    }
                    Ok(Err(e)) => {
                        tracing::debug!("Vote request to {} failed: {}", peer, e);
                    }
                    Err(_) => {
                        tracing::debug!("Vote request to {} timed out", peer);
                    }
                }
            }

            let won = state.is_candidate()
                && state.current_term == term
                && state.has_majority(self.view.cluster_size())
                && state.become_leader(term);
            if !won {
                state.lose_election(term);
            }
            self.persist(&state);
            self.publish(&state);
            won
        };

        if won {
            self.on_elected(term);
        } else {
            self.reset_election_timer();
        }
    }

    fn on_elected(self: &Arc<Self>, term: u64) {
        self.cancel_election_timer();

        let node = Arc::downgrade(self);
        let interval = self.config.heartbeat_interval();
        let handle = tokio::spawn(async move {
            loop {
                let Some(node) = node.upgrade() else {
                    break;
                };
                if !node.broadcast_heartbeat(term).await {
                    break;
                }
                drop(node);
                tokio::time::sleep(interval).await;
            }
        });
        if let Some(previous) = lock(&self.timers).heartbeat.replace(handle) {
            previous.abort();
        }

        self.events.on_leader_elected(&self.node_id, term);
    }

    /// Returns false once this node is no longer leader in `term`
    async fn broadcast_heartbeat(self: &Arc<Self>, term: u64) -> bool {
        {
            let state = lock(&self.state);
            if !state.is_leader() || state.current_term != term {
                return false;
            }
        }

        let commit = self
            .ledger
            .as_ref()
            .and_then(|ledger| lock(ledger).commit_point());
        let heartbeat = Heartbeat {
            leader_id: self.node_id.clone(),
            term,
            commit,
        };

        let rpc_timeout = self.config.rpc_timeout();
        let peers = self.view.peer_addrs();
        let sends = peers.iter().map(|peer| {
            let transport = self.transport.clone();
            let heartbeat = &heartbeat;
            async move {
                tokio::time::timeout(rpc_timeout, transport.send_heartbeat(peer, heartbeat)).await
            }
        });
        let highest_term = join_all(sends)
            .await
            .into_iter()
            .filter_map(|reply| match reply {
                Ok(Ok(reply)) if !reply.accepted => Some(reply.term),
                _ => None,
            })
            .max()
            .unwrap_or(0);

        if highest_term <= term {
            return true;
        }

        {
            let mut state = lock(&self.state);
            state.observe_term(highest_term);
            self.persist(&state);
            self.publish(&state);
        }
        tracing::info!(
            "Node {} stepping down: a peer reported term {}",
            self.node_id,
            highest_term
        );
        self.events.on_log_message(
            &self.node_id,
            &format!("stepped down, saw term {}", highest_term),
        );
        self.reset_election_timer();
        false
    }

    fn persist(&self, state: &ElectionState) {
        let mut store = lock(&self.term_store);
        if let Err(e) = store.save(state.current_term, state.voted_for.as_deref()) {
            tracing::error!("Node {} failed to persist election state: {}", self.node_id, e);
        }
    }

    fn publish(&self, state: &ElectionState) {
        let next = Leadership::of(state);
        self.leadership.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn view(&self) -> &Arc<ClusterView> {
        &self.view
    }

    pub fn is_active(&self) -> bool {
        lock(&self.state).active
    }

    pub fn is_leader(&self) -> bool {
        lock(&self.state).is_leader()
    }

    pub fn role(&self) -> Role {
        lock(&self.state).role
    }

    pub fn current_term(&self) -> u64 {
        lock(&self.state).current_term
    }

    /// Node id of the current leader, if known
    pub fn leader_id(&self) -> Option<String> {
        lock(&self.state).current_leader.clone()
    }

    pub fn leadership(&self) -> Leadership {
        Leadership::of(&lock(&self.state))
    }

    /// Receive every leadership change
    pub fn subscribe(&self) -> watch::Receiver<Leadership> {
        self.leadership.subscribe()
    }
}

impl Drop for RaftNode {
    fn drop(&mut self) {
        let timers = self.timers.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = timers.election.take() {
            handle.abort();
        }
        if let Some(handle) = timers.heartbeat.take() {
            handle.abort();
        }
    }
}
