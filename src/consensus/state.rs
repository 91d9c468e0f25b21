//! Election state machine
//!
//! Pure role/term/vote transitions with no timers or I/O, so the safety rules
//! can be exercised directly. [`RaftNode`](super::RaftNode) wraps this in a
//! mutex and drives it from timers and RPCs.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Role of a node in the current term
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Follower => write!(f, "follower"),
            Role::Candidate => write!(f, "candidate"),
            Role::Leader => write!(f, "leader"),
        }
    }
}

/// Outcome of a vote request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoteDecision {
    pub granted: bool,
    /// Responder's term after handling the request
    pub term: u64,
}

/// Outcome of a heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatDecision {
    pub accepted: bool,
    /// Receiver's term after handling the heartbeat
    pub term: u64,
}

#[derive(Debug, Clone)]
pub struct ElectionState {
    pub node_id: String,
    pub current_term: u64,
    pub voted_for: Option<String>,
    pub role: Role,
    pub current_leader: Option<String>,
    /// Inactive nodes neither vote nor lead
    pub active: bool,
    votes_received: HashSet<String>,
}

impl ElectionState {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            current_term: 0,
            voted_for: None,
            role: Role::Follower,
            current_leader: None,
            active: false,
            votes_received: HashSet::new(),
        }
    }

    /// Resume from a persisted term and vote
    pub fn restore(node_id: impl Into<String>, term: u64, voted_for: Option<String>) -> Self {
        Self {
            current_term: term,
            voted_for,
            ..Self::new(node_id)
        }
    }

    /// Returns false if already active
    pub fn activate(&mut self) -> bool {
        if self.active {
            return false;
        }
        self.active = true;
        self.role = Role::Follower;
        self.current_leader = None;
        self.votes_received.clear();
        true
    }

    /// Returns false if already inactive
    pub fn deactivate(&mut self) -> bool {
        if !self.active {
            return false;
        }
        self.active = false;
        self.role = Role::Follower;
        self.current_leader = None;
        self.votes_received.clear();
        true
    }

    pub fn become_follower(&mut self, term: u64, leader: Option<String>) {
        if term > self.current_term {
            self.voted_for = None;
        }
        if self.role != Role::Follower || term != self.current_term {
            tracing::info!(
                "Node {} transitioning to Follower (term: {})",
                self.node_id,
                term
            );
        }
        self.role = Role::Follower;
        self.current_term = term;
        self.current_leader = leader;
        self.votes_received.clear();
    }

    /// Start a new election: bump the term and vote for ourselves.
    /// Returns the new term.
    pub fn become_candidate(&mut self) -> u64 {
        self.current_term += 1;
        self.role = Role::Candidate;
        self.voted_for = Some(self.node_id.clone());
        self.current_leader = None;
        self.votes_received.clear();
        self.votes_received.insert(self.node_id.clone());

        tracing::info!(
            "Node {} transitioning to Candidate (term: {})",
            self.node_id,
            self.current_term
        );
        self.current_term
    }

    /// Only a candidate still in `term` can win
    pub fn become_leader(&mut self, term: u64) -> bool {
        if self.role != Role::Candidate || self.current_term != term {
            return false;
        }
        tracing::info!(
            "Node {} transitioning to Leader (term: {})",
            self.node_id,
            self.current_term
        );
        self.role = Role::Leader;
        self.current_leader = Some(self.node_id.clone());
        self.votes_received.clear();
        true
    }

    /// Record a granted vote for the election in `term`
    pub fn add_vote(&mut self, from: impl Into<String>, term: u64) -> bool {
        if self.role != Role::Candidate || self.current_term != term {
            return false;
        }
        self.votes_received.insert(from.into())
    }

    /// Votes strictly greater than half the cluster
    pub fn has_majority(&self, cluster_size: usize) -> bool {
        self.votes_received.len() > cluster_size / 2
    }

    pub fn votes(&self) -> usize {
        self.votes_received.len()
    }

    /// Give up the election in `term`. The self-vote stands for that term.
    pub fn lose_election(&mut self, term: u64) {
        if self.role == Role::Candidate && self.current_term == term {
            tracing::info!(
                "Node {} lost election for term {} ({} votes)",
                self.node_id,
                term,
                self.votes_received.len()
            );
            self.role = Role::Follower;
            self.votes_received.clear();
        }
    }

    /// Step down if `term` is newer than ours. Returns true if it was.
    pub fn observe_term(&mut self, term: u64) -> bool {
        if term > self.current_term {
            tracing::info!(
                "Node {} updating term from {} to {}",
                self.node_id,
                self.current_term,
                term
            );
            self.become_follower(term, None);
            true
        } else {
            false
        }
    }

    pub fn handle_vote_request(&mut self, candidate: &str, term: u64) -> VoteDecision {
        if !self.active {
            return VoteDecision {
                granted: false,
                term: self.current_term,
            };
        }

        self.observe_term(term);

        let granted = term == self.current_term
            && match &self.voted_for {
                None => true,
                Some(voted) => voted == candidate,
            };

        if granted {
            self.voted_for = Some(candidate.to_string());
            tracing::debug!(
                "Node {} granted vote to {} for term {}",
                self.node_id,
                candidate,
                term
            );
        }

        VoteDecision {
            granted,
            term: self.current_term,
        }
    }

    pub fn handle_heartbeat(&mut self, leader: &str, term: u64) -> HeartbeatDecision {
        if !self.active || term < self.current_term {
            return HeartbeatDecision {
                accepted: false,
                term: self.current_term,
            };
        }

        if self.current_leader.as_deref() != Some(leader) || term != self.current_term {
            tracing::info!(
                "Node {} following leader {} (term: {})",
                self.node_id,
                leader,
                term
            );
        }
        self.become_follower(term, Some(leader.to_string()));
        self.voted_for = Some(leader.to_string());

        HeartbeatDecision {
            accepted: true,
            term: self.current_term,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    pub fn is_candidate(&self) -> bool {
        self.role == Role::Candidate
    }

    pub fn is_follower(&self) -> bool {
        self.role == Role::Follower
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active(id: &str) -> ElectionState {
        let mut state = ElectionState::new(id);
        state.activate();
        state
    }

    #[test]
    fn test_candidate_wins_with_majority() {
        let mut state = active("n1");
        let term = state.become_candidate();
        assert_eq!(term, 1);
        assert!(!state.has_majority(3));

        assert!(state.add_vote("n2", term));
        assert!(state.has_majority(3));
        assert!(state.become_leader(term));
        assert_eq!(state.current_leader.as_deref(), Some("n1"));
    }

    #[test]
    fn test_one_vote_per_term() {
        let mut state = active("n3");
        assert!(state.handle_vote_request("n1", 1).granted);
        assert!(state.handle_vote_request("n1", 1).granted);
        assert!(!state.handle_vote_request("n2", 1).granted);

        // New term clears the vote
        assert!(state.handle_vote_request("n2", 2).granted);
        assert_eq!(state.current_term, 2);
    }

    #[test]
    fn test_stale_vote_request_denied() {
        let mut state = active("n2");
        state.handle_heartbeat("n1", 5);
        let decision = state.handle_vote_request("n3", 4);
        assert!(!decision.granted);
        assert_eq!(decision.term, 5);
    }

    #[test]
    fn test_higher_term_demotes_leader() {
        let mut state = active("n1");
        let term = state.become_candidate();
        state.add_vote("n2", term);
        state.become_leader(term);

        let decision = state.handle_vote_request("n3", term + 1);
        assert!(decision.granted);
        assert!(state.is_follower());
        assert_eq!(state.voted_for.as_deref(), Some("n3"));
    }

    #[test]
    fn test_failed_candidate_keeps_self_vote() {
        let mut state = active("n1");
        let term = state.become_candidate();
        state.lose_election(term);

        assert!(state.is_follower());
        assert!(!state.handle_vote_request("n2", term).granted);
        assert!(state.handle_vote_request("n2", term + 1).granted);
    }

    #[test]
    fn test_inactive_node_neither_votes_nor_follows() {
        let mut state = ElectionState::new("n1");
        assert!(!state.handle_vote_request("n2", 1).granted);
        assert!(!state.handle_heartbeat("n2", 1).accepted);
        assert_eq!(state.current_term, 0);
    }

    #[test]
    fn test_heartbeat_adopts_leader() {
        let mut state = active("n2");
        let term = state.become_candidate();

        assert!(!state.handle_heartbeat("n1", term - 1).accepted);
        assert!(state.is_candidate());

        assert!(state.handle_heartbeat("n1", term).accepted);
        assert!(state.is_follower());
        assert_eq!(state.current_leader.as_deref(), Some("n1"));
        assert_eq!(state.voted_for.as_deref(), Some("n1"));
    }

    #[test]
    fn test_late_votes_ignored_after_step_down() {
        let mut state = active("n1");
        let term = state.become_candidate();
        state.observe_term(term + 1);
        assert!(!state.add_vote("n2", term));
        assert!(!state.become_leader(term));
    }
}
