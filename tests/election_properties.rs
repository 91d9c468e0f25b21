//! Property tests for the election rules.
//!
//! A handful of `ElectionState`s exchange vote requests, vote replies and
//! heartbeats through a shared message pool. The strategy picks which node
//! times out, which message is delivered or lost, and when nodes stop or
//! restart. Whatever the interleaving, no term ever has two leaders and no
//! node's term goes backwards.

use payledger::consensus::ElectionState;
use proptest::prelude::*;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone)]
enum Message {
    VoteRequest {
        from: usize,
        to: usize,
        term: u64,
    },
    VoteReply {
        from: usize,
        to: usize,
        election_term: u64,
        granted: bool,
        term: u64,
    },
    Heartbeat {
        from: usize,
        to: usize,
        term: u64,
    },
}

#[derive(Debug, Clone)]
enum Step {
    Timeout(usize),
    Heartbeats(usize),
    Deliver(usize),
    Lose(usize),
    Toggle(usize),
}

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        2 => any::<usize>().prop_map(Step::Timeout),
        2 => any::<usize>().prop_map(Step::Heartbeats),
        8 => any::<usize>().prop_map(Step::Deliver),
        1 => any::<usize>().prop_map(Step::Lose),
        1 => any::<usize>().prop_map(Step::Toggle),
    ]
}

struct Sim {
    nodes: Vec<ElectionState>,
    pool: Vec<Message>,
    leaders: HashMap<u64, HashSet<usize>>,
}

impl Sim {
    fn new(size: usize) -> Self {
        let nodes = (0..size)
            .map(|i| {
                let mut state = ElectionState::new(format!("n{i}"));
                state.activate();
                state
            })
            .collect();
        Self {
            nodes,
            pool: Vec::new(),
            leaders: HashMap::new(),
        }
    }

    fn size(&self) -> usize {
        self.nodes.len()
    }

    fn apply(&mut self, step: Step) {
        let n = self.size();
        match step {
            Step::Timeout(i) => {
                let i = i % n;
                let node = &mut self.nodes[i];
                if node.active && !node.is_leader() {
                    let term = node.become_candidate();
                    for to in (0..n).filter(|&to| to != i) {
                        self.pool.push(Message::VoteRequest { from: i, to, term });
                    }
                    self.try_win(i, term);
                }
            }
            Step::Heartbeats(i) => {
                let i = i % n;
                if self.nodes[i].active && self.nodes[i].is_leader() {
                    let term = self.nodes[i].current_term;
                    for to in (0..n).filter(|&to| to != i) {
                        self.pool.push(Message::Heartbeat { from: i, to, term });
                    }
                }
            }
            Step::Deliver(k) => {
                if !self.pool.is_empty() {
                    let message = self.pool.swap_remove(k % self.pool.len());
                    self.deliver(message);
                }
            }
            Step::Lose(k) => {
                if !self.pool.is_empty() {
                    self.pool.swap_remove(k % self.pool.len());
                }
            }
            Step::Toggle(i) => {
                let node = &mut self.nodes[i % n];
                if node.active {
                    node.deactivate();
                } else {
                    node.activate();
                }
            }
        }
    }

    fn deliver(&mut self, message: Message) {
        match message {
            Message::VoteRequest { from, to, term } => {
                let candidate = self.nodes[from].node_id.clone();
                let decision = self.nodes[to].handle_vote_request(&candidate, term);
                self.pool.push(Message::VoteReply {
                    from: to,
                    to: from,
                    election_term: term,
                    granted: decision.granted,
                    term: decision.term,
                });
            }
            Message::VoteReply {
                from,
                to,
                election_term,
                granted,
                term,
            } => {
                if !self.nodes[to].active {
                    return;
                }
                if self.nodes[to].observe_term(term) {
                    return;
                }
                if granted {
                    let voter = self.nodes[from].node_id.clone();
                    self.nodes[to].add_vote(voter, election_term);
                    self.try_win(to, election_term);
                }
            }
            Message::Heartbeat { from, to, term } => {
                let leader = self.nodes[from].node_id.clone();
                let decision = self.nodes[to].handle_heartbeat(&leader, term);
                if !decision.accepted && self.nodes[from].active {
                    self.nodes[from].observe_term(decision.term);
                }
            }
        }
    }

    fn try_win(&mut self, i: usize, term: u64) {
        let size = self.size();
        let node = &mut self.nodes[i];
        if node.has_majority(size) && node.become_leader(term) {
            self.leaders.entry(term).or_default().insert(i);
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn prop_at_most_one_leader_per_term(
        size in 2usize..=5,
        steps in prop::collection::vec(step_strategy(), 1..300),
    ) {
        let mut sim = Sim::new(size);
        let mut last_terms = vec![0u64; size];

        for step in steps {
            sim.apply(step);

            for (i, node) in sim.nodes.iter().enumerate() {
                prop_assert!(
                    node.current_term >= last_terms[i],
                    "n{} went from term {} to {}",
                    i,
                    last_terms[i],
                    node.current_term
                );
                last_terms[i] = node.current_term;
            }
            for (term, winners) in &sim.leaders {
                prop_assert!(
                    winners.len() <= 1,
                    "term {} had leaders {:?}",
                    term,
                    winners
                );
            }
        }
    }

    #[test]
    fn prop_leader_role_matches_recorded_win(
        size in 2usize..=5,
        steps in prop::collection::vec(step_strategy(), 1..200),
    ) {
        let mut sim = Sim::new(size);
        for step in steps {
            sim.apply(step);
        }

        for (i, node) in sim.nodes.iter().enumerate() {
            if node.is_leader() {
                let winners = sim.leaders.get(&node.current_term);
                prop_assert!(winners.map_or(false, |w| w.contains(&i)));
                prop_assert_eq!(node.current_leader.as_deref(), Some(node.node_id.as_str()));
            }
        }
    }
}

#[test]
fn test_split_vote_elects_nobody() {
    let mut sim = Sim::new(4);
    // Two candidates in the same term each get one other vote
    sim.apply(Step::Timeout(0));
    sim.apply(Step::Timeout(1));
    sim.pool.clear();

    let d = sim.nodes[2].handle_vote_request("n0", 1);
    assert!(d.granted);
    sim.nodes[0].add_vote("n2", 1);
    let d = sim.nodes[3].handle_vote_request("n1", 1);
    assert!(d.granted);
    sim.nodes[1].add_vote("n3", 1);

    assert!(!sim.nodes[0].has_majority(4));
    assert!(!sim.nodes[1].has_majority(4));
    assert!(sim.leaders.is_empty());
}
