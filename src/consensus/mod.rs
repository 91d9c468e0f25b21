//! Leader election
//!
//! One leader per term, elected by majority vote with randomized timeouts and
//! kept in place by heartbeats. The same leadership signal drives routing.

pub mod membership;
pub mod raft_node;
pub mod state;
pub mod term_store;
pub mod transport;

pub use membership::{ClusterMembership, ClusterView, MembershipProvider};
pub use raft_node::{Leadership, RaftNode};
pub use state::{ElectionState, Role};
pub use term_store::TermStore;
pub use transport::{
    ElectionTransport, Heartbeat, HeartbeatReply, LocalNetwork, TcpTransport, VoteReply,
};
