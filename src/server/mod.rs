//! TCP front end: line protocol, payment routing and the node server

pub mod node;
pub mod protocol;
pub mod router;

pub use node::{NodeHandle, PaymentNode};
pub use protocol::{NodeStatus, PayReply, ReplicateReply, Request};
pub use router::{PaymentOutcome, PaymentRouter};
