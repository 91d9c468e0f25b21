//! Collaborator notifications (monitoring, admin front-ends)
//!
//! The core only needs fire-and-forget delivery: implementations must never
//! block the calling node.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Capability handed to a node for reporting leadership changes and diagnostics
pub trait ClusterEvents: Send + Sync {
    fn on_leader_elected(&self, node_id: &str, term: u64);

    fn on_log_message(&self, _node_id: &str, _text: &str) {}
}

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEvents;

impl ClusterEvents for NoopEvents {
    fn on_leader_elected(&self, _node_id: &str, _term: u64) {}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClusterEventKind {
    LeaderElected { term: u64 },
    LogMessage { text: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterEvent {
    pub node_id: String,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: ClusterEventKind,
}

/// Buffers events on an unbounded channel; a dropped receiver silently
/// disables delivery.
#[derive(Debug, Clone)]
pub struct ChannelEvents {
    tx: mpsc::UnboundedSender<ClusterEvent>,
}

impl ChannelEvents {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ClusterEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn emit(&self, node_id: &str, kind: ClusterEventKind) {
        let _ = self.tx.send(ClusterEvent {
            node_id: node_id.to_string(),
            at: Utc::now(),
            kind,
        });
    }
}

impl ClusterEvents for ChannelEvents {
    fn on_leader_elected(&self, node_id: &str, term: u64) {
        self.emit(node_id, ClusterEventKind::LeaderElected { term });
    }

    fn on_log_message(&self, node_id: &str, text: &str) {
        self.emit(
            node_id,
            ClusterEventKind::LogMessage {
                text: text.to_string(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_events_buffer_in_order() {
        let (events, mut rx) = ChannelEvents::new();
        events.on_log_message("node-1", "started");
        events.on_leader_elected("node-1", 3);

        let first = rx.try_recv().unwrap();
        assert_eq!(first.node_id, "node-1");
        assert_eq!(
            first.kind,
            ClusterEventKind::LogMessage {
                text: "started".into()
            }
        );
        let second = rx.try_recv().unwrap();
        assert_eq!(second.kind, ClusterEventKind::LeaderElected { term: 3 });
    }

    #[test]
    fn test_dropped_receiver_does_not_panic() {
        let (events, rx) = ChannelEvents::new();
        drop(rx);
        events.on_leader_elected("node-2", 1);
    }

    #[test]
    fn test_event_serializes_flat() {
        let event = ClusterEvent {
            node_id: "node-1".into(),
            at: Utc::now(),
            kind: ClusterEventKind::LeaderElected { term: 5 },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "leader_elected");
        assert_eq!(json["term"], 5);
    }
}
