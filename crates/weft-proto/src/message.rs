//! The routed mesh message record.
//!
//! A message carries its own trace: `current_route` is the list of nodes it
//! has visited, appended at each forward. Floods use the trace for loop
//! suppression; acks walk it in reverse to find their way back to the
//! original sender.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Adjacency map: node name to its sorted list of neighbor names.
///
/// Topology is always expressed as name-to-names maps, never as node
/// objects holding references to each other, so cyclic graphs stay cheap
/// to copy and compare.
pub type Mesh = HashMap<String, Vec<String>>;

/// Message payload, tagged by command.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    /// Application bytes addressed to a single node.
    Unicast(Vec<u8>),
    /// Application bytes flooded to every reachable node.
    Broadcast(Vec<u8>),
    /// Delivery acknowledgment; the enclosing `id` names the acked message.
    Ack,
    /// The originator's current neighbor list, sorted.
    StateAnnouncement(Vec<String>),
}

impl Payload {
    /// Short command name for log lines.
    pub fn command(&self) -> &'static str {
        match self {
            Payload::Unicast(_) => "unicast",
            Payload::Broadcast(_) => "broadcast",
            Payload::Ack => "ack",
            Payload::StateAnnouncement(_) => "msa",
        }
    }
}

/// A routed mesh message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Originating node name.
    pub source: String,
    /// Target node for unicast and ack traffic; `None` for floods.
    pub destination: Option<String>,
    /// Path traversed so far, appended on each forward.
    pub current_route: Vec<String>,
    /// Per-origin sequence number, assigned at origination.
    pub id: u64,
    /// Remaining hop budget. Ignored by state announcements.
    pub ttl: i32,
    /// Command-tagged payload.
    pub payload: Payload,
}

impl Message {
    /// A unicast from `source` to `destination` with a fresh trace.
    pub fn unicast(
        source: impl Into<String>,
        destination: impl Into<String>,
        id: u64,
        ttl: i32,
        body: Vec<u8>,
    ) -> Self {
        let source = source.into();
        Self {
            current_route: vec![source.clone()],
            source,
            destination: Some(destination.into()),
            id,
            ttl,
            payload: Payload::Unicast(body),
        }
    }

    /// A broadcast from `source` with a fresh trace.
    pub fn broadcast(source: impl Into<String>, id: u64, ttl: i32, body: Vec<u8>) -> Self {
        let source = source.into();
        Self {
            current_route: vec![source.clone()],
            source,
            destination: None,
            id,
            ttl,
            payload: Payload::Broadcast(body),
        }
    }

    /// A state announcement from `source` carrying its neighbor list.
    pub fn state_announcement(source: impl Into<String>, id: u64, neighbors: Vec<String>) -> Self {
        let source = source.into();
        Self {
            current_route: vec![source.clone()],
            source,
            destination: None,
            id,
            ttl: 0,
            payload: Payload::StateAnnouncement(neighbors),
        }
    }

    /// The ack for a delivered unicast: addressed to the sender, echoing the
    /// message id, with the inbound trace reversed as the return plan. The
    /// hop budget is sized to the plan.
    pub fn ack_for(delivered: &Message, acker: impl Into<String>) -> Self {
        let mut route: Vec<String> = delivered.current_route.clone();
        route.reverse();
        Self {
            source: acker.into(),
            destination: Some(delivered.source.clone()),
            ttl: route.len() as i32,
            current_route: route,
            id: delivered.id,
            payload: Payload::Ack,
        }
    }

    /// Record `hop` on the trace unless it is already the latest entry.
    pub fn note_hop(&mut self, hop: &str) {
        if self.current_route.last().map(String::as_str) != Some(hop) {
            self.current_route.push(hop.to_string());
        }
    }

    /// True if `name` appears anywhere on the trace.
    pub fn visited(&self, name: &str) -> bool {
        self.current_route.iter().any(|h| h == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_round_trips_through_json() {
        let messages = vec![
            Message::unicast("a", "c", 7, 3, b"hello".to_vec()),
            Message::broadcast("a", 8, 4, vec![0, 1, 2, 255]),
            Message::state_announcement("b", 1, vec!["a".into(), "c".into()]),
        ];
        for m in messages {
            let bytes = serde_json::to_vec(&m).unwrap();
            let back: Message = serde_json::from_slice(&bytes).unwrap();
            assert_eq!(m, back);
        }
    }

    #[test]
    fn ack_reverses_the_trace_and_echoes_the_id() {
        let mut m = Message::unicast("a", "c", 42, 8, vec![1]);
        m.note_hop("b");

        let ack = Message::ack_for(&m, "c");
        assert_eq!(ack.source, "c");
        assert_eq!(ack.destination.as_deref(), Some("a"));
        assert_eq!(ack.id, 42);
        assert_eq!(ack.current_route, vec!["b".to_string(), "a".to_string()]);
        assert_eq!(ack.ttl, 2);
        assert_eq!(ack.payload, Payload::Ack);
    }

    #[test]
    fn note_hop_skips_consecutive_duplicates() {
        let mut m = Message::broadcast("a", 1, 4, vec![]);
        m.note_hop("a");
        assert_eq!(m.current_route, vec!["a".to_string()]);
        m.note_hop("b");
        m.note_hop("b");
        assert_eq!(m.current_route, vec!["a".to_string(), "b".to_string()]);
        assert!(m.visited("a"));
        assert!(m.visited("b"));
        assert!(!m.visited("c"));
    }
}
