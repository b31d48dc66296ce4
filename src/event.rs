//! Progress events exchanged between producers and the tree owner.
//!
//! Every event carries the producer that emitted it and a producer-local sequence
//! number. Together they identify the event uniquely, which is what makes
//! [`ProgressTree::apply`](crate::ProgressTree::apply) safe against duplicated
//! delivery.

use compact_str::CompactString;
use serde::{Deserialize, Serialize};

use crate::node::{NodeId, ProducerId, Total};

/// A single progress event addressed to one node.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// The producer that emitted the event.
    #[serde(rename = "producer_id")]
    pub producer: ProducerId,
    /// Position of the event in the producer's stream, starting at 1.
    #[serde(rename = "sequence_number")]
    pub sequence: u64,
    /// The node the operation applies to.
    #[serde(rename = "node_id")]
    pub node: NodeId,
    /// What to do.
    pub op: EventOp,
}

/// The operation carried by an [`Event`].
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOp {
    /// Create the node under `parent` (or as a root).
    Create {
        /// Parent node, `None` for a root.
        parent: Option<NodeId>,
        /// Initial total.
        total: Total,
        /// Human-readable label.
        label: CompactString,
    },
    /// Add completed units.
    Advance(u64),
    /// Add failed units.
    Fail(u64),
    /// Replace the total.
    ReviseTotal(Total),
    /// Announce how many children the node will eventually have.
    ExpectChildren(u64),
    /// Mark the node as done.
    Done,
    /// Remove the node and its subtree from aggregation.
    Remove,
}

impl EventOp {
    /// Short name used in logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::Advance(_) => "advance",
            Self::Fail(_) => "fail",
            Self::ReviseTotal(_) => "revise_total",
            Self::ExpectChildren(_) => "expect_children",
            Self::Done => "done",
            Self::Remove => "remove",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Event, EventOp};
    use crate::node::{NodeId, ProducerId, Total};

    #[test]
    fn test_event_json_shape() {
        let producer = ProducerId::new(4);
        let event = Event {
            producer,
            sequence: 9,
            node: NodeId::new(producer, 2),
            op: EventOp::Advance(128),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(
            json,
            r#"{"producer_id":4,"sequence_number":9,"node_id":{"producer":4,"local":2},"op":{"advance":128}}"#
        );
    }

    #[test]
    fn test_create_event_decodes() {
        let json = r#"{"producer_id":1,"sequence_number":1,"node_id":{"producer":1,"local":1},"op":{"create":{"parent":null,"total":"unknown","label":"projects"}}}"#;
        let event: Event = serde_json::from_str(json).unwrap();

        assert_eq!(
            event.op,
            EventOp::Create {
                parent: None,
                total: Total::Unknown,
                label: "projects".into(),
            }
        );
        assert_eq!(event.op.name(), "create");
    }
}
