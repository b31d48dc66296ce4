//! Error types shared by the tree, the update channel and the wire transport.

use std::time::Duration;

use thiserror::Error;

use crate::node::{NodeId, ProducerId, Total};

/// Errors produced while mutating a [`ProgressTree`](crate::ProgressTree) or
/// delivering events to it.
#[derive(Debug, Error)]
pub enum ProgressError {
    /// The node does not exist, was pruned, or has been removed.
    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    /// The requested parent does not resolve to an active node.
    #[error("unknown or inactive parent {0}")]
    UnknownParent(NodeId),

    /// A create event reused an id that is already present in the tree.
    #[error("node {0} already exists")]
    DuplicateNode(NodeId),

    /// A create event named a node id minted under another producer.
    #[error("producer {producer} cannot create node {node}")]
    ForeignNode {
        /// The producer that sent the event.
        producer: ProducerId,
        /// The node id it tried to create.
        node: NodeId,
    },

    /// The id is reserved for the tree owner and cannot send events.
    #[error("producer id {0} is reserved for the tree owner")]
    ReservedProducer(ProducerId),

    /// Recording `amount` would push `completed + failed` past a known total, or
    /// past `u64::MAX` for an unknown one.
    #[error(
        "node {node}: recording {amount} more would exceed total {total} (completed {completed}, failed {failed})"
    )]
    OverCompletion {
        /// The node being advanced or failed.
        node: NodeId,
        /// Units the caller tried to record.
        amount: u64,
        /// Completed units before the call.
        completed: u64,
        /// Failed units before the call.
        failed: u64,
        /// The node's known total (`u64::MAX` when the total is unknown).
        total: u64,
    },

    /// A revision would lower the total below work already committed.
    #[error("node {node}: total {requested} is below committed work {committed}")]
    InvalidRevision {
        /// The node being revised.
        node: NodeId,
        /// The rejected total.
        requested: Total,
        /// `completed + failed` at the time of the call.
        committed: u64,
    },

    /// The channel stayed saturated for the whole submit timeout.
    #[error("update channel saturated for {0:?}")]
    Backpressure(Duration),

    /// The tree owner has gone away; no further events can be delivered.
    #[error("update channel closed")]
    ChannelClosed,

    /// Reading or writing the cross-process transport failed.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An event could not be encoded or decoded.
    #[error("event codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl ProgressError {
    /// Returns `true` for errors a producer may recover from by retrying later.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Backpressure(_))
    }

    /// Returns `true` if a failed submission certainly delivered nothing.
    ///
    /// Any other submission error may have left the event (or part of it) in
    /// flight, so the producer must not reuse its sequence number.
    #[must_use]
    pub const fn is_undelivered(&self) -> bool {
        matches!(self, Self::Backpressure(_) | Self::ChannelClosed)
    }

    /// Returns `true` for errors that indicate a programming error in the producer:
    /// it referenced a node or parent that does not exist, or an id it does not own.
    #[must_use]
    pub const fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::UnknownNode(_)
                | Self::UnknownParent(_)
                | Self::DuplicateNode(_)
                | Self::ForeignNode { .. }
                | Self::ReservedProducer(_)
        )
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = ProgressError> = std::result::Result<T, E>;
