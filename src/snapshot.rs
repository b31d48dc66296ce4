//! Immutable, point-in-time views of the tree for renderers.
//!
//! A [`NodeSnapshot`] owns a deep copy of a subtree: structure, each node's own
//! numbers, its aggregate and its timing. Renderers can read it at their own pace
//! without holding any lock, and derived metrics such as ETA and throughput are
//! computed from the copy.
//!
//! Removed nodes are kept in snapshots (with [`NodeState::Removed`]) until the tree
//! is pruned, so a renderer can show what was cancelled. They never contribute to
//! their ancestors' aggregates.

use std::time::Duration;

use compact_str::CompactString;
use serde::{Deserialize, Serialize};

use crate::{
    error::{ProgressError, Result},
    node::{Aggregate, NodeId, NodeState, ProgressNode, Total},
    tree::ProgressTree,
};

/// A plain-data copy of one node and its subtree.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    id: NodeId,
    label: CompactString,
    state: NodeState,

    total: Total,
    completed: u64,
    failed: u64,

    aggregate: Aggregate,
    elapsed: Duration,

    children: Vec<NodeSnapshot>,
}

impl NodeSnapshot {
    /// The node's id.
    #[must_use]
    pub const fn id(&self) -> NodeId {
        self.id
    }

    /// The node's label.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// The lifecycle state at snapshot time.
    #[must_use]
    pub const fn state(&self) -> NodeState {
        self.state
    }

    /// The node's own total.
    #[must_use]
    pub const fn total(&self) -> Total {
        self.total
    }

    /// Units completed on the node itself.
    #[must_use]
    pub const fn completed(&self) -> u64 {
        self.completed
    }

    /// Units failed on the node itself.
    #[must_use]
    pub const fn failed(&self) -> u64 {
        self.failed
    }

    /// The aggregate over the node's live subtree.
    #[must_use]
    pub const fn aggregate(&self) -> Aggregate {
        self.aggregate
    }

    /// Time the node has been (or was) active.
    #[must_use]
    pub const fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Child snapshots in insertion order, removed children included.
    #[must_use]
    pub fn children(&self) -> &[Self] {
        &self.children
    }

    /// Finds a node anywhere in this subtree.
    #[must_use]
    pub fn find(&self, id: NodeId) -> Option<&Self> {
        if self.id == id {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(id))
    }

    /// Depth-first listing of the subtree with each node's depth (0 for `self`).
    ///
    /// Convenient for renderers drawing an indented list.
    #[must_use]
    pub fn flatten(&self) -> Vec<(usize, &Self)> {
        let mut out = Vec::new();
        let mut stack = vec![(0usize, self)];
        while let Some((depth, node)) = stack.pop() {
            out.push((depth, node));
            stack.extend(node.children.iter().rev().map(|child| (depth + 1, child)));
        }
        out
    }

    /// Estimates the time remaining from the average rate since creation.
    ///
    /// Returns `None` if:
    /// * Nothing has completed yet.
    /// * The aggregate total is unknown, or already settled.
    /// * Elapsed time is effectively zero.
    #[allow(clippy::cast_precision_loss)]
    #[must_use]
    pub fn eta(&self) -> Option<Duration> {
        if self.aggregate.completed == 0 || self.aggregate.is_settled() {
            return None;
        }
        let remaining = self.aggregate.remaining()?;

        let secs = self.elapsed.as_secs_f64();
        if secs <= 1e-6 {
            return None;
        }

        let rate = self.aggregate.completed as f64 / secs;
        Some(Duration::from_secs_f64(remaining as f64 / rate))
    }

    /// Average completed units per second over the node's lifetime.
    #[allow(clippy::cast_precision_loss)]
    #[must_use]
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.aggregate.completed as f64 / secs
        } else {
            0.0
        }
    }

    /// Completed units per second relative to an earlier snapshot of the same node.
    #[allow(clippy::cast_precision_loss)]
    #[must_use]
    pub fn throughput_since(&self, prev: &Self) -> f64 {
        let done = self.aggregate.completed.saturating_sub(prev.aggregate.completed) as f64;
        let secs = self.elapsed.as_secs_f64() - prev.elapsed.as_secs_f64();

        if secs > 0.0 { done / secs } else { 0.0 }
    }
}

/// Snapshots of every root of a tree.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct TreeSnapshot(pub Vec<NodeSnapshot>);

impl TreeSnapshot {
    /// Sum of the aggregates of all live roots.
    #[must_use]
    pub fn aggregate(&self) -> Aggregate {
        self.0
            .iter()
            .filter(|root| root.state != NodeState::Removed)
            .map(NodeSnapshot::aggregate)
            .sum()
    }

    /// Finds a node anywhere in the forest.
    #[must_use]
    pub fn find(&self, id: NodeId) -> Option<&NodeSnapshot> {
        self.0.iter().find_map(|root| root.find(id))
    }

    /// `true` if every live root has settled.
    #[must_use]
    pub fn is_all_settled(&self) -> bool {
        self.0
            .iter()
            .filter(|root| root.state != NodeState::Removed)
            .all(|root| root.aggregate.is_settled())
    }
}

impl ProgressTree {
    /// Copies the subtree rooted at `id` into an owned [`NodeSnapshot`].
    ///
    /// # Errors
    ///
    /// [`ProgressError::UnknownNode`] if the id was never added or has been pruned.
    pub fn snapshot(&self, id: NodeId) -> Result<NodeSnapshot> {
        self.node(id)
            .map(|node| self.capture(node))
            .ok_or(ProgressError::UnknownNode(id))
    }

    /// Copies every root into a [`TreeSnapshot`].
    #[must_use]
    pub fn snapshot_all(&self) -> TreeSnapshot {
        TreeSnapshot(
            self.roots()
                .iter()
                .filter_map(|root| self.node(*root))
                .map(|node| self.capture(node))
                .collect(),
        )
    }

    fn capture(&self, node: &ProgressNode) -> NodeSnapshot {
        NodeSnapshot {
            id: node.id(),
            label: node.label.clone(),
            state: node.state(),
            total: node.total(),
            completed: node.completed(),
            failed: node.failed(),
            aggregate: self.compute(node.id()),
            elapsed: node.elapsed(),
            children: node
                .children()
                .iter()
                .filter_map(|child| self.node(*child))
                .map(|child| self.capture(child))
                .collect(),
        }
    }
}
