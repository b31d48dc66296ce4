//! The node arena and the aggregation algorithm.
//!
//! [`ProgressTree`] is the single authority over structure and numbers. It is a
//! plain single-owner data structure: every mutation takes `&mut self`, and
//! concurrent access is arranged from the outside (see [`tracker`](crate::tracker)).
//!
//! # Aggregation
//!
//! Each node memoizes its [`Aggregate`] together with a dirty bit. Any mutation
//! marks the node and its ancestors dirty, stopping at the first ancestor that is
//! already dirty: a dirty node always has dirty ancestors, so the rest of the
//! chain is known to be invalid already. Reads recompute only the dirty part of
//! the requested subtree.
//!
//! A node with at least one live child aggregates its children; a node without
//! live children is a leaf-unit counter and aggregates its own numbers. Unknown
//! totals are contagious upward, removed subtrees are excluded entirely.

use std::{
    collections::{HashMap, HashSet},
    fmt,
};

use compact_str::CompactString;
use tracing::{debug, trace};

use crate::{
    error::{ProgressError, Result},
    event::{Event, EventOp},
    node::{Aggregate, NodeId, NodeState, ProducerId, ProgressNode, Total},
};

/// Result of applying an [`Event`] to the tree.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ApplyOutcome {
    /// The event changed (or was checked against) the tree.
    Applied,
    /// The `(producer, sequence)` pair was already seen; the tree is untouched.
    Duplicate,
}

/// An arena of [`ProgressNode`]s addressed by stable [`NodeId`]s.
#[derive(Clone, Default)]
pub struct ProgressTree {
    nodes: HashMap<NodeId, ProgressNode>,
    roots: Vec<NodeId>,
    next_local: u64,
    // Highest sequence number applied per producer.
    watermarks: HashMap<ProducerId, u64>,
}

impl fmt::Debug for ProgressTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressTree")
            .field("nodes", &self.nodes.len())
            .field("roots", &self.roots.len())
            .field("producers", &self.watermarks.len())
            .finish()
    }
}

impl ProgressTree {
    /// Creates an empty tree.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Structure
    // ========================================================================

    /// Adds a node under `parent` (or as a new root) and returns its id.
    ///
    /// # Errors
    ///
    /// [`ProgressError::UnknownParent`] if `parent` is not an active node.
    pub fn add_node(
        &mut self,
        parent: Option<NodeId>,
        total: Total,
        label: impl Into<CompactString>,
    ) -> Result<NodeId> {
        let mut local = self.next_local + 1;
        while self.nodes.contains_key(&NodeId::new(ProducerId::OWNER, local)) {
            local += 1;
        }
        let id = NodeId::new(ProducerId::OWNER, local);
        self.insert(id, parent, total, label.into())?;
        self.next_local = local;
        Ok(id)
    }

    /// Inserts a node whose id was minted by a producer.
    pub(crate) fn insert(
        &mut self,
        id: NodeId,
        parent: Option<NodeId>,
        total: Total,
        label: CompactString,
    ) -> Result<()> {
        if self.nodes.contains_key(&id) {
            return Err(ProgressError::DuplicateNode(id));
        }
        if let Some(parent) = parent {
            match self.nodes.get(&parent) {
                Some(node) if node.state == NodeState::Active => {}
                _ => return Err(ProgressError::UnknownParent(parent)),
            }
        }

        debug!(node = %id, ?parent, %total, %label, "add_node");
        self.nodes
            .insert(id, ProgressNode::new(id, parent, total, label));

        match parent {
            Some(parent) => {
                if let Some(node) = self.nodes.get_mut(&parent) {
                    node.children.push(id);
                }
                self.invalidate(parent);
            }
            None => self.roots.push(id),
        }
        Ok(())
    }

    /// Removes a node (and its whole subtree) from aggregation.
    ///
    /// The removed nodes keep their final numbers, visible in snapshots, until
    /// [`prune`](Self::prune) frees them. Removing an already removed node is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// [`ProgressError::UnknownNode`] if the id was never added or has been pruned.
    pub fn remove_node(&mut self, id: NodeId) -> Result<()> {
        let parent = match self.nodes.get(&id) {
            None => return Err(ProgressError::UnknownNode(id)),
            Some(node) if !node.is_live() => return Ok(()),
            Some(node) => node.parent,
        };

        // Freeze the subtree's aggregate before it stops being maintained.
        let frozen = self.recompute(id);

        let mut retired = 0usize;
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.nodes.get_mut(&current)
                && node.is_live()
            {
                node.retire();
                retired += 1;
                stack.extend(node.children.iter().copied());
            }
        }

        debug!(node = %id, retired, completed = frozen.completed, total = %frozen.total, "remove_node");
        if let Some(parent) = parent {
            self.invalidate(parent);
        }
        Ok(())
    }

    /// Physically frees every removed node and returns how many were freed.
    pub fn prune(&mut self) -> usize {
        let removed: HashSet<NodeId> = self
            .nodes
            .values()
            .filter(|node| !node.is_live())
            .map(ProgressNode::id)
            .collect();

        if removed.is_empty() {
            return 0;
        }

        self.nodes.retain(|id, _| !removed.contains(id));
        self.roots.retain(|id| !removed.contains(id));
        for node in self.nodes.values_mut() {
            node.children.retain(|id| !removed.contains(id));
        }

        debug!(pruned = removed.len(), remaining = self.nodes.len(), "prune");
        removed.len()
    }

    // ========================================================================
    // Quantities
    // ========================================================================

    /// Records `amount` completed units on a node.
    ///
    /// # Errors
    ///
    /// * [`ProgressError::UnknownNode`] if the node is absent or removed.
    /// * [`ProgressError::OverCompletion`] if a known total would be exceeded,
    ///   or the counters would pass `u64::MAX`. The node is left unchanged;
    ///   revise the total first to record more.
    pub fn advance(&mut self, id: NodeId, amount: u64) -> Result<()> {
        let aggregator = self.has_live_children(id);
        let node = self.live_mut(id)?;
        node.check_record(amount)?;
        if amount == 0 {
            return Ok(());
        }
        node.completed += amount;
        node.settle();
        if aggregator {
            debug!(node = %id, amount, "advance: node has live children, own units are not aggregated");
        }
        trace!(node = %id, amount, completed = node.completed, "advance");
        self.invalidate(id);
        Ok(())
    }

    /// Records `amount` failed units on a node.
    ///
    /// # Errors
    ///
    /// Same as [`advance`](Self::advance).
    pub fn mark_failed(&mut self, id: NodeId, amount: u64) -> Result<()> {
        let aggregator = self.has_live_children(id);
        let node = self.live_mut(id)?;
        node.check_record(amount)?;
        if amount == 0 {
            return Ok(());
        }
        node.failed += amount;
        node.settle();
        if aggregator {
            debug!(node = %id, amount, "mark_failed: node has live children, own units are not aggregated");
        }
        trace!(node = %id, amount, failed = node.failed, "mark_failed");
        self.invalidate(id);
        Ok(())
    }

    /// Replaces a node's total.
    ///
    /// Switching to [`Total::Unknown`] is always allowed.
    ///
    /// # Errors
    ///
    /// * [`ProgressError::UnknownNode`] if the node is absent or removed.
    /// * [`ProgressError::InvalidRevision`] if a known total is below
    ///   `completed + failed`.
    pub fn revise_total(&mut self, id: NodeId, total: Total) -> Result<()> {
        let node = self.live_mut(id)?;
        node.check_revision(total)?;
        node.total = total;
        node.settle();
        trace!(node = %id, %total, "revise_total");
        self.invalidate(id);
        Ok(())
    }

    /// Marks a node as done.
    ///
    /// With a known total the remaining units are recorded as completed; with an
    /// unknown total the total becomes the work recorded so far.
    ///
    /// # Errors
    ///
    /// [`ProgressError::UnknownNode`] if the node is absent or removed.
    pub fn complete(&mut self, id: NodeId) -> Result<()> {
        let node = self.live_mut(id)?;
        match node.total {
            Total::Known(total) => node.completed = total.saturating_sub(node.failed),
            Total::Unknown => node.total = Total::Known(node.committed()),
        }
        node.settle();
        trace!(node = %id, completed = node.completed, "complete");
        self.invalidate(id);
        Ok(())
    }

    /// Announces how many children a node is expected to have in the end.
    ///
    /// Only [`estimate`](Self::estimate) uses this number.
    ///
    /// # Errors
    ///
    /// [`ProgressError::UnknownNode`] if the node is absent or removed.
    pub fn set_expected_children(&mut self, id: NodeId, expected: u64) -> Result<()> {
        self.live_mut(id)?.expected_children = Some(expected);
        Ok(())
    }

    // ========================================================================
    // Aggregation
    // ========================================================================

    /// Returns the aggregate of a node, recomputing and caching dirty parts.
    ///
    /// Removed nodes report the aggregate frozen at removal time.
    ///
    /// # Errors
    ///
    /// [`ProgressError::UnknownNode`] if the id was never added or has been pruned.
    pub fn aggregate(&mut self, id: NodeId) -> Result<Aggregate> {
        self.ensure(id)?;
        Ok(self.recompute(id))
    }

    /// Like [`aggregate`](Self::aggregate) but without updating the cache.
    ///
    /// Cheap when the tree has been [`refresh`](Self::refresh)ed since the last
    /// mutation.
    ///
    /// # Errors
    ///
    /// [`ProgressError::UnknownNode`] if the id was never added or has been pruned.
    pub fn peek_aggregate(&self, id: NodeId) -> Result<Aggregate> {
        self.ensure(id)?;
        Ok(self.compute(id))
    }

    /// Recomputes every dirty aggregate.
    pub fn refresh(&mut self) {
        for root in self.roots.clone() {
            self.recompute(root);
        }
    }

    /// Extrapolates the eventual total of a node.
    ///
    /// Leaves estimate to their known total. For a node with live children, the
    /// estimates of the children that have one are scaled up to the number of
    /// children expected (see [`set_expected_children`](Self::set_expected_children),
    /// minus removed ones), or to the live child count if no expectation was set.
    /// Returns `None` while nothing below the node has an estimate.
    ///
    /// # Errors
    ///
    /// [`ProgressError::UnknownNode`] if the id was never added or has been pruned.
    pub fn estimate(&self, id: NodeId) -> Result<Option<u64>> {
        self.ensure(id)?;
        Ok(self.estimate_inner(id))
    }

    fn estimate_inner(&self, id: NodeId) -> Option<u64> {
        let node = self.nodes.get(&id)?;

        let (live, removed): (Vec<NodeId>, Vec<NodeId>) = node
            .children
            .iter()
            .copied()
            .partition(|child| self.nodes.get(child).is_some_and(ProgressNode::is_live));

        if live.is_empty() {
            return node.total.known();
        }

        let estimates: Vec<u64> = live
            .iter()
            .filter_map(|child| self.estimate_inner(*child))
            .collect();
        let n_known = estimates.len() as u64;
        if n_known == 0 {
            return None;
        }

        let n = node
            .expected_children
            .map_or(live.len() as u64, |expected| {
                expected.saturating_sub(removed.len() as u64)
            })
            .max(n_known);

        let sum: u128 = estimates.iter().copied().map(u128::from).sum();
        let scaled = sum * u128::from(n) / u128::from(n_known);
        Some(u64::try_from(scaled).unwrap_or(u64::MAX))
    }

    fn recompute(&mut self, id: NodeId) -> Aggregate {
        let (own, live_children) = match self.nodes.get(&id) {
            None => return Aggregate::EMPTY,
            Some(node) if !node.dirty => return node.cached,
            Some(node) => (node.own_aggregate(), self.live_children(node)),
        };

        let aggregate = if live_children.is_empty() {
            own
        } else {
            live_children
                .into_iter()
                .map(|child| self.recompute(child))
                .sum()
        };

        if let Some(node) = self.nodes.get_mut(&id) {
            node.cached = aggregate;
            node.dirty = false;
        }
        aggregate
    }

    pub(crate) fn compute(&self, id: NodeId) -> Aggregate {
        let Some(node) = self.nodes.get(&id) else {
            return Aggregate::EMPTY;
        };
        if !node.dirty {
            return node.cached;
        }

        let live_children = self.live_children(node);
        if live_children.is_empty() {
            node.own_aggregate()
        } else {
            live_children
                .into_iter()
                .map(|child| self.compute(child))
                .sum()
        }
    }

    fn has_live_children(&self, id: NodeId) -> bool {
        self.nodes.get(&id).is_some_and(|node| {
            node.children
                .iter()
                .any(|child| self.nodes.get(child).is_some_and(ProgressNode::is_live))
        })
    }

    fn live_children(&self, node: &ProgressNode) -> Vec<NodeId> {
        node.children
            .iter()
            .copied()
            .filter(|child| self.nodes.get(child).is_some_and(ProgressNode::is_live))
            .collect()
    }

    fn invalidate(&mut self, id: NodeId) {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let Some(node) = self.nodes.get_mut(&current) else {
                break;
            };
            if node.dirty {
                break;
            }
            node.dirty = true;
            cursor = node.parent;
        }
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Applies an event, skipping `(producer, sequence)` pairs already seen.
    ///
    /// Producers deliver their events in order, so a per-producer high-watermark
    /// is enough to recognise replays. A rejected event still moves the watermark:
    /// replaying it would be rejected the same way.
    ///
    /// # Errors
    ///
    /// Whatever the underlying operation returns.
    pub fn apply(&mut self, event: &Event) -> Result<ApplyOutcome> {
        if event.producer == ProducerId::OWNER {
            return Err(ProgressError::ReservedProducer(event.producer));
        }

        let watermark = self.watermarks.entry(event.producer).or_insert(0);
        if event.sequence <= *watermark {
            trace!(
                producer = %event.producer,
                sequence = event.sequence,
                "apply: duplicate event skipped"
            );
            return Ok(ApplyOutcome::Duplicate);
        }
        *watermark = event.sequence;

        let node = event.node;
        match &event.op {
            EventOp::Create { .. } if node.producer() != event.producer => {
                Err(ProgressError::ForeignNode {
                    producer: event.producer,
                    node,
                })
            }
            EventOp::Create {
                parent,
                total,
                label,
            } => self.insert(node, *parent, *total, label.clone()),
            EventOp::Advance(amount) => self.advance(node, *amount),
            EventOp::Fail(amount) => self.mark_failed(node, *amount),
            EventOp::ReviseTotal(total) => self.revise_total(node, *total),
            EventOp::ExpectChildren(expected) => self.set_expected_children(node, *expected),
            EventOp::Done => self.complete(node),
            EventOp::Remove => self.remove_node(node),
        }?;
        Ok(ApplyOutcome::Applied)
    }

    /// Highest sequence number applied for `producer` (0 if none).
    #[must_use]
    pub fn watermark(&self, producer: ProducerId) -> u64 {
        self.watermarks.get(&producer).copied().unwrap_or(0)
    }

    // ========================================================================
    // Read access
    // ========================================================================

    /// Looks up a node, removed ones included.
    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<&ProgressNode> {
        self.nodes.get(&id)
    }

    /// Root nodes in insertion order.
    #[must_use]
    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    /// Iterates over every node in no particular order.
    pub fn nodes(&self) -> impl Iterator<Item = &ProgressNode> {
        self.nodes.values()
    }

    /// Number of nodes, removed ones included until pruned.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// `true` if the tree holds no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn ensure(&self, id: NodeId) -> Result<()> {
        if self.nodes.contains_key(&id) {
            Ok(())
        } else {
            Err(ProgressError::UnknownNode(id))
        }
    }

    fn live_mut(&mut self, id: NodeId) -> Result<&mut ProgressNode> {
        self.nodes
            .get_mut(&id)
            .filter(|node| node.is_live())
            .ok_or(ProgressError::UnknownNode(id))
    }
}
