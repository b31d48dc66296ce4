//! Node-level primitives: identities, totals, lifecycle states and aggregates.
//!
//! A [`ProgressNode`] is pure data plus the invariants that can be checked without
//! looking at the rest of the tree:
//!
//! * `completed + failed <= total` whenever the total is [`Total::Known`].
//! * `completed` and `failed` never decrease.
//! * The lifecycle [`NodeState`] follows from the numbers, except for
//!   [`NodeState::Removed`] which only the tree can assign.
//!
//! Cross-node rules (aggregation, Unknown contagion, removal exclusion) live in
//! [`tree`](crate::tree).

use std::{
    fmt,
    iter::Sum,
    ops::{Add, AddAssign},
    time::Duration,
};

use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use web_time::Instant;

use crate::error::{ProgressError, Result};

/// Upper bound reported by [`Aggregate::fraction`] while the total is still unknown.
///
/// Work that may still grow is never shown as finished.
pub const UNKNOWN_CEILING: f64 = 0.99;

/// Identity of a producer (a thread or process reporting events).
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProducerId(u64);

impl ProducerId {
    /// The id used by the tree owner when it creates nodes directly.
    pub const OWNER: Self = Self(0);

    /// Wraps a raw producer number.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw producer number.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ProducerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable identity of a node.
///
/// Ids are minted by whoever creates the node: the producer id plus a number local
/// to that producer. Remote producers can therefore address a node they just
/// created without waiting for the owner to answer.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct NodeId {
    producer: ProducerId,
    local: u64,
}

impl NodeId {
    /// Builds an id from its two halves.
    #[must_use]
    pub const fn new(producer: ProducerId, local: u64) -> Self {
        Self { producer, local }
    }

    /// The producer that minted this id.
    #[must_use]
    pub const fn producer(self) -> ProducerId {
        self.producer
    }

    /// The producer-local part of the id.
    #[must_use]
    pub const fn local(self) -> u64 {
        self.local
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.producer, self.local)
    }
}

/// The expected amount of work of a node.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Total {
    /// The full amount of work is known.
    Known(u64),
    /// More work may still be discovered.
    Unknown,
}

impl Total {
    /// Returns `true` if the total is [`Total::Known`].
    #[must_use]
    pub const fn is_known(self) -> bool {
        matches!(self, Self::Known(_))
    }

    /// Returns the known amount, if any.
    #[must_use]
    pub const fn known(self) -> Option<u64> {
        match self {
            Self::Known(total) => Some(total),
            Self::Unknown => None,
        }
    }
}

impl From<Option<u64>> for Total {
    fn from(value: Option<u64>) -> Self {
        value.map_or(Self::Unknown, Self::Known)
    }
}

impl From<u64> for Total {
    fn from(value: u64) -> Self {
        Self::Known(value)
    }
}

impl Add for Total {
    type Output = Self;

    /// Unknown is contagious: the sum is known only if both sides are.
    fn add(self, rhs: Self) -> Self {
        match (self, rhs) {
            (Self::Known(a), Self::Known(b)) => Self::Known(a.saturating_add(b)),
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for Total {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Known(total) => write!(f, "{total}"),
            Self::Unknown => f.write_str("unknown"),
        }
    }
}

/// Lifecycle tag of a node.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// Work is still outstanding (or the total is unknown).
    #[default]
    Active,
    /// `completed == total`.
    Completed,
    /// `completed + failed == total` with at least one failed unit.
    Failed,
    /// Excluded from aggregation; numbers are frozen until pruned.
    Removed,
}

/// Recursively aggregated figures for a node and its live descendants.
///
/// Aggregates form a commutative monoid under `+` with [`Aggregate::EMPTY`] as the
/// identity, so a parent's aggregate never depends on the order or grouping of its
/// children.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    /// Units completed anywhere in the subtree, including under unknown totals.
    pub completed: u64,
    /// Units that will never complete.
    pub failed: u64,
    /// Known only if every live leaf of the subtree has a known total.
    pub total: Total,
    /// Sum of the known leaf totals.
    pub known_total: u64,
    /// Units completed under leaves whose total is known.
    pub known_completed: u64,
}

impl Aggregate {
    /// The identity element: no work, nothing done.
    pub const EMPTY: Self = Self {
        completed: 0,
        failed: 0,
        total: Total::Known(0),
        known_total: 0,
        known_completed: 0,
    };

    /// Aggregate of a single leaf-unit counter.
    #[must_use]
    pub const fn leaf(total: Total, completed: u64, failed: u64) -> Self {
        match total {
            Total::Known(known) => Self {
                completed,
                failed,
                total,
                known_total: known,
                known_completed: completed,
            },
            Total::Unknown => Self {
                completed,
                failed,
                total,
                known_total: 0,
                known_completed: 0,
            },
        }
    }

    /// Completed fraction in `0.0..=1.0`.
    ///
    /// Unknown parts of the subtree are left out of the denominator, and while the
    /// total is unknown the result never exceeds [`UNKNOWN_CEILING`]. Returns `None`
    /// if nothing in the subtree has a known total yet.
    #[allow(clippy::cast_precision_loss)]
    #[must_use]
    pub fn fraction(&self) -> Option<f64> {
        match self.total {
            Total::Known(0) => Some(1.0),
            Total::Known(total) => Some(self.completed as f64 / total as f64),
            Total::Unknown if self.known_total == 0 => None,
            Total::Unknown => Some(
                (self.known_completed as f64 / self.known_total as f64).min(UNKNOWN_CEILING),
            ),
        }
    }

    /// [`fraction`](Self::fraction) scaled to `0.0..=100.0`.
    #[must_use]
    pub fn percent(&self) -> Option<f64> {
        self.fraction().map(|f| f * 100.0)
    }

    /// `true` once every unit of a known total has completed successfully.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        matches!(self.total, Total::Known(total) if self.completed == total)
    }

    /// `true` once every unit of a known total is either completed or failed.
    #[must_use]
    pub const fn is_settled(&self) -> bool {
        matches!(self.total, Total::Known(total) if self.completed.saturating_add(self.failed) == total)
    }

    /// Units neither completed nor failed, if the total is known.
    #[must_use]
    pub const fn remaining(&self) -> Option<u64> {
        match self.total {
            Total::Known(total) => Some(total.saturating_sub(self.completed.saturating_add(self.failed))),
            Total::Unknown => None,
        }
    }
}

impl Default for Aggregate {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl Add for Aggregate {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            completed: self.completed.saturating_add(rhs.completed),
            failed: self.failed.saturating_add(rhs.failed),
            total: self.total + rhs.total,
            known_total: self.known_total.saturating_add(rhs.known_total),
            known_completed: self.known_completed.saturating_add(rhs.known_completed),
        }
    }
}

impl AddAssign for Aggregate {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sum for Aggregate {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::EMPTY, Add::add)
    }
}

/// A single unit of work in the hierarchy.
///
/// Nodes are owned by a [`ProgressTree`](crate::ProgressTree); callers only ever see
/// shared references through [`ProgressTree::node`](crate::ProgressTree::node).
#[derive(Clone, Debug)]
pub struct ProgressNode {
    pub(crate) id: NodeId,
    pub(crate) label: CompactString,
    pub(crate) parent: Option<NodeId>,
    pub(crate) children: Vec<NodeId>,

    pub(crate) total: Total,
    pub(crate) completed: u64,
    pub(crate) failed: u64,
    pub(crate) state: NodeState,
    pub(crate) expected_children: Option<u64>,

    pub(crate) started: Instant,
    pub(crate) stopped: Option<Instant>,

    // Memoized aggregate, valid only while `dirty` is false.
    pub(crate) dirty: bool,
    pub(crate) cached: Aggregate,
}

impl ProgressNode {
    pub(crate) fn new(
        id: NodeId,
        parent: Option<NodeId>,
        total: Total,
        label: CompactString,
    ) -> Self {
        let mut node = Self {
            id,
            label,
            parent,
            children: Vec::new(),
            total,
            completed: 0,
            failed: 0,
            state: NodeState::Active,
            expected_children: None,
            started: Instant::now(),
            stopped: None,
            dirty: true,
            cached: Aggregate::EMPTY,
        };
        node.settle();
        node
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// The node's id.
    #[must_use]
    pub const fn id(&self) -> NodeId {
        self.id
    }

    /// The human-readable label.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// The parent, or `None` for a root.
    #[must_use]
    pub const fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// Children in insertion order, including removed ones that were not pruned yet.
    #[must_use]
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    /// The node's own total.
    #[must_use]
    pub const fn total(&self) -> Total {
        self.total
    }

    /// Units completed on this node itself.
    #[must_use]
    pub const fn completed(&self) -> u64 {
        self.completed
    }

    /// Units failed on this node itself.
    #[must_use]
    pub const fn failed(&self) -> u64 {
        self.failed
    }

    /// `completed + failed`.
    #[must_use]
    pub const fn committed(&self) -> u64 {
        self.completed.saturating_add(self.failed)
    }

    /// The lifecycle state.
    #[must_use]
    pub const fn state(&self) -> NodeState {
        self.state
    }

    /// How many children the caller announced, if any.
    #[must_use]
    pub const fn expected_children(&self) -> Option<u64> {
        self.expected_children
    }

    /// `true` unless the node has been removed.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.state != NodeState::Removed
    }

    /// The node's own numbers as an aggregate, ignoring children.
    #[must_use]
    pub const fn own_aggregate(&self) -> Aggregate {
        Aggregate::leaf(self.total, self.completed, self.failed)
    }

    /// Time since creation, or between creation and the moment the node stopped
    /// being active.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.stopped.map_or_else(
            || self.started.elapsed(),
            |stopped| stopped.duration_since(self.started),
        )
    }

    // ========================================================================
    // Node-local invariants
    // ========================================================================

    /// Rejects recording `amount` more units if that would exceed a known total, or
    /// overflow the counters of an unknown one.
    pub(crate) fn check_record(&self, amount: u64) -> Result<()> {
        let limit = match self.total {
            Total::Known(total) => total,
            Total::Unknown => u64::MAX,
        };
        let within = self
            .committed()
            .checked_add(amount)
            .is_some_and(|after| after <= limit);
        if !within {
            return Err(ProgressError::OverCompletion {
                node: self.id,
                amount,
                completed: self.completed,
                failed: self.failed,
                total: limit,
            });
        }
        Ok(())
    }

    /// Rejects a known total lower than the work already committed.
    pub(crate) fn check_revision(&self, requested: Total) -> Result<()> {
        match requested {
            Total::Known(total) if total < self.committed() => Err(ProgressError::InvalidRevision {
                node: self.id,
                requested,
                committed: self.committed(),
            }),
            _ => Ok(()),
        }
    }

    /// Derives the lifecycle state from the numbers and records stop times.
    pub(crate) fn settle(&mut self) {
        if self.state == NodeState::Removed {
            return;
        }

        let next = match self.total {
            Total::Known(total) if self.committed() >= total => {
                if self.failed > 0 {
                    NodeState::Failed
                } else {
                    NodeState::Completed
                }
            }
            _ => NodeState::Active,
        };

        match (self.state, next) {
            (NodeState::Active, NodeState::Completed | NodeState::Failed) => {
                self.stopped = Some(Instant::now());
            }
            (NodeState::Completed | NodeState::Failed, NodeState::Active) => {
                self.stopped = None;
            }
            _ => {}
        }
        self.state = next;
    }

    /// Freezes the node as removed.
    pub(crate) fn retire(&mut self) {
        if self.state == NodeState::Active {
            self.stopped = Some(Instant::now());
        }
        self.state = NodeState::Removed;
    }
}
