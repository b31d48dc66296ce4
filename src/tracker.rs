//! The single-writer owner of a tree and the read side handed to renderers.
//!
//! # Synchronization Strategy
//!
//! The [`ProgressTree`] sits behind one coarse-grained
//! [`RwLock`](parking_lot::RwLock). Producers never touch it; they only talk to the
//! update channel.
//!
//! * **Owner:** the [`Tracker`] drains the channel and applies each batch under a
//!   single write lock, then refreshes the dirty aggregates before releasing it.
//! * **Renderers:** a [`Monitor`] takes the read lock once per snapshot. Because
//!   batches are applied atomically, every snapshot reflects a whole prefix of the
//!   event stream, never a half-applied batch.

use std::{fmt, sync::Arc, time::Duration};

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::{
    channel::EventReceiver,
    error::{ProgressError, Result},
    event::Event,
    node::{Aggregate, NodeId},
    snapshot::{NodeSnapshot, TreeSnapshot},
    tree::{ApplyOutcome, ProgressTree},
};

/// An event the owner could not apply, with the reason.
#[derive(Debug)]
pub struct Rejected {
    /// The offending event.
    pub event: Event,
    /// Why it was rejected.
    pub error: ProgressError,
}

/// What happened while applying one or more batches.
#[derive(Debug, Default)]
pub struct PumpReport {
    /// Events that were applied.
    pub applied: usize,
    /// Events skipped as replays of an already seen `(producer, sequence)`.
    pub duplicates: usize,
    /// Events that were rejected, in arrival order.
    pub rejected: Vec<Rejected>,
}

impl PumpReport {
    /// Total number of events looked at.
    #[must_use]
    pub fn total(&self) -> usize {
        self.applied + self.duplicates + self.rejected.len()
    }

    /// Folds another report into this one.
    pub fn merge(&mut self, other: Self) {
        self.applied += other.applied;
        self.duplicates += other.duplicates;
        self.rejected.extend(other.rejected);
    }
}

/// The tree owner: drains the update channel and applies events in order.
pub struct Tracker {
    tree: Arc<RwLock<ProgressTree>>,
    receiver: EventReceiver,
}

impl fmt::Debug for Tracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracker")
            .field("nodes", &self.tree.read().len())
            .field("queued", &self.receiver.len())
            .finish()
    }
}

impl Tracker {
    /// Creates an owner for an empty tree fed by `receiver`.
    #[must_use]
    pub fn new(receiver: EventReceiver) -> Self {
        Self::with_tree(receiver, ProgressTree::new())
    }

    /// Creates an owner for an existing tree.
    #[must_use]
    pub fn with_tree(receiver: EventReceiver, mut tree: ProgressTree) -> Self {
        tree.refresh();
        Self {
            tree: Arc::new(RwLock::new(tree)),
            receiver,
        }
    }

    /// Returns a cloneable read-only handle for renderers.
    #[must_use]
    pub fn monitor(&self) -> Monitor {
        Monitor {
            tree: Arc::clone(&self.tree),
        }
    }

    /// Applies everything currently queued, without blocking.
    pub fn pump(&self) -> PumpReport {
        self.apply_batch(self.receiver.drain())
    }

    /// Waits up to `timeout` for events, then applies everything queued.
    ///
    /// # Errors
    ///
    /// [`ProgressError::ChannelClosed`] once every producer is gone and the queue
    /// is empty.
    pub fn pump_timeout(&self, timeout: Duration) -> Result<PumpReport> {
        let batch = self.receiver.recv_batch(Some(timeout))?;
        Ok(self.apply_batch(batch))
    }

    /// Applies events until every sender has been dropped and the queue is empty.
    ///
    /// Intended for a dedicated owner thread.
    pub fn run(&self) -> PumpReport {
        let mut report = PumpReport::default();
        while let Ok(batch) = self.receiver.recv_batch(None) {
            report.merge(self.apply_batch(batch));
        }
        debug!(
            applied = report.applied,
            duplicates = report.duplicates,
            rejected = report.rejected.len(),
            "run: channel closed"
        );
        report
    }

    /// Runs `f` with exclusive access to the tree, for operations the owner performs
    /// directly (laying out top-level nodes, pruning, ...).
    ///
    /// Aggregates are refreshed before the lock is released.
    pub fn with_tree_mut<R>(&self, f: impl FnOnce(&mut ProgressTree) -> R) -> R {
        let mut tree = self.tree.write();
        let out = f(&mut tree);
        tree.refresh();
        out
    }

    fn apply_batch(&self, batch: Vec<Event>) -> PumpReport {
        let mut report = PumpReport::default();
        if batch.is_empty() {
            return report;
        }

        let mut tree = self.tree.write();
        for event in batch {
            match tree.apply(&event) {
                Ok(ApplyOutcome::Applied) => report.applied += 1,
                Ok(ApplyOutcome::Duplicate) => report.duplicates += 1,
                Err(error) => {
                    warn!(
                        producer = %event.producer,
                        sequence = event.sequence,
                        node = %event.node,
                        op = event.op.name(),
                        %error,
                        "pump: event rejected"
                    );
                    report.rejected.push(Rejected { event, error });
                }
            }
        }
        tree.refresh();
        drop(tree);

        debug!(
            applied = report.applied,
            duplicates = report.duplicates,
            rejected = report.rejected.len(),
            "pump: batch applied"
        );
        report
    }
}

/// A cloneable, read-only view of a tracked tree.
///
/// Renderers call [`snapshot`](Self::snapshot) on their own schedule; the tracker
/// places no constraint on how often.
#[derive(Clone)]
pub struct Monitor {
    tree: Arc<RwLock<ProgressTree>>,
}

impl fmt::Debug for Monitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Only metadata, to avoid walking the tree during debug formatting
        f.debug_struct("Monitor")
            .field("nodes", &self.tree.read().len())
            .finish()
    }
}

impl Monitor {
    /// Snapshot of the subtree rooted at `id`.
    ///
    /// # Errors
    ///
    /// [`ProgressError::UnknownNode`] if the id is not (or no longer) in the tree.
    pub fn snapshot(&self, id: NodeId) -> Result<NodeSnapshot> {
        self.tree.read().snapshot(id)
    }

    /// Snapshot of every root.
    #[must_use]
    pub fn snapshot_all(&self) -> TreeSnapshot {
        self.tree.read().snapshot_all()
    }

    /// Current aggregate of a node.
    ///
    /// # Errors
    ///
    /// [`ProgressError::UnknownNode`] if the id is not (or no longer) in the tree.
    pub fn aggregate(&self, id: NodeId) -> Result<Aggregate> {
        self.tree.read().peek_aggregate(id)
    }

    /// Extrapolated eventual total of a node, see [`ProgressTree::estimate`].
    ///
    /// # Errors
    ///
    /// [`ProgressError::UnknownNode`] if the id is not (or no longer) in the tree.
    pub fn estimate(&self, id: NodeId) -> Result<Option<u64>> {
        self.tree.read().estimate(id)
    }

    /// Current root ids.
    #[must_use]
    pub fn roots(&self) -> Vec<NodeId> {
        self.tree.read().roots().to_vec()
    }

    /// `true` if every live root has settled (an empty tree counts as settled).
    #[must_use]
    pub fn is_all_settled(&self) -> bool {
        self.snapshot_all().is_all_settled()
    }
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Duration};

    use super::Tracker;
    use crate::{
        builder::TrackerBuilder,
        channel,
        error::ProgressError,
        event::{Event, EventOp},
        node::Total,
    };

    /// Rejections
    /// Structural errors from producers are reported, not swallowed.
    #[test]
    fn test_pump_reports_rejections() {
        let (tracker, sender) = TrackerBuilder::new().build();
        let producer = sender.producer();

        let leaf = producer.create(None, Total::Known(2), "leaf").unwrap();
        leaf.advance(2).unwrap();
        leaf.advance(1).unwrap();

        let report = tracker.pump();
        assert_eq!(report.applied, 2);
        assert_eq!(report.rejected.len(), 1);
        assert!(matches!(
            report.rejected[0].error,
            ProgressError::OverCompletion { .. }
        ));
        assert_eq!(report.rejected[0].event.sequence, 3);
    }

    /// Duplicate Delivery
    /// A transport that retries delivery does not double-count.
    #[test]
    fn test_duplicate_delivery_is_ignored() {
        let (tracker, sender) = TrackerBuilder::new().build();
        let producer = sender.producer();
        let task = producer.create(None, Total::Unknown, "task").unwrap();
        task.advance(5).unwrap();

        let replay = Event {
            producer: producer.id(),
            sequence: 2,
            node: task.id(),
            op: EventOp::Advance(5),
        };
        sender.submit(replay).unwrap();

        let report = tracker.pump();
        assert_eq!((report.applied, report.duplicates), (2, 1));
        assert_eq!(tracker.monitor().aggregate(task.id()).unwrap().completed, 5);
    }

    /// Dedicated Owner Thread
    /// `run` applies events until all producers are gone.
    #[test]
    fn test_run_until_closed() {
        let (tracker, sender) = TrackerBuilder::new().with_capacity(4).build();
        let monitor = tracker.monitor();
        let producer = sender.producer();
        drop(sender);

        let owner = thread::spawn(move || tracker.run());

        let task = producer.create(None, Total::Known(100), "bytes").unwrap();
        for _ in 0..100 {
            task.advance(1).unwrap();
        }
        drop(task);
        drop(producer);

        let report = owner.join().unwrap();
        assert_eq!(report.applied, 101);
        assert!(monitor.is_all_settled());
    }

    #[test]
    fn test_tracker_over_plain_channel() {
        let (sender, receiver) = channel::bounded(8, None);
        let tracker = Tracker::new(receiver);
        let task = sender.producer().create(None, Total::Known(2), "t").unwrap();
        task.done().unwrap();

        assert_eq!(tracker.pump().applied, 2);
        assert!(tracker.monitor().is_all_settled());
        assert!(format!("{tracker:?}").contains("nodes: 1"));
    }

    #[test]
    fn test_pump_timeout_reports_closed() {
        let (tracker, sender) = TrackerBuilder::new().build();
        assert_eq!(tracker.pump_timeout(Duration::from_millis(5)).unwrap().total(), 0);

        drop(sender);
        assert!(matches!(
            tracker.pump_timeout(Duration::from_millis(5)),
            Err(ProgressError::ChannelClosed)
        ));
    }

    #[test]
    fn test_owner_direct_operations() {
        let (tracker, sender) = TrackerBuilder::new().build();
        let root = tracker
            .with_tree_mut(|tree| tree.add_node(None, Total::Unknown, "projects"))
            .unwrap();

        let producer = sender.producer();
        let file = producer.create(Some(root), Total::Known(8), "file").unwrap();
        file.advance(8).unwrap();
        tracker.pump();

        let monitor = tracker.monitor();
        assert_eq!(monitor.roots(), vec![root]);
        assert!(monitor.aggregate(root).unwrap().is_complete());

        file.remove().unwrap();
        tracker.pump();
        assert_eq!(tracker.with_tree_mut(|tree| tree.prune()), 1);
        assert!(monitor.snapshot(file.id()).is_err());
    }
}
