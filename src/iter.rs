//! Iterator adapters for automatic progress reporting.
//!
//! [`TrackedIteratorExt`] attaches a node to any [`Iterator`]: every yielded item
//! advances it by one, and exhausting the iterator marks it done.
//!
//! # Heuristics
//!
//! The node's total comes from [`Iterator::size_hint`]:
//! * An exact size (`lower == upper`) gives a known total.
//! * Anything else gives an unknown total, resolved to the item count once the
//!   iterator is exhausted.
//!
//! # Example
//!
//! ```
//! use tiered_progress::{TrackedIteratorExt as _, TrackerBuilder};
//!
//! let (tracker, sender) = TrackerBuilder::new().build();
//! let producer = sender.producer();
//!
//! let files = vec!["a.rs", "b.rs", "c.rs"];
//! let mut iter = files.into_iter().track(&producer, None, "files").unwrap();
//! let node = iter.task().id();
//! for _file in &mut iter {}
//!
//! tracker.pump();
//! assert!(tracker.monitor().aggregate(node).unwrap().is_complete());
//! ```

use compact_str::CompactString;
use tracing::warn;

use crate::{
    error::Result,
    node::{NodeId, Total},
    producer::{Producer, TaskHandle},
};

/// An iterator adapter reporting one unit per item through a [`TaskHandle`].
///
/// Reporting failures (a full or closed channel) never interrupt iteration; they
/// are logged and the item is still yielded.
#[derive(Debug)]
pub struct TaskIter<I> {
    iter: I,
    task: TaskHandle,
    finished: bool,
}

impl<I> TaskIter<I> {
    /// Wraps `iter`, reporting on `task`.
    ///
    /// Usually constructed via [`TrackedIteratorExt`].
    pub const fn new(iter: I, task: TaskHandle) -> Self {
        Self {
            iter,
            task,
            finished: false,
        }
    }

    /// The handle items are reported on.
    pub const fn task(&self) -> &TaskHandle {
        &self.task
    }
}

impl<I: Iterator> Iterator for TaskIter<I> {
    type Item = I::Item;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.iter.next();

        if item.is_some() {
            if let Err(err) = self.task.advance(1) {
                warn!(node = %self.task.id(), %err, "task_iter: advance not reported");
            }
        } else if !self.finished {
            self.finished = true;
            if let Err(err) = self.task.done() {
                warn!(node = %self.task.id(), %err, "task_iter: completion not reported");
            }
        }

        item
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.iter.size_hint()
    }
}

/// Extension trait attaching progress reporting to any [`Iterator`].
pub trait TrackedIteratorExt: Iterator + Sized {
    /// Creates a node under `parent` (or a root) sized from
    /// [`size_hint`](Iterator::size_hint) and wraps the iterator.
    ///
    /// # Errors
    ///
    /// Delivery errors for the create event.
    fn track(
        self,
        producer: &Producer,
        parent: Option<NodeId>,
        label: impl Into<CompactString>,
    ) -> Result<TaskIter<Self>> {
        let task = producer.create(parent, total_from_size_hint(&self), label)?;
        Ok(TaskIter::new(self, task))
    }

    /// Wraps the iterator using an existing handle.
    fn track_with(self, task: TaskHandle) -> TaskIter<Self> {
        TaskIter::new(self, task)
    }
}

impl<I: Iterator> TrackedIteratorExt for I {}

fn total_from_size_hint<I: Iterator>(iter: &I) -> Total {
    match iter.size_hint() {
        (lower, Some(upper)) if lower == upper => Total::Known(upper as u64),
        _ => Total::Unknown,
    }
}
