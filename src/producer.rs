//! The producer-facing API.
//!
//! Worker code only ever needs a [`Producer`] and the [`TaskHandle`]s it creates.
//! Whether the events end up in an in-process channel or are written to a pipe
//! towards another process is decided by the [`EventSink`] behind the producer.
//!
//! ```
//! use tiered_progress::{Total, TrackerBuilder};
//!
//! let (tracker, sender) = TrackerBuilder::new().build();
//! let producer = sender.producer();
//!
//! let project = producer.create(None, Total::Unknown, "project").unwrap();
//! let file = project.create_child(Total::Known(512), "README.md").unwrap();
//! file.advance(512).unwrap();
//! project.done().unwrap();
//!
//! let report = tracker.pump();
//! assert!(report.rejected.is_empty());
//!
//! let agg = tracker.monitor().aggregate(project.id()).unwrap();
//! assert_eq!(agg.completed, 512);
//! ```

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use compact_str::CompactString;
use parking_lot::Mutex;

use crate::{
    error::{ProgressError, Result},
    event::{Event, EventOp},
    node::{NodeId, ProducerId, Total},
};

/// Destination of a producer's events.
///
/// Implemented by [`EventSender`](crate::EventSender) for in-process delivery and
/// by [`WireSink`](crate::transport::WireSink) for delivery across processes.
pub trait EventSink: Send + Sync {
    /// Delivers one event, blocking under backpressure.
    ///
    /// # Errors
    ///
    /// Implementations report saturation, a closed channel, or transport failures.
    /// [`Backpressure`](ProgressError::Backpressure) and
    /// [`ChannelClosed`](ProgressError::ChannelClosed) must only be returned when
    /// nothing of the event was delivered.
    fn submit(&self, event: Event) -> Result<()>;
}

/// A registered source of progress events.
///
/// Cloning is cheap and clones share the same identity and sequence counter, so a
/// producer can be handed to several threads while keeping its event stream
/// ordered.
#[derive(Clone)]
pub struct Producer {
    inner: Arc<ProducerInner>,
}

struct ProducerInner {
    id: ProducerId,
    sink: Arc<dyn EventSink>,
    // Last sequence number that may have reached the sink. Held while submitting
    // so that sequence order and enqueue order agree.
    sequence: Mutex<u64>,
    next_local: AtomicU64,
}

impl fmt::Debug for Producer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("id", &self.inner.id)
            .field("sequence", &self.sequence())
            .finish()
    }
}

impl Producer {
    /// Creates a producer with an already registered id.
    ///
    /// # Errors
    ///
    /// [`ProgressError::ReservedProducer`] for [`ProducerId::OWNER`].
    pub fn new(id: ProducerId, sink: Arc<dyn EventSink>) -> Result<Self> {
        if id == ProducerId::OWNER {
            return Err(ProgressError::ReservedProducer(id));
        }
        Ok(Self::registered(id, sink))
    }

    /// Creates a producer for an id handed out by the channel's registry.
    pub(crate) fn registered(id: ProducerId, sink: Arc<dyn EventSink>) -> Self {
        Self {
            inner: Arc::new(ProducerInner {
                id,
                sink,
                sequence: Mutex::new(0),
                next_local: AtomicU64::new(1),
            }),
        }
    }

    /// This producer's id.
    #[must_use]
    pub fn id(&self) -> ProducerId {
        self.inner.id
    }

    /// Sequence number of the last event that was (or may have been) delivered.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        *self.inner.sequence.lock()
    }

    /// Creates a node under `parent` (or a root) and returns a handle to it.
    ///
    /// The id is minted locally, so the handle is usable immediately; the owner
    /// reports an unknown parent when it applies the event.
    ///
    /// # Errors
    ///
    /// Delivery errors from the underlying sink.
    pub fn create(
        &self,
        parent: Option<NodeId>,
        total: Total,
        label: impl Into<CompactString>,
    ) -> Result<TaskHandle> {
        let node = NodeId::new(
            self.inner.id,
            self.inner.next_local.fetch_add(1, Ordering::Relaxed),
        );
        self.emit(
            node,
            EventOp::Create {
                parent,
                total,
                label: label.into(),
            },
        )?;
        Ok(self.attach(node))
    }

    /// Returns a handle for a node created elsewhere (by the owner or another
    /// producer). Events sent through it are attributed to this producer.
    #[must_use]
    pub fn attach(&self, node: NodeId) -> TaskHandle {
        TaskHandle {
            node,
            producer: self.clone(),
        }
    }

    fn emit(&self, node: NodeId, op: EventOp) -> Result<()> {
        let mut sequence = self.inner.sequence.lock();
        let event = Event {
            producer: self.inner.id,
            sequence: *sequence + 1,
            node,
            op,
        };
        match self.inner.sink.submit(event) {
            Err(err) if err.is_undelivered() => Err(err),
            // The event may be in flight; its number must never be reused.
            result => {
                *sequence += 1;
                result
            }
        }
    }
}

/// A handle to one node, used by worker code to report progress.
#[derive(Clone, Debug)]
pub struct TaskHandle {
    node: NodeId,
    producer: Producer,
}

impl TaskHandle {
    /// The node this handle reports on.
    #[must_use]
    pub const fn id(&self) -> NodeId {
        self.node
    }

    /// The producer the handle submits through.
    #[must_use]
    pub const fn producer(&self) -> &Producer {
        &self.producer
    }

    /// Records `amount` completed units.
    ///
    /// Only leaves count toward aggregates: once the node has live children its
    /// own numbers are kept but no longer summed.
    ///
    /// # Errors
    ///
    /// Delivery errors from the underlying sink.
    pub fn advance(&self, amount: u64) -> Result<()> {
        self.producer.emit(self.node, EventOp::Advance(amount))
    }

    /// Records `amount` failed units.
    ///
    /// # Errors
    ///
    /// Delivery errors from the underlying sink.
    pub fn fail(&self, amount: u64) -> Result<()> {
        self.producer.emit(self.node, EventOp::Fail(amount))
    }

    /// Replaces the node's total.
    ///
    /// # Errors
    ///
    /// Delivery errors from the underlying sink.
    pub fn revise_total(&self, total: Total) -> Result<()> {
        self.producer.emit(self.node, EventOp::ReviseTotal(total))
    }

    /// Announces how many children this node will eventually have.
    ///
    /// # Errors
    ///
    /// Delivery errors from the underlying sink.
    pub fn expect_children(&self, expected: u64) -> Result<()> {
        self.producer.emit(self.node, EventOp::ExpectChildren(expected))
    }

    /// Marks the node as done: a known total is filled up, an unknown one becomes
    /// the work recorded so far.
    ///
    /// # Errors
    ///
    /// Delivery errors from the underlying sink.
    pub fn done(&self) -> Result<()> {
        self.producer.emit(self.node, EventOp::Done)
    }

    /// Removes the node and its subtree from aggregation.
    ///
    /// # Errors
    ///
    /// Delivery errors from the underlying sink.
    pub fn remove(&self) -> Result<()> {
        self.producer.emit(self.node, EventOp::Remove)
    }

    /// Creates a child node through the same producer.
    ///
    /// # Errors
    ///
    /// Delivery errors from the underlying sink.
    pub fn create_child(&self, total: Total, label: impl Into<CompactString>) -> Result<Self> {
        self.producer.create(Some(self.node), total, label)
    }
}
