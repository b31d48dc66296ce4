//! The bounded conduit between producers and the tree owner.
//!
//! Producers push [`Event`]s through an [`EventSender`]; the single owner pulls
//! them out of the [`EventReceiver`] in arrival order. The queue is bounded: once
//! it is full, submissions block (backpressure) instead of dropping events, since
//! a lost event would silently corrupt every aggregate above its node.
//!
//! # Ordering
//!
//! All producers share one FIFO queue, so the owner sees a single total arrival
//! order. Per-producer order is preserved as long as each producer enqueues its
//! own events in sequence order, which [`Producer`] guarantees.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use tracing::{debug, warn};

use crate::{
    error::{ProgressError, Result},
    event::Event,
    node::ProducerId,
    producer::{EventSink, Producer},
};

/// Queue depth used when none is configured.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Creates a bounded update channel.
///
/// `capacity` is clamped to at least one slot. With `submit_timeout` set, a
/// submission that cannot be enqueued in time fails with
/// [`ProgressError::Backpressure`]; without it, submissions block until there is
/// room.
#[must_use]
pub fn bounded(capacity: usize, submit_timeout: Option<Duration>) -> (EventSender, EventReceiver) {
    let capacity = capacity.max(1);
    debug!(capacity, ?submit_timeout, "bounded: creating update channel");

    let (tx, rx) = crossbeam_channel::bounded(capacity);
    (
        EventSender {
            tx,
            submit_timeout,
            next_producer: Arc::new(AtomicU64::new(1)),
        },
        EventReceiver { rx },
    )
}

/// The producer side of the update channel.
///
/// Cheap to clone; every clone feeds the same queue and shares the same producer
/// registry.
#[derive(Clone)]
pub struct EventSender {
    tx: Sender<Event>,
    submit_timeout: Option<Duration>,
    next_producer: Arc<AtomicU64>,
}

impl fmt::Debug for EventSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSender")
            .field("queued", &self.tx.len())
            .field("capacity", &self.tx.capacity())
            .field("submit_timeout", &self.submit_timeout)
            .finish()
    }
}

impl EventSender {
    /// Enqueues an event for the tree owner.
    ///
    /// # Errors
    ///
    /// * [`ProgressError::Backpressure`] if the queue stayed full for the whole
    ///   configured submit timeout. The event was not enqueued.
    /// * [`ProgressError::ChannelClosed`] if the owner has gone away.
    pub fn submit(&self, event: Event) -> Result<()> {
        let Some(timeout) = self.submit_timeout else {
            return self.tx.send(event).map_err(|_| ProgressError::ChannelClosed);
        };

        self.tx.send_timeout(event, timeout).map_err(|err| match err {
            SendTimeoutError::Timeout(event) => {
                warn!(
                    producer = %event.producer,
                    sequence = event.sequence,
                    ?timeout,
                    "submit: channel saturated"
                );
                ProgressError::Backpressure(timeout)
            }
            SendTimeoutError::Disconnected(_) => ProgressError::ChannelClosed,
        })
    }

    /// Reserves the next producer id. Ids are handed out in registration order,
    /// starting at 1.
    ///
    /// Use this to give an out-of-process worker its identity; in-process code
    /// usually calls [`producer`](Self::producer) instead.
    pub fn register_producer(&self) -> ProducerId {
        let id = ProducerId::new(self.next_producer.fetch_add(1, Ordering::Relaxed));
        debug!(producer = %id, "register_producer");
        id
    }

    /// Registers a new in-process [`Producer`] feeding this channel.
    #[must_use]
    pub fn producer(&self) -> Producer {
        Producer::registered(self.register_producer(), Arc::new(self.clone()))
    }

    /// Number of events currently queued.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tx.len()
    }

    /// `true` if no events are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    /// Maximum queue depth before submissions block.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.tx.capacity().unwrap_or(usize::MAX)
    }
}

impl EventSink for EventSender {
    fn submit(&self, event: Event) -> Result<()> {
        Self::submit(self, event)
    }
}

/// The owner side of the update channel.
pub struct EventReceiver {
    rx: Receiver<Event>,
}

impl fmt::Debug for EventReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventReceiver")
            .field("queued", &self.rx.len())
            .finish()
    }
}

impl EventReceiver {
    /// Takes every event currently queued, in FIFO order, without blocking.
    #[must_use]
    pub fn drain(&self) -> Vec<Event> {
        self.rx.try_iter().collect()
    }

    /// Waits for at least one event (up to `timeout`, or forever with `None`) and
    /// then drains whatever else is queued.
    ///
    /// Returns an empty batch if the timeout elapses.
    ///
    /// # Errors
    ///
    /// [`ProgressError::ChannelClosed`] once every sender is gone and the queue is
    /// empty.
    pub fn recv_batch(&self, timeout: Option<Duration>) -> Result<Vec<Event>> {
        let first = match timeout {
            Some(timeout) => match self.rx.recv_timeout(timeout) {
                Ok(event) => event,
                Err(RecvTimeoutError::Timeout) => return Ok(Vec::new()),
                Err(RecvTimeoutError::Disconnected) => return Err(ProgressError::ChannelClosed),
            },
            None => self.rx.recv().map_err(|_| ProgressError::ChannelClosed)?,
        };

        let mut batch = Vec::with_capacity(self.rx.len() + 1);
        batch.push(first);
        batch.extend(self.rx.try_iter());
        Ok(batch)
    }

    /// Number of events currently queued.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// `true` if no events are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
