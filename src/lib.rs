//! # `tiered_progress`
//!
//! Hierarchical progress aggregation for workloads that discover their own size
//! while they run.
//!
//! Work is modelled as a tree of nodes (project → file → chunk, say). Each node
//! carries a total that may be [`Unknown`](Total::Unknown) until discovery
//! finishes, plus completed and failed counts. Any node can be asked for the
//! [`Aggregate`] over its live subtree, and unknown totals propagate upward so a
//! partial answer never masquerades as a final one.
//!
//! `tiered_progress` is designed to be:
//!
//! * **Headless**: It computes progress but leaves rendering to the caller, who pulls
//!   [`NodeSnapshot`]s at whatever cadence suits them.
//! * **Single-writer**: Producers (threads or other processes) never touch the tree.
//!   They send [`Event`]s through a bounded channel and one [`Tracker`] applies them,
//!   deduplicating replays by `(producer, sequence)`.
//! * **Lazy**: Aggregates are cached per node and only the ancestor path of a change is
//!   invalidated, so frequent small updates on deep trees stay cheap.
//!
//! ## Modules
//!
//! * [`tree`]: The node arena, its mutations and the aggregation engine.
//! * [`node`]: Ids, totals, lifecycle states and the [`Aggregate`] monoid.
//! * [`event`]: The events producers send to the owner.
//! * [`channel`]: The bounded update channel and producer registry.
//! * [`producer`]: The [`Producer`] / [`TaskHandle`] API used by worker code.
//! * [`tracker`]: The owner loop and the read-only [`Monitor`].
//! * [`snapshot`]: Immutable views with ETA and throughput.
//! * [`builder`]: Configuration and construction of a [`Tracker`].
//! * [`transport`]: Newline-delimited JSON for producers in other processes.
//! * [`iter`] / [`io`]: Adapters reporting iterator items and transferred bytes.
//!
//! ## Example
//!
//! ```
//! use tiered_progress::{Total, TrackerBuilder};
//!
//! let (tracker, sender) = TrackerBuilder::new().build();
//! let monitor = tracker.monitor();
//! let producer = sender.producer();
//!
//! let project = producer.create(None, Total::Unknown, "project").unwrap();
//! let a = project.create_child(Total::Known(10), "a").unwrap();
//! let b = project.create_child(Total::Known(10), "b").unwrap();
//! a.advance(10).unwrap();
//! b.advance(10).unwrap();
//! tracker.pump();
//! assert_eq!(monitor.aggregate(project.id()).unwrap().total, Total::Known(20));
//!
//! // A newly discovered file with an unknown size makes the whole project unknown.
//! let c = project.create_child(Total::Unknown, "c").unwrap();
//! tracker.pump();
//! assert_eq!(monitor.aggregate(project.id()).unwrap().total, Total::Unknown);
//!
//! c.revise_total(Total::Known(5)).unwrap();
//! c.advance(5).unwrap();
//! tracker.pump();
//! let agg = monitor.aggregate(project.id()).unwrap();
//! assert_eq!((agg.completed, agg.total), (25, Total::Known(25)));
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod builder;
pub mod channel;
pub mod error;
pub mod event;
pub mod io;
pub mod iter;
pub mod node;
pub mod producer;
pub mod snapshot;
pub mod tracker;
pub mod transport;
pub mod tree;

pub use builder::{TrackerBuilder, TrackerConfig};
pub use channel::{EventReceiver, EventSender};
pub use error::{ProgressError, Result};
pub use event::{Event, EventOp};
pub use io::{TaskReader, TaskWriter};
pub use iter::{TaskIter, TrackedIteratorExt};
pub use node::{Aggregate, NodeId, NodeState, ProducerId, ProgressNode, Total};
pub use producer::{EventSink, Producer, TaskHandle};
pub use snapshot::{NodeSnapshot, TreeSnapshot};
pub use tracker::{Monitor, PumpReport, Rejected, Tracker};
pub use transport::{WireReader, WireSink};
pub use tree::{ApplyOutcome, ProgressTree};
