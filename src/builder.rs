//! Configuration and construction of a [`Tracker`].
//!
//! [`TrackerConfig`] is the plain-data form, suitable for embedding in an
//! application's own config file (it implements [`serde::Deserialize`] with
//! defaults for every field). [`TrackerBuilder`] is the fluent form.
//!
//! # Key Features
//!
//! * **Backpressure policy:** the queue depth and how long a producer may wait
//!   for room before [`ProgressError::Backpressure`](crate::ProgressError::Backpressure).
//! * **Pre-populated trees:** start tracking from an existing [`ProgressTree`],
//!   e.g. one whose top levels were laid out before any worker started.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    channel::{self, DEFAULT_CAPACITY, EventSender},
    error::Result,
    tracker::Tracker,
    tree::ProgressTree,
};

/// Tunables of the update channel.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Events that may be queued before producers block.
    pub capacity: usize,
    /// How long a blocked producer waits before giving up, in milliseconds.
    /// `None` waits indefinitely.
    pub submit_timeout_ms: Option<u64>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            submit_timeout_ms: None,
        }
    }
}

impl TrackerConfig {
    /// Parses a configuration from JSON, filling absent fields with defaults.
    ///
    /// # Errors
    ///
    /// [`ProgressError::Codec`](crate::ProgressError::Codec) if the JSON is malformed.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// The submit timeout as a [`Duration`].
    #[must_use]
    pub fn submit_timeout(&self) -> Option<Duration> {
        self.submit_timeout_ms.map(Duration::from_millis)
    }
}

/// A builder for [`Tracker`] and its update channel.
#[derive(Debug, Default)]
pub struct TrackerBuilder {
    config: TrackerConfig,
    tree: Option<ProgressTree>,
}

impl TrackerBuilder {
    /// Starts from the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from an existing configuration.
    #[must_use]
    pub fn from_config(config: TrackerConfig) -> Self {
        Self { config, tree: None }
    }

    /// Sets the queue depth.
    #[must_use]
    pub const fn with_capacity(mut self, capacity: usize) -> Self {
        self.config.capacity = capacity;
        self
    }

    /// Sets how long producers may block on a full queue.
    #[must_use]
    pub fn with_submit_timeout(mut self, timeout: Duration) -> Self {
        self.config.submit_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Starts tracking from an existing tree instead of an empty one.
    #[must_use]
    pub fn with_tree(mut self, tree: ProgressTree) -> Self {
        self.tree = Some(tree);
        self
    }

    /// Consumes the builder and returns the owner together with the sender that
    /// producers are registered on.
    #[must_use]
    pub fn build(self) -> (Tracker, EventSender) {
        let (sender, receiver) = channel::bounded(self.config.capacity, self.config.submit_timeout());
        let tracker = Tracker::with_tree(receiver, self.tree.unwrap_or_default());
        (tracker, sender)
    }
}
