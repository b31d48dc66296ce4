//! Delivery of events across process boundaries.
//!
//! Events travel as newline-delimited JSON, one [`Event`] per line:
//!
//! ```text
//! {"producer_id":4,"sequence_number":9,"node_id":{"producer":4,"local":2},"op":{"advance":128}}
//! ```
//!
//! A worker process wraps its end of a pipe or socket in a [`WireSink`] (usually
//! through [`remote_producer`]) and uses the ordinary [`Producer`] API. The owning
//! process reads the other end with a [`WireReader`] and hands the decoded events to
//! its channel with [`forward`]. Ordering within one stream is preserved, and
//! replays caused by reconnects are discarded by the tree's per-producer watermark.

use std::{
    fmt,
    io::{self, BufRead, Read as _, Write},
    sync::Arc,
};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::{
    channel::EventSender,
    error::{ProgressError, Result},
    event::Event,
    node::ProducerId,
    producer::{EventSink, Producer},
};

/// Longest accepted line, newline included.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Encodes one event as a single JSON line.
///
/// # Errors
///
/// [`ProgressError::Codec`] if serialization fails.
pub fn encode(event: &Event) -> Result<Vec<u8>> {
    let mut line = serde_json::to_vec(event)?;
    line.push(b'\n');
    Ok(line)
}

/// Decodes one line produced by [`encode`]. Surrounding whitespace is ignored.
///
/// # Errors
///
/// [`ProgressError::Codec`] if the line is not a valid event.
pub fn decode(line: &str) -> Result<Event> {
    Ok(serde_json::from_str(line.trim())?)
}

/// An [`EventSink`] writing JSON lines to any [`Write`].
///
/// Each event is written and flushed under a lock, so lines from concurrent
/// handles never interleave.
///
/// The first I/O failure is returned as [`ProgressError::Io`] and breaks the sink:
/// part of a line may already be on the wire, so every later submission fails
/// with [`ProgressError::ChannelClosed`] without writing. Reconnect with a fresh
/// sink to continue.
pub struct WireSink<W> {
    state: Mutex<WireState<W>>,
}

struct WireState<W> {
    writer: W,
    broken: bool,
}

impl<W> fmt::Debug for WireSink<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WireSink")
            .field("broken", &self.state.lock().broken)
            .finish_non_exhaustive()
    }
}

impl<W: Write> WireSink<W> {
    /// Wraps a writer.
    pub fn new(writer: W) -> Self {
        Self {
            state: Mutex::new(WireState {
                writer,
                broken: false,
            }),
        }
    }

    /// `true` once a write or flush has failed.
    pub fn is_broken(&self) -> bool {
        self.state.lock().broken
    }

    /// Unwraps the writer.
    pub fn into_inner(self) -> W {
        self.state.into_inner().writer
    }
}

impl<W: Write + Send> EventSink for WireSink<W> {
    fn submit(&self, event: Event) -> Result<()> {
        let line = encode(&event)?;
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.broken {
            return Err(ProgressError::ChannelClosed);
        }

        let written = state
            .writer
            .write_all(&line)
            .and_then(|()| state.writer.flush());
        if let Err(err) = written {
            state.broken = true;
            warn!(
                producer = %event.producer,
                sequence = event.sequence,
                %err,
                "wire_sink: write failed, stream abandoned"
            );
            return Err(ProgressError::Io(err));
        }
        Ok(())
    }
}

/// Creates a producer whose events are written to `writer`.
///
/// `id` must have been reserved by the owner with
/// [`EventSender::register_producer`] and passed to the worker out of band.
///
/// # Errors
///
/// [`ProgressError::ReservedProducer`] if `id` is the owner's id.
pub fn remote_producer<W>(id: ProducerId, writer: W) -> Result<Producer>
where
    W: Write + Send + 'static,
{
    Producer::new(id, Arc::new(WireSink::new(writer)))
}

/// Decodes JSON lines from a [`BufRead`], skipping blank lines.
///
/// A malformed line yields [`ProgressError::Codec`] and decoding continues with
/// the next line. An I/O failure or a line longer than [`MAX_LINE_BYTES`] yields
/// [`ProgressError::Io`] and ends the iteration.
pub struct WireReader<R> {
    reader: R,
    line: String,
    finished: bool,
}

impl<R> fmt::Debug for WireReader<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WireReader")
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl<R: BufRead> WireReader<R> {
    /// Wraps a buffered reader.
    pub const fn new(reader: R) -> Self {
        Self {
            reader,
            line: String::new(),
            finished: false,
        }
    }

    fn read_line(&mut self) -> io::Result<usize> {
        self.line.clear();
        let limit = MAX_LINE_BYTES as u64;
        let read = (&mut self.reader).take(limit).read_line(&mut self.line)?;
        if read as u64 == limit && !self.line.ends_with('\n') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("event line exceeds {MAX_LINE_BYTES} bytes"),
            ));
        }
        Ok(read)
    }
}

impl<R: BufRead> Iterator for WireReader<R> {
    type Item = Result<Event>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.finished {
            match self.read_line() {
                Ok(0) => self.finished = true,
                Ok(_) if self.line.trim().is_empty() => {}
                Ok(_) => return Some(decode(&self.line)),
                Err(err) => {
                    self.finished = true;
                    return Some(Err(err.into()));
                }
            }
        }
        None
    }
}

/// Reads events from `reader` until end of stream and submits them to `sender`
/// in the order they were read. Returns the number of events forwarded.
///
/// Malformed lines are logged and skipped.
///
/// # Errors
///
/// * [`ProgressError::Io`] if reading fails.
/// * Submission errors from `sender` ([`ProgressError::ChannelClosed`] once the
///   owner is gone, [`ProgressError::Backpressure`] with a submit timeout).
pub fn forward<R: BufRead>(reader: R, sender: &EventSender) -> Result<u64> {
    let mut forwarded = 0u64;
    for decoded in WireReader::new(reader) {
        let event = match decoded {
            Ok(event) => event,
            Err(ProgressError::Codec(err)) => {
                warn!(%err, "forward: skipping malformed line");
                continue;
            }
            Err(err) => return Err(err),
        };
        trace!(producer = %event.producer, sequence = event.sequence, "forward");
        sender.submit(event)?;
        forwarded += 1;
    }
    debug!(forwarded, "forward: end of stream");
    Ok(forwarded)
}
