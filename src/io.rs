//! I/O wrappers reporting transferred bytes.
//!
//! [`TaskReader`] and [`TaskWriter`] wrap any [`Read`] or [`Write`] and advance a
//! [`TaskHandle`] by the number of bytes each call moved. Useful for downloads,
//! hashing or compressing large files, where the node's total is the byte size.
//!
//! A failure to report (e.g. the owner went away) surfaces as an
//! [`io::Error`] from the read or write call that moved the bytes.

use std::io::{self, Read, Write};

use crate::producer::TaskHandle;

/// A [`Read`] adapter advancing a node by the bytes read.
#[derive(Debug)]
pub struct TaskReader<R> {
    inner: R,
    task: TaskHandle,
}

impl<R> TaskReader<R> {
    /// Wraps `inner`, reporting on `task`.
    pub const fn new(inner: R, task: TaskHandle) -> Self {
        Self { inner, task }
    }

    /// The handle bytes are reported on.
    pub const fn task(&self) -> &TaskHandle {
        &self.task
    }

    /// Unwraps the reader.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for TaskReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.task.advance(n as u64).map_err(io::Error::other)?;
        }
        Ok(n)
    }
}

/// A [`Write`] adapter advancing a node by the bytes written.
#[derive(Debug)]
pub struct TaskWriter<W> {
    inner: W,
    task: TaskHandle,
}

impl<W> TaskWriter<W> {
    /// Wraps `inner`, reporting on `task`.
    pub const fn new(inner: W, task: TaskHandle) -> Self {
        Self { inner, task }
    }

    /// The handle bytes are reported on.
    pub const fn task(&self) -> &TaskHandle {
        &self.task
    }

    /// Unwraps the writer.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for TaskWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        if n > 0 {
            self.task.advance(n as u64).map_err(io::Error::other)?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
