use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("pipe closed")]
pub struct PipeClosed;

/// Creates a bounded byte pipe. Either end can hand out a [`PipeCloser`];
/// once closed, writes fail and the reader drains what is already buffered
/// before reporting end of stream.
pub fn pipe(capacity: usize) -> (PipeWriter, PipeReader) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let (closed, _) = watch::channel(false);
    let closed = Arc::new(closed);
    (
        PipeWriter {
            tx,
            closed: Arc::clone(&closed),
        },
        PipeReader { rx, closed },
    )
}

#[derive(Clone)]
pub struct PipeWriter {
    tx: mpsc::Sender<Bytes>,
    closed: Arc<watch::Sender<bool>>,
}

pub struct PipeReader {
    rx: mpsc::Receiver<Bytes>,
    closed: Arc<watch::Sender<bool>>,
}

#[derive(Clone)]
pub struct PipeCloser {
    closed: Arc<watch::Sender<bool>>,
}

impl PipeCloser {
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

impl PipeWriter {
    pub async fn write(&self, data: impl Into<Bytes>) -> Result<(), PipeClosed> {
        if self.is_closed() {
            return Err(PipeClosed);
        }
        let mut closed = self.closed.subscribe();
        tokio::select! {
            biased;
            sent = self.tx.send(data.into()) => sent.map_err(|_| PipeClosed),
            _ = closed.wait_for(|closed| *closed) => Err(PipeClosed),
        }
    }

    /// Writes without waiting for room; fails if the pipe is full or closed.
    pub fn try_write(&self, data: impl Into<Bytes>) -> Result<(), PipeClosed> {
        if self.is_closed() {
            return Err(PipeClosed);
        }
        self.tx.try_send(data.into()).map_err(|_| PipeClosed)
    }

    /// For backends driving blocking I/O on their own threads. Must not be
    /// called from inside the async runtime.
    pub fn blocking_write(&self, data: impl Into<Bytes>) -> Result<(), PipeClosed> {
        futures::executor::block_on(self.write(data))
    }

    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow() || self.tx.is_closed()
    }

    pub fn closer(&self) -> PipeCloser {
        PipeCloser {
            closed: Arc::clone(&self.closed),
        }
    }
}

impl PipeReader {
    /// Next chunk, or `None` once the pipe is closed and drained or every
    /// writer is gone.
    pub async fn read(&mut self) -> Option<Bytes> {
        let mut closed = self.closed.subscribe();
        tokio::select! {
            biased;
            chunk = self.rx.recv() => chunk,
            _ = closed.wait_for(|closed| *closed) => self.rx.try_recv().ok(),
        }
    }

    /// Blocking counterpart of [`PipeReader::read`]; same caveat as
    /// [`PipeWriter::blocking_write`].
    pub fn blocking_read(&mut self) -> Option<Bytes> {
        futures::executor::block_on(self.read())
    }

    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    pub fn closer(&self) -> PipeCloser {
        PipeCloser {
            closed: Arc::clone(&self.closed),
        }
    }
}
