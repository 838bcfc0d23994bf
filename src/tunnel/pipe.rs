//! Bounded in-memory pipes with blocking reads and read deadlines
//!
//! A closed pipe refuses writes but keeps serving what is already buffered;
//! once drained, reads fail with `ClosedPipe`. `Ok(0)` is never EOF: a
//! datagram pipe returns it for an empty datagram.

use super::TunnelError;
use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Byte pipe capacity (500 MiB)
pub const BYTE_PIPE_CAPACITY: usize = 500 * 1024 * 1024;

/// Datagram pipe capacity, in messages
pub const DATAGRAM_PIPE_CAPACITY: usize = 1024;

/// Wait for `notify` or the deadline, whichever comes first
async fn wait(notified: std::pin::Pin<&mut tokio::sync::futures::Notified<'_>>, deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => {
            let _ = tokio::time::timeout_at(deadline, notified).await;
        }
        None => notified.await,
    }
}

struct ByteState {
    buf: BytesMut,
    closed: bool,
    deadline: Option<Instant>,
}

/// Ordered byte stream pipe
pub struct BytePipe {
    state: Mutex<ByteState>,
    readable: Notify,
    writable: Notify,
    capacity: usize,
}

impl BytePipe {
    pub fn new() -> Self {
        Self::with_capacity(BYTE_PIPE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Mutex::new(ByteState {
                buf: BytesMut::new(),
                closed: false,
                deadline: None,
            }),
            readable: Notify::new(),
            writable: Notify::new(),
            capacity,
        }
    }

    /// Read whatever is available, up to `buf.len()` bytes
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, TunnelError> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let notified = self.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let deadline = {
                let mut state = self.state.lock();
                if !state.buf.is_empty() {
                    let n = buf.len().min(state.buf.len());
                    buf[..n].copy_from_slice(&state.buf[..n]);
                    state.buf.advance(n);
                    drop(state);
                    self.writable.notify_waiters();
                    return Ok(n);
                }
                if state.closed {
                    return Err(TunnelError::ClosedPipe);
                }
                if let Some(deadline) = state.deadline {
                    if Instant::now() >= deadline {
                        return Err(TunnelError::Timeout);
                    }
                }
                state.deadline
            };
            wait(notified, deadline).await;
        }
    }

    /// Append `data`, waiting while the pipe is full
    pub async fn write(&self, data: &[u8]) -> Result<(), TunnelError> {
        loop {
            let notified = self.writable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(TunnelError::ClosedPipe);
                }
                if state.buf.is_empty() || state.buf.len() + data.len() <= self.capacity {
                    state.buf.extend_from_slice(data);
                    drop(state);
                    self.readable.notify_waiters();
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    pub fn close(&self) {
        self.state.lock().closed = true;
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }

    /// Set or clear the read deadline; wakes blocked readers
    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.state.lock().deadline = deadline;
        self.readable.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.state.lock().buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for BytePipe {
    fn default() -> Self {
        Self::new()
    }
}

struct DatagramState {
    queue: VecDeque<Bytes>,
    closed: bool,
    deadline: Option<Instant>,
}

/// Message pipe that preserves datagram boundaries
pub struct DatagramPipe {
    state: Mutex<DatagramState>,
    readable: Notify,
    capacity: usize,
}

impl DatagramPipe {
    pub fn new() -> Self {
        Self::with_capacity(DATAGRAM_PIPE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Mutex::new(DatagramState {
                queue: VecDeque::new(),
                closed: false,
                deadline: None,
            }),
            readable: Notify::new(),
            capacity,
        }
    }

    /// Read exactly one datagram
    ///
    /// A datagram longer than `buf` is left queued and `ShortBuffer` returned.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, TunnelError> {
        loop {
            let notified = self.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let deadline = {
                let mut state = self.state.lock();
                if let Some(front) = state.queue.front() {
                    if front.len() > buf.len() {
                        return Err(TunnelError::ShortBuffer(front.len()));
                    }
                    let n = front.len();
                    buf[..n].copy_from_slice(front);
                    state.queue.pop_front();
                    return Ok(n);
                }
                if state.closed {
                    return Err(TunnelError::ClosedPipe);
                }
                if let Some(deadline) = state.deadline {
                    if Instant::now() >= deadline {
                        return Err(TunnelError::Timeout);
                    }
                }
                state.deadline
            };
            wait(notified, deadline).await;
        }
    }

    /// Queue one datagram; dropped silently when the pipe is full
    pub fn write(&self, datagram: Bytes) -> Result<(), TunnelError> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(TunnelError::ClosedPipe);
            }
            if state.queue.len() >= self.capacity {
                tracing::trace!(len = datagram.len(), "datagram pipe full, dropping");
                return Ok(());
            }
            state.queue.push_back(datagram);
        }
        self.readable.notify_waiters();
        Ok(())
    }

    pub fn close(&self) {
        self.state.lock().closed = true;
        self.readable.notify_waiters();
    }

    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.state.lock().deadline = deadline;
        self.readable.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DatagramPipe {
    fn default() -> Self {
        Self::new()
    }
}
