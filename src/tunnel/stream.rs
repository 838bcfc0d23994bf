//! Multiplexed stream implementation

use super::frame::{Closing, Frame};
use super::obfuscator::MAX_FRAME_PAYLOAD;
use super::recv_buffer::RecvBuffer;
use super::session::Session;
use super::switchboard::UNASSIGNED;
use super::TunnelError;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::trace;

/// Stream state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Open in both directions
    Active,
    /// Closed by this side
    LocallyClosed,
    /// Closed by the peer
    RemotelyClosed,
}

/// A logical stream within a session
pub struct Stream {
    id: u32,
    session: Weak<Session>,
    buffer: Box<dyn RecvBuffer>,
    next_send_seq: AtomicU64,
    assigned_conn: AtomicU32,
    state: Mutex<StreamState>,
    unordered: bool,
}

impl Stream {
    pub(super) fn new(
        id: u32,
        session: Weak<Session>,
        buffer: Box<dyn RecvBuffer>,
        assigned_conn: u32,
        unordered: bool,
    ) -> Self {
        Self {
            id,
            session,
            buffer,
            next_send_seq: AtomicU64::new(0),
            assigned_conn: AtomicU32::new(assigned_conn),
            state: Mutex::new(StreamState::Active),
            unordered,
        }
    }

    /// Get stream ID
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn state(&self) -> StreamState {
        *self.state.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.state() != StreamState::Active
    }

    /// Whether the stream preserves datagram boundaries
    pub fn is_unordered(&self) -> bool {
        self.unordered
    }

    /// Enclave this stream is pinned to, if any
    pub fn assigned_connection(&self) -> Option<u32> {
        match self.assigned_conn.load(Ordering::Relaxed) {
            UNASSIGNED => None,
            id => Some(id),
        }
    }

    pub(super) fn buffer(&self) -> &dyn RecvBuffer {
        self.buffer.as_ref()
    }

    fn session(&self) -> Result<Arc<Session>, TunnelError> {
        self.session
            .upgrade()
            .ok_or_else(|| TunnelError::BrokenSession("session dropped".to_string()))
    }

    /// Read payload bytes (ordered) or one datagram (unordered)
    ///
    /// After the stream closes, buffered data is still returned; once it is
    /// drained reads fail with `BrokenStream`, or `BrokenSession` when the
    /// whole session went away. An unordered stream returns `Ok(0)` for an empty datagram.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, TunnelError> {
        if buf.is_empty() && !self.unordered {
            return Ok(0);
        }
        match self.buffer.read(buf).await {
            Err(TunnelError::ClosedPipe) => {}
            other => return other,
        }
        match self.session.upgrade() {
            Some(session) if !session.is_closed() => Err(TunnelError::BrokenStream),
            Some(session) => Err(TunnelError::BrokenSession(session.terminal_message())),
            None => Err(TunnelError::BrokenSession("session dropped".to_string())),
        }
    }

    /// Send `data`; ordered streams split it into frames as needed
    pub async fn write(&self, data: &[u8]) -> Result<usize, TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::BrokenStream);
        }
        let session = self.session()?;

        if self.unordered {
            if data.len() > MAX_FRAME_PAYLOAD {
                return Err(TunnelError::FrameTooLarge(data.len(), MAX_FRAME_PAYLOAD));
            }
            self.send_frame(&session, Bytes::copy_from_slice(data)).await?;
            return Ok(data.len());
        }

        for chunk in data.chunks(MAX_FRAME_PAYLOAD) {
            self.send_frame(&session, Bytes::copy_from_slice(chunk)).await?;
        }
        Ok(data.len())
    }

    async fn send_frame(&self, session: &Session, payload: Bytes) -> Result<(), TunnelError> {
        let seq = self.next_send_seq.fetch_add(1, Ordering::Relaxed);
        let frame = Frame::data(self.id, seq, payload);
        session.send_frame(&frame, Some(&self.assigned_conn)).await
    }

    /// Close actively, telling the peer
    pub async fn close(&self) -> Result<(), TunnelError> {
        {
            let mut state = self.state.lock();
            if *state != StreamState::Active {
                return Ok(());
            }
            *state = StreamState::LocallyClosed;
        }
        self.buffer.close();

        let session = self.session()?;
        let seq = self.next_send_seq.fetch_add(1, Ordering::Relaxed);
        let frame = Frame::closing(self.id, seq, Closing::ClosingStream);
        let sent = session.send_frame(&frame, Some(&self.assigned_conn)).await;
        session.del_stream(self.id).await;
        sent
    }

    /// Closed by the peer; the buffer drains before reads fail
    pub(super) fn passive_close(&self) -> bool {
        let mut state = self.state.lock();
        if *state != StreamState::Active {
            return false;
        }
        *state = StreamState::RemotelyClosed;
        drop(state);
        self.buffer.close();
        true
    }

    /// Closed because the session ended
    pub(super) fn session_close(&self) {
        let mut state = self.state.lock();
        if *state == StreamState::Active {
            *state = StreamState::LocallyClosed;
        }
        drop(state);
        self.buffer.close();
    }

    /// Reads blocked past `deadline` fail with `Timeout`; `None` clears it
    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.buffer.set_read_deadline(deadline);
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Copy between a stream and a socket until either side ends
///
/// The relay gives up once neither direction has carried data for
/// `idle_timeout`. Both sides are closed when the relay returns. Returns the
/// byte counts sent into and received from the stream.
pub async fn relay<S>(stream: Arc<Stream>, conn: S, idle_timeout: Option<Duration>) -> (u64, u64)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut conn_r, mut conn_w) = tokio::io::split(conn);
    let last_active = Mutex::new(Instant::now());
    let mut sent = 0u64;
    let mut received = 0u64;

    let upstream = async {
        let mut buf = vec![0u8; MAX_FRAME_PAYLOAD];
        loop {
            let n = match idle_timeout {
                Some(idle) => loop {
                    let deadline = *last_active.lock() + idle;
                    match tokio::time::timeout_at(deadline, conn_r.read(&mut buf)).await {
                        Ok(r) => break r?,
                        Err(_) if *last_active.lock() + idle <= Instant::now() => {
                            return Err::<(), TunnelError>(TunnelError::Timeout);
                        }
                        // the other direction moved; wait out the new deadline
                        Err(_) => continue,
                    }
                },
                None => conn_r.read(&mut buf).await?,
            };
            if n == 0 {
                return Ok(());
            }
            *last_active.lock() = Instant::now();
            stream.write(&buf[..n]).await?;
            sent += n as u64;
        }
    };

    let downstream = async {
        let mut buf = vec![0u8; MAX_FRAME_PAYLOAD];
        loop {
            let n = match stream.read(&mut buf).await {
                Ok(n) => n,
                Err(e) => return Err::<(), TunnelError>(e),
            };
            *last_active.lock() = Instant::now();
            conn_w.write_all(&buf[..n]).await?;
            received += n as u64;
        }
    };

    let result = tokio::select! {
        r = upstream => r,
        r = downstream => r,
    };
    if let Err(e) = &result {
        trace!(stream = stream.id(), error = %e, "relay ended");
    }

    let _ = stream.close().await;
    let _ = conn_w.shutdown().await;
    (sent, received)
}
