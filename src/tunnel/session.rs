//! Sessions: a set of streams multiplexed over a switchboard
//!
//! Frame ingress runs on one read loop per underlying connection. Each
//! loop decodes a unit, looks up (or, on the accepting side, creates) the
//! target stream and hands the frame to its receive buffer.

use super::frame::{Closing, Frame, SESSION_STREAM_ID};
use super::obfuscator::Obfuscator;
use super::recv_buffer::{DatagramBuffer, RecvBuffer, StreamBuffer};
use super::stream::Stream;
use super::switchboard::{Switchboard, UNASSIGNED};
use super::{TunnelError, ACCEPT_BACKLOG};
use crate::transport::{Connection, UnitReader};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

type CloseHook = Box<dyn FnOnce(u32) + Send>;

/// How long a closed stream id keeps swallowing late frames
const TOMBSTONE_TTL: Duration = Duration::from_secs(120);

/// Upper bound on remembered closed stream ids
const TOMBSTONE_LIMIT: usize = 4096;

/// Recently closed stream ids, oldest first
#[derive(Default)]
struct Tombstones {
    ids: HashSet<u32>,
    order: VecDeque<(u32, Instant)>,
}

impl Tombstones {
    fn insert(&mut self, id: u32, now: Instant) {
        self.prune(now);
        if self.ids.insert(id) {
            self.order.push_back((id, now));
        }
        while self.order.len() > TOMBSTONE_LIMIT {
            if let Some((old, _)) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
    }

    fn contains(&self, id: u32) -> bool {
        self.ids.contains(&id)
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&(id, at)) = self.order.front() {
            if now.saturating_duration_since(at) < TOMBSTONE_TTL {
                break;
            }
            self.order.pop_front();
            self.ids.remove(&id);
        }
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

/// Session parameters
pub struct SessionConfig {
    pub obfuscator: Obfuscator,
    /// Datagram streams without reordering
    pub unordered: bool,
    /// Close the session once its last stream closes
    pub singleplex: bool,
    /// Create streams for unknown ids sent by the peer (server side)
    pub accept_streams: bool,
}

/// A multiplexed session
pub struct Session {
    id: u32,
    obfuscator: Obfuscator,
    unordered: bool,
    singleplex: bool,
    accept_streams: bool,
    streams: RwLock<HashMap<u32, Arc<Stream>>>,
    /// Ids of streams recently closed, so late frames do not resurrect them
    tombstones: Mutex<Tombstones>,
    next_stream_id: AtomicU32,
    session_seq: AtomicU64,
    accept_tx: mpsc::Sender<Arc<Stream>>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<Arc<Stream>>>,
    switchboard: Switchboard,
    cancel: CancellationToken,
    closed: AtomicBool,
    terminal_msg: Mutex<Option<String>>,
    on_close: Mutex<Vec<CloseHook>>,
}

impl Session {
    pub fn new(id: u32, config: SessionConfig) -> Arc<Self> {
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_BACKLOG);
        Arc::new(Self {
            id,
            obfuscator: config.obfuscator,
            unordered: config.unordered,
            singleplex: config.singleplex,
            accept_streams: config.accept_streams,
            streams: RwLock::new(HashMap::new()),
            tombstones: Mutex::new(Tombstones::default()),
            next_stream_id: AtomicU32::new(1),
            session_seq: AtomicU64::new(0),
            accept_tx,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            switchboard: Switchboard::new(),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            terminal_msg: Mutex::new(None),
            on_close: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Handed to returning connections so they join with the same key
    pub fn session_key(&self) -> [u8; 32] {
        *self.obfuscator.session_key()
    }

    pub fn is_unordered(&self) -> bool {
        self.unordered
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Why the session ended, empty while it is alive
    pub fn terminal_message(&self) -> String {
        self.terminal_msg.lock().clone().unwrap_or_default()
    }

    pub fn stream_count(&self) -> usize {
        self.streams.read().len()
    }

    /// Ids of the live streams, ascending
    pub fn stream_ids(&self) -> Vec<u32> {
        let mut ids: Vec<_> = self.streams.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn connection_count(&self) -> usize {
        self.switchboard.connection_count()
    }

    /// Closed stream ids still remembered
    pub fn tombstone_count(&self) -> usize {
        let mut tombstones = self.tombstones.lock();
        tombstones.prune(Instant::now());
        tombstones.len()
    }

    /// Resolves once the session is closed
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }

    /// Run `hook` with the session id when the session closes
    pub fn on_close(&self, hook: impl FnOnce(u32) + Send + 'static) {
        if self.is_closed() {
            hook(self.id);
            return;
        }
        self.on_close.lock().push(Box::new(hook));
    }

    /// Install an underlying connection and start its read loop
    pub fn add_connection(self: &Arc<Self>, conn: Connection) -> Result<(), TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::BrokenSession(self.terminal_message()));
        }
        let (reader, writer) = conn.split();
        let enclave = self.switchboard.add_connection(writer)?;
        debug!(session = self.id, enclave, "connection added");
        tokio::spawn(self.clone().read_loop(enclave, reader));
        Ok(())
    }

    fn new_stream(self: &Arc<Self>, id: u32, assigned: u32) -> Arc<Stream> {
        let buffer: Box<dyn RecvBuffer> = if self.unordered {
            Box::new(DatagramBuffer::new())
        } else {
            Box::new(StreamBuffer::new())
        };
        Arc::new(Stream::new(
            id,
            Arc::downgrade(self),
            buffer,
            assigned,
            self.unordered,
        ))
    }

    /// Open a new outgoing stream
    pub fn open_stream(self: &Arc<Self>) -> Result<Arc<Stream>, TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::BrokenSession(self.terminal_message()));
        }
        let id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let stream = self.new_stream(id, self.switchboard.enclave_for(id));
        self.streams.write().insert(id, stream.clone());
        trace!(session = self.id, stream = id, "stream opened");
        Ok(stream)
    }

    /// Wait for the peer to open a stream
    pub async fn accept_stream(&self) -> Result<Arc<Stream>, TunnelError> {
        let mut rx = self.accept_rx.lock().await;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(TunnelError::BrokenSession(self.terminal_message())),
            stream = rx.recv() => stream
                .ok_or_else(|| TunnelError::BrokenSession(self.terminal_message())),
        }
    }

    /// Seal and send one frame
    pub(super) async fn send_frame(
        &self,
        frame: &Frame,
        assigned: Option<&AtomicU32>,
    ) -> Result<(), TunnelError> {
        let record = self.obfuscator.obfuscate(frame)?;
        match self.switchboard.send(&record, assigned).await {
            Err(TunnelError::BrokenSession(msg)) => {
                self.close_local("no live connections").await;
                Err(TunnelError::BrokenSession(msg))
            }
            other => other,
        }
    }

    /// Forget a closed stream
    pub(super) async fn del_stream(&self, id: u32) {
        let now_empty = {
            let mut streams = self.streams.write();
            streams.remove(&id);
            streams.is_empty()
        };
        if self.accept_streams {
            self.tombstones.lock().insert(id, Instant::now());
        }
        if self.singleplex && now_empty {
            debug!(session = self.id, "last stream closed in singleplex session");
            self.close().await;
        }
    }

    async fn read_loop(self: Arc<Self>, enclave: u32, mut reader: UnitReader) {
        let mut buf = Vec::new();
        loop {
            let read = tokio::select! {
                _ = self.cancel.cancelled() => break,
                r = reader.read_unit(&mut buf) => r,
            };
            if let Err(e) = read {
                debug!(session = self.id, enclave, error = %e, "connection read ended");
                break;
            }
            match self.obfuscator.deobfuscate(&buf) {
                Ok(frame) => self.recv_frame(frame).await,
                Err(e) => debug!(session = self.id, error = %e, "dropping undecodable frame"),
            }
        }

        if self.switchboard.remove(enclave) && !self.is_closed() {
            self.close_local("all connections closed").await;
        }
    }

    async fn recv_frame(self: &Arc<Self>, frame: Frame) {
        match frame.closing {
            Closing::ClosingSession => {
                self.close_local("closed by peer").await;
                return;
            }
            Closing::ClosingSubsequent => {
                let doomed: Vec<_> = self
                    .streams
                    .read()
                    .values()
                    .filter(|s| s.id() > frame.stream_id)
                    .cloned()
                    .collect();
                for stream in doomed {
                    if stream.passive_close() {
                        self.del_stream(stream.id()).await;
                    }
                }
                return;
            }
            _ => {}
        }
        if frame.stream_id == SESSION_STREAM_ID {
            return;
        }

        let stream = match self.lookup_or_accept(&frame).await {
            Some(stream) => stream,
            None => {
                trace!(session = self.id, stream = frame.stream_id, "frame for unknown stream dropped");
                return;
            }
        };

        match stream.buffer().write(frame).await {
            Ok(true) => {
                if stream.passive_close() {
                    trace!(session = self.id, stream = stream.id(), "stream closed by peer");
                    self.del_stream(stream.id()).await;
                }
            }
            Ok(false) => {}
            Err(e) => trace!(session = self.id, stream = stream.id(), error = %e, "frame not buffered"),
        }
    }

    async fn lookup_or_accept(self: &Arc<Self>, frame: &Frame) -> Option<Arc<Stream>> {
        if let Some(stream) = self.streams.read().get(&frame.stream_id) {
            return Some(stream.clone());
        }
        if !self.accept_streams
            || frame.closing != Closing::None
            || self.is_closed()
            || self.tombstones.lock().contains(frame.stream_id)
        {
            return None;
        }

        let (stream, created) = {
            let mut streams = self.streams.write();
            match streams.get(&frame.stream_id) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let stream = self.new_stream(frame.stream_id, UNASSIGNED);
                    streams.insert(frame.stream_id, stream.clone());
                    (stream, true)
                }
            }
        };
        if created {
            trace!(session = self.id, stream = frame.stream_id, "stream accepted");
            if self.accept_tx.send(stream.clone()).await.is_err() {
                return None;
            }
        }
        Some(stream)
    }

    /// Close actively: tell the peer, then tear everything down
    pub async fn close(&self) {
        if self.is_closed() {
            return;
        }
        let seq = self.session_seq.fetch_add(1, Ordering::Relaxed);
        let frame = Frame::closing(SESSION_STREAM_ID, seq, Closing::ClosingSession);
        if let Ok(record) = self.obfuscator.obfuscate(&frame) {
            let _ = self.switchboard.send(&record, None).await;
        }
        self.close_local("closed actively").await;
    }

    async fn close_local(&self, msg: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.terminal_msg.lock() = Some(msg.to_string());
        self.cancel.cancel();

        let streams: Vec<_> = self.streams.write().drain().map(|(_, s)| s).collect();
        for stream in &streams {
            stream.session_close();
        }
        self.switchboard.close_all().await;

        let hooks = std::mem::take(&mut *self.on_close.lock());
        for hook in hooks {
            hook(self.id);
        }
        info!(session = self.id, reason = msg, streams = streams.len(), "session closed");
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("streams", &self.stream_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::{EncryptionMethod, Role, StreamState};
    use std::time::Duration;
    use tokio::time::{timeout, Instant};

    fn config(role: Role, unordered: bool, singleplex: bool) -> SessionConfig {
        SessionConfig {
            obfuscator: Obfuscator::new(EncryptionMethod::Aes256Gcm, &[0x11u8; 32], role).unwrap(),
            unordered,
            singleplex,
            accept_streams: role == Role::Server,
        }
    }

    /// A client and server session joined by `conns` in-memory connections
    fn pair(conns: usize, unordered: bool, singleplex: bool) -> (Arc<Session>, Arc<Session>) {
        let client = Session::new(1, config(Role::Client, unordered, singleplex));
        let server = Session::new(1, config(Role::Server, unordered, false));
        for _ in 0..conns {
            let (a, b) = tokio::io::duplex(1 << 20);
            client.add_connection(Connection::tls(a)).unwrap();
            server.add_connection(Connection::tls(b)).unwrap();
        }
        (client, server)
    }

    async fn read_exact(stream: &Stream, len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len);
        let mut buf = vec![0u8; 4096];
        while out.len() < len {
            let n = stream.read(&mut buf).await.unwrap();
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    #[tokio::test]
    async fn test_multiplexed_echo() {
        let (client, server) = pair(3, false, false);

        let echo = tokio::spawn({
            let server = server.clone();
            async move {
                while let Ok(stream) = server.accept_stream().await {
                    tokio::spawn(async move {
                        let mut buf = vec![0u8; 8192];
                        while let Ok(n) = stream.read(&mut buf).await {
                            if stream.write(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    });
                }
            }
        });

        let mut tasks = Vec::new();
        for i in 0..20u8 {
            let stream = client.open_stream().unwrap();
            tasks.push(tokio::spawn(async move {
                let payload: Vec<u8> = (0..40_000u32).map(|j| (j as u8) ^ i).collect();
                stream.write(&payload).await.unwrap();
                assert_eq!(read_exact(&stream, payload.len()).await, payload);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(client.stream_count(), 20);
        assert_eq!(server.stream_count(), 20);

        client.close().await;
        timeout(Duration::from_secs(1), server.closed()).await.unwrap();
        assert_eq!(server.terminal_message(), "closed by peer");
        echo.await.unwrap();
    }

    #[tokio::test]
    async fn test_passive_close_drains_then_breaks() {
        let (client, server) = pair(1, false, false);
        let stream = client.open_stream().unwrap();
        stream.write(b"0123456789abcdef").await.unwrap();

        let remote = server.accept_stream().await.unwrap();
        assert_eq!(read_exact(&remote, 16).await, b"0123456789abcdef");
        remote.write(b"bye").await.unwrap();
        remote.close().await.unwrap();
        assert_eq!(server.stream_count(), 0);

        let mut buf = [0u8; 16];
        let n = timeout(Duration::from_millis(500), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"bye");
        let err = timeout(Duration::from_millis(500), stream.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(err, Err(TunnelError::BrokenStream)));
        assert_eq!(stream.state(), StreamState::RemotelyClosed);
        assert!(matches!(stream.write(b"x").await, Err(TunnelError::BrokenStream)));
    }

    #[tokio::test]
    async fn test_session_close_wakes_readers() {
        let (client, _server) = pair(2, false, false);
        let stream = client.open_stream().unwrap();

        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 8];
            stream.read(&mut buf).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.close().await;

        let result = timeout(Duration::from_millis(500), reader).await.unwrap().unwrap();
        assert!(matches!(result, Err(TunnelError::BrokenSession(_))));
        assert!(client.open_stream().is_err());
    }

    #[tokio::test]
    async fn test_read_deadline() {
        let (client, _server) = pair(1, false, false);
        let stream = client.open_stream().unwrap();
        let start = Instant::now();
        stream.set_read_deadline(Some(start + Duration::from_millis(100)));

        let mut buf = [0u8; 8];
        assert!(matches!(stream.read(&mut buf).await, Err(TunnelError::Timeout)));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_unordered_datagrams() {
        let (client, server) = pair(2, true, false);
        let stream = client.open_stream().unwrap();
        let datagrams: Vec<Vec<u8>> = (1..=30usize).map(|n| vec![n as u8; n * 37]).collect();
        for d in &datagrams {
            stream.write(d).await.unwrap();
        }

        let remote = server.accept_stream().await.unwrap();
        assert!(remote.is_unordered());
        let mut seen = Vec::new();
        let mut buf = vec![0u8; 2048];
        for _ in 0..datagrams.len() {
            let n = remote.read(&mut buf).await.unwrap();
            seen.push(buf[..n].to_vec());
        }
        // a single enclave per stream keeps them in order here, but only boundaries are promised
        seen.sort();
        let mut expected = datagrams.clone();
        expected.sort();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn test_empty_datagram_keeps_stream_open() {
        let (client, server) = pair(1, true, false);
        let stream = client.open_stream().unwrap();
        stream.write(b"").await.unwrap();
        stream.write(b"after").await.unwrap();

        let remote = server.accept_stream().await.unwrap();
        let mut buf = [0u8; 64];
        let first = timeout(Duration::from_millis(500), remote.read(&mut buf)).await.unwrap();
        assert_eq!(first.unwrap(), 0);
        assert!(!remote.is_closed());
        let n = timeout(Duration::from_millis(500), remote.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"after");

        remote.write(b"").await.unwrap();
        let back = timeout(Duration::from_millis(500), stream.read(&mut buf)).await.unwrap();
        assert_eq!(back.unwrap(), 0);

        stream.close().await.unwrap();
        let end = timeout(Duration::from_millis(500), remote.read(&mut buf)).await.unwrap();
        assert!(matches!(end, Err(TunnelError::BrokenStream)));
    }

    #[tokio::test]
    async fn test_all_connections_lost() {
        let client = Session::new(9, config(Role::Client, false, false));
        let (a, b) = tokio::io::duplex(4096);
        client.add_connection(Connection::tls(a)).unwrap();
        drop(b);

        timeout(Duration::from_secs(1), client.closed()).await.unwrap();
        assert_eq!(client.terminal_message(), "all connections closed");
    }

    #[tokio::test]
    async fn test_singleplex_closes_with_last_stream() {
        let (client, server) = pair(1, false, true);
        let stream = client.open_stream().unwrap();
        stream.write(b"hi").await.unwrap();
        server.accept_stream().await.unwrap();

        stream.close().await.unwrap();
        assert!(client.is_closed());
        timeout(Duration::from_secs(1), server.closed()).await.unwrap();
    }

    #[tokio::test]
    async fn test_closing_subsequent() {
        let (client, server) = pair(1, false, false);
        let streams: Vec<_> = (0..4).map(|_| client.open_stream().unwrap()).collect();
        for s in &streams {
            s.write(b"x").await.unwrap();
        }
        for _ in 0..4 {
            server.accept_stream().await.unwrap();
        }

        let frame = Frame::closing(2, 0, Closing::ClosingSubsequent);
        client.send_frame(&frame, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(server.stream_count(), 2);
    }

    #[tokio::test]
    async fn test_close_hook_runs_once() {
        let (client, _server) = pair(1, false, false);
        let hits = Arc::new(AtomicU32::new(0));
        let counter = hits.clone();
        client.on_close(move |id| {
            assert_eq!(id, 1);
            counter.fetch_add(1, Ordering::SeqCst);
        });
        client.close().await;
        client.close().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_tombstones_expire_and_stay_bounded() {
        let start = Instant::now();
        let mut tombstones = Tombstones::default();
        tombstones.insert(1, start);
        tombstones.insert(1, start);
        assert_eq!(tombstones.len(), 1);

        tombstones.insert(2, start + TOMBSTONE_TTL / 2);
        assert!(tombstones.contains(1));
        tombstones.insert(3, start + TOMBSTONE_TTL);
        assert!(!tombstones.contains(1));
        assert!(tombstones.contains(2));

        let later = start + TOMBSTONE_TTL;
        for id in 10..(10 + 2 * TOMBSTONE_LIMIT as u32) {
            tombstones.insert(id, later);
        }
        assert_eq!(tombstones.len(), TOMBSTONE_LIMIT);
        assert!(!tombstones.contains(10));
        assert!(tombstones.contains(9 + 2 * TOMBSTONE_LIMIT as u32));
    }

    #[tokio::test]
    async fn test_closed_ids_bounded_over_many_streams() {
        let (client, server) = pair(1, false, false);
        for _ in 0..5000 {
            let stream = client.open_stream().unwrap();
            stream.write(b"x").await.unwrap();
            let remote = server.accept_stream().await.unwrap();
            assert_eq!(read_exact(&remote, 1).await, b"x");
            stream.close().await.unwrap();
        }

        timeout(Duration::from_secs(5), async {
            while server.stream_count() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(server.tombstone_count() <= TOMBSTONE_LIMIT);
        assert!(server.tombstone_count() > 0);
    }

    #[tokio::test]
    async fn test_late_frame_does_not_reopen_stream() {
        let (client, server) = pair(1, false, false);
        let stream = client.open_stream().unwrap();
        stream.write(b"x").await.unwrap();
        server.accept_stream().await.unwrap();
        stream.close().await.unwrap();
        timeout(Duration::from_secs(1), async {
            while server.stream_count() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let late = Frame::data(stream.id(), 7, bytes::Bytes::from_static(b"late"));
        client.send_frame(&late, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(server.stream_count(), 0);
        assert_eq!(server.tombstone_count(), 1);
    }
}
