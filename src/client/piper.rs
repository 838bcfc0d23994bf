//! Local acceptors that carry TCP connections and UDP flows over sessions

use super::connector::Connector;
use crate::tunnel::{relay, Session, Stream, TunnelError, MAX_FRAME_PAYLOAD};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Hands out streams, creating sessions as needed
pub struct SessionSlot {
    connector: Arc<Connector>,
    current: tokio::sync::Mutex<Option<Arc<Session>>>,
}

impl SessionSlot {
    pub fn new(connector: Arc<Connector>) -> Self {
        Self {
            connector,
            current: tokio::sync::Mutex::new(None),
        }
    }

    /// Open a stream on the shared session, or on a fresh one in singleplex mode
    pub async fn open_stream(&self) -> Result<Arc<Stream>, TunnelError> {
        if self.connector.singleplex() {
            return self.connector.make_session().await?.open_stream();
        }

        let mut current = self.current.lock().await;
        if let Some(session) = current.as_ref() {
            if !session.is_closed() {
                if let Ok(stream) = session.open_stream() {
                    return Ok(stream);
                }
            }
            debug!(session = session.id(), reason = %session.terminal_message(), "replacing closed session");
        }
        let session = self.connector.make_session().await?;
        *current = Some(session.clone());
        session.open_stream()
    }

    /// The current multiplexed session, if any
    pub async fn session(&self) -> Option<Arc<Session>> {
        self.current.lock().await.clone()
    }

    pub async fn close(&self) {
        if let Some(session) = self.current.lock().await.take() {
            session.close().await;
        }
    }
}

/// Relay every accepted local TCP connection over its own stream
pub async fn pipe_tcp(
    listener: TcpListener,
    slot: Arc<SessionSlot>,
    stream_timeout: Duration,
    shutdown: CancellationToken,
) {
    info!(listen = ?listener.local_addr().ok(), "TCP piper listening");
    loop {
        let (conn, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %e, "accept error");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            },
        };
        let _ = conn.set_nodelay(true);

        let slot = slot.clone();
        tokio::spawn(async move {
            let stream = match slot.open_stream().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(%peer, error = %e, "could not open stream");
                    return;
                }
            };
            debug!(%peer, stream = stream.id(), "local connection piped");
            let (sent, received) = relay(stream, conn, Some(stream_timeout)).await;
            debug!(%peer, sent, received, "local connection finished");
        });
    }
    slot.close().await;
}

struct Flow {
    stream: Arc<Stream>,
    last_active: Mutex<Instant>,
}

impl Flow {
    fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }
}

type Flows = Arc<Mutex<HashMap<SocketAddr, Arc<Flow>>>>;

/// Carry each local UDP peer on its own unordered stream
///
/// A flow idle for `stream_timeout` in both directions is closed; the
/// peer's next datagram opens a new stream.
pub async fn pipe_udp(
    socket: UdpSocket,
    slot: Arc<SessionSlot>,
    stream_timeout: Duration,
    shutdown: CancellationToken,
) {
    info!(listen = ?socket.local_addr().ok(), "UDP piper listening");
    let socket = Arc::new(socket);
    let flows: Flows = Arc::new(Mutex::new(HashMap::new()));
    let mut buf = vec![0u8; 65536];

    loop {
        let (n, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(e) => {
                    debug!(error = %e, "UDP receive failed");
                    continue;
                }
            },
        };
        if n > MAX_FRAME_PAYLOAD {
            debug!(%peer, len = n, "datagram too large for one frame, dropped");
            continue;
        }

        let existing = flows.lock().get(&peer).filter(|f| !f.stream.is_closed()).cloned();
        let flow = match existing {
            Some(flow) => flow,
            None => match slot.open_stream().await {
                Ok(stream) => {
                    debug!(%peer, stream = stream.id(), "UDP flow opened");
                    let flow = Arc::new(Flow {
                        stream,
                        last_active: Mutex::new(Instant::now()),
                    });
                    flows.lock().insert(peer, flow.clone());
                    tokio::spawn(downstream(
                        flow.clone(),
                        peer,
                        socket.clone(),
                        flows.clone(),
                        stream_timeout,
                    ));
                    flow
                }
                Err(e) => {
                    warn!(%peer, error = %e, "could not open stream for UDP flow");
                    continue;
                }
            },
        };

        flow.touch();
        if let Err(e) = flow.stream.write(&buf[..n]).await {
            debug!(%peer, error = %e, "UDP flow write failed");
            flows.lock().remove(&peer);
        }
    }
    slot.close().await;
}

async fn downstream(
    flow: Arc<Flow>,
    peer: SocketAddr,
    socket: Arc<UdpSocket>,
    flows: Flows,
    idle: Duration,
) {
    let mut buf = vec![0u8; MAX_FRAME_PAYLOAD];
    loop {
        let deadline = *flow.last_active.lock() + idle;
        flow.stream.set_read_deadline(Some(deadline));
        match flow.stream.read(&mut buf).await {
            Ok(n) => {
                flow.touch();
                if let Err(e) = socket.send_to(&buf[..n], peer).await {
                    debug!(%peer, error = %e, "UDP send to local peer failed");
                }
            }
            Err(TunnelError::Timeout) => {
                if *flow.last_active.lock() + idle <= Instant::now() {
                    debug!(%peer, stream = flow.stream.id(), "UDP flow idle, closing");
                    break;
                }
            }
            Err(e) => {
                debug!(%peer, error = %e, "UDP flow ended");
                break;
            }
        }
    }

    let _ = flow.stream.close().await;
    let mut flows = flows.lock();
    if flows.get(&peer).is_some_and(|f| Arc::ptr_eq(f, &flow)) {
        flows.remove(&peer);
    }
}
