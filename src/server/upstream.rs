//! Forwarding accepted streams to the configured upstream proxy

use crate::config::{Network, ProxyEntry};
use crate::tunnel::{relay, Session, Stream, TunnelError, MAX_FRAME_PAYLOAD};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{lookup_host, TcpStream, UdpSocket};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Accept streams from `session` and relay each one to `upstream`
pub async fn serve_session(session: Arc<Session>, upstream: ProxyEntry, stream_timeout: Duration) {
    while let Ok(stream) = session.accept_stream().await {
        let upstream = upstream.clone();
        tokio::spawn(async move {
            let result = match upstream.network {
                Network::Tcp => relay_tcp(stream.clone(), &upstream.address, stream_timeout).await,
                Network::Udp => relay_udp(stream.clone(), &upstream.address, stream_timeout).await,
            };
            if let Err(e) = result {
                warn!(stream = stream.id(), upstream = %upstream.address, error = %e, "upstream relay failed");
                let _ = stream.close().await;
            }
        });
    }
    debug!(
        session = session.id(),
        reason = %session.terminal_message(),
        "session stopped accepting streams"
    );
}

async fn relay_tcp(stream: Arc<Stream>, address: &str, idle: Duration) -> Result<(), TunnelError> {
    let conn = TcpStream::connect(address).await?;
    let _ = conn.set_nodelay(true);
    let (sent, received) = relay(stream.clone(), conn, Some(idle)).await;
    debug!(stream = stream.id(), sent, received, "TCP stream finished");
    Ok(())
}

async fn resolve(address: &str) -> Result<SocketAddr, TunnelError> {
    lookup_host(address).await?.next().ok_or_else(|| {
        TunnelError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("{} did not resolve", address),
        ))
    })
}

async fn relay_udp(stream: Arc<Stream>, address: &str, idle: Duration) -> Result<(), TunnelError> {
    let target = resolve(address).await?;
    let bind: SocketAddr = if target.is_ipv4() {
        ([0, 0, 0, 0], 0).into()
    } else {
        ([0u16; 8], 0).into()
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(target).await?;
    info!(stream = stream.id(), upstream = %target, "UDP stream opened");

    let last_active = Mutex::new(Instant::now());
    let to_upstream = async {
        let mut buf = vec![0u8; MAX_FRAME_PAYLOAD];
        loop {
            let n = match stream.read(&mut buf).await {
                Ok(n) => n,
                Err(e) => return Err::<(), TunnelError>(e),
            };
            *last_active.lock() = Instant::now();
            socket.send(&buf[..n]).await?;
        }
    };
    let from_upstream = async {
        let mut buf = vec![0u8; 65536];
        loop {
            let deadline = *last_active.lock() + idle;
            let n = match tokio::time::timeout_at(deadline, socket.recv(&mut buf)).await {
                Ok(r) => r?,
                Err(_) if *last_active.lock() + idle <= Instant::now() => {
                    return Err::<(), TunnelError>(TunnelError::Timeout);
                }
                Err(_) => continue,
            };
            *last_active.lock() = Instant::now();
            // datagrams that cannot fit in one frame are dropped
            if n <= MAX_FRAME_PAYLOAD {
                stream.write(&buf[..n]).await?;
            }
        }
    };

    let result = tokio::select! {
        r = to_upstream => r,
        r = from_upstream => r,
    };
    if let Err(e) = result {
        debug!(stream = stream.id(), error = %e, "UDP stream finished");
    }
    let _ = stream.close().await;
    Ok(())
}
