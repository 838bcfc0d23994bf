//! Per-connection dispatch: authenticate, join a session, or hand off to the decoy

use super::admin::serve_admin;
use super::upstream::serve_session;
use super::Server;
use crate::config::encode_uid;
use crate::crypto::random_bytes;
use crate::protocol::{Authenticated, HandshakeFlavor, TouchStone, FIRST_PACKET_MAX, FIRST_PACKET_TIMEOUT};
use crate::transport::{BoxedStream, Connection, TransportError};
use crate::tunnel::{EncryptionMethod, Obfuscator, Role, Session, SessionConfig, TunnelError};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::Role as WsRole;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

/// Handle one accepted connection to completion of its handshake
pub(super) async fn dispatch(server: Arc<Server>, mut conn: TcpStream, peer: SocketAddr) {
    let _ = conn.set_nodelay(true);

    let mut first = Vec::with_capacity(FIRST_PACKET_MAX);
    if let Err(reason) = read_first_packet(&mut conn, &mut first).await {
        warn!(%peer, reason, len = first.len(), "no usable first packet, redirecting to decoy");
        redirect(&server.redir_addr, conn, first).await;
        return;
    }

    let auth = match server.touchstone.authenticate(&first) {
        Ok(auth) => auth,
        Err(e) => {
            warn!(%peer, error = %e, "handshake rejected, redirecting to decoy");
            redirect(&server.redir_addr, conn, first).await;
            return;
        }
    };
    let info = auth.info.clone();

    if info.encryption_method == EncryptionMethod::Plain && !server.allow_plain {
        warn!(%peer, "plain frame codec requested but not allowed, redirecting to decoy");
        redirect(&server.redir_addr, conn, first).await;
        return;
    }

    if server.admin_uid == Some(info.uid) && info.session_id == 0 {
        if let Err(e) = admit_admin(&server, &auth, conn).await {
            debug!(%peer, error = %e, "admin handshake failed");
        }
        return;
    }

    let Some(upstream) = server.proxy_book.get(&info.proxy_method).cloned() else {
        warn!(%peer, method = %info.proxy_method, "unknown proxy method, redirecting to decoy");
        redirect(&server.redir_addr, conn, first).await;
        return;
    };

    let user = match server.panel.get_user(&info.uid).await {
        Ok(user) => user,
        Err(e) => {
            warn!(%peer, uid = %encode_uid(&info.uid), error = %e, "user refused, redirecting to decoy");
            redirect(&server.redir_addr, conn, first).await;
            return;
        }
    };

    let make = || {
        let mut key = [0u8; 32];
        random_bytes(&mut key);
        session_config(info.encryption_method, &key, info.unordered)
    };
    let (session, created) = match user.get_session(info.session_id, make).await {
        Ok(found) => found,
        Err(e) => {
            warn!(%peer, uid = %encode_uid(&info.uid), error = %e, "session refused, redirecting to decoy");
            redirect(&server.redir_addr, conn, first).await;
            return;
        }
    };

    let prepared = match finish_handshake(&auth, conn, &session.session_key()).await {
        Ok(prepared) => prepared,
        Err(e) => {
            debug!(%peer, error = %e, "could not complete handshake");
            if created {
                session.close().await;
            }
            return;
        }
    };
    if let Err(e) = session.add_connection(prepared) {
        debug!(%peer, session = session.id(), error = %e, "session closed before connection joined");
        return;
    }
    debug!(%peer, session = session.id(), created, "connection joined session");

    if created {
        tokio::spawn(serve_session(session, upstream, server.stream_timeout));
    }
}

fn session_config(
    method: EncryptionMethod,
    key: &[u8; 32],
    unordered: bool,
) -> Result<SessionConfig, TunnelError> {
    Ok(SessionConfig {
        obfuscator: Obfuscator::new(method, key, Role::Server)?,
        unordered,
        singleplex: false,
        accept_streams: true,
    })
}

async fn admit_admin(server: &Server, auth: &Authenticated, conn: TcpStream) -> Result<(), TransportError> {
    let mut key = [0u8; 32];
    random_bytes(&mut key);
    let config = session_config(auth.info.encryption_method, &key, false)
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

    let prepared = finish_handshake(auth, conn, &key).await?;
    let session = Session::new(0, config);
    session
        .add_connection(prepared)
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
    info!(uid = %encode_uid(&auth.info.uid), "admin connected");
    tokio::spawn(serve_admin(session, server.panel.clone()));
    Ok(())
}

/// Accumulate the first packet, giving up after the deadline or the size cap
async fn read_first_packet(conn: &mut TcpStream, buf: &mut Vec<u8>) -> Result<(), &'static str> {
    let deadline = Instant::now() + FIRST_PACKET_TIMEOUT;
    let mut chunk = [0u8; FIRST_PACKET_MAX];
    loop {
        if TouchStone::first_packet_complete(buf) {
            return Ok(());
        }
        if buf.len() >= FIRST_PACKET_MAX {
            return Err("first packet too large");
        }
        let room = FIRST_PACKET_MAX - buf.len();
        match tokio::time::timeout_at(deadline, conn.read(&mut chunk[..room])).await {
            Err(_) => return Err("timed out"),
            Ok(Err(_)) => return Err("read failed"),
            Ok(Ok(0)) => return Err("closed early"),
            Ok(Ok(n)) => buf.extend_from_slice(&chunk[..n]),
        }
    }
}

/// Send the handshake reply and wrap `conn` for frame traffic
async fn finish_handshake(
    auth: &Authenticated,
    mut conn: TcpStream,
    session_key: &[u8; 32],
) -> Result<Connection, TransportError> {
    let reply = auth.reply(session_key)?;
    conn.write_all(&reply).await?;
    match auth.flavor {
        HandshakeFlavor::DirectTls { .. } => Ok(Connection::tls(conn)),
        HandshakeFlavor::WebSocket { .. } => {
            let stream: BoxedStream = Box::new(conn);
            let ws = WebSocketStream::from_raw_socket(stream, WsRole::Server, None).await;
            Ok(Connection::Ws(ws))
        }
    }
}

/// Replay what was read to the decoy, then splice the two connections
async fn redirect(redir_addr: &str, mut conn: TcpStream, first: Vec<u8>) {
    let mut decoy = match TcpStream::connect(redir_addr).await {
        Ok(decoy) => decoy,
        Err(e) => {
            warn!(decoy = redir_addr, error = %e, "decoy unreachable, dropping connection");
            return;
        }
    };
    if !first.is_empty() && decoy.write_all(&first).await.is_err() {
        return;
    }
    match tokio::io::copy_bidirectional(&mut conn, &mut decoy).await {
        Ok((up, down)) => debug!(up, down, "decoy connection finished"),
        Err(e) => debug!(error = %e, "decoy connection ended"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_first_packet_waits_for_whole_record() {
        let (mut client, mut server) = pair().await;
        let record = [0x16, 0x03, 0x01, 0x00, 0x04, 1, 2, 3, 4];
        client.write_all(&record[..6]).await.unwrap();
        let writer = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            client.write_all(&record[6..]).await.unwrap();
            client
        });

        let mut buf = Vec::new();
        read_first_packet(&mut server, &mut buf).await.unwrap();
        assert_eq!(buf, record);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_first_packet_gives_up() {
        let (mut client, mut server) = pair().await;
        client.write_all(b"\x16\x03\x01\x05\x00partial").await.unwrap();
        drop(client);
        let mut buf = Vec::new();
        assert_eq!(
            read_first_packet(&mut server, &mut buf).await,
            Err("closed early")
        );
        assert_eq!(buf, b"\x16\x03\x01\x05\x00partial");
    }

    #[tokio::test]
    async fn test_redirect_replays_first_bytes() {
        let decoy = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let decoy_addr = decoy.local_addr().unwrap().to_string();
        let decoy_task = tokio::spawn(async move {
            let (mut conn, _) = decoy.accept().await.unwrap();
            let mut buf = vec![0u8; 11];
            conn.read_exact(&mut buf).await.unwrap();
            conn.write_all(b"decoy").await.unwrap();
            buf
        });

        let (mut client, server) = pair().await;
        tokio::spawn(async move { redirect(&decoy_addr, server, b"probe".to_vec()).await });
        client.write_all(b" again").await.unwrap();

        let mut reply = [0u8; 5];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"decoy");
        assert_eq!(decoy_task.await.unwrap(), b"probe again");
    }
}
