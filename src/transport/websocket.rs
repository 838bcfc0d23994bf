//! WebSocket transport
//!
//! The upgrade request carries the handshake in its `Hidden` header and the
//! server's `101` response returns the sealed session key in `reply`.

use super::{BoxedStream, Connection, Transport, TransportError};
use crate::protocol::websocket::{decode_reply, HIDDEN_HEADER, REPLY_HEADER};
use crate::protocol::{AuthInfo, ClientAuth, ProtocolError};
use async_trait::async_trait;
use base64::Engine;
use tokio_tungstenite::client_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tracing::debug;

/// WebSocket transport towards `ws://host/path`
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    host: String,
    path: String,
}

impl WebSocketTransport {
    pub fn new(host: impl Into<String>, path: impl Into<String>) -> Self {
        let path = path.into();
        let path = if path.starts_with('/') {
            path
        } else {
            format!("/{}", path)
        };
        Self {
            host: host.into(),
            path,
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn handshake(
        &self,
        stream: BoxedStream,
        auth: &AuthInfo,
    ) -> Result<(Connection, [u8; 32]), TransportError> {
        let client = ClientAuth::new(auth)?;

        let url = format!("ws://{}{}", self.host, self.path);
        let mut request = url.as_str().into_client_request()?;
        let hidden = base64::engine::general_purpose::STANDARD.encode(client.hidden_blob());
        request.headers_mut().insert(
            HeaderName::from_static(HIDDEN_HEADER),
            HeaderValue::from_str(&hidden)
                .map_err(|e| TransportError::WebSocket(e.to_string()))?,
        );

        let (ws, response) = client_async(request, stream).await?;
        let reply = response
            .headers()
            .get(REPLY_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                ProtocolError::BadInput("upgrade response without reply header".to_string())
            })?;
        let session_key = client.open_reply(&decode_reply(reply)?)?;
        debug!(url = %url, "WebSocket handshake complete");

        Ok((Connection::Ws(ws), session_key))
    }
}
