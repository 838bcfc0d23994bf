//! WebSocket upgrade carrying the handshake in HTTP headers
//!
//! The client sends its ephemeral key and sealed payload in a `Hidden`
//! request header; the server answers `101 Switching Protocols` with the
//! sealed session key in a `reply` header. Both values are base64.

use super::ProtocolError;
use base64::Engine;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;

/// Request header carrying `eph_pub ‖ ciphertext`
pub const HIDDEN_HEADER: &str = "hidden";

/// Response header carrying `nonce ‖ sealed session key`
pub const REPLY_HEADER: &str = "reply";

/// Length of the decoded `Hidden` header
pub const HIDDEN_LEN: usize = 96;

/// Length of the decoded `reply` header
pub const REPLY_LEN: usize = 60;

/// The parts of an upgrade request the server needs
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    /// `Sec-WebSocket-Key`
    pub key: String,
    /// Decoded `Hidden` header
    pub hidden: [u8; HIDDEN_LEN],
}

/// Whether `first` is a GET whose head asks for a WebSocket and carries `Hidden`
pub fn looks_like_upgrade(first: &[u8]) -> bool {
    if !first.starts_with(b"GET ") {
        return false;
    }
    let Some(end) = find_head_end(first) else {
        return false;
    };
    let Ok(head) = std::str::from_utf8(&first[..end]) else {
        return false;
    };

    let (mut upgrade, mut hidden) = (false, false);
    for (name, value) in head.split("\r\n").skip(1).filter_map(|l| l.split_once(':')) {
        let name = name.trim();
        if name.eq_ignore_ascii_case("upgrade") && value.trim().eq_ignore_ascii_case("websocket") {
            upgrade = true;
        } else if name.eq_ignore_ascii_case(HIDDEN_HEADER) {
            hidden = true;
        }
    }
    upgrade && hidden
}

/// Whether `buf` holds a complete request head
pub fn request_complete(buf: &[u8]) -> bool {
    find_head_end(buf).is_some()
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// Parse a complete upgrade request
pub fn parse_upgrade_request(buf: &[u8]) -> Result<UpgradeRequest, ProtocolError> {
    let end = find_head_end(buf)
        .ok_or_else(|| ProtocolError::BadInput("incomplete HTTP request".to_string()))?;
    if end != buf.len() {
        return Err(ProtocolError::BadInput(
            "data after upgrade request".to_string(),
        ));
    }
    let head = std::str::from_utf8(&buf[..end])
        .map_err(|_| ProtocolError::BadInput("request head is not UTF-8".to_string()))?;

    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    if !request_line.starts_with("GET ") || !request_line.ends_with(" HTTP/1.1") {
        return Err(ProtocolError::BadInput(format!(
            "unexpected request line {:?}",
            request_line
        )));
    }

    let mut upgrade = false;
    let mut key = None;
    let mut hidden = None;
    for line in lines.filter(|l| !l.is_empty()) {
        let Some((name, value)) = line.split_once(':') else {
            return Err(ProtocolError::BadInput(format!("bad header line {:?}", line)));
        };
        let value = value.trim();
        match name.trim().to_ascii_lowercase().as_str() {
            "upgrade" => upgrade = value.eq_ignore_ascii_case("websocket"),
            "sec-websocket-key" => key = Some(value.to_string()),
            HIDDEN_HEADER => hidden = Some(value.to_string()),
            _ => {}
        }
    }

    if !upgrade {
        return Err(ProtocolError::BadInput("not a websocket upgrade".to_string()));
    }
    let key = key.ok_or_else(|| ProtocolError::BadInput("missing Sec-WebSocket-Key".to_string()))?;
    let hidden = hidden.ok_or_else(|| ProtocolError::BadInput("missing Hidden header".to_string()))?;

    let decoded = base64::engine::general_purpose::STANDARD
        .decode(hidden)
        .map_err(|e| ProtocolError::BadInput(format!("Hidden header: {}", e)))?;
    let hidden: [u8; HIDDEN_LEN] = decoded.as_slice().try_into().map_err(|_| {
        ProtocolError::BadInput(format!("Hidden header of {} bytes", decoded.len()))
    })?;

    Ok(UpgradeRequest { key, hidden })
}

/// The `101 Switching Protocols` response carrying the sealed session key
pub fn upgrade_response(key: &str, reply: &[u8; REPLY_LEN]) -> Vec<u8> {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         {}: {}\r\n\r\n",
        derive_accept_key(key.as_bytes()),
        REPLY_HEADER,
        base64::engine::general_purpose::STANDARD.encode(reply)
    )
    .into_bytes()
}

/// Decode a `reply` header value
pub fn decode_reply(value: &str) -> Result<[u8; REPLY_LEN], ProtocolError> {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(value.trim())
        .map_err(|e| ProtocolError::BadInput(format!("reply header: {}", e)))?;
    decoded
        .as_slice()
        .try_into()
        .map_err(|_| ProtocolError::BadInput(format!("reply header of {} bytes", decoded.len())))
}
