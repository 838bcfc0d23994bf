//! Read-only admin API spoken over the streams of an admin session
//!
//! Each stream carries one HTTP/1.1 request and its JSON response:
//!
//! - `GET /admin/users`
//! - `GET /admin/users/<base64 uid>`

use super::panel::Panel;
use crate::config::parse_uid;
use crate::tunnel::{Session, Stream, TunnelError};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

const MAX_REQUEST: usize = 8 * 1024;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Serve admin requests until the session closes
pub async fn serve_admin(session: Arc<Session>, panel: Arc<Panel>) {
    info!(session = session.id(), "admin session opened");
    while let Ok(stream) = session.accept_stream().await {
        let panel = panel.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_request(&stream, &panel).await {
                debug!(stream = stream.id(), error = %e, "admin request failed");
            }
            let _ = stream.close().await;
        });
    }
}

async fn handle_request(stream: &Stream, panel: &Panel) -> Result<(), TunnelError> {
    stream.set_read_deadline(Some(Instant::now() + REQUEST_TIMEOUT));
    let mut request = Vec::new();
    let mut buf = [0u8; 1024];
    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
        if request.len() > MAX_REQUEST {
            return respond(stream, 413, "Payload Too Large", &error_body("request too large")).await;
        }
        let n = stream.read(&mut buf).await?;
        request.extend_from_slice(&buf[..n]);
    }

    let (status, reason, body) = route(&request, panel).await;
    respond(stream, status, reason, &body).await
}

async fn route(request: &[u8], panel: &Panel) -> (u16, &'static str, String) {
    let line = request
        .split(|&b| b == b'\r')
        .next()
        .and_then(|l| std::str::from_utf8(l).ok())
        .unwrap_or("");
    let mut parts = line.split_whitespace();
    let (Some(method), Some(path)) = (parts.next(), parts.next()) else {
        return (400, "Bad Request", error_body("malformed request line"));
    };
    if method != "GET" {
        return (405, "Method Not Allowed", error_body("only GET is supported"));
    }

    match path.trim_end_matches('/') {
        "/admin/users" => (200, "OK", to_json(&panel.user_statuses().await)),
        p => match p.strip_prefix("/admin/users/") {
            Some(encoded) => match parse_uid(encoded) {
                Ok(uid) => match panel.user_status(&uid).await {
                    Some(status) => (200, "OK", to_json(&status)),
                    None => (404, "Not Found", error_body("no such user")),
                },
                Err(_) => (400, "Bad Request", error_body("invalid uid")),
            },
            None => (404, "Not Found", error_body("no such endpoint")),
        },
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| error_body(&e.to_string()))
}

fn error_body(message: &str) -> String {
    serde_json::json!({ "error": message }).to_string()
}

async fn respond(stream: &Stream, status: u16, reason: &str, body: &str) -> Result<(), TunnelError> {
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason,
        body.len(),
        body
    );
    stream.write(response.as_bytes()).await.map(|_| ())
}
