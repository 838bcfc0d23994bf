//! Transport layer implementations
//!
//! Provides the two ways a client carries its handshake and frames:
//! - Direct TLS: a browser-shaped ClientHello over raw TCP, then one TLS
//!   application-data record per frame
//! - WebSocket: an HTTP upgrade carrying the handshake in headers, then one
//!   binary message per frame (TLS is terminated by a fronting CDN)

mod connection;
mod direct;
mod websocket;

pub use connection::{AsyncStream, BoxedStream, Connection, UnitReader, UnitWriter};
pub use direct::DirectTls;
pub use websocket::WebSocketTransport;

use crate::protocol::{AuthInfo, ProtocolError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Handshake failed: {0}")]
    Handshake(#[from] ProtocolError),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Bad record: {0}")]
    BadRecord(String),

    #[error("Connection closed")]
    Closed,

    #[error("Timeout")]
    Timeout,
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error;
        match e {
            Error::ConnectionClosed | Error::AlreadyClosed => TransportError::Closed,
            Error::Io(e) => TransportError::Io(e),
            other => TransportError::WebSocket(other.to_string()),
        }
    }
}

/// Client-side handshake over a freshly dialed stream
#[async_trait]
pub trait Transport: Send + Sync {
    /// Authenticate over `stream`, returning the prepared connection and session key
    async fn handshake(
        &self,
        stream: BoxedStream,
        auth: &AuthInfo,
    ) -> Result<(Connection, [u8; 32]), TransportError>;
}

/// Which transport a client uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Direct,
    WebSocket,
}

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Time allowed for the handshake after connecting
    pub handshake_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}
