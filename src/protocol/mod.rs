//! Handshake protocol definitions and constants
//!
//! The authentication handshake hides inside a TLS 1.3 ClientHello/ServerHello
//! pair (or a WebSocket upgrade):
//!
//! ```text
//! Client                                         Server
//!   |  ClientHello                                 |
//!   |    random      = ephemeral X25519 public     |
//!   |    session_id  = sealed auth payload[0:32]   |
//!   |    key_share   = sealed auth payload[32:64]  |
//!   |--------------------------------------------->|  TouchStone
//!   |                                              |
//!   |  ServerHello + ChangeCipherSpec + AppData    |
//!   |    random[0:12]   = nonce                    |
//!   |    random[12:32]  = sealed session key[0:20] |
//!   |    key_share[0:28]= sealed session key[20:]  |
//!   |<---------------------------------------------|
//! ```

mod auth;
mod client_hello;
pub mod record;
mod touchstone;
pub mod websocket;

pub use auth::{AuthInfo, ClientAuth, ClientInfo, Uid, WorldState, AUTH_PAYLOAD_LEN};
pub use client_hello::{parse_client_hello, parse_client_hello_record, ClientHello};
pub use touchstone::{
    compose_server_reply, seal_session_key, Authenticated, HandshakeFlavor, TouchStone,
    UsedRandoms,
};

use crate::crypto::CryptoError;
use crate::obfuscation::FingerprintError;
use std::time::Duration;
use thiserror::Error;

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Bad input: {0}")]
    BadInput(String),

    #[error("Replayed ClientHello random")]
    Replay,

    #[error("Bad decryption")]
    BadDecryption,

    #[error("Timestamp {timestamp} outside window around {now}")]
    TimestampOutOfWindow { timestamp: u64, now: u64 },

    #[error("Used-random cache is full ({0} entries)")]
    CacheFull(usize),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Fingerprint error: {0}")]
    Fingerprint(#[from] FingerprintError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Accepted clock skew between client and server
pub const TIMESTAMP_WINDOW: Duration = Duration::from_secs(12 * 60 * 60);

/// Largest record body carried on the data path
pub const APP_DATA_MAX_LENGTH: usize = 16401;

/// Time the server waits for a complete first packet
pub const FIRST_PACKET_TIMEOUT: Duration = Duration::from_secs(3);

/// Bytes the server reads looking for a first packet
pub const FIRST_PACKET_MAX: usize = 1500;
