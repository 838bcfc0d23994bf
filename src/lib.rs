//! # Mimic Tunnel
//!
//! A censorship-resistant transport that hides proxied streams inside traffic
//! that looks like an ordinary TLS 1.3 (or WebSocket) session to a plausible
//! destination.
//!
//! ## Features
//!
//! - **Handshake piggybacking**: authentication rides inside a browser-shaped
//!   TLS ClientHello/ServerHello exchange (X25519 + AES-GCM)
//! - **Browser fingerprints**: Chrome, Firefox and Safari ClientHello templates
//! - **Multiplexing**: N logical streams fanned over M underlying connections
//! - **Frame encryption**: AES-128-GCM, AES-256-GCM or ChaCha20-Poly1305 per frame
//! - **Probe resistance**: anything that fails authentication is transparently
//!   reverse-proxied to a decoy web server
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │          Pipers (client) / Dispatcher (server)       │
//! │      (local acceptors, decoy redirect, user panel)   │
//! ├─────────────────────────────────────────────────────┤
//! │                  Multiplexing Layer                  │
//! │   (Session, Stream, reorder buffer, Switchboard)     │
//! ├─────────────────────────────────────────────────────┤
//! │                    Frame Codec                       │
//! │        (Obfuscator: AEAD + TLS record wrapper)       │
//! ├─────────────────────────────────────────────────────┤
//! │                  Handshake Layer                     │
//! │  (ClientHello templates, TouchStone, server reply)   │
//! ├─────────────────────────────────────────────────────┤
//! │                  Transport Layer                     │
//! │          (direct TLS records, WebSocket)             │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod client;
pub mod config;
pub mod crypto;
pub mod obfuscation;
pub mod protocol;
pub mod server;
pub mod transport;
pub mod tunnel;

pub use config::Config;

/// Protocol version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default port for the server listener
pub const DEFAULT_PORT: u16 = 443;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Fingerprint error: {0}")]
    Fingerprint(#[from] obfuscation::FingerprintError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Authorisation error: {0}")]
    Auth(#[from] server::AuthError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Timeout")]
    Timeout,
}
