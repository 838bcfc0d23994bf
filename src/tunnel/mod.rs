//! Tunnel layer - multiplexed, encrypted streams over a pool of connections
//!
//! Provides:
//! - Frame encoding and the record-level codec
//! - Ordered (byte) and unordered (datagram) receive buffers
//! - The switchboard that spreads frames across underlying connections
//! - Sessions and the streams they own

mod frame;
mod obfuscator;
mod pipe;
mod recv_buffer;
mod session;
mod stream;
mod switchboard;

pub use frame::{Closing, Frame, FRAME_HEADER_SIZE, SESSION_STREAM_ID};
pub use obfuscator::{EncryptionMethod, Obfuscator, Role, MAX_FRAME_PAYLOAD};
pub use pipe::{BytePipe, DatagramPipe, BYTE_PIPE_CAPACITY, DATAGRAM_PIPE_CAPACITY};
pub use recv_buffer::{DatagramBuffer, Delivery, RecvBuffer, ReorderQueue, StreamBuffer};
pub use session::{Session, SessionConfig};
pub use stream::{relay, Stream, StreamState};
pub use switchboard::Switchboard;

use crate::transport::TransportError;
use thiserror::Error;

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Frame too large: {0} > {1}")]
    FrameTooLarge(usize, usize),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Frame failed authentication")]
    BadDecryption,

    #[error("Broken stream")]
    BrokenStream,

    #[error("Broken session: {0}")]
    BrokenSession(String),

    #[error("Timeout")]
    Timeout,

    #[error("Buffer too short for {0}-byte datagram")]
    ShortBuffer(usize),

    #[error("Write to closed pipe")]
    ClosedPipe,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crate::crypto::CryptoError),
}

/// Capacity of a session's queue of accepted-but-unclaimed streams
pub const ACCEPT_BACKLOG: usize = 1024;
