//! Multiplexing frames
//!
//! Frame header (encrypted as associated data, masked on the wire):
//! ```text
//! +--------+--------+--------+--------+
//! |            Stream ID (4B)         |
//! +--------+--------+--------+--------+
//! |                                   |
//! +            Seq (8B)               +
//! |                                   |
//! +--------+--------+--------+--------+
//! | Closing|Reserved|
//! +--------+--------+
//! ```

use super::TunnelError;
use bytes::{Buf, BufMut, Bytes};

/// Frame header size in bytes
pub const FRAME_HEADER_SIZE: usize = 14;

/// Stream id reserved for session-level frames
pub const SESSION_STREAM_ID: u32 = 0;

/// Closing tags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Closing {
    /// Ordinary data frame
    None = 0x00,
    /// The sender closed this stream
    ClosingStream = 0x01,
    /// The sender closed the whole session
    ClosingSession = 0x02,
    /// Close every stream with a higher id than this one
    ClosingSubsequent = 0x03,
}

impl TryFrom<u8> for Closing {
    type Error = TunnelError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Closing::None),
            0x01 => Ok(Closing::ClosingStream),
            0x02 => Ok(Closing::ClosingSession),
            0x03 => Ok(Closing::ClosingSubsequent),
            _ => Err(TunnelError::InvalidFrame(format!(
                "Unknown closing tag: {}",
                value
            ))),
        }
    }
}

/// A multiplexing frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stream_id: u32,
    /// Per-stream sequence number, starting at 0
    pub seq: u64,
    pub closing: Closing,
    pub payload: Bytes,
}

impl Frame {
    /// Create a data frame
    pub fn data(stream_id: u32, seq: u64, payload: Bytes) -> Self {
        Self {
            stream_id,
            seq,
            closing: Closing::None,
            payload,
        }
    }

    /// Create a closing frame padded with 300-500 random bytes
    pub fn closing(stream_id: u32, seq: u64, closing: Closing) -> Self {
        Self {
            stream_id,
            seq,
            closing,
            payload: Bytes::from(closing_padding()),
        }
    }

    /// Encode the header
    pub fn header(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        let mut buf = &mut header[..];
        buf.put_u32(self.stream_id);
        buf.put_u64(self.seq);
        buf.put_u8(self.closing as u8);
        buf.put_u8(0);
        header
    }

    /// Rebuild a frame from a decoded header and payload
    pub fn from_header(header: &[u8; FRAME_HEADER_SIZE], payload: Bytes) -> Result<Self, TunnelError> {
        let mut buf = &header[..];
        let stream_id = buf.get_u32();
        let seq = buf.get_u64();
        let closing = Closing::try_from(buf.get_u8())?;
        Ok(Self {
            stream_id,
            seq,
            closing,
            payload,
        })
    }
}

fn closing_padding() -> Vec<u8> {
    use rand::Rng;
    let mut padding = vec![0u8; rand::thread_rng().gen_range(300..=500)];
    crate::crypto::random_bytes(&mut padding);
    padding
}
