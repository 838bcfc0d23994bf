//! Frame codec
//!
//! Every frame travels as one TLS application-data record:
//!
//! ```text
//! 17 03 03 | len (2B) | masked header (14B) | AEAD(payload) + tag (16B)
//! ```
//!
//! The header is the AEAD's associated data and is masked on the wire with
//! `SHA-256(session_key ‖ tag)[0:14]`, so a passive observer sees only
//! uniformly random bytes after the record header.
//!
//! The nonce is `stream_id (4B) ‖ seq | direction << 63 (8B)`. Both peers
//! share one session key; the direction bit keeps their nonce spaces apart.
//!
//! `Plain` performs no encryption. The header is scrambled with four CRC-32
//! words keyed by the session key and 16 random salt bytes appended to the
//! record. It offers no confidentiality and is only meant to be layered
//! under another cipher.

use super::frame::{Frame, FRAME_HEADER_SIZE};
use super::TunnelError;
use crate::crypto::{random_bytes, AeadAlgorithm, AeadCipher, NONCE_LEN, TAG_LEN};
use crate::protocol::record::{
    add_record_layer, CONTENT_APPLICATION_DATA, RECORD_HEADER_LEN, VERSION_TLS12,
};
use crate::protocol::APP_DATA_MAX_LENGTH;
use bytes::Bytes;
use ring::digest;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

/// Salt length appended in `Plain` mode; same size as an AEAD tag
const SALT_LEN: usize = 16;

/// Largest payload a single frame can carry
pub const MAX_FRAME_PAYLOAD: usize = APP_DATA_MAX_LENGTH - FRAME_HEADER_SIZE - TAG_LEN;

/// Frame encryption methods, as negotiated in the auth payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EncryptionMethod {
    #[serde(rename = "plain")]
    Plain,
    #[default]
    #[serde(rename = "aes-256-gcm")]
    Aes256Gcm,
    #[serde(rename = "chacha20-poly1305")]
    ChaCha20Poly1305,
    #[serde(rename = "aes-128-gcm")]
    Aes128Gcm,
}

impl EncryptionMethod {
    pub fn as_byte(&self) -> u8 {
        match self {
            Self::Plain => 0,
            Self::Aes256Gcm => 1,
            Self::ChaCha20Poly1305 => 2,
            Self::Aes128Gcm => 3,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Plain),
            1 => Some(Self::Aes256Gcm),
            2 => Some(Self::ChaCha20Poly1305),
            3 => Some(Self::Aes128Gcm),
            _ => None,
        }
    }

    fn algorithm(&self) -> Option<AeadAlgorithm> {
        match self {
            Self::Plain => None,
            Self::Aes256Gcm => Some(AeadAlgorithm::Aes256Gcm),
            Self::ChaCha20Poly1305 => Some(AeadAlgorithm::ChaCha20Poly1305),
            Self::Aes128Gcm => Some(AeadAlgorithm::Aes128Gcm),
        }
    }
}

/// Which end of the session a codec belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    fn direction_bit(&self) -> u64 {
        match self {
            Role::Client => 0,
            Role::Server => 1 << 63,
        }
    }

    fn peer(&self) -> Role {
        match self {
            Role::Client => Role::Server,
            Role::Server => Role::Client,
        }
    }
}

/// Seals outgoing frames as `role` and opens frames sent by the peer
pub struct Obfuscator {
    method: EncryptionMethod,
    cipher: Option<AeadCipher>,
    session_key: [u8; 32],
    role: Role,
}

impl Obfuscator {
    pub fn new(
        method: EncryptionMethod,
        session_key: &[u8; 32],
        role: Role,
    ) -> Result<Self, TunnelError> {
        let cipher = match method.algorithm() {
            Some(algorithm) => Some(AeadCipher::new(
                algorithm,
                &session_key[..algorithm.key_len()],
            )?),
            None => None,
        };
        Ok(Self {
            method,
            cipher,
            session_key: *session_key,
            role,
        })
    }

    pub fn method(&self) -> EncryptionMethod {
        self.method
    }

    /// Key shared by every connection of the session
    pub fn session_key(&self) -> &[u8; 32] {
        &self.session_key
    }

    pub fn role(&self) -> Role {
        self.role
    }

    fn nonce(frame_stream_id: u32, seq: u64, role: Role) -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        nonce[..4].copy_from_slice(&frame_stream_id.to_be_bytes());
        nonce[4..].copy_from_slice(&(seq | role.direction_bit()).to_be_bytes());
        nonce
    }

    fn aead_mask(&self, tag: &[u8]) -> [u8; FRAME_HEADER_SIZE] {
        let mut ctx = digest::Context::new(&digest::SHA256);
        ctx.update(&self.session_key);
        ctx.update(tag);
        let digest = ctx.finish();

        let mut mask = [0u8; FRAME_HEADER_SIZE];
        mask.copy_from_slice(&digest.as_ref()[..FRAME_HEADER_SIZE]);
        mask
    }

    fn plain_mask(&self, salt: &[u8]) -> [u8; FRAME_HEADER_SIZE] {
        let mut words = [0u8; 16];
        for (i, word) in words.chunks_exact_mut(4).enumerate() {
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&self.session_key);
            hasher.update(salt);
            hasher.update(&[i as u8]);
            word.copy_from_slice(&hasher.finalize().to_be_bytes());
        }
        let mut mask = [0u8; FRAME_HEADER_SIZE];
        mask.copy_from_slice(&words[..FRAME_HEADER_SIZE]);
        mask
    }

    /// Encode `frame` into one complete record
    pub fn obfuscate(&self, frame: &Frame) -> Result<Vec<u8>, TunnelError> {
        if frame.payload.len() > MAX_FRAME_PAYLOAD {
            return Err(TunnelError::FrameTooLarge(
                frame.payload.len(),
                MAX_FRAME_PAYLOAD,
            ));
        }

        let header = frame.header();
        let mut body = Vec::with_capacity(FRAME_HEADER_SIZE + frame.payload.len() + TAG_LEN);
        body.extend_from_slice(&header);

        match &self.cipher {
            Some(cipher) => {
                let mut sealed = frame.payload.to_vec();
                let nonce = Self::nonce(frame.stream_id, frame.seq, self.role);
                cipher.seal_in_place(&nonce, &header, &mut sealed)?;

                let mask = self.aead_mask(&sealed[sealed.len() - TAG_LEN..]);
                for (b, m) in body.iter_mut().zip(mask.iter()) {
                    *b ^= m;
                }
                body.extend_from_slice(&sealed);
            }
            None => {
                let mut salt = [0u8; SALT_LEN];
                random_bytes(&mut salt);
                let mask = self.plain_mask(&salt);
                for (b, m) in body.iter_mut().zip(mask.iter()) {
                    *b ^= m;
                }
                body.extend_from_slice(&frame.payload);
                body.extend_from_slice(&salt);
            }
        }

        Ok(add_record_layer(CONTENT_APPLICATION_DATA, VERSION_TLS12, &body))
    }

    /// Decode one complete record sent by the peer
    pub fn deobfuscate(&self, record: &[u8]) -> Result<Frame, TunnelError> {
        if record.len() < RECORD_HEADER_LEN || record[0] != CONTENT_APPLICATION_DATA {
            return Err(TunnelError::InvalidFrame("not an application data record".to_string()));
        }
        let len = u16::from_be_bytes([record[3], record[4]]) as usize;
        let body = &record[RECORD_HEADER_LEN..];
        if body.len() != len {
            return Err(TunnelError::InvalidFrame(format!(
                "record declares {} bytes, holds {}",
                len,
                body.len()
            )));
        }
        if body.len() < FRAME_HEADER_SIZE + TAG_LEN {
            return Err(TunnelError::InvalidFrame(format!(
                "record body of {} bytes too short",
                body.len()
            )));
        }

        let mut header = [0u8; FRAME_HEADER_SIZE];
        header.copy_from_slice(&body[..FRAME_HEADER_SIZE]);
        let rest = &body[FRAME_HEADER_SIZE..];

        match &self.cipher {
            Some(cipher) => {
                let mask = self.aead_mask(&rest[rest.len() - TAG_LEN..]);
                for (b, m) in header.iter_mut().zip(mask.iter()) {
                    *b ^= m;
                }
                // stream id and seq are needed for the nonce before the header is trusted
                let stream_id = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
                let mut seq = [0u8; 8];
                seq.copy_from_slice(&header[4..12]);
                let nonce = Self::nonce(stream_id, u64::from_be_bytes(seq), self.role.peer());

                let payload = cipher
                    .open(&nonce, &header, rest)
                    .map_err(|_| TunnelError::BadDecryption)?;
                Frame::from_header(&header, Bytes::from(payload))
            }
            None => {
                let (payload, salt) = rest.split_at(rest.len() - SALT_LEN);
                let mask = self.plain_mask(salt);
                for (b, m) in header.iter_mut().zip(mask.iter()) {
                    *b ^= m;
                }
                Frame::from_header(&header, Bytes::copy_from_slice(payload))
            }
        }
    }
}

impl Drop for Obfuscator {
    fn drop(&mut self) {
        self.session_key.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::Closing;

    const METHODS: [EncryptionMethod; 4] = [
        EncryptionMethod::Plain,
        EncryptionMethod::Aes256Gcm,
        EncryptionMethod::ChaCha20Poly1305,
        EncryptionMethod::Aes128Gcm,
    ];

    fn pair(method: EncryptionMethod) -> (Obfuscator, Obfuscator) {
        let mut key = [0u8; 32];
        random_bytes(&mut key);
        (
            Obfuscator::new(method, &key, Role::Client).unwrap(),
            Obfuscator::new(method, &key, Role::Server).unwrap(),
        )
    }

    #[test]
    fn test_round_trip_all_methods() {
        for method in METHODS {
            let (client, server) = pair(method);
            for len in [0usize, 1, 100, 1500, MAX_FRAME_PAYLOAD] {
                let mut payload = vec![0u8; len];
                random_bytes(&mut payload);
                let frame = Frame::data(9, 1234, Bytes::from(payload));

                let record = client.obfuscate(&frame).unwrap();
                assert!(record.len() - RECORD_HEADER_LEN <= APP_DATA_MAX_LENGTH);
                assert_eq!(&record[..3], &[0x17, 0x03, 0x03]);
                assert_eq!(server.deobfuscate(&record).unwrap(), frame, "{:?} {}", method, len);

                let back = server.obfuscate(&frame).unwrap();
                assert_eq!(client.deobfuscate(&back).unwrap(), frame);
            }
        }
    }

    #[test]
    fn test_closing_frames_round_trip() {
        for method in METHODS {
            let (client, server) = pair(method);
            let frame = Frame::closing(0, 5, Closing::ClosingSession);
            let record = server.obfuscate(&frame).unwrap();
            assert_eq!(client.deobfuscate(&record).unwrap(), frame);
        }
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let (client, _) = pair(EncryptionMethod::Aes256Gcm);
        let frame = Frame::data(1, 0, Bytes::from(vec![0u8; MAX_FRAME_PAYLOAD + 1]));
        assert!(matches!(
            client.obfuscate(&frame),
            Err(TunnelError::FrameTooLarge(..))
        ));
    }

    #[test]
    fn test_tampered_record_fails() {
        let (client, server) = pair(EncryptionMethod::ChaCha20Poly1305);
        let record = client
            .obfuscate(&Frame::data(1, 0, Bytes::from_static(b"hello")))
            .unwrap();
        for offset in [RECORD_HEADER_LEN, RECORD_HEADER_LEN + 13, RECORD_HEADER_LEN + 15, record.len() - 1] {
            let mut tampered = record.clone();
            tampered[offset] ^= 0x80;
            assert!(server.deobfuscate(&tampered).is_err(), "offset {}", offset);
        }
    }

    #[test]
    fn test_direction_separates_nonces() {
        let (client, _) = pair(EncryptionMethod::Aes256Gcm);
        let record = client
            .obfuscate(&Frame::data(1, 0, Bytes::from_static(b"hello")))
            .unwrap();
        // a record cannot be reflected back at its sender
        assert!(matches!(
            client.deobfuscate(&record),
            Err(TunnelError::BadDecryption)
        ));
    }

    #[test]
    fn test_header_is_masked() {
        let (client, _) = pair(EncryptionMethod::Aes256Gcm);
        let frame = Frame::data(1, 0, Bytes::from_static(b"hello"));
        let record = client.obfuscate(&frame).unwrap();
        assert_ne!(&record[RECORD_HEADER_LEN..RECORD_HEADER_LEN + FRAME_HEADER_SIZE], &frame.header());
    }

    #[test]
    fn test_method_bytes() {
        for method in METHODS {
            assert_eq!(EncryptionMethod::from_byte(method.as_byte()), Some(method));
        }
        assert_eq!(EncryptionMethod::from_byte(4), None);
    }
}
