//! Cryptographic primitives
//!
//! This module provides:
//! - X25519 key generation and ECDH
//! - AES-128-GCM, AES-256-GCM and ChaCha20-Poly1305 AEAD with explicit nonces
//! - Secure random number generation
//!
//! The shared secret from ECDH is used directly as key material; there is no
//! HKDF stage between the exchange and the AEAD.

mod aead;
mod keys;

pub use aead::{aes_gcm_open, aes_gcm_seal, AeadAlgorithm, AeadCipher};
pub use keys::{ecdh, EphemeralKeyPair, KeyPair, PrivateKey, PublicKey};

use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

/// Length of an X25519 key or shared secret in bytes
pub const KEY_LEN: usize = 32;

/// Length of nonce in bytes
pub const NONCE_LEN: usize = 12;

/// Length of authentication tag in bytes
pub const TAG_LEN: usize = 16;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed")]
    Decryption,

    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Invalid key encoding: {0}")]
    InvalidEncoding(String),

    #[error("Ciphertext too short: {0} bytes")]
    ShortCiphertext(usize),
}

/// Fill `buf` from the operating system CSPRNG
pub fn random_bytes(buf: &mut [u8]) {
    OsRng.fill_bytes(buf);
}

/// Generate a random nonce
pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    random_bytes(&mut nonce);
    nonce
}

/// Random `u32` from the CSPRNG
pub fn random_u32() -> u32 {
    OsRng.next_u32()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_bytes() {
        let mut buf1 = [0u8; 32];
        let mut buf2 = [0u8; 32];
        random_bytes(&mut buf1);
        random_bytes(&mut buf2);
        assert_ne!(buf1, buf2);
    }
}
