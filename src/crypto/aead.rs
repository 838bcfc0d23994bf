//! AEAD encryption/decryption utilities
//!
//! Thin wrapper over `ring` that exposes the three ciphers the protocol can
//! negotiate. Nonces are always supplied by the caller: the handshake uses
//! nonces carried on the wire, and the frame codec derives them from the
//! frame header.

use super::{CryptoError, NONCE_LEN, TAG_LEN};
use ring::aead::{
    Aad, LessSafeKey, Nonce, UnboundKey, AES_128_GCM, AES_256_GCM, CHACHA20_POLY1305,
};

/// AEAD algorithms available to the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AeadAlgorithm {
    Aes128Gcm,
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl AeadAlgorithm {
    /// Key length required by this algorithm
    pub fn key_len(&self) -> usize {
        match self {
            AeadAlgorithm::Aes128Gcm => 16,
            AeadAlgorithm::Aes256Gcm | AeadAlgorithm::ChaCha20Poly1305 => 32,
        }
    }

    fn ring_algorithm(&self) -> &'static ring::aead::Algorithm {
        match self {
            AeadAlgorithm::Aes128Gcm => &AES_128_GCM,
            AeadAlgorithm::Aes256Gcm => &AES_256_GCM,
            AeadAlgorithm::ChaCha20Poly1305 => &CHACHA20_POLY1305,
        }
    }
}

/// AEAD cipher bound to a single key
pub struct AeadCipher {
    key: LessSafeKey,
    algorithm: AeadAlgorithm,
}

impl AeadCipher {
    /// Create a new cipher. `key` must be exactly `algorithm.key_len()` bytes.
    pub fn new(algorithm: AeadAlgorithm, key: &[u8]) -> Result<Self, CryptoError> {
        if key.len() != algorithm.key_len() {
            return Err(CryptoError::InvalidKeyLength {
                expected: algorithm.key_len(),
                actual: key.len(),
            });
        }
        let unbound = UnboundKey::new(algorithm.ring_algorithm(), key).map_err(|_| {
            CryptoError::InvalidKeyLength {
                expected: algorithm.key_len(),
                actual: key.len(),
            }
        })?;

        Ok(Self {
            key: LessSafeKey::new(unbound),
            algorithm,
        })
    }

    /// Algorithm this cipher was built with
    pub fn algorithm(&self) -> AeadAlgorithm {
        self.algorithm
    }

    /// Encrypt `buffer` in place and append the tag
    pub fn seal_in_place(
        &self,
        nonce: &[u8; NONCE_LEN],
        associated_data: &[u8],
        buffer: &mut Vec<u8>,
    ) -> Result<(), CryptoError> {
        self.key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(*nonce),
                Aad::from(associated_data),
                buffer,
            )
            .map_err(|_| CryptoError::Encryption("seal failed".to_string()))
    }

    /// Encrypt `plaintext`, returning ciphertext with appended tag
    pub fn seal(
        &self,
        nonce: &[u8; NONCE_LEN],
        associated_data: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let mut buffer = Vec::with_capacity(plaintext.len() + TAG_LEN);
        buffer.extend_from_slice(plaintext);
        self.seal_in_place(nonce, associated_data, &mut buffer)?;
        Ok(buffer)
    }

    /// Decrypt `ciphertext` (with trailing tag), returning the plaintext
    pub fn open(
        &self,
        nonce: &[u8; NONCE_LEN],
        associated_data: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() < TAG_LEN {
            return Err(CryptoError::ShortCiphertext(ciphertext.len()));
        }
        let mut buffer = ciphertext.to_vec();
        let len = self
            .key
            .open_in_place(
                Nonce::assume_unique_for_key(*nonce),
                Aad::from(associated_data),
                &mut buffer,
            )
            .map_err(|_| CryptoError::Decryption)?
            .len();
        buffer.truncate(len);
        Ok(buffer)
    }
}

/// One-shot AES-GCM seal keyed by the first 16 or all 32 bytes of `key`
pub fn aes_gcm_seal(
    key: &[u8],
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let algorithm = if key.len() == 16 {
        AeadAlgorithm::Aes128Gcm
    } else {
        AeadAlgorithm::Aes256Gcm
    };
    AeadCipher::new(algorithm, key)?.seal(nonce, &[], plaintext)
}

/// One-shot AES-GCM open, counterpart of [`aes_gcm_seal`]
pub fn aes_gcm_open(
    key: &[u8],
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let algorithm = if key.len() == 16 {
        AeadAlgorithm::Aes128Gcm
    } else {
        AeadAlgorithm::Aes256Gcm
    };
    AeadCipher::new(algorithm, key)?.open(nonce, &[], ciphertext)
}
