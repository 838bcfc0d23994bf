//! X25519 key management

use super::{CryptoError, KEY_LEN};
use base64::Engine;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use x25519_dalek::{EphemeralSecret, StaticSecret};
use zeroize::Zeroize;

/// Long-term X25519 key pair (the server's identity)
#[derive(Clone)]
pub struct KeyPair {
    pub public: PublicKey,
    pub private: PrivateKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = x25519_dalek::PublicKey::from(&secret);
        Self {
            public: PublicKey(public.to_bytes()),
            private: PrivateKey(secret.to_bytes()),
        }
    }

    /// Create from existing private key bytes, deriving the public key
    pub fn from_private(private: PrivateKey) -> Self {
        Self {
            public: private.public_key(),
            private,
        }
    }
}

/// Single-use key pair generated for one handshake
pub struct EphemeralKeyPair {
    secret: EphemeralSecret,
    pub public: PublicKey,
}

impl EphemeralKeyPair {
    /// Generate a fresh ephemeral key pair
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = x25519_dalek::PublicKey::from(&secret);
        Self {
            secret,
            public: PublicKey(public.to_bytes()),
        }
    }

    /// Consume the ephemeral secret and compute the shared secret with `remote`
    pub fn diffie_hellman(self, remote: &PublicKey) -> [u8; KEY_LEN] {
        let remote = x25519_dalek::PublicKey::from(remote.0);
        self.secret.diffie_hellman(&remote).to_bytes()
    }
}

/// Compute `X25519(private, public)`
pub fn ecdh(private: &PrivateKey, public: &PublicKey) -> [u8; KEY_LEN] {
    let secret = StaticSecret::from(private.0);
    let remote = x25519_dalek::PublicKey::from(public.0);
    secret.diffie_hellman(&remote).to_bytes()
}

/// X25519 public key
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey(pub [u8; KEY_LEN]);

impl PublicKey {
    /// Create from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength {
                expected: KEY_LEN,
                actual: bytes.len(),
            })?;
        Ok(Self(arr))
    }

    /// Get as bytes
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Encode as base64
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.0)
    }

    /// Decode from base64
    pub fn from_base64(s: &str) -> Result<Self, CryptoError> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(s.trim())
            .map_err(|e| CryptoError::InvalidEncoding(e.to_string()))?;
        Self::from_bytes(&bytes)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}...)", &self.to_base64()[..8])
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base64())
    }
}

/// X25519 private key (kept secret)
#[derive(Clone)]
pub struct PrivateKey(pub [u8; KEY_LEN]);

impl PrivateKey {
    /// Create from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength {
                expected: KEY_LEN,
                actual: bytes.len(),
            })?;
        Ok(Self(arr))
    }

    /// Get as bytes
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Derive the matching public key
    pub fn public_key(&self) -> PublicKey {
        let secret = StaticSecret::from(self.0);
        PublicKey(x25519_dalek::PublicKey::from(&secret).to_bytes())
    }

    /// Encode as base64 (be careful with this!)
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.0)
    }

    /// Decode from base64
    pub fn from_base64(s: &str) -> Result<Self, CryptoError> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(s.trim())
            .map_err(|e| CryptoError::InvalidEncoding(e.to_string()))?;
        Self::from_bytes(&bytes)
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKey([REDACTED])")
    }
}

impl Drop for PrivateKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_generation() {
        let kp = KeyPair::generate();
        assert_eq!(kp.private.public_key(), kp.public);
    }

    #[test]
    fn test_public_key_base64() {
        let kp = KeyPair::generate();
        let b64 = kp.public.to_base64();
        let recovered = PublicKey::from_base64(&b64).unwrap();
        assert_eq!(kp.public, recovered);
    }

    #[test]
    fn test_ecdh_agreement() {
        let server = KeyPair::generate();
        let eph = EphemeralKeyPair::generate();
        let eph_public = eph.public;

        let client_shared = eph.diffie_hellman(&server.public);
        let server_shared = ecdh(&server.private, &eph_public);
        assert_eq!(client_shared, server_shared);
    }

    #[test]
    fn test_from_private_derives_public() {
        let kp = KeyPair::generate();
        let restored = KeyPair::from_private(PrivateKey::from_base64(&kp.private.to_base64()).unwrap());
        assert_eq!(restored.public, kp.public);
    }

    #[test]
    fn test_bad_length() {
        assert!(PublicKey::from_bytes(&[0u8; 31]).is_err());
    }
}
