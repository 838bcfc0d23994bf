//! Client authentication payload and client-side handshake

use super::record::{
    add_record_layer, read_record, CONTENT_HANDSHAKE, RECORD_HEADER_LEN, VERSION_TLS10,
};
use super::ProtocolError;
use crate::crypto::{aes_gcm_open, aes_gcm_seal, EphemeralKeyPair, PublicKey, NONCE_LEN};
use crate::obfuscation::{BrowserProfile, ClientHelloFields};
use crate::tunnel::EncryptionMethod;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::AsyncRead;
use tracing::trace;
use zeroize::Zeroize;

/// 16-byte user identifier
pub type Uid = [u8; 16];

/// Plaintext size of the authentication payload
pub const AUTH_PAYLOAD_LEN: usize = 48;

const PROXY_METHOD_MAX: usize = 12;

/// Clock abstraction so handshakes can be tested at arbitrary times
#[derive(Clone)]
pub struct WorldState {
    clock: Arc<dyn Fn() -> SystemTime + Send + Sync>,
}

impl WorldState {
    /// The real wall clock
    pub fn real() -> Self {
        Self {
            clock: Arc::new(SystemTime::now),
        }
    }

    /// A clock shifted from the wall clock by `offset` seconds
    pub fn skewed(offset: i64) -> Self {
        Self {
            clock: Arc::new(move || {
                let now = SystemTime::now();
                if offset >= 0 {
                    now + Duration::from_secs(offset as u64)
                } else {
                    now - Duration::from_secs(offset.unsigned_abs())
                }
            }),
        }
    }

    pub fn now(&self) -> SystemTime {
        (self.clock)()
    }

    /// Current time in Unix seconds
    pub fn unix_now(&self) -> u64 {
        self.now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

impl Default for WorldState {
    fn default() -> Self {
        Self::real()
    }
}

impl std::fmt::Debug for WorldState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "WorldState({})", self.unix_now())
    }
}

/// Everything a client needs to authenticate one connection
#[derive(Debug, Clone)]
pub struct AuthInfo {
    pub uid: Uid,
    pub proxy_method: String,
    pub encryption_method: EncryptionMethod,
    pub unordered: bool,
    /// Zero only for admin sessions
    pub session_id: u32,
    pub mock_domain: String,
    pub server_public_key: PublicKey,
    pub world: WorldState,
}

/// What the server learns from a verified payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub uid: Uid,
    pub session_id: u32,
    pub proxy_method: String,
    pub encryption_method: EncryptionMethod,
    pub unordered: bool,
}

impl AuthInfo {
    /// Lay out the 48-byte plaintext
    ///
    /// ```text
    /// [0:16]  UID
    /// [16:28] proxy method, null padded
    /// [28]    encryption method
    /// [29:37] unix seconds, big-endian
    /// [37:41] session id, big-endian
    /// [41]    flags (bit 0 = unordered)
    /// [42:48] reserved
    /// ```
    pub fn encode_payload(&self) -> Result<[u8; AUTH_PAYLOAD_LEN], ProtocolError> {
        let method = self.proxy_method.as_bytes();
        if method.len() > PROXY_METHOD_MAX {
            return Err(ProtocolError::BadInput(format!(
                "proxy method {:?} longer than {} bytes",
                self.proxy_method, PROXY_METHOD_MAX
            )));
        }

        let mut payload = [0u8; AUTH_PAYLOAD_LEN];
        payload[0..16].copy_from_slice(&self.uid);
        payload[16..16 + method.len()].copy_from_slice(method);
        payload[28] = self.encryption_method.as_byte();
        payload[29..37].copy_from_slice(&self.world.unix_now().to_be_bytes());
        payload[37..41].copy_from_slice(&self.session_id.to_be_bytes());
        payload[41] = self.unordered as u8;
        Ok(payload)
    }
}

impl ClientInfo {
    /// Parse a decrypted payload, returning the info and its timestamp
    pub fn decode_payload(payload: &[u8]) -> Result<(Self, u64), ProtocolError> {
        if payload.len() != AUTH_PAYLOAD_LEN {
            return Err(ProtocolError::BadInput(format!(
                "auth payload of {} bytes",
                payload.len()
            )));
        }

        let mut uid = [0u8; 16];
        uid.copy_from_slice(&payload[0..16]);

        let method = &payload[16..28];
        let end = method.iter().position(|&b| b == 0).unwrap_or(PROXY_METHOD_MAX);
        let proxy_method = std::str::from_utf8(&method[..end])
            .map_err(|_| ProtocolError::BadInput("proxy method is not UTF-8".to_string()))?
            .to_string();

        let encryption_method = EncryptionMethod::from_byte(payload[28]).ok_or_else(|| {
            ProtocolError::BadInput(format!("unknown encryption method {}", payload[28]))
        })?;

        let mut ts = [0u8; 8];
        ts.copy_from_slice(&payload[29..37]);
        let mut sid = [0u8; 4];
        sid.copy_from_slice(&payload[37..41]);

        Ok((
            Self {
                uid,
                session_id: u32::from_be_bytes(sid),
                proxy_method,
                encryption_method,
                unordered: payload[41] & 0x01 != 0,
            },
            u64::from_be_bytes(ts),
        ))
    }
}

/// Client half of one handshake: the ephemeral key and sealed payload
pub struct ClientAuth {
    pub eph_pub: [u8; 32],
    pub ciphertext: [u8; 64],
    shared: [u8; 32],
}

impl ClientAuth {
    /// Generate an ephemeral key and seal the payload for the server
    pub fn new(info: &AuthInfo) -> Result<Self, ProtocolError> {
        let eph = EphemeralKeyPair::generate();
        let eph_pub = *eph.public.as_bytes();
        let shared = eph.diffie_hellman(&info.server_public_key);

        let mut payload = info.encode_payload()?;
        let nonce = nonce_from(&eph_pub);
        let sealed = aes_gcm_seal(&shared[..16], &nonce, &payload);
        payload.zeroize();

        let mut ciphertext = [0u8; 64];
        ciphertext.copy_from_slice(&sealed?);
        Ok(Self {
            eph_pub,
            ciphertext,
            shared,
        })
    }

    /// The ClientHello record carrying this handshake
    pub fn client_hello_record(
        &self,
        profile: BrowserProfile,
        server_name: &str,
    ) -> Result<Vec<u8>, ProtocolError> {
        let mut session_id = [0u8; 32];
        let mut key_share = [0u8; 32];
        session_id.copy_from_slice(&self.ciphertext[..32]);
        key_share.copy_from_slice(&self.ciphertext[32..]);

        let hello = profile.compose_client_hello(&ClientHelloFields {
            random: self.eph_pub,
            session_id,
            x25519_key_share: key_share,
            server_name: server_name.to_string(),
        })?;
        Ok(add_record_layer(CONTENT_HANDSHAKE, VERSION_TLS10, &hello))
    }

    /// `eph_pub ‖ ciphertext` as carried in the WebSocket `Hidden` header
    pub fn hidden_blob(&self) -> [u8; 96] {
        let mut blob = [0u8; 96];
        blob[..32].copy_from_slice(&self.eph_pub);
        blob[32..].copy_from_slice(&self.ciphertext);
        blob
    }

    /// Read the three server records and recover the session key
    pub async fn read_server_reply<R>(&self, reader: &mut R) -> Result<[u8; 32], ProtocolError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut record = Vec::new();
        read_record(reader, &mut record).await?;
        if record[0] != CONTENT_HANDSHAKE {
            return Err(ProtocolError::BadInput(format!(
                "expected ServerHello, got record type {:#04x}",
                record[0]
            )));
        }
        let body = &record[RECORD_HEADER_LEN..];
        if body.len() < 116 {
            return Err(ProtocolError::BadInput(format!(
                "ServerHello of {} bytes too short",
                body.len()
            )));
        }

        let mut sealed = [0u8; 60];
        sealed[..32].copy_from_slice(&body[6..38]);
        sealed[32..].copy_from_slice(&body[84..112]);
        let session_key = self.open_reply(&sealed)?;

        // ChangeCipherSpec and the fake encrypted certificate
        for _ in 0..2 {
            read_record(reader, &mut record).await?;
            trace!(len = record.len(), "discarded handshake record");
        }
        Ok(session_key)
    }

    /// Open a `nonce ‖ sealed session key` blob
    pub fn open_reply(&self, reply: &[u8]) -> Result<[u8; 32], ProtocolError> {
        if reply.len() != NONCE_LEN + 48 {
            return Err(ProtocolError::BadInput(format!(
                "server reply of {} bytes",
                reply.len()
            )));
        }
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&reply[..NONCE_LEN]);
        let key = aes_gcm_open(&self.shared, &nonce, &reply[NONCE_LEN..])
            .map_err(|_| ProtocolError::BadDecryption)?;

        let mut session_key = [0u8; 32];
        session_key.copy_from_slice(&key);
        Ok(session_key)
    }
}

impl Drop for ClientAuth {
    fn drop(&mut self) {
        self.shared.zeroize();
    }
}

/// The first twelve bytes of a 32-byte value, used as a handshake nonce
pub(super) fn nonce_from(bytes: &[u8; 32]) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&bytes[..NONCE_LEN]);
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    fn auth_info(server: &KeyPair) -> AuthInfo {
        AuthInfo {
            uid: [7u8; 16],
            proxy_method: "shadowsocks".to_string(),
            encryption_method: EncryptionMethod::Aes256Gcm,
            unordered: true,
            session_id: 0xdead_beef,
            mock_domain: "www.bing.com".to_string(),
            server_public_key: server.public,
            world: WorldState::real(),
        }
    }

    #[test]
    fn test_payload_layout() {
        let server = KeyPair::generate();
        let info = auth_info(&server);
        let payload = info.encode_payload().unwrap();

        assert_eq!(&payload[0..16], &[7u8; 16]);
        assert_eq!(&payload[16..27], b"shadowsocks");
        assert_eq!(payload[27], 0);
        assert_eq!(payload[28], EncryptionMethod::Aes256Gcm.as_byte());
        assert_eq!(&payload[37..41], &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(payload[41], 1);
        assert_eq!(&payload[42..48], &[0u8; 6]);

        let (decoded, ts) = ClientInfo::decode_payload(&payload).unwrap();
        assert_eq!(decoded.uid, info.uid);
        assert_eq!(decoded.proxy_method, "shadowsocks");
        assert_eq!(decoded.session_id, 0xdead_beef);
        assert!(decoded.unordered);
        assert!(ts.abs_diff(info.world.unix_now()) <= 1);
    }

    #[test]
    fn test_long_proxy_method_rejected() {
        let server = KeyPair::generate();
        let mut info = auth_info(&server);
        info.proxy_method = "a-very-long-method".to_string();
        assert!(matches!(
            info.encode_payload(),
            Err(ProtocolError::BadInput(_))
        ));
    }

    #[test]
    fn test_skewed_clock() {
        let real = WorldState::real().unix_now();
        let ahead = WorldState::skewed(3600).unix_now();
        let behind = WorldState::skewed(-3600).unix_now();
        assert!(ahead.abs_diff(real + 3600) <= 1);
        assert!(behind.abs_diff(real - 3600) <= 1);
    }

    #[test]
    fn test_client_hello_carries_material() {
        let server = KeyPair::generate();
        let auth = ClientAuth::new(&auth_info(&server)).unwrap();
        let record = auth
            .client_hello_record(BrowserProfile::Firefox, "www.bing.com")
            .unwrap();
        assert_eq!(&record[..3], &[0x16, 0x03, 0x01]);

        let hello = crate::protocol::parse_client_hello_record(&record).unwrap();
        assert_eq!(hello.random, auth.eph_pub);
        assert_eq!(hello.session_id, auth.ciphertext[..32].to_vec());
        assert_eq!(hello.x25519_key_share().unwrap()[..], auth.ciphertext[32..]);
    }

    #[test]
    fn test_open_reply_rejects_garbage() {
        let server = KeyPair::generate();
        let auth = ClientAuth::new(&auth_info(&server)).unwrap();
        assert!(matches!(
            auth.open_reply(&[0u8; 60]),
            Err(ProtocolError::BadDecryption)
        ));
        assert!(auth.open_reply(&[0u8; 10]).is_err());
    }
}
