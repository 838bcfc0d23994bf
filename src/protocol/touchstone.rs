//! Server-side handshake verification ("TouchStone") and reply composition

use super::auth::{nonce_from, ClientInfo};
use super::record::{
    add_record_layer, CONTENT_APPLICATION_DATA, CONTENT_CHANGE_CIPHER_SPEC, CONTENT_HANDSHAKE,
    RECORD_HEADER_LEN, VERSION_TLS12,
};
use super::websocket::{self, REPLY_LEN};
use super::{parse_client_hello_record, ProtocolError, WorldState, TIMESTAMP_WINDOW};
use crate::crypto::{
    aes_gcm_open, aes_gcm_seal, ecdh, generate_nonce, random_bytes, PrivateKey, PublicKey,
    NONCE_LEN,
};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use zeroize::Zeroize;

/// How the peer framed its handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeFlavor {
    /// ClientHello over raw TCP; the session id is echoed in the ServerHello
    DirectTls { client_session_id: Vec<u8> },
    /// WebSocket upgrade; the key is needed for `Sec-WebSocket-Accept`
    WebSocket { key: String },
}

/// A peer that passed verification
pub struct Authenticated {
    pub info: ClientInfo,
    pub flavor: HandshakeFlavor,
    shared: [u8; 32],
}

impl Authenticated {
    /// Bytes to send back so the client can recover `session_key`
    pub fn reply(&self, session_key: &[u8; 32]) -> Result<Vec<u8>, ProtocolError> {
        match &self.flavor {
            HandshakeFlavor::DirectTls { client_session_id } => {
                compose_server_reply(&self.shared, client_session_id, session_key)
            }
            HandshakeFlavor::WebSocket { key } => {
                let sealed = seal_session_key(&self.shared, session_key)?;
                Ok(websocket::upgrade_response(key, &sealed))
            }
        }
    }
}

impl Drop for Authenticated {
    fn drop(&mut self) {
        self.shared.zeroize();
    }
}

/// Randoms of accepted ClientHellos, keyed to the server time they were seen
pub struct UsedRandoms {
    entries: Mutex<HashMap<[u8; 32], u64>>,
    limit: usize,
}

impl UsedRandoms {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            limit,
        }
    }

    fn is_live(seen: u64, now: u64) -> bool {
        now.saturating_sub(seen) < TIMESTAMP_WINDOW.as_secs()
    }

    /// Fail with `Replay` if `random` was accepted within the window
    pub fn check(&self, random: &[u8; 32], now: u64) -> Result<(), ProtocolError> {
        match self.entries.lock().get(random) {
            Some(&seen) if Self::is_live(seen, now) => Err(ProtocolError::Replay),
            _ => Ok(()),
        }
    }

    /// Remember `random`; refuses replays and growth past the limit
    pub fn record(&self, random: [u8; 32], now: u64) -> Result<(), ProtocolError> {
        let mut entries = self.entries.lock();
        if let Some(&seen) = entries.get(&random) {
            if Self::is_live(seen, now) {
                return Err(ProtocolError::Replay);
            }
        } else if entries.len() >= self.limit {
            return Err(ProtocolError::CacheFull(entries.len()));
        }
        entries.insert(random, now);
        Ok(())
    }

    /// Evict entries older than the window, returning how many were dropped
    pub fn sweep(&self, now: u64) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, seen| Self::is_live(*seen, now));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Verifies first packets against the server's private key
pub struct TouchStone {
    private_key: PrivateKey,
    used_randoms: Arc<UsedRandoms>,
    world: WorldState,
}

impl TouchStone {
    pub fn new(private_key: PrivateKey, used_randoms: Arc<UsedRandoms>, world: WorldState) -> Self {
        Self {
            private_key,
            used_randoms,
            world,
        }
    }

    pub fn used_randoms(&self) -> &Arc<UsedRandoms> {
        &self.used_randoms
    }

    /// Whether `buf` holds a whole first packet of either flavor
    pub fn first_packet_complete(buf: &[u8]) -> bool {
        if buf.first() == Some(&CONTENT_HANDSHAKE) {
            if buf.len() < RECORD_HEADER_LEN {
                return false;
            }
            let len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
            buf.len() >= RECORD_HEADER_LEN + len
        } else {
            websocket::request_complete(buf)
        }
    }

    /// Detect the transport and authenticate the first packet
    pub fn authenticate(&self, first: &[u8]) -> Result<Authenticated, ProtocolError> {
        if first.starts_with(&[CONTENT_HANDSHAKE, 0x03, 0x01]) {
            let hello = parse_client_hello_record(first)?;
            let key_share = hello.x25519_key_share().ok_or_else(|| {
                ProtocolError::BadInput("ClientHello without x25519 key share".to_string())
            })?;
            if hello.session_id.len() != 32 {
                return Err(ProtocolError::BadInput(format!(
                    "session id of {} bytes",
                    hello.session_id.len()
                )));
            }

            let mut ciphertext = [0u8; 64];
            ciphertext[..32].copy_from_slice(&hello.session_id);
            ciphertext[32..].copy_from_slice(&key_share);

            let (info, shared) = self.verify(&hello.random, &ciphertext)?;
            Ok(Authenticated {
                info,
                flavor: HandshakeFlavor::DirectTls {
                    client_session_id: hello.session_id,
                },
                shared,
            })
        } else if websocket::looks_like_upgrade(first) {
            let request = websocket::parse_upgrade_request(first)?;
            let mut random = [0u8; 32];
            let mut ciphertext = [0u8; 64];
            random.copy_from_slice(&request.hidden[..32]);
            ciphertext.copy_from_slice(&request.hidden[32..]);

            let (info, shared) = self.verify(&random, &ciphertext)?;
            Ok(Authenticated {
                info,
                flavor: HandshakeFlavor::WebSocket { key: request.key },
                shared,
            })
        } else {
            Err(ProtocolError::BadInput("unrecognised first packet".to_string()))
        }
    }

    fn verify(
        &self,
        random: &[u8; 32],
        ciphertext: &[u8; 64],
    ) -> Result<(ClientInfo, [u8; 32]), ProtocolError> {
        let now = self.world.unix_now();
        self.used_randoms.check(random, now)?;

        let mut shared = ecdh(&self.private_key, &PublicKey(*random));
        let mut payload = match aes_gcm_open(&shared[..16], &nonce_from(random), ciphertext) {
            Ok(payload) => payload,
            Err(_) => {
                shared.zeroize();
                return Err(ProtocolError::BadDecryption);
            }
        };
        let decoded = ClientInfo::decode_payload(&payload);
        payload.zeroize();
        let (info, timestamp) = decoded?;

        if timestamp.abs_diff(now) > TIMESTAMP_WINDOW.as_secs() {
            shared.zeroize();
            return Err(ProtocolError::TimestampOutOfWindow { timestamp, now });
        }

        self.used_randoms.record(*random, now)?;
        debug!(session_id = info.session_id, "ClientHello authenticated");
        Ok((info, shared))
    }
}

/// `nonce ‖ AES-256-GCM(shared, nonce, session_key)`
pub fn seal_session_key(
    shared: &[u8; 32],
    session_key: &[u8; 32],
) -> Result<[u8; REPLY_LEN], ProtocolError> {
    let nonce = generate_nonce();
    let sealed = aes_gcm_seal(shared, &nonce, session_key)?;

    let mut reply = [0u8; REPLY_LEN];
    reply[..NONCE_LEN].copy_from_slice(&nonce);
    reply[NONCE_LEN..].copy_from_slice(&sealed);
    Ok(reply)
}

/// ServerHello, ChangeCipherSpec and a fake encrypted certificate, back to back
///
/// ServerHello body offsets the client reads without parsing:
///
/// ```text
/// [6:38]   random     = nonce(12) ‖ sealed[0:20]
/// [84:116] key share  = sealed[20:48] ‖ random(4)
/// ```
pub fn compose_server_reply(
    shared: &[u8; 32],
    client_session_id: &[u8],
    session_key: &[u8; 32],
) -> Result<Vec<u8>, ProtocolError> {
    let sealed = seal_session_key(shared, session_key)?;

    let mut tail = [0u8; 4];
    random_bytes(&mut tail);

    let mut body = Vec::with_capacity(122);
    body.push(0x02); // server_hello
    body.extend_from_slice(&[0x00, 0x00, 0x76]);
    body.extend_from_slice(&[0x03, 0x03]);
    body.extend_from_slice(&sealed[..32]);
    body.push(client_session_id.len() as u8);
    body.extend_from_slice(client_session_id);
    body.extend_from_slice(&[0x13, 0x01]); // TLS_AES_128_GCM_SHA256
    body.push(0x00);
    body.extend_from_slice(&[0x00, 0x2e]);
    body.extend_from_slice(&[0x00, 0x33, 0x00, 0x24, 0x00, 0x1d, 0x00, 0x20]);
    body.extend_from_slice(&sealed[32..]);
    body.extend_from_slice(&tail);
    body.extend_from_slice(&[0x00, 0x2b, 0x00, 0x02, 0x03, 0x04]);

    let handshake_len = (body.len() - 4) as u32;
    body[1..4].copy_from_slice(&handshake_len.to_be_bytes()[1..]);

    let mut certificate = vec![0u8; rand::thread_rng().gen_range(1200..2400)];
    random_bytes(&mut certificate);

    let mut reply = add_record_layer(CONTENT_HANDSHAKE, VERSION_TLS12, &body);
    reply.extend(add_record_layer(CONTENT_CHANGE_CIPHER_SPEC, VERSION_TLS12, &[0x01]));
    reply.extend(add_record_layer(CONTENT_APPLICATION_DATA, VERSION_TLS12, &certificate));
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::obfuscation::BrowserProfile;
    use crate::protocol::{AuthInfo, ClientAuth};
    use crate::tunnel::EncryptionMethod;

    fn auth_info(server: &KeyPair, world: WorldState) -> AuthInfo {
        AuthInfo {
            uid: [3u8; 16],
            proxy_method: "socks5".to_string(),
            encryption_method: EncryptionMethod::ChaCha20Poly1305,
            unordered: false,
            session_id: 42,
            mock_domain: "www.microsoft.com".to_string(),
            server_public_key: server.public,
            world,
        }
    }

    fn touchstone(server: &KeyPair) -> TouchStone {
        TouchStone::new(
            server.private.clone(),
            Arc::new(UsedRandoms::new(1024)),
            WorldState::real(),
        )
    }

    #[tokio::test]
    async fn test_direct_tls_round_trip() {
        let server = KeyPair::generate();
        let stone = touchstone(&server);

        for profile in [BrowserProfile::Chrome, BrowserProfile::Firefox, BrowserProfile::Safari] {
            let client = ClientAuth::new(&auth_info(&server, WorldState::real())).unwrap();
            let hello = client.client_hello_record(profile, "www.microsoft.com").unwrap();
            assert!(TouchStone::first_packet_complete(&hello));
            assert!(!TouchStone::first_packet_complete(&hello[..hello.len() - 1]));

            let authed = stone.authenticate(&hello).unwrap();
            assert_eq!(authed.info.uid, [3u8; 16]);
            assert_eq!(authed.info.session_id, 42);
            assert_eq!(authed.info.proxy_method, "socks5");
            assert_eq!(authed.info.encryption_method, EncryptionMethod::ChaCha20Poly1305);

            let session_key = [0x5au8; 32];
            let reply = authed.reply(&session_key).unwrap();
            assert_eq!(&reply[..3], &[0x16, 0x03, 0x03]);

            let mut reader = &reply[..];
            let recovered = client.read_server_reply(&mut reader).await.unwrap();
            assert_eq!(recovered, session_key);
            assert!(reader.is_empty());
        }
    }

    #[test]
    fn test_server_hello_layout() {
        let reply = compose_server_reply(&[1u8; 32], &[9u8; 32], &[2u8; 32]).unwrap();
        let body = &reply[RECORD_HEADER_LEN..RECORD_HEADER_LEN + 122];
        assert_eq!(&reply[3..5], &[0x00, 122]);
        assert_eq!(body[0], 0x02);
        assert_eq!(&body[1..4], &[0x00, 0x00, 118]);
        assert_eq!(&body[39..71], &[9u8; 32]);
        assert_eq!(&body[76..84], &[0x00, 0x33, 0x00, 0x24, 0x00, 0x1d, 0x00, 0x20]);
        assert_eq!(&body[116..122], &[0x00, 0x2b, 0x00, 0x02, 0x03, 0x04]);

        let ccs = &reply[RECORD_HEADER_LEN + 122..RECORD_HEADER_LEN + 128];
        assert_eq!(ccs, &[0x14, 0x03, 0x03, 0x00, 0x01, 0x01]);
        let app = &reply[RECORD_HEADER_LEN + 128..];
        let len = u16::from_be_bytes([app[3], app[4]]) as usize;
        assert_eq!(app[0], 0x17);
        assert!((1200..2400).contains(&len));
        assert_eq!(app.len(), RECORD_HEADER_LEN + len);
    }

    #[test]
    fn test_tampering_fails() {
        let server = KeyPair::generate();
        let stone = touchstone(&server);
        let client = ClientAuth::new(&auth_info(&server, WorldState::real())).unwrap();
        let hello = client
            .client_hello_record(BrowserProfile::Chrome, "www.microsoft.com")
            .unwrap();
        let parsed = crate::protocol::parse_client_hello_record(&hello).unwrap();

        // random at 11, session id at 44; key share located by value
        let share_at = hello
            .windows(32)
            .position(|w| w == parsed.x25519_key_share().unwrap())
            .unwrap();
        for offset in [11 + 5, 44 + 20, share_at + 7] {
            let mut tampered = hello.clone();
            tampered[offset] ^= 0x01;
            assert!(stone.authenticate(&tampered).is_err(), "offset {}", offset);
        }
        assert!(stone.authenticate(&hello).is_ok());
    }

    #[test]
    fn test_replay_rejected() {
        let server = KeyPair::generate();
        let stone = touchstone(&server);
        let client = ClientAuth::new(&auth_info(&server, WorldState::real())).unwrap();
        let hello = client
            .client_hello_record(BrowserProfile::Chrome, "www.microsoft.com")
            .unwrap();

        assert!(stone.authenticate(&hello).is_ok());
        assert!(matches!(stone.authenticate(&hello), Err(ProtocolError::Replay)));
    }

    #[test]
    fn test_timestamp_window() {
        let server = KeyPair::generate();
        let stone = touchstone(&server);
        let window = TIMESTAMP_WINDOW.as_secs() as i64;

        for skew in [window + 60, -(window + 60)] {
            let client = ClientAuth::new(&auth_info(&server, WorldState::skewed(skew))).unwrap();
            let hello = client
                .client_hello_record(BrowserProfile::Chrome, "www.microsoft.com")
                .unwrap();
            assert!(matches!(
                stone.authenticate(&hello),
                Err(ProtocolError::TimestampOutOfWindow { .. })
            ));
        }

        let client = ClientAuth::new(&auth_info(&server, WorldState::skewed(window - 60))).unwrap();
        let hello = client
            .client_hello_record(BrowserProfile::Chrome, "www.microsoft.com")
            .unwrap();
        assert!(stone.authenticate(&hello).is_ok());
    }

    #[test]
    fn test_wrong_server_key() {
        let server = KeyPair::generate();
        let other = KeyPair::generate();
        let client = ClientAuth::new(&auth_info(&other, WorldState::real())).unwrap();
        let hello = client
            .client_hello_record(BrowserProfile::Chrome, "www.microsoft.com")
            .unwrap();
        assert!(matches!(
            touchstone(&server).authenticate(&hello),
            Err(ProtocolError::BadDecryption)
        ));
    }

    #[test]
    fn test_websocket_round_trip() {
        let server = KeyPair::generate();
        let stone = touchstone(&server);
        let client = ClientAuth::new(&auth_info(&server, WorldState::real())).unwrap();

        let request = format!(
            "GET / HTTP/1.1\r\nHost: cdn.example.com\r\nConnection: Upgrade\r\n\
             Upgrade: websocket\r\nSec-WebSocket-Version: 13\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nHidden: {}\r\n\r\n",
            base64::Engine::encode(&base64::engine::general_purpose::STANDARD, client.hidden_blob())
        );
        assert!(TouchStone::first_packet_complete(request.as_bytes()));

        let authed = stone.authenticate(request.as_bytes()).unwrap();
        assert!(matches!(authed.flavor, HandshakeFlavor::WebSocket { .. }));

        let session_key = [0x77u8; 32];
        let response = String::from_utf8(authed.reply(&session_key).unwrap()).unwrap();
        let value = response
            .lines()
            .find_map(|l| l.strip_prefix("reply: "))
            .unwrap();
        let reply = websocket::decode_reply(value).unwrap();
        assert_eq!(client.open_reply(&reply).unwrap(), session_key);
    }

    #[test]
    fn test_used_random_cache() {
        let cache = UsedRandoms::new(2);
        let window = TIMESTAMP_WINDOW.as_secs();

        cache.record([1u8; 32], 1000).unwrap();
        assert!(matches!(cache.check(&[1u8; 32], 1001), Err(ProtocolError::Replay)));
        assert!(cache.check(&[1u8; 32], 1000 + window).is_ok());

        cache.record([2u8; 32], 1000).unwrap();
        assert!(matches!(
            cache.record([3u8; 32], 1000),
            Err(ProtocolError::CacheFull(2))
        ));

        assert_eq!(cache.sweep(1000 + window + 1), 2);
        assert!(cache.is_empty());
        cache.record([3u8; 32], 1000 + window + 1).unwrap();
    }

    #[test]
    fn test_garbage_rejected() {
        let server = KeyPair::generate();
        let stone = touchstone(&server);
        assert!(stone.authenticate(b"SSH-2.0-OpenSSH_9.6\r\n").is_err());
        assert!(stone.authenticate(&[0x16, 0x03, 0x01, 0x00, 0x02, 0x01, 0x00]).is_err());
        assert!(stone.authenticate(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n").is_err());
    }
}
