//! Browser ClientHello templates
//!
//! Composes TLS 1.3 ClientHello handshake messages byte-for-byte in the shape
//! a real browser sends. Censors fingerprint TLS clients with JA3/JA4 by
//! looking at:
//! - Cipher suite order
//! - TLS extension order
//! - Supported groups (curves)
//! - EC point formats
//!
//! Each template takes the four fields the handshake layer controls (random,
//! session id, X25519 key share and SNI) and emits a message whose total
//! length does not depend on the SNI: the padding extension absorbs the
//! difference.

use super::grease::{grease, grease_except, is_grease};
use crate::crypto::random_bytes;
use crate::protocol::ClientHello;
use serde::{Deserialize, Serialize};

/// Longest SNI hostname a template accepts
pub const MAX_SNI_LEN: usize = 255;

/// Browser fingerprint profiles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrowserProfile {
    /// Chrome (BoringSSL) with GREASE
    #[default]
    Chrome,
    /// Firefox (NSS)
    Firefox,
    /// Safari (Apple SecureTransport / Network.framework) with GREASE
    Safari,
}

impl BrowserProfile {
    /// Parse a profile name as used in config files and on the command line
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "chrome" => Some(Self::Chrome),
            "firefox" => Some(Self::Firefox),
            "safari" => Some(Self::Safari),
            _ => None,
        }
    }

    /// Length of every ClientHello handshake message this profile emits
    pub fn hello_len(&self) -> usize {
        match self {
            Self::Chrome => CHROME_HELLO_LEN,
            Self::Firefox => FIREFOX_HELLO_LEN,
            Self::Safari => SAFARI_HELLO_LEN,
        }
    }

    /// Compose a ClientHello handshake message (without the record header)
    pub fn compose_client_hello(
        &self,
        fields: &ClientHelloFields,
    ) -> Result<Vec<u8>, FingerprintError> {
        if fields.server_name.len() > MAX_SNI_LEN {
            return Err(FingerprintError::InvalidSni(format!(
                "{} bytes exceeds {}",
                fields.server_name.len(),
                MAX_SNI_LEN
            )));
        }
        match self {
            Self::Chrome => compose_chrome(fields),
            Self::Firefox => compose_firefox(fields),
            Self::Safari => compose_safari(fields),
        }
    }
}

/// The handshake-controlled fields of a ClientHello
#[derive(Debug, Clone)]
pub struct ClientHelloFields {
    pub random: [u8; 32],
    pub session_id: [u8; 32],
    pub x25519_key_share: [u8; 32],
    pub server_name: String,
}

/// Fingerprint-related errors
#[derive(Debug, thiserror::Error)]
pub enum FingerprintError {
    #[error("Invalid SNI: {0}")]
    InvalidSni(String),

    #[error("ClientHello overflows template length by {0} bytes")]
    Overflow(usize),
}

const CHROME_HELLO_LEN: usize = 560;
const FIREFOX_HELLO_LEN: usize = 640;
const SAFARI_HELLO_LEN: usize = 576;

const EXT_SERVER_NAME: u16 = 0x0000;
const EXT_STATUS_REQUEST: u16 = 0x0005;
const EXT_SUPPORTED_GROUPS: u16 = 0x000a;
const EXT_EC_POINT_FORMATS: u16 = 0x000b;
const EXT_SIGNATURE_ALGORITHMS: u16 = 0x000d;
const EXT_ALPN: u16 = 0x0010;
const EXT_SCT: u16 = 0x0012;
const EXT_PADDING: u16 = 0x0015;
const EXT_EXTENDED_MASTER_SECRET: u16 = 0x0017;
const EXT_COMPRESS_CERTIFICATE: u16 = 0x001b;
const EXT_RECORD_SIZE_LIMIT: u16 = 0x001c;
const EXT_SESSION_TICKET: u16 = 0x0023;
const EXT_SUPPORTED_VERSIONS: u16 = 0x002b;
const EXT_PSK_KEY_EXCHANGE_MODES: u16 = 0x002d;
const EXT_KEY_SHARE: u16 = 0x0033;
const EXT_RENEGOTIATION_INFO: u16 = 0xff01;

/// "h2", "http/1.1"
const ALPN_H2_HTTP11: [u8; 14] = [
    0x00, 0x0c, 0x02, b'h', b'2', 0x08, b'h', b't', b't', b'p', b'/', b'1', b'.', b'1',
];

fn put_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_be_bytes());
}

fn put_u16_list(buf: &mut Vec<u8>, values: &[u16]) {
    for &v in values {
        put_u16(buf, v);
    }
}

/// Append one extension record: type, length, data
fn add_ext(buf: &mut Vec<u8>, ext_type: u16, data: &[u8]) {
    put_u16(buf, ext_type);
    put_u16(buf, data.len() as u16);
    buf.extend_from_slice(data);
}

fn server_name_ext(name: &str) -> Vec<u8> {
    let name = name.as_bytes();
    let mut data = Vec::with_capacity(5 + name.len());
    put_u16(&mut data, (name.len() + 3) as u16);
    data.push(0x00); // host_name
    put_u16(&mut data, name.len() as u16);
    data.extend_from_slice(name);
    data
}

fn x25519_share(key: &[u8; 32]) -> Vec<u8> {
    let mut share = Vec::with_capacity(36);
    put_u16(&mut share, 0x001d);
    put_u16(&mut share, 32);
    share.extend_from_slice(key);
    share
}

/// Wrap the fields, cipher suites and extensions into a padded handshake message
fn assemble(
    fields: &ClientHelloFields,
    cipher_suites: &[u16],
    mut extensions: Vec<u8>,
    target_len: usize,
) -> Result<Vec<u8>, FingerprintError> {
    // type(1) len(3) version(2) random(32) sid(1+32) suites(2+n) compression(2) ext_len(2)
    let head_len = 4 + 2 + 32 + 33 + 2 + cipher_suites.len() * 2 + 2 + 2;
    let used = head_len + extensions.len() + 4;
    let padding = target_len
        .checked_sub(used)
        .ok_or(FingerprintError::Overflow(used - target_len))?;
    add_ext(&mut extensions, EXT_PADDING, &vec![0u8; padding]);

    let mut hello = Vec::with_capacity(target_len);
    hello.push(0x01); // client_hello
    let body_len = (target_len - 4) as u32;
    hello.extend_from_slice(&body_len.to_be_bytes()[1..]);
    put_u16(&mut hello, 0x0303);
    hello.extend_from_slice(&fields.random);
    hello.push(32);
    hello.extend_from_slice(&fields.session_id);
    put_u16(&mut hello, (cipher_suites.len() * 2) as u16);
    put_u16_list(&mut hello, cipher_suites);
    hello.push(0x01);
    hello.push(0x00); // null compression
    put_u16(&mut hello, extensions.len() as u16);
    hello.extend_from_slice(&extensions);

    debug_assert_eq!(hello.len(), target_len);
    Ok(hello)
}

fn compose_chrome(fields: &ClientHelloFields) -> Result<Vec<u8>, FingerprintError> {
    let cipher_suites = [
        grease(),
        0x1301, 0x1302, 0x1303, 0xc02b, 0xc02f, 0xc02c, 0xc030, 0xcca9, 0xcca8, 0xc013,
        0xc014, 0x009c, 0x009d, 0x002f, 0x0035, 0x000a,
    ];

    let first_grease = grease();
    let last_grease = grease_except(first_grease);

    let mut groups = Vec::with_capacity(10);
    put_u16(&mut groups, 8);
    put_u16_list(&mut groups, &[grease(), 0x001d, 0x0017, 0x0018]);

    let mut key_share = Vec::with_capacity(43);
    put_u16(&mut key_share, 41);
    put_u16(&mut key_share, grease());
    put_u16(&mut key_share, 1);
    key_share.push(0x00);
    key_share.extend_from_slice(&x25519_share(&fields.x25519_key_share));

    let mut sig_algs = Vec::with_capacity(18);
    put_u16(&mut sig_algs, 16);
    put_u16_list(
        &mut sig_algs,
        &[0x0403, 0x0804, 0x0401, 0x0503, 0x0805, 0x0501, 0x0806, 0x0601],
    );

    let mut versions = vec![10];
    put_u16_list(&mut versions, &[grease(), 0x0304, 0x0303, 0x0302, 0x0301]);

    let mut ext = Vec::with_capacity(CHROME_HELLO_LEN);
    add_ext(&mut ext, first_grease, &[]);
    add_ext(&mut ext, EXT_SERVER_NAME, &server_name_ext(&fields.server_name));
    add_ext(&mut ext, EXT_EXTENDED_MASTER_SECRET, &[]);
    add_ext(&mut ext, EXT_RENEGOTIATION_INFO, &[0x00]);
    add_ext(&mut ext, EXT_SUPPORTED_GROUPS, &groups);
    add_ext(&mut ext, EXT_EC_POINT_FORMATS, &[0x01, 0x00]);
    add_ext(&mut ext, EXT_SESSION_TICKET, &[]);
    add_ext(&mut ext, EXT_ALPN, &ALPN_H2_HTTP11);
    add_ext(&mut ext, EXT_STATUS_REQUEST, &[0x01, 0x00, 0x00, 0x00, 0x00]);
    add_ext(&mut ext, EXT_SIGNATURE_ALGORITHMS, &sig_algs);
    add_ext(&mut ext, EXT_SCT, &[]);
    add_ext(&mut ext, EXT_KEY_SHARE, &key_share);
    add_ext(&mut ext, EXT_PSK_KEY_EXCHANGE_MODES, &[0x01, 0x01]);
    add_ext(&mut ext, EXT_SUPPORTED_VERSIONS, &versions);
    add_ext(&mut ext, EXT_COMPRESS_CERTIFICATE, &[0x02, 0x00, 0x02]);
    add_ext(&mut ext, last_grease, &[0x00]);

    assemble(fields, &cipher_suites, ext, CHROME_HELLO_LEN)
}

fn compose_firefox(fields: &ClientHelloFields) -> Result<Vec<u8>, FingerprintError> {
    let cipher_suites = [
        0x1301, 0x1303, 0x1302, 0xc02b, 0xc02f, 0xcca9, 0xcca8, 0xc02c, 0xc030, 0xc00a,
        0xc009, 0xc013, 0xc014, 0x009c, 0x009d, 0x002f, 0x0035, 0x000a,
    ];

    let mut groups = Vec::with_capacity(14);
    put_u16(&mut groups, 12);
    put_u16_list(&mut groups, &[0x001d, 0x0017, 0x0018, 0x0019, 0x0100, 0x0101]);

    // Firefox offers both x25519 and secp256r1 shares
    let mut p256 = [0u8; 65];
    random_bytes(&mut p256);
    p256[0] = 0x04; // uncompressed point

    let mut shares = x25519_share(&fields.x25519_key_share);
    put_u16(&mut shares, 0x0017);
    put_u16(&mut shares, 65);
    shares.extend_from_slice(&p256);

    let mut key_share = Vec::with_capacity(2 + shares.len());
    put_u16(&mut key_share, shares.len() as u16);
    key_share.extend_from_slice(&shares);

    let mut versions = vec![8];
    put_u16_list(&mut versions, &[0x0304, 0x0303, 0x0302, 0x0301]);

    let mut sig_algs = Vec::with_capacity(24);
    put_u16(&mut sig_algs, 22);
    put_u16_list(
        &mut sig_algs,
        &[
            0x0403, 0x0503, 0x0603, 0x0804, 0x0805, 0x0806, 0x0401, 0x0501, 0x0601, 0x0203,
            0x0201,
        ],
    );

    let mut ext = Vec::with_capacity(FIREFOX_HELLO_LEN);
    add_ext(&mut ext, EXT_SERVER_NAME, &server_name_ext(&fields.server_name));
    add_ext(&mut ext, EXT_EXTENDED_MASTER_SECRET, &[]);
    add_ext(&mut ext, EXT_RENEGOTIATION_INFO, &[0x00]);
    add_ext(&mut ext, EXT_SUPPORTED_GROUPS, &groups);
    add_ext(&mut ext, EXT_EC_POINT_FORMATS, &[0x01, 0x00]);
    add_ext(&mut ext, EXT_SESSION_TICKET, &[]);
    add_ext(&mut ext, EXT_ALPN, &ALPN_H2_HTTP11);
    add_ext(&mut ext, EXT_STATUS_REQUEST, &[0x01, 0x00, 0x00, 0x00, 0x00]);
    add_ext(&mut ext, EXT_KEY_SHARE, &key_share);
    add_ext(&mut ext, EXT_SUPPORTED_VERSIONS, &versions);
    add_ext(&mut ext, EXT_SIGNATURE_ALGORITHMS, &sig_algs);
    add_ext(&mut ext, EXT_PSK_KEY_EXCHANGE_MODES, &[0x01, 0x01]);
    add_ext(&mut ext, EXT_RECORD_SIZE_LIMIT, &[0x40, 0x01]);

    assemble(fields, &cipher_suites, ext, FIREFOX_HELLO_LEN)
}

fn compose_safari(fields: &ClientHelloFields) -> Result<Vec<u8>, FingerprintError> {
    let cipher_suites = [
        grease(),
        0x1301, 0x1302, 0x1303, 0xc02c, 0xc02b, 0xcca9, 0xc030, 0xc02f, 0xcca8, 0xc00a,
        0xc009, 0xc014, 0xc013, 0x009d, 0x009c, 0x0035, 0x002f, 0xc008, 0xc012, 0x000a,
    ];

    let first_grease = grease();
    let last_grease = grease_except(first_grease);

    let mut groups = Vec::with_capacity(12);
    put_u16(&mut groups, 10);
    put_u16_list(&mut groups, &[grease(), 0x001d, 0x0017, 0x0018, 0x0019]);

    let mut sig_algs = Vec::with_capacity(24);
    put_u16(&mut sig_algs, 22);
    put_u16_list(
        &mut sig_algs,
        &[
            0x0403, 0x0804, 0x0401, 0x0503, 0x0203, 0x0805, 0x0805, 0x0501, 0x0806, 0x0601,
            0x0201,
        ],
    );

    let mut key_share = Vec::with_capacity(43);
    put_u16(&mut key_share, 41);
    put_u16(&mut key_share, grease());
    put_u16(&mut key_share, 1);
    key_share.push(0x00);
    key_share.extend_from_slice(&x25519_share(&fields.x25519_key_share));

    let mut versions = vec![10];
    put_u16_list(&mut versions, &[grease(), 0x0304, 0x0303, 0x0302, 0x0301]);

    let mut ext = Vec::with_capacity(SAFARI_HELLO_LEN);
    add_ext(&mut ext, first_grease, &[]);
    add_ext(&mut ext, EXT_SERVER_NAME, &server_name_ext(&fields.server_name));
    add_ext(&mut ext, EXT_EXTENDED_MASTER_SECRET, &[]);
    add_ext(&mut ext, EXT_RENEGOTIATION_INFO, &[0x00]);
    add_ext(&mut ext, EXT_SUPPORTED_GROUPS, &groups);
    add_ext(&mut ext, EXT_EC_POINT_FORMATS, &[0x01, 0x00]);
    add_ext(&mut ext, EXT_ALPN, &ALPN_H2_HTTP11);
    add_ext(&mut ext, EXT_STATUS_REQUEST, &[0x01, 0x00, 0x00, 0x00, 0x00]);
    add_ext(&mut ext, EXT_SIGNATURE_ALGORITHMS, &sig_algs);
    add_ext(&mut ext, EXT_SCT, &[]);
    add_ext(&mut ext, EXT_KEY_SHARE, &key_share);
    add_ext(&mut ext, EXT_PSK_KEY_EXCHANGE_MODES, &[0x01, 0x01]);
    add_ext(&mut ext, EXT_SUPPORTED_VERSIONS, &versions);
    add_ext(&mut ext, last_grease, &[0x00]);

    assemble(fields, &cipher_suites, ext, SAFARI_HELLO_LEN)
}

/// JA3 fingerprint components of a ClientHello
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ja3Components {
    /// Legacy TLS version
    pub version: u16,
    /// Cipher suites, GREASE removed
    pub cipher_suites: Vec<u16>,
    /// Extension types in order, GREASE removed
    pub extensions: Vec<u16>,
    /// Supported groups, GREASE removed
    pub curves: Vec<u16>,
    /// EC point formats
    pub point_formats: Vec<u8>,
}

impl Ja3Components {
    /// Extract the JA3 components from a parsed ClientHello
    pub fn from_client_hello(hello: &ClientHello) -> Self {
        let curves = hello
            .extension(EXT_SUPPORTED_GROUPS)
            .filter(|data| data.len() >= 2)
            .map(|data| {
                data[2..]
                    .chunks_exact(2)
                    .map(|c| u16::from_be_bytes([c[0], c[1]]))
                    .filter(|v| !is_grease(*v))
                    .collect()
            })
            .unwrap_or_default();

        let point_formats = hello
            .extension(EXT_EC_POINT_FORMATS)
            .filter(|data| !data.is_empty())
            .map(|data| data[1..].to_vec())
            .unwrap_or_default();

        Self {
            version: hello.legacy_version,
            cipher_suites: hello
                .cipher_suites
                .iter()
                .copied()
                .filter(|v| !is_grease(*v))
                .collect(),
            extensions: hello
                .extensions
                .iter()
                .map(|(ext_type, _)| *ext_type)
                .filter(|v| !is_grease(*v))
                .collect(),
            curves,
            point_formats,
        }
    }

    /// Calculate JA3 hash (MD5 of fingerprint string)
    pub fn ja3_hash(&self) -> String {
        let fingerprint = self.ja3_string();
        format!("{:x}", md5::compute(fingerprint.as_bytes()))
    }

    /// Get JA3 fingerprint string
    pub fn ja3_string(&self) -> String {
        fn join<T: ToString>(values: &[T]) -> String {
            values
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join("-")
        }

        format!(
            "{},{},{},{},{}",
            self.version,
            join(&self.cipher_suites),
            join(&self.extensions),
            join(&self.curves),
            join(&self.point_formats)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::parse_client_hello;

    const CHROME_JA3: &str = "771,4865-4866-4867-49195-49199-49196-49200-52393-52392-49171-49172-156-157-47-53-10,0-23-65281-10-11-35-16-5-13-18-51-45-43-27-21,29-23-24,0";
    const FIREFOX_JA3: &str = "771,4865-4867-4866-49195-49199-52393-52392-49196-49200-49162-49161-49171-49172-156-157-47-53-10,0-23-65281-10-11-35-16-5-51-43-13-45-28-21,29-23-24-25-256-257,0";
    const SAFARI_JA3: &str = "771,4865-4866-4867-49196-49195-52393-49200-49199-52392-49162-49161-49172-49171-157-156-53-47-49160-49170-10,0-23-65281-10-11-16-5-13-18-51-45-43-21,29-23-24-25,0";

    fn fields(sni: &str) -> ClientHelloFields {
        let mut fields = ClientHelloFields {
            random: [0u8; 32],
            session_id: [0u8; 32],
            x25519_key_share: [0u8; 32],
            server_name: sni.to_string(),
        };
        random_bytes(&mut fields.random);
        random_bytes(&mut fields.session_id);
        random_bytes(&mut fields.x25519_key_share);
        fields
    }

    fn ja3_of(profile: BrowserProfile, sni: &str) -> Ja3Components {
        let hello = profile.compose_client_hello(&fields(sni)).unwrap();
        Ja3Components::from_client_hello(&parse_client_hello(&hello).unwrap())
    }

    #[test]
    fn test_ja3_matches_reference() {
        for (profile, reference) in [
            (BrowserProfile::Chrome, CHROME_JA3),
            (BrowserProfile::Firefox, FIREFOX_JA3),
            (BrowserProfile::Safari, SAFARI_JA3),
        ] {
            for sni in ["a.io", "www.bing.com", "static.cloudflareinsights.example.com"] {
                let ja3 = ja3_of(profile, sni);
                assert_eq!(ja3.ja3_string(), reference, "{:?} {}", profile, sni);
                assert_eq!(
                    ja3.ja3_hash(),
                    format!("{:x}", md5::compute(reference.as_bytes()))
                );
            }
        }
    }

    #[test]
    fn test_length_independent_of_sni() {
        for profile in [BrowserProfile::Chrome, BrowserProfile::Firefox, BrowserProfile::Safari] {
            for len in [0usize, 1, 12, 64, 200, MAX_SNI_LEN] {
                let sni = "x".repeat(len);
                let hello = profile.compose_client_hello(&fields(&sni)).unwrap();
                assert_eq!(hello.len(), profile.hello_len(), "{:?} sni len {}", profile, len);
            }
        }
    }

    #[test]
    fn test_fields_land_in_place() {
        let f = fields("example.com");
        for profile in [BrowserProfile::Chrome, BrowserProfile::Firefox, BrowserProfile::Safari] {
            let hello = parse_client_hello(&profile.compose_client_hello(&f).unwrap()).unwrap();
            assert_eq!(hello.random, f.random);
            assert_eq!(hello.session_id, f.session_id.to_vec());
            assert_eq!(hello.x25519_key_share().unwrap(), f.x25519_key_share);
            assert_eq!(hello.server_name().as_deref(), Some("example.com"));
            assert!(hello.extension(EXT_PADDING).is_some());
        }
    }

    #[test]
    fn test_chrome_grease_positions() {
        let hello =
            parse_client_hello(&BrowserProfile::Chrome.compose_client_hello(&fields("a.b")).unwrap())
                .unwrap();
        assert!(is_grease(hello.cipher_suites[0]));
        let first = hello.extensions.first().unwrap().0;
        let last_grease = hello.extensions[hello.extensions.len() - 2].0;
        assert!(is_grease(first));
        assert!(is_grease(last_grease));
        assert_ne!(first, last_grease);
    }

    #[test]
    fn test_oversized_sni_rejected() {
        let sni = "x".repeat(MAX_SNI_LEN + 1);
        for profile in [BrowserProfile::Chrome, BrowserProfile::Firefox, BrowserProfile::Safari] {
            assert!(matches!(
                profile.compose_client_hello(&fields(&sni)),
                Err(FingerprintError::InvalidSni(_))
            ));
        }
    }

    #[test]
    fn test_profile_names() {
        assert_eq!(BrowserProfile::from_name("Chrome"), Some(BrowserProfile::Chrome));
        assert_eq!(BrowserProfile::from_name("firefox"), Some(BrowserProfile::Firefox));
        assert_eq!(BrowserProfile::from_name("safari"), Some(BrowserProfile::Safari));
        assert_eq!(BrowserProfile::from_name("lynx"), None);
    }
}
