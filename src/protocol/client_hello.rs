//! ClientHello parsing
//!
//! ```text
//! HandshakeType (1 byte) = 0x01
//! Length (3 bytes)
//! ProtocolVersion (2 bytes)
//! Random (32 bytes)
//! SessionID (1 byte length + variable)
//! CipherSuites (2 bytes length + variable)
//! CompressionMethods (1 byte length + variable)
//! Extensions (2 bytes length + variable)
//! ```

use super::record::{peel_record_layer, CONTENT_HANDSHAKE};
use super::ProtocolError;

const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXT_SERVER_NAME: u16 = 0x0000;
const EXT_KEY_SHARE: u16 = 0x0033;
const GROUP_X25519: u16 = 0x001d;

/// A fully parsed ClientHello
#[derive(Debug, Clone)]
pub struct ClientHello {
    pub legacy_version: u16,
    pub random: [u8; 32],
    pub session_id: Vec<u8>,
    pub cipher_suites: Vec<u16>,
    pub compression_methods: Vec<u8>,
    /// Extensions in wire order
    pub extensions: Vec<(u16, Vec<u8>)>,
}

impl ClientHello {
    /// Data of the first extension of type `ext_type`
    pub fn extension(&self, ext_type: u16) -> Option<&[u8]> {
        self.extensions
            .iter()
            .find(|(t, _)| *t == ext_type)
            .map(|(_, data)| data.as_slice())
    }

    /// Host name from the server_name extension
    pub fn server_name(&self) -> Option<String> {
        let data = self.extension(EXT_SERVER_NAME)?;
        let mut r = Reader::new(data);
        let mut list = Reader::new(r.vec_u16().ok()?);
        while !list.is_empty() {
            let name_type = list.u8().ok()?;
            let name = list.vec_u16().ok()?;
            if name_type == 0 {
                return String::from_utf8(name.to_vec()).ok();
            }
        }
        None
    }

    /// The 32-byte X25519 entry of the key_share extension
    pub fn x25519_key_share(&self) -> Option<[u8; 32]> {
        let data = self.extension(EXT_KEY_SHARE)?;
        let mut r = Reader::new(data);
        let mut shares = Reader::new(r.vec_u16().ok()?);
        while !shares.is_empty() {
            let group = shares.u16().ok()?;
            let key = shares.vec_u16().ok()?;
            if group == GROUP_X25519 {
                return key.try_into().ok();
            }
        }
        None
    }
}

/// Parse a ClientHello handshake message (no record header)
pub fn parse_client_hello(msg: &[u8]) -> Result<ClientHello, ProtocolError> {
    let mut r = Reader::new(msg);
    if r.u8()? != HANDSHAKE_CLIENT_HELLO {
        return Err(bad("not a ClientHello"));
    }
    let len = r.u24()? as usize;
    let mut body = Reader::new(r.take(len)?);

    let legacy_version = body.u16()?;
    let random: [u8; 32] = body
        .take(32)?
        .try_into()
        .map_err(|_| bad("short random"))?;
    let session_id = body.vec_u8()?.to_vec();
    if session_id.len() > 32 {
        return Err(bad("session id longer than 32 bytes"));
    }

    let suites = body.vec_u16()?;
    if suites.len() % 2 != 0 {
        return Err(bad("odd cipher suite list"));
    }
    let cipher_suites = suites
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect();

    let compression_methods = body.vec_u8()?.to_vec();

    let mut extensions = Vec::new();
    if !body.is_empty() {
        let mut exts = Reader::new(body.vec_u16()?);
        while !exts.is_empty() {
            let ext_type = exts.u16()?;
            let data = exts.vec_u16()?;
            extensions.push((ext_type, data.to_vec()));
        }
    }
    if !body.is_empty() {
        return Err(bad("trailing bytes after extensions"));
    }

    Ok(ClientHello {
        legacy_version,
        random,
        session_id,
        cipher_suites,
        compression_methods,
        extensions,
    })
}

/// Parse a handshake record carrying a ClientHello
pub fn parse_client_hello_record(record: &[u8]) -> Result<ClientHello, ProtocolError> {
    let (content_type, body) = peel_record_layer(record)?;
    if content_type != CONTENT_HANDSHAKE {
        return Err(bad("not a handshake record"));
    }
    parse_client_hello(body)
}

fn bad(msg: &str) -> ProtocolError {
    ProtocolError::BadInput(msg.to_string())
}

/// Bounds-checked big-endian cursor
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        if self.buf.len() < n {
            return Err(bad("truncated ClientHello"));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, ProtocolError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> Result<u32, ProtocolError> {
        let b = self.take(3)?;
        Ok(u32::from_be_bytes([0, b[0], b[1], b[2]]))
    }

    fn vec_u8(&mut self) -> Result<&'a [u8], ProtocolError> {
        let len = self.u8()? as usize;
        self.take(len)
    }

    fn vec_u16(&mut self) -> Result<&'a [u8], ProtocolError> {
        let len = self.u16()? as usize;
        self.take(len)
    }
}
