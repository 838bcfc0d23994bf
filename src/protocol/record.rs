//! TLS record layer framing
//!
//! ```text
//! ContentType (1 byte)
//! ProtocolVersion (2 bytes)
//! Length (2 bytes, big-endian)
//! Fragment (variable)
//! ```

use super::ProtocolError;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Size of the record header
pub const RECORD_HEADER_LEN: usize = 5;

/// Largest fragment a TLS 1.3 ciphertext record may carry (2^14 + 256)
pub const MAX_RECORD_BODY: usize = 16384 + 256;

pub const CONTENT_CHANGE_CIPHER_SPEC: u8 = 0x14;
pub const CONTENT_HANDSHAKE: u8 = 0x16;
pub const CONTENT_APPLICATION_DATA: u8 = 0x17;

/// Legacy version used on the first ClientHello record
pub const VERSION_TLS10: [u8; 2] = [0x03, 0x01];
/// Legacy version used on every other record
pub const VERSION_TLS12: [u8; 2] = [0x03, 0x03];

/// Prefix `body` with a record header
pub fn add_record_layer(content_type: u8, version: [u8; 2], body: &[u8]) -> Vec<u8> {
    let mut record = Vec::with_capacity(RECORD_HEADER_LEN + body.len());
    record.push(content_type);
    record.extend_from_slice(&version);
    record.extend_from_slice(&(body.len() as u16).to_be_bytes());
    record.extend_from_slice(body);
    record
}

/// Split a complete record into its content type and body
pub fn peel_record_layer(record: &[u8]) -> Result<(u8, &[u8]), ProtocolError> {
    if record.len() < RECORD_HEADER_LEN {
        return Err(ProtocolError::BadInput(format!(
            "record of {} bytes is shorter than its header",
            record.len()
        )));
    }
    let len = u16::from_be_bytes([record[3], record[4]]) as usize;
    let body = &record[RECORD_HEADER_LEN..];
    if body.len() != len {
        return Err(ProtocolError::BadInput(format!(
            "record declares {} bytes, holds {}",
            len,
            body.len()
        )));
    }
    Ok((record[0], body))
}

/// Read exactly one record (header included) from `reader` into `buf`
///
/// `buf` is cleared first. Oversized records are rejected before their
/// body is read.
pub async fn read_record<R>(reader: &mut R, buf: &mut Vec<u8>) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; RECORD_HEADER_LEN];
    reader.read_exact(&mut header).await?;

    let len = u16::from_be_bytes([header[3], header[4]]) as usize;
    if len > MAX_RECORD_BODY {
        return Err(ProtocolError::BadInput(format!("record length {} too large", len)));
    }

    buf.clear();
    buf.reserve(RECORD_HEADER_LEN + len);
    buf.extend_from_slice(&header);
    buf.resize(RECORD_HEADER_LEN + len, 0);
    reader.read_exact(&mut buf[RECORD_HEADER_LEN..]).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_peel() {
        let record = add_record_layer(CONTENT_APPLICATION_DATA, VERSION_TLS12, b"payload");
        assert_eq!(&record[..5], &[0x17, 0x03, 0x03, 0x00, 0x07]);

        let (content_type, body) = peel_record_layer(&record).unwrap();
        assert_eq!(content_type, CONTENT_APPLICATION_DATA);
        assert_eq!(body, b"payload");
    }

    #[test]
    fn test_peel_rejects_length_mismatch() {
        let mut record = add_record_layer(CONTENT_HANDSHAKE, VERSION_TLS10, &[1, 2, 3]);
        record.pop();
        assert!(peel_record_layer(&record).is_err());
        assert!(peel_record_layer(&[0x16, 0x03]).is_err());
    }

    #[tokio::test]
    async fn test_read_records_back_to_back() {
        let mut wire = add_record_layer(CONTENT_HANDSHAKE, VERSION_TLS12, &[9u8; 40]);
        wire.extend(add_record_layer(CONTENT_CHANGE_CIPHER_SPEC, VERSION_TLS12, &[1]));

        let mut reader = &wire[..];
        let mut buf = Vec::new();
        read_record(&mut reader, &mut buf).await.unwrap();
        assert_eq!(buf.len(), 45);
        read_record(&mut reader, &mut buf).await.unwrap();
        assert_eq!(buf, vec![0x14, 0x03, 0x03, 0x00, 0x01, 0x01]);
        assert!(read_record(&mut reader, &mut buf).await.is_err());
    }

    #[tokio::test]
    async fn test_read_rejects_oversized() {
        let wire = [0x17, 0x03, 0x03, 0xff, 0xff];
        let mut reader = &wire[..];
        let mut buf = Vec::new();
        assert!(matches!(
            read_record(&mut reader, &mut buf).await,
            Err(ProtocolError::BadInput(_))
        ));
    }
}
