//! Prepared connections and their unit-oriented halves
//!
//! A unit is one complete TLS application-data record. Over direct TLS it
//! is read off the byte stream by its record header; over WebSocket it is
//! the body of one binary message.

use super::TransportError;
use crate::protocol::record::read_record;
use crate::protocol::ProtocolError;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

/// Any bidirectional byte stream a connection can run over
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// An authenticated connection ready to carry frames
pub enum Connection {
    Tls(BoxedStream),
    Ws(WebSocketStream<BoxedStream>),
}

impl Connection {
    /// Wrap any stream as a direct TLS connection
    pub fn tls<S: AsyncStream + 'static>(stream: S) -> Self {
        Connection::Tls(Box::new(stream))
    }

    pub fn split(self) -> (UnitReader, UnitWriter) {
        match self {
            Connection::Tls(stream) => {
                let (r, w) = tokio::io::split(stream);
                (UnitReader::Tls(r), UnitWriter::Tls(w))
            }
            Connection::Ws(ws) => {
                let (w, r) = ws.split();
                (UnitReader::Ws(r), UnitWriter::Ws(w))
            }
        }
    }
}

/// Read half of a connection
pub enum UnitReader {
    Tls(ReadHalf<BoxedStream>),
    Ws(SplitStream<WebSocketStream<BoxedStream>>),
}

impl UnitReader {
    /// Read the next unit into `buf`
    pub async fn read_unit(&mut self, buf: &mut Vec<u8>) -> Result<(), TransportError> {
        match self {
            UnitReader::Tls(r) => read_record(r, buf).await.map_err(|e| match e {
                ProtocolError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    TransportError::Closed
                }
                ProtocolError::Io(e) => TransportError::Io(e),
                other => TransportError::BadRecord(other.to_string()),
            }),
            UnitReader::Ws(r) => loop {
                match r.next().await {
                    Some(Ok(Message::Binary(data))) => {
                        *buf = data;
                        return Ok(());
                    }
                    Some(Ok(Message::Close(_))) | None => return Err(TransportError::Closed),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(e.into()),
                }
            },
        }
    }
}

/// Write half of a connection
pub enum UnitWriter {
    Tls(WriteHalf<BoxedStream>),
    Ws(SplitSink<WebSocketStream<BoxedStream>, Message>),
}

impl UnitWriter {
    /// Write one complete unit
    pub async fn write_unit(&mut self, unit: &[u8]) -> Result<(), TransportError> {
        match self {
            UnitWriter::Tls(w) => {
                w.write_all(unit).await?;
                Ok(())
            }
            UnitWriter::Ws(w) => {
                w.send(Message::Binary(unit.to_vec())).await?;
                Ok(())
            }
        }
    }

    pub async fn close(&mut self) {
        let _ = match self {
            UnitWriter::Tls(w) => w.shutdown().await.map_err(TransportError::from),
            UnitWriter::Ws(w) => w.close().await.map_err(TransportError::from),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::record::{add_record_layer, CONTENT_APPLICATION_DATA, VERSION_TLS12};
    use tokio_tungstenite::tungstenite::protocol::Role;

    #[tokio::test]
    async fn test_tls_units() {
        let (a, b) = tokio::io::duplex(1 << 16);
        let (_, mut writer) = Connection::tls(a).split();
        let (mut reader, _) = Connection::tls(b).split();

        let first = add_record_layer(CONTENT_APPLICATION_DATA, VERSION_TLS12, b"first");
        let second = add_record_layer(CONTENT_APPLICATION_DATA, VERSION_TLS12, &[7u8; 3000]);
        writer.write_unit(&first).await.unwrap();
        writer.write_unit(&second).await.unwrap();

        let mut buf = Vec::new();
        reader.read_unit(&mut buf).await.unwrap();
        assert_eq!(buf, first);
        reader.read_unit(&mut buf).await.unwrap();
        assert_eq!(buf, second);

        writer.close().await;
        assert!(matches!(
            reader.read_unit(&mut buf).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_ws_units() {
        let (a, b) = tokio::io::duplex(1 << 16);
        let client =
            WebSocketStream::from_raw_socket(Box::new(a) as BoxedStream, Role::Client, None).await;
        let server =
            WebSocketStream::from_raw_socket(Box::new(b) as BoxedStream, Role::Server, None).await;
        let (_, mut writer) = Connection::Ws(client).split();
        let (mut reader, _) = Connection::Ws(server).split();

        let unit = add_record_layer(CONTENT_APPLICATION_DATA, VERSION_TLS12, b"over websocket");
        writer.write_unit(&unit).await.unwrap();

        let mut buf = Vec::new();
        reader.read_unit(&mut buf).await.unwrap();
        assert_eq!(buf, unit);
    }
}
