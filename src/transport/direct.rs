//! Direct TLS transport
//!
//! Sends one browser-shaped ClientHello record and reads back the
//! ServerHello, ChangeCipherSpec and fake certificate records. No real TLS
//! session exists afterwards; frames are sealed by the tunnel's own codec.

use super::{BoxedStream, Connection, Transport, TransportError};
use crate::obfuscation::BrowserProfile;
use crate::protocol::{AuthInfo, ClientAuth};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Direct TLS transport mimicking `profile`
#[derive(Debug, Clone, Copy)]
pub struct DirectTls {
    profile: BrowserProfile,
}

impl DirectTls {
    pub fn new(profile: BrowserProfile) -> Self {
        Self { profile }
    }

    pub fn profile(&self) -> BrowserProfile {
        self.profile
    }
}

#[async_trait]
impl Transport for DirectTls {
    async fn handshake(
        &self,
        mut stream: BoxedStream,
        auth: &AuthInfo,
    ) -> Result<(Connection, [u8; 32]), TransportError> {
        let client = ClientAuth::new(auth)?;
        let hello = client.client_hello_record(self.profile, &auth.mock_domain)?;
        stream.write_all(&hello).await?;
        debug!(profile = ?self.profile, len = hello.len(), "ClientHello sent");

        let session_key = client.read_server_reply(&mut stream).await?;
        Ok((Connection::Tls(stream), session_key))
    }
}
