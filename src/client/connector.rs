//! Building client sessions out of freshly handshaken connections

use crate::config::ClientConfig;
use crate::crypto::{random_u32, PublicKey};
use crate::obfuscation::BrowserProfile;
use crate::protocol::{AuthInfo, Uid, WorldState};
use crate::transport::{
    Connection, DirectTls, Transport, TransportConfig, TransportError, TransportKind,
    WebSocketTransport,
};
use crate::tunnel::{EncryptionMethod, Obfuscator, Role, Session, SessionConfig, TunnelError};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Delay between failed handshake attempts
pub const RETRY_DELAY: Duration = Duration::from_secs(3);

/// Dials the server and assembles sessions
#[derive(Debug, Clone)]
pub struct Connector {
    remote: String,
    transport: TransportKind,
    browser: BrowserProfile,
    ws_host: String,
    ws_path: String,
    uid: Uid,
    proxy_method: String,
    encryption_method: EncryptionMethod,
    unordered: bool,
    mock_domain: String,
    server_public_key: PublicKey,
    num_conn: usize,
    timeouts: TransportConfig,
    retry_delay: Duration,
    world: WorldState,
}

impl Connector {
    pub fn from_config(config: &ClientConfig) -> Result<Self, crate::Error> {
        config.validate()?;
        Ok(Self {
            remote: config.remote.clone(),
            transport: config.transport,
            browser: config.browser,
            ws_host: config
                .ws_host
                .clone()
                .unwrap_or_else(|| config.mock_domain.clone()),
            ws_path: config.ws_path.clone(),
            uid: config.uid()?,
            proxy_method: config.proxy_method.clone(),
            encryption_method: config.encryption_method,
            unordered: config.unordered,
            mock_domain: config.mock_domain.clone(),
            server_public_key: config.server_public_key()?,
            num_conn: config.num_conn,
            timeouts: TransportConfig::default(),
            retry_delay: RETRY_DELAY,
            world: WorldState::real(),
        })
    }

    /// Use `world` as the clock stamped into handshakes
    pub fn with_world(mut self, world: WorldState) -> Self {
        self.world = world;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_timeouts(mut self, timeouts: TransportConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn singleplex(&self) -> bool {
        self.num_conn == 0
    }

    pub fn is_unordered(&self) -> bool {
        self.unordered
    }

    fn auth_info(&self, session_id: u32) -> AuthInfo {
        AuthInfo {
            uid: self.uid,
            proxy_method: self.proxy_method.clone(),
            encryption_method: self.encryption_method,
            unordered: self.unordered,
            session_id,
            mock_domain: self.mock_domain.clone(),
            server_public_key: self.server_public_key,
            world: self.world.clone(),
        }
    }

    /// Dial and authenticate one connection of session `session_id`
    pub async fn connect_one(
        &self,
        session_id: u32,
        profile: BrowserProfile,
    ) -> Result<(Connection, [u8; 32]), TransportError> {
        let tcp = tokio::time::timeout(self.timeouts.connect_timeout, TcpStream::connect(&self.remote))
            .await
            .map_err(|_| TransportError::Timeout)??;
        let _ = tcp.set_nodelay(true);

        let transport: Box<dyn Transport> = match self.transport {
            TransportKind::Direct => Box::new(DirectTls::new(profile)),
            TransportKind::WebSocket => {
                Box::new(WebSocketTransport::new(self.ws_host.clone(), self.ws_path.clone()))
            }
        };
        let auth = self.auth_info(session_id);
        tokio::time::timeout(
            self.timeouts.handshake_timeout,
            transport.handshake(Box::new(tcp), &auth),
        )
        .await
        .map_err(|_| TransportError::Timeout)?
    }

    /// Keep trying until one connection authenticates
    async fn connect_with_retry(&self, session_id: u32) -> (Connection, [u8; 32]) {
        let mut profile = self.browser;
        loop {
            match self.connect_one(session_id, profile).await {
                Ok(done) => return done,
                Err(e) => {
                    warn!(remote = %self.remote, ?profile, error = %e, "handshake failed, retrying");
                    // Chrome's first packet can exceed some path MTUs
                    if profile == BrowserProfile::Chrome {
                        profile = BrowserProfile::Firefox;
                    }
                    tokio::time::sleep(self.retry_delay).await;
                }
            }
        }
    }

    /// Open a session over `num_conn` connections (one when singleplex)
    pub async fn make_session(&self) -> Result<Arc<Session>, TunnelError> {
        let session_id = loop {
            let id = random_u32();
            if id != 0 {
                break id;
            }
        };
        let count = self.num_conn.max(1);
        debug!(session_id, count, "making session");

        let connections = join_all((0..count).map(|_| self.connect_with_retry(session_id))).await;
        // every connection of a session receives the same key
        let session_key = connections
            .last()
            .map(|(_, key)| *key)
            .ok_or_else(|| TunnelError::BrokenSession("no connections".to_string()))?;

        let session = Session::new(
            session_id,
            SessionConfig {
                obfuscator: Obfuscator::new(self.encryption_method, &session_key, Role::Client)?,
                unordered: self.unordered,
                singleplex: self.singleplex(),
                accept_streams: false,
            },
        );
        for (conn, _) in connections {
            session.add_connection(conn)?;
        }
        info!(session_id, connections = count, "session established");
        Ok(session)
    }
}
