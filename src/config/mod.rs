//! Configuration management

use crate::crypto::{PrivateKey, PublicKey};
use crate::obfuscation::BrowserProfile;
use crate::protocol::Uid;
use crate::transport::TransportKind;
use crate::tunnel::EncryptionMethod;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: Option<ServerConfig>,
    /// Client configuration
    pub client: Option<ClientConfig>,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse(content: &str) -> Result<Self, crate::Error> {
        toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }
}

/// Network of an upstream proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Tcp,
    Udp,
}

/// Where streams of one proxy method are forwarded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyEntry {
    #[serde(default)]
    pub network: Network,
    pub address: String,
}

/// A user of the local user database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEntry {
    /// Base64 UID
    pub uid: String,
    /// Concurrent sessions allowed
    #[serde(default = "default_sessions_cap")]
    pub sessions_cap: usize,
    /// Unix seconds after which the user is refused; 0 never expires
    #[serde(default)]
    pub expiry: u64,
    /// Remaining credit in bytes; unlimited when absent
    #[serde(default)]
    pub credit: Option<u64>,
}

fn default_sessions_cap() -> usize {
    16
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen addresses
    pub listen: Vec<String>,
    /// Server private key (base64)
    #[serde(default)]
    pub private_key: String,
    /// Server public key (base64) - derived from private key, stored for convenience
    #[serde(default)]
    pub public_key: String,
    /// Decoy web server that failed handshakes are forwarded to
    pub redir_addr: String,
    /// Proxy method -> upstream
    #[serde(default)]
    pub proxy_book: HashMap<String, ProxyEntry>,
    /// UID (base64) allowed to open admin sessions
    #[serde(default)]
    pub admin_uid: Option<String>,
    /// UIDs (base64) admitted without consulting the user database
    #[serde(default)]
    pub bypass_uids: Vec<String>,
    /// Local user database
    #[serde(default)]
    pub users: Vec<UserEntry>,
    /// Idle timeout for upstream reads, in seconds
    #[serde(default = "default_stream_timeout")]
    pub stream_timeout: u64,
    /// Accept sessions that ask for the unencrypted frame codec
    #[serde(default)]
    pub allow_plain: bool,
    /// ClientHellos are refused once this many randoms are remembered
    #[serde(default = "default_max_used_randoms")]
    pub max_used_randoms: usize,
}

fn default_stream_timeout() -> u64 {
    300
}

fn default_max_used_randoms() -> usize {
    1 << 20
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: vec!["0.0.0.0:443".to_string()],
            private_key: String::new(),
            public_key: String::new(),
            redir_addr: "127.0.0.1:8080".to_string(),
            proxy_book: HashMap::new(),
            admin_uid: None,
            bypass_uids: Vec::new(),
            users: Vec::new(),
            stream_timeout: default_stream_timeout(),
            allow_plain: false,
            max_used_randoms: default_max_used_randoms(),
        }
    }
}

impl ServerConfig {
    pub fn private_key(&self) -> Result<PrivateKey, crate::Error> {
        PrivateKey::from_base64(&self.private_key)
            .map_err(|e| crate::Error::Config(format!("Invalid private_key: {}", e)))
    }

    pub fn admin_uid(&self) -> Result<Option<Uid>, crate::Error> {
        self.admin_uid.as_deref().map(parse_uid).transpose()
    }

    pub fn bypass_uids(&self) -> Result<Vec<Uid>, crate::Error> {
        self.bypass_uids.iter().map(|u| parse_uid(u)).collect()
    }

    pub fn stream_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_timeout)
    }

    /// Check the settings that cannot be caught by deserialization
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.listen.is_empty() {
            return Err(crate::Error::Config("no listen address".to_string()));
        }
        if self.proxy_book.is_empty() {
            return Err(crate::Error::Config("proxy_book is empty".to_string()));
        }
        self.private_key()?;
        self.admin_uid()?;
        self.bypass_uids()?;
        for user in &self.users {
            parse_uid(&user.uid)?;
        }
        Ok(())
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server address
    pub remote: String,
    /// How the handshake and frames are carried
    #[serde(default)]
    pub transport: TransportKind,
    /// ClientHello fingerprint
    #[serde(default)]
    pub browser: BrowserProfile,
    /// Server public key (base64)
    pub server_public_key: String,
    /// This user's UID (base64)
    pub uid: String,
    /// Upstream selected on the server
    pub proxy_method: String,
    #[serde(default)]
    pub encryption_method: EncryptionMethod,
    /// SNI presented in the ClientHello
    pub mock_domain: String,
    /// Underlying connections per session; 0 opens one session per local connection
    #[serde(default = "default_num_conn")]
    pub num_conn: usize,
    /// Preserve datagram boundaries (required for UDP)
    #[serde(default)]
    pub unordered: bool,
    /// Local listen address
    pub listen: String,
    /// Idle timeout for local reads, in seconds
    #[serde(default = "default_stream_timeout")]
    pub stream_timeout: u64,
    /// Permit the unencrypted frame codec
    #[serde(default)]
    pub allow_plain: bool,
    /// Host header for the WebSocket transport; defaults to `mock_domain`
    #[serde(default)]
    pub ws_host: Option<String>,
    #[serde(default = "default_ws_path")]
    pub ws_path: String,
}

fn default_num_conn() -> usize {
    4
}

fn default_ws_path() -> String {
    "/".to_string()
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            remote: "127.0.0.1:443".to_string(),
            transport: TransportKind::Direct,
            browser: BrowserProfile::Chrome,
            server_public_key: String::new(),
            uid: String::new(),
            proxy_method: "shadowsocks".to_string(),
            encryption_method: EncryptionMethod::Aes256Gcm,
            mock_domain: "www.bing.com".to_string(),
            num_conn: default_num_conn(),
            unordered: false,
            listen: "127.0.0.1:1984".to_string(),
            stream_timeout: default_stream_timeout(),
            allow_plain: false,
            ws_host: None,
            ws_path: default_ws_path(),
        }
    }
}

impl ClientConfig {
    pub fn server_public_key(&self) -> Result<PublicKey, crate::Error> {
        PublicKey::from_base64(&self.server_public_key)
            .map_err(|e| crate::Error::Config(format!("Invalid server_public_key: {}", e)))
    }

    pub fn uid(&self) -> Result<Uid, crate::Error> {
        parse_uid(&self.uid)
    }

    pub fn stream_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_timeout)
    }

    /// Whether each local connection gets its own session
    pub fn singleplex(&self) -> bool {
        self.num_conn == 0
    }

    pub fn validate(&self) -> Result<(), crate::Error> {
        self.server_public_key()?;
        self.uid()?;
        if self.proxy_method.len() > 12 {
            return Err(crate::Error::Config(format!(
                "proxy_method {:?} longer than 12 bytes",
                self.proxy_method
            )));
        }
        if self.encryption_method == EncryptionMethod::Plain && !self.allow_plain {
            return Err(crate::Error::Config(
                "encryption_method \"plain\" needs allow_plain = true".to_string(),
            ));
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or `EnvFilter` directive (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Decode a base64 UID
pub fn parse_uid(s: &str) -> Result<Uid, crate::Error> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(s.trim())
        .map_err(|e| crate::Error::Config(format!("Invalid UID {:?}: {}", s, e)))?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| crate::Error::Config(format!("UID must be 16 bytes, got {}", bytes.len())))
}

/// Encode a UID as base64
pub fn encode_uid(uid: &Uid) -> String {
    base64::engine::general_purpose::STANDARD.encode(uid)
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    let mut server = ServerConfig::default();
    server.proxy_book.insert(
        "shadowsocks".to_string(),
        ProxyEntry {
            network: Network::Tcp,
            address: "127.0.0.1:8388".to_string(),
        },
    );
    Config {
        server: Some(server),
        client: Some(ClientConfig::default()),
        logging: LoggingConfig::default(),
    }
}
