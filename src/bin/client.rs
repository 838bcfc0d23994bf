//! Mimic Tunnel Client
//!
//! Listens locally and carries every accepted TCP connection (or UDP flow,
//! when `unordered` is set) to the server over browser-shaped sessions.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use mimic_tunnel::{
    client::{pipe_tcp, pipe_udp, Connector, SessionSlot},
    config::{encode_uid, Config},
    crypto::random_bytes,
    obfuscation::BrowserProfile,
    protocol::Uid,
};
use std::sync::Arc;
use tokio::net::{TcpListener, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Mimic Tunnel Client - censorship-resistant transport
#[derive(Parser, Debug)]
#[command(name = "mimic-client")]
#[command(about = "Mimic Tunnel Client - streams hidden in TLS look-alike traffic")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "client.toml")]
    config: String,

    /// Generate a new UID and exit
    #[arg(long)]
    generate_uid: bool,

    /// Server address (overrides config)
    #[arg(short, long)]
    remote: Option<String>,

    /// Local listen address (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Browser profile for the ClientHello (chrome, firefox, safari)
    #[arg(long)]
    profile: Option<String>,

    /// Log level (trace, debug, info, warn, error); overrides [logging]
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate_uid {
        let mut uid: Uid = [0u8; 16];
        random_bytes(&mut uid);
        println!("uid = \"{}\"", encode_uid(&uid));
        return Ok(());
    }

    let config = Config::load(&args.config).context("Failed to load configuration")?;

    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(level))
        .init();

    let mut client_config = config
        .client
        .ok_or_else(|| anyhow!("No [client] section in config file"))?;
    if let Some(remote) = args.remote {
        client_config.remote = remote;
    }
    if let Some(listen) = args.listen {
        client_config.listen = listen;
    }
    if let Some(profile) = args.profile {
        client_config.browser = BrowserProfile::from_name(&profile)
            .ok_or_else(|| anyhow!("Unknown browser profile: {}", profile))?;
    }

    let connector = Arc::new(
        Connector::from_config(&client_config).context("Invalid client configuration")?,
    );
    let slot = Arc::new(SessionSlot::new(connector));
    let stream_timeout = client_config.stream_timeout();

    info!("Mimic Tunnel Client v{}", mimic_tunnel::VERSION);
    info!(
        "Remote: {} ({:?}, {:?}, {} connection(s){})",
        client_config.remote,
        client_config.transport,
        client_config.browser,
        client_config.num_conn.max(1),
        if client_config.singleplex() { ", singleplex" } else { "" }
    );

    let shutdown = CancellationToken::new();
    let piper = if client_config.unordered {
        let socket = UdpSocket::bind(&client_config.listen)
            .await
            .with_context(|| format!("Failed to bind UDP {}", client_config.listen))?;
        tokio::spawn(pipe_udp(socket, slot, stream_timeout, shutdown.clone()))
    } else {
        let listener = TcpListener::bind(&client_config.listen)
            .await
            .with_context(|| format!("Failed to bind TCP {}", client_config.listen))?;
        tokio::spawn(pipe_tcp(listener, slot, stream_timeout, shutdown.clone()))
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutting down...");
    shutdown.cancel();
    let _ = piper.await;
    Ok(())
}
