//! Mimic Tunnel Server
//!
//! Accepts browser-shaped TLS (or WebSocket) handshakes, authenticates
//! users, forwards their streams to the configured upstream proxies and
//! sends everything else to the decoy web server.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use mimic_tunnel::{
    config::{encode_uid, Config},
    crypto::{random_bytes, KeyPair},
    protocol::Uid,
    server::Server,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Mimic Tunnel Server - censorship-resistant transport
#[derive(Parser, Debug)]
#[command(name = "mimic-server")]
#[command(about = "Mimic Tunnel Server - streams hidden in TLS look-alike traffic")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "server.toml")]
    config: String,

    /// Generate new keypair and exit
    #[arg(long)]
    generate_key: bool,

    /// Generate a new user UID and exit
    #[arg(long)]
    generate_uid: bool,

    /// Listen address (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Log level (trace, debug, info, warn, error); overrides [logging]
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate_key {
        return generate_keypair();
    }
    if args.generate_uid {
        return generate_uid();
    }

    let mut config = Config::load(&args.config).context("Failed to load configuration")?;

    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(level))
        .init();

    let server_config = config
        .server
        .as_mut()
        .ok_or_else(|| anyhow!("No [server] section in config file"))?;

    if server_config.private_key.is_empty() {
        info!("No keypair configured - generating new keypair...");
        let keypair = KeyPair::generate();
        server_config.private_key = keypair.private.to_base64();
        server_config.public_key = keypair.public.to_base64();
        info!("Share this public key with clients: {}", keypair.public.to_base64());
        config
            .save(&args.config)
            .context("Failed to save config with new keypair")?;
        info!("Generated and saved new keypair to config file");
    }

    let mut server_config = config
        .server
        .clone()
        .ok_or_else(|| anyhow!("No [server] section in config file"))?;
    if let Some(listen) = args.listen {
        server_config.listen = vec![listen];
    }
    if server_config.allow_plain {
        warn!("allow_plain is set: sessions may run without frame encryption");
    }

    let server = Server::from_config(&server_config).context("Invalid server configuration")?;
    let public = server_config.private_key()?.public_key();

    info!("Mimic Tunnel Server v{}", mimic_tunnel::VERSION);
    info!("Server public key: {}", public.to_base64());
    info!("Decoy: {}", server_config.redir_addr);

    let shutdown = CancellationToken::new();
    server.spawn_sweeper(shutdown.clone());

    let mut tasks = Vec::new();
    for addr in &server_config.listen {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind to {}", addr))?;
        tasks.push(tokio::spawn(server.clone().serve(listener, shutdown.clone())));
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutting down...");
    shutdown.cancel();
    for task in tasks {
        let _ = task.await;
    }
    Ok(())
}

/// Generate and print a new keypair
fn generate_keypair() -> Result<()> {
    let keypair = KeyPair::generate();

    println!("Add to your server config:");
    println!("  private_key = \"{}\"", keypair.private.to_base64());
    println!("  public_key = \"{}\"", keypair.public.to_base64());
    println!();
    println!("Share with clients:");
    println!("  server_public_key = \"{}\"", keypair.public.to_base64());

    Ok(())
}

/// Generate and print a new UID
fn generate_uid() -> Result<()> {
    let mut uid: Uid = [0u8; 16];
    random_bytes(&mut uid);
    println!("uid = \"{}\"", encode_uid(&uid));
    Ok(())
}
