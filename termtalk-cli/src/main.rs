//! `termtalk`: host or join an encrypted terminal chat room.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use termtalk_core::identity::probe_entropy;
use termtalk_server::registry::REGISTRY_FILE_NAME;
use termtalk_server::{FileRegistry, HostConfig};
use termtalk_transport::DEFAULT_TOR_PORT;

mod host;
mod join;
mod ui;

/// Encrypted peer-to-peer terminal chat.
///
/// One side hosts a short-lived room; the other joins it by room ID. Every
/// message after the key exchange is sealed with ChaCha20-Poly1305.
#[derive(Parser)]
#[command(name = "termtalk")]
#[command(version)]
#[command(about = "Encrypted peer-to-peer terminal chat")]
struct Cli {
    /// Settings file (TOML). Flags override its values.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Room registry file (default: ~/.termtalk_rooms.json)
    #[arg(long, global = true)]
    registry: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Host a new room and wait for peers
    Host(HostArgs),
    /// Join a room by its ID
    Join(JoinArgs),
}

#[derive(Args, Debug)]
pub struct HostArgs {
    /// Address to listen on. Anything other than loopback is reachable
    /// from the network.
    #[arg(long)]
    pub bind: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Room lifetime in seconds
    #[arg(long)]
    pub ttl: Option<u64>,
}

#[derive(Args, Debug)]
pub struct JoinArgs {
    /// Room ID (16 hex characters). Prompted for when omitted.
    pub room: Option<String>,

    /// Host address (host:port), skipping the registry lookup
    #[arg(long)]
    pub host: Option<String>,

    /// Seconds to wait for the TCP connection
    #[arg(long, default_value_t = 10)]
    pub connect_timeout: u64,

    /// Route the connection through a local Tor SOCKS5 proxy
    #[arg(long)]
    pub tor: bool,

    /// Tor SOCKS5 proxy port on 127.0.0.1
    #[arg(long, default_value_t = DEFAULT_TOR_PORT)]
    pub tor_port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    probe_entropy().context("OS randomness source unavailable")?;

    let config = match &cli.config {
        Some(path) => HostConfig::load(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => HostConfig::default(),
    };
    let registry = Arc::new(FileRegistry::new(registry_path(cli.registry)?));
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    ui::banner();

    match cli.command {
        Command::Host(args) => host::run(config, &args, registry, &mut stdin).await,
        Command::Join(args) => {
            join::run(&args, config.session_config(), registry, &mut stdin).await
        }
    }
}

fn registry_path(explicit: Option<PathBuf>) -> Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path),
        None => {
            let home = dirs::home_dir().context("cannot locate the home directory")?;
            Ok(home.join(REGISTRY_FILE_NAME))
        }
    }
}
