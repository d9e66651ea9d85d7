//! PeerWire - Framed peer-to-peer connections
//!
//! Hosts or joins a two-player session and runs the name handshake.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use peerwire::config::{self, Config};
use peerwire::network::{
    client_handshake, resolve_host, server_handshake, ConnectionPool, PendingConnect,
};
use peerwire::protocol;

/// PeerWire - Framed peer-to-peer connections
#[derive(Parser)]
#[command(name = "peerwire")]
#[command(author = "PeerWire Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Host or join a two-player session over framed TCP", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Wait for a player to join
    Host {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Player name to announce
        #[arg(short, long)]
        name: Option<String>,

        /// How long to wait for a player (seconds)
        #[arg(short, long)]
        timeout: Option<u64>,
    },

    /// Join a hosted session
    Join {
        /// Host to connect to, as `host` or `host:port`
        #[arg(short, long)]
        server: String,

        /// Port used when the server address carries none
        #[arg(short, long)]
        port: Option<u16>,

        /// Player name to announce
        #[arg(short, long)]
        name: Option<String>,

        /// Connect timeout (seconds)
        #[arg(short, long)]
        timeout: Option<u64>,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show protocol information
    Info,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    // Initialize logging
    let filter = if cli.verbose || config.general.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Host {
            port,
            name,
            timeout,
        } => {
            run_host(config, port, name, timeout)?;
        }
        Commands::Join {
            server,
            port,
            name,
            timeout,
        } => {
            run_join(config, server, port, name, timeout)?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
        Commands::Info => {
            print_protocol_info(&config);
        }
    }

    Ok(())
}

/// Wait for the attempt to finish, or for Ctrl+C
fn wait_for_peer(pool: &ConnectionPool, pending: PendingConnect) -> anyhow::Result<SocketAddr> {
    pool.block_on(async {
        tokio::select! {
            result = pending => result.map_err(anyhow::Error::from),
            _ = tokio::signal::ctrl_c() => Err(anyhow::anyhow!("Cancelled")),
        }
    })?
}

/// Split `host[:port]`, falling back to `default_port`
fn split_host_port(server: &str, default_port: u16) -> (&str, u16) {
    match server.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => match port.parse() {
            Ok(port) => (host, port),
            Err(_) => (server, default_port),
        },
        _ => (server, default_port),
    }
}

/// Accept one player and run the server side of the handshake
fn run_host(
    config: Config,
    port: Option<u16>,
    name: Option<String>,
    timeout: Option<u64>,
) -> anyhow::Result<()> {
    let mut settings = config.network_settings();
    if let Some(port) = port {
        settings.port = port;
    }
    if let Some(secs) = timeout {
        settings.accept_timeout_ms = secs * 1000;
    }
    let name = name.unwrap_or(config.general.name.clone());

    let bind_addr: SocketAddr = format!("{}:{}", config.network.bind_address, settings.port)
        .parse()
        .with_context(|| format!("Invalid bind address {}", config.network.bind_address))?;

    let mut pool = ConnectionPool::new(settings.clone());
    pool.init(format!("Server[{}]", name), config.pool.connections.max(1))?;
    let connection = pool
        .connection(0)
        .ok_or_else(|| anyhow::anyhow!("Pool has no connections"))?;

    println!(
        "Accepting client connections on {} for the next {} seconds...",
        bind_addr,
        settings.accept_timeout().as_secs()
    );
    let pending = connection.accept_on(bind_addr, settings.accept_timeout())?;
    let peer_addr = wait_for_peer(&pool, pending).context("No player joined")?;

    let peer_name = pool
        .block_on(server_handshake(
            connection,
            &name,
            settings.handshake_timeout(),
        ))?
        .context("Handshake failed")?;

    println!("\n========================================");
    println!("  PeerWire Session Ready");
    println!("========================================");
    println!("  Host:   {}", name);
    println!("  Player: {} ({})", peer_name, peer_addr);
    println!("========================================");

    pool.stop();
    Ok(())
}

/// Connect to a host and run the client side of the handshake
fn run_join(
    config: Config,
    server: String,
    port: Option<u16>,
    name: Option<String>,
    timeout: Option<u64>,
) -> anyhow::Result<()> {
    let mut settings = config.network_settings();
    if let Some(port) = port {
        settings.port = port;
    }
    if let Some(secs) = timeout {
        settings.connect_timeout_ms = secs * 1000;
    }
    let name = name.unwrap_or(config.general.name.clone());

    let mut pool = ConnectionPool::new(settings.clone());
    pool.init(format!("Client[{}]", name), config.pool.connections.max(1))?;

    let server_addr: SocketAddr = match server.parse() {
        Ok(addr) => addr,
        Err(_) => {
            let (host, port) = split_host_port(&server, settings.port);
            pool.block_on(resolve_host(host, port))?
                .with_context(|| format!("Could not resolve {}", server))?
        }
    };

    let connection = pool
        .connection(0)
        .ok_or_else(|| anyhow::anyhow!("Pool has no connections"))?;

    println!("Connecting to {}...", server_addr);
    let pending = connection.connect_async(server_addr, settings.connect_timeout())?;
    wait_for_peer(&pool, pending).context("Could not reach the host")?;

    let host_name = pool
        .block_on(client_handshake(
            connection,
            &name,
            settings.handshake_timeout(),
        ))?
        .context("Handshake failed")?;

    println!("\n========================================");
    println!("  PeerWire Session Ready");
    println!("========================================");
    println!("  Player: {}", name);
    println!("  Host:   {} ({})", host_name, server_addr);
    println!("========================================");

    pool.stop();
    Ok(())
}

/// Print protocol information
fn print_protocol_info(config: &Config) {
    let settings = config.network_settings();

    println!("PeerWire Protocol Information");
    println!("=============================\n");

    println!("Header Magic: {:#04X} {:#04X}", protocol::HEADER_MAGIC[0], protocol::HEADER_MAGIC[1]);
    println!("Footer Magic: {:#04X} {:#04X}", protocol::FOOTER_MAGIC[0], protocol::FOOTER_MAGIC[1]);
    println!("Frame Overhead: {} bytes", protocol::FRAME_OVERHEAD);
    println!("Default Port: {}", protocol::DEFAULT_PORT);

    println!("\nConfigured:");
    println!("  Port: {}", settings.port);
    println!("  Connect Timeout: {:?}", settings.connect_timeout());
    println!("  Accept Timeout: {:?}", settings.accept_timeout());
    println!("  Handshake Timeout: {:?}", settings.handshake_timeout());
    println!("  Max Payload: {} bytes", settings.max_payload_size);
    println!("  Drain Timeout: {:?}", settings.drain_timeout());
}
