//! GameLink - Peer-to-peer game networking
//!
//! Companion CLI for manual testing: run a relay server, connect a
//! client, watch the traffic.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use gamelink::config::{self, Config};
use gamelink::protocol::{Message, DEFAULT_PORT};
use gamelink::{Client, ClientEvent, NetConfig, Server, ServerEvent};

/// GameLink - peer-to-peer game networking
#[derive(Parser)]
#[command(name = "gamelink")]
#[command(version = "0.1.0")]
#[command(about = "Run a GameLink server or client", long_about = None)]
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
    /// Run a relay server that rebroadcasts every data message
    Server {
        /// Port to listen on
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Maximum simultaneous peers (0 = unlimited)
        #[arg(short, long, default_value_t = 0)]
        max_peers: usize,
    },

    /// Connect to a server and print received messages
    Client {
        /// Server address (host or host:port)
        #[arg(short, long)]
        server: String,

        /// Server port (ignored when --server includes one)
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Optional message to send after connecting
        #[arg(short, long)]
        message: Option<String>,
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
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    match cli.command {
        Commands::Server { port, max_peers } => {
            run_server(config, port, max_peers).await?;
        }
        Commands::Client {
            server,
            port,
            message,
        } => {
            run_client(config, server, port, message).await?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config();
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
    }

    Ok(())
}

/// Run a relay server: every data message from one peer is rebroadcast
/// to all connected peers
async fn run_server(config: Config, port: u16, max_peers: usize) -> anyhow::Result<()> {
    let mut net_config = config.net_config();
    net_config.port = port;
    net_config.max_peers = max_peers;

    let mut server = Server::new(net_config);
    let mut event_rx = server
        .take_event_receiver()
        .expect("event receiver already taken");

    let addr = server.start().await?;
    println!("GameLink server listening on {}", addr);
    println!("Press Ctrl+C to stop.\n");

    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                match event {
                    ServerEvent::PeerConnected { peer } => {
                        println!("+ Peer {} connected from {}", peer.id(), peer.addr());
                    }
                    ServerEvent::PeerDisconnected { peer_id, reason } => {
                        println!("- Peer {} disconnected: {}", peer_id, reason);
                    }
                    ServerEvent::MessageReceived { peer_id, message } => {
                        if let Some(text) = message.payload_str() {
                            println!("[peer {}] {}", peer_id, text);
                        }
                        // Relay semantics: fan the message back out
                        let delivered = server.broadcast(message).await;
                        tracing::debug!("Relayed to {} peers", delivered);
                    }
                    ServerEvent::Stopped => break,
                    _ => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                break;
            }
        }
    }

    server.stop().await;
    tracing::info!("Server stopped");

    Ok(())
}

/// Connect to a server, optionally send one message, and print traffic
async fn run_client(
    config: Config,
    server: String,
    port: u16,
    message: Option<String>,
) -> anyhow::Result<()> {
    let server_addr: SocketAddr = if server.contains(':') {
        server.parse()?
    } else {
        gamelink::net::resolve_host(&server, port).await?
    };

    let mut client = Client::new(config.net_config());
    let mut event_rx = client
        .take_event_receiver()
        .expect("event receiver already taken");

    println!("Connecting to {}...", server_addr);
    client.connect(server_addr).await?;

    if let Some(text) = &message {
        let msg = Message::data(client.local_peer_id(), 0, text.clone().into_bytes());
        client.send(msg).await?;
    }

    println!("Connected as peer {}. Press Ctrl+C to disconnect.\n", client.local_peer_id());

    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                match event {
                    ClientEvent::MessageReceived { message } => {
                        if let Some(text) = message.payload_str() {
                            println!("[peer {}] {}", message.sender_id, text);
                        } else {
                            println!("[peer {}] {} bytes", message.sender_id, message.payload.len());
                        }
                    }
                    ClientEvent::Disconnected { reason } => {
                        println!("Disconnected: {}", reason);
                        break;
                    }
                    _ => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nDisconnecting...");
                break;
            }
        }
    }

    client.disconnect().await;
    tracing::info!("Client disconnected");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["gamelink", "server", "--port", "7667"]);
        assert!(cli.is_ok());

        let cli = Cli::try_parse_from(["gamelink", "client", "--server", "127.0.0.1:7667"]);
        assert!(cli.is_ok());
    }
}
