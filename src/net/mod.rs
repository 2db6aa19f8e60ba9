//! Network module - TCP communication between game hosts
//!
//! Provides:
//! - Server for accepting incoming connections and tracking peers
//! - Client for connecting to a server
//! - Connection management and message framing

mod server;
mod client;
mod connection;

pub use server::*;
pub use client::*;
pub use connection::*;

use std::net::SocketAddr;

/// Configuration for network operations
#[derive(Debug, Clone)]
pub struct NetConfig {
    /// Port to listen on or connect to
    pub port: u16,
    /// Interface to bind to (server side)
    pub bind_address: String,
    /// Maximum simultaneous peers, 0 = unlimited
    pub max_peers: usize,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Interval between client pings in milliseconds
    pub heartbeat_interval_ms: u64,
    /// Maximum message payload size in bytes
    pub max_message_size: usize,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            port: crate::protocol::DEFAULT_PORT,
            bind_address: "0.0.0.0".to_string(),
            max_peers: 0,
            connect_timeout_ms: 5000,
            heartbeat_interval_ms: 1000,
            max_message_size: crate::protocol::MAX_PAYLOAD_SIZE,
        }
    }
}

impl NetConfig {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    pub fn with_max_peers(mut self, max_peers: usize) -> Self {
        self.max_peers = max_peers;
        self
    }
}

/// Resolve a hostname to a socket address
pub async fn resolve_host(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    use tokio::net::lookup_host;

    let addr_string = format!("{}:{}", host, port);
    let mut addrs = lookup_host(&addr_string).await?;

    addrs.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Could not resolve host: {}", host),
        )
    })
}
