//! GameLink Server
//!
//! Accepts connections from game clients, assigns each a peer identity,
//! and maintains the registry of connected peers. Supports addressed
//! sends and best-effort broadcast.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};

use super::connection::{Connection, ConnectionError, ConnectionHandle};
use super::NetConfig;
use crate::peer::{Peer, PeerState};
use crate::protocol::{now_micros, Message, MessageType};

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Server already running")]
    AlreadyRunning,

    #[error("Bind failed: {0}")]
    BindFailed(String),

    #[error("No such peer")]
    NotConnected,

    #[error("Send failed: {0}")]
    SendFailed(ConnectionError),
}

pub type ServerResult<T> = Result<T, ServerError>;

/// Events emitted by the server
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// The server is accepting connections
    Started { addr: SocketAddr },
    /// The server stopped accepting connections
    Stopped,
    /// A new peer entered the registry
    PeerConnected { peer: Peer },
    /// A peer left the registry
    PeerDisconnected { peer_id: u32, reason: String },
    /// Received a message from a peer
    MessageReceived { peer_id: u32, message: Message },
}

/// Callback invoked per event when the server is polled
pub type ServerEventHandler = Box<dyn Fn(&ServerEvent) + Send + Sync>;

/// One registry entry: the peer plus its live connection
struct PeerEntry {
    peer: Peer,
    handle: ConnectionHandle,
    shutdown: mpsc::Sender<String>,
}

type Registry = Arc<RwLock<HashMap<u32, PeerEntry>>>;

/// GameLink Server
pub struct Server {
    config: NetConfig,
    /// Connected peers, keyed by assigned id
    registry: Registry,
    /// Next peer id; ids start at 1 and are never reused
    next_peer_id: Arc<AtomicU32>,
    event_tx: mpsc::Sender<ServerEvent>,
    event_rx: Option<mpsc::Receiver<ServerEvent>>,
    handlers: Vec<ServerEventHandler>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    running: Arc<RwLock<bool>>,
}

impl Server {
    /// Create a new server
    pub fn new(config: NetConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);

        Self {
            config,
            registry: Arc::new(RwLock::new(HashMap::new())),
            next_peer_id: Arc::new(AtomicU32::new(1)),
            event_tx,
            event_rx: Some(event_rx),
            handlers: Vec::new(),
            shutdown_tx: None,
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// Take the event receiver for async consumption (can only be called
    /// once; afterwards `poll` yields nothing)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<ServerEvent>> {
        self.event_rx.take()
    }

    /// Register a callback invoked for every event drained by `poll`
    pub fn on_event(&mut self, handler: impl Fn(&ServerEvent) + Send + Sync + 'static) {
        self.handlers.push(Box::new(handler));
    }

    /// Drain pending events without blocking, invoking registered
    /// handlers and returning the drained events
    pub fn poll(&mut self) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        if let Some(rx) = self.event_rx.as_mut() {
            while let Ok(event) = rx.try_recv() {
                events.push(event);
            }
        }
        for event in &events {
            for handler in &self.handlers {
                handler(event);
            }
        }
        events
    }

    /// Start accepting connections. Returns the bound address, so a
    /// configured port of 0 yields an ephemeral port.
    pub async fn start(&mut self) -> ServerResult<SocketAddr> {
        {
            let running = self.running.read().await;
            if *running {
                return Err(ServerError::AlreadyRunning);
            }
        }

        let bind_addr = format!("{}:{}", self.config.bind_address, self.config.port);
        let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
            ServerError::BindFailed(format!("Failed to bind to {}: {}", bind_addr, e))
        })?;

        let local_addr = listener.local_addr()?;
        tracing::info!("Server listening on {}", local_addr);

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx);

        {
            let mut running = self.running.write().await;
            *running = true;
        }

        let _ = self
            .event_tx
            .send(ServerEvent::Started { addr: local_addr })
            .await;

        let registry = self.registry.clone();
        let next_peer_id = self.next_peer_id.clone();
        let event_tx = self.event_tx.clone();
        let max_peers = self.config.max_peers;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                tracing::debug!("New connection from {}", addr);

                                let registry = registry.clone();
                                let next_peer_id = next_peer_id.clone();
                                let event_tx = event_tx.clone();

                                tokio::spawn(async move {
                                    handle_peer(
                                        stream,
                                        addr,
                                        registry,
                                        next_peer_id,
                                        event_tx,
                                        max_peers,
                                    )
                                    .await;
                                });
                            }
                            Err(e) => {
                                tracing::error!("Accept error: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Server shutdown requested");
                        break;
                    }
                }
            }

            let _ = event_tx.send(ServerEvent::Stopped).await;
        });

        Ok(local_addr)
    }

    /// Stop the server: disconnect every peer, then stop accepting.
    /// Idempotent; stopping a stopped server is a no-op.
    pub async fn stop(&mut self) {
        // Check-and-clear under one write lock, so is_running reflects
        // the stop as soon as this call returns.
        {
            let mut running = self.running.write().await;
            if !*running {
                return;
            }
            *running = false;
        }

        self.disconnect_all("Server shutting down").await;

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
    }

    /// Look up a peer by id
    pub async fn peer(&self, peer_id: u32) -> Option<Peer> {
        self.registry.read().await.get(&peer_id).map(|e| e.peer.clone())
    }

    /// Snapshot of all connected peers
    pub async fn peers(&self) -> Vec<Peer> {
        self.registry.read().await.values().map(|e| e.peer.clone()).collect()
    }

    /// Number of connected peers
    pub async fn peer_count(&self) -> usize {
        self.registry.read().await.len()
    }

    /// Disconnect one peer, removing it from the registry and notifying
    /// with the given reason. A no-op for unknown ids.
    pub async fn disconnect_peer(&self, peer_id: u32, reason: &str) {
        let entry = { self.registry.write().await.remove(&peer_id) };

        if let Some(mut entry) = entry {
            entry.peer.set_state(PeerState::Disconnected);
            entry.handle.mark_disconnected();
            let _ = entry.shutdown.send(reason.to_string()).await;

            tracing::info!("Disconnected peer {}: {}", peer_id, reason);
            let _ = self
                .event_tx
                .send(ServerEvent::PeerDisconnected {
                    peer_id,
                    reason: reason.to_string(),
                })
                .await;
        }
    }

    /// Disconnect every connected peer. The id set is captured up front,
    /// so handlers that trigger further disconnects cannot corrupt the
    /// iteration.
    pub async fn disconnect_all(&self, reason: &str) {
        let peer_ids: Vec<u32> = { self.registry.read().await.keys().copied().collect() };

        for peer_id in peer_ids {
            self.disconnect_peer(peer_id, reason).await;
        }
    }

    /// Send a message to one peer, refreshing its activity timestamp
    pub async fn send_to(&self, peer_id: u32, message: Message) -> ServerResult<()> {
        let handle = {
            let mut registry = self.registry.write().await;
            match registry.get_mut(&peer_id) {
                Some(entry) => {
                    entry.peer.touch();
                    entry.handle.clone()
                }
                None => return Err(ServerError::NotConnected),
            }
        };

        handle.send(message).await.map_err(ServerError::SendFailed)
    }

    /// Send a message to every connected peer, best-effort. A failure
    /// against one peer is logged and does not abort the rest of the
    /// fan-out. Returns the number of peers the message was queued to.
    pub async fn broadcast(&self, message: Message) -> usize {
        let handles: Vec<(u32, ConnectionHandle)> = {
            let mut registry = self.registry.write().await;
            registry
                .iter_mut()
                .map(|(id, entry)| {
                    entry.peer.touch();
                    (*id, entry.handle.clone())
                })
                .collect()
        };

        let mut delivered = 0;
        for (peer_id, handle) in handles {
            match handle.send(message.clone()).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!("Broadcast to peer {} failed: {}", peer_id, e);
                }
            }
        }
        delivered
    }

    /// Whether the server is accepting connections
    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}

/// Handle one accepted connection for its whole lifetime
async fn handle_peer(
    stream: TcpStream,
    addr: SocketAddr,
    registry: Registry,
    next_peer_id: Arc<AtomicU32>,
    event_tx: mpsc::Sender<ServerEvent>,
    max_peers: usize,
) {
    let mut conn = Connection::new(stream, addr);

    let (msg_tx, mut msg_rx) = mpsc::channel::<Message>(256);
    let handle = ConnectionHandle::new(msg_tx);
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<String>(1);

    // Capacity check and id assignment are atomic with the insert, so a
    // reader never sees the registry above capacity or a half-admitted
    // peer. The accept itself implies a completed transport handshake,
    // so the peer enters the registry as Connected.
    let peer_id = {
        let mut registry = registry.write().await;
        if max_peers > 0 && registry.len() >= max_peers {
            None
        } else {
            let peer_id = next_peer_id.fetch_add(1, Ordering::SeqCst);
            let peer = Peer::new(peer_id, addr, PeerState::Connected);
            registry.insert(
                peer_id,
                PeerEntry {
                    peer,
                    handle: handle.clone(),
                    shutdown: shutdown_tx,
                },
            );
            Some(peer_id)
        }
    };

    let peer_id = match peer_id {
        Some(id) => id,
        None => {
            tracing::warn!("Rejecting connection from {}: server full", addr);
            let _ = conn.close(0, "Server full").await;
            return;
        }
    };

    // Announce the assigned id to the client
    if let Err(e) = conn.send(&Message::handshake(peer_id)).await {
        tracing::warn!("Handshake to {} failed: {}", addr, e);
        registry.write().await.remove(&peer_id);
        return;
    }

    tracing::info!("Peer {} connected from {}", peer_id, addr);
    {
        let registry = registry.read().await;
        if let Some(entry) = registry.get(&peer_id) {
            let _ = event_tx
                .send(ServerEvent::PeerConnected {
                    peer: entry.peer.clone(),
                })
                .await;
        }
    }

    let disconnect_reason = loop {
        tokio::select! {
            result = conn.recv() => {
                match result {
                    Ok(Some(message)) => {
                        {
                            let mut registry = registry.write().await;
                            if let Some(entry) = registry.get_mut(&peer_id) {
                                entry.peer.touch();
                            }
                        }
                        match message.kind {
                            MessageType::Disconnect => {
                                break message.payload_str()
                                    .unwrap_or("Peer disconnected")
                                    .to_string();
                            }
                            MessageType::Ping => {
                                let pong = Message::pong_for(&message, 0);
                                if let Err(e) = conn.send(&pong).await {
                                    break format!("Send error: {}", e);
                                }
                            }
                            MessageType::Pong => {
                                // The timestamp is remote-controlled; saturate so a
                                // hostile value cannot overflow the subtraction
                                let elapsed_us = now_micros().saturating_sub(message.timestamp);
                                let rtt_ms = (elapsed_us.max(0) / 1000) as u64;
                                handle.update_rtt(rtt_ms);
                                let mut registry = registry.write().await;
                                if let Some(entry) = registry.get_mut(&peer_id) {
                                    entry.peer.update_rtt(rtt_ms as u32);
                                }
                            }
                            _ => {
                                tracing::debug!("Message from peer {}: {:?}", peer_id, message.kind);
                                let _ = event_tx.send(ServerEvent::MessageReceived {
                                    peer_id,
                                    message,
                                }).await;
                            }
                        }
                    }
                    Ok(None) => {
                        break "Connection closed".to_string();
                    }
                    Err(e) => {
                        // Malformed data is a fault of this connection
                        // only; drop the peer, leave the rest untouched.
                        break format!("Error: {}", e);
                    }
                }
            }

            Some(message) = msg_rx.recv() => {
                if let Err(e) = conn.send(&message).await {
                    break format!("Send error: {}", e);
                }
            }

            Some(reason) = shutdown_rx.recv() => {
                break reason;
            }
        }
    };

    handle.mark_disconnected();

    // Whoever removes the entry emits the disconnect event; if a
    // disconnect_peer call got here first, stay silent.
    let removed = { registry.write().await.remove(&peer_id) };
    if removed.is_some() {
        tracing::info!("Peer {} disconnected: {}", peer_id, disconnect_reason);
        let _ = event_tx
            .send(ServerEvent::PeerDisconnected {
                peer_id,
                reason: disconnect_reason.clone(),
            })
            .await;
    }

    let _ = conn.close(0, &disconnect_reason).await;
}
