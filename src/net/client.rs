//! GameLink Client
//!
//! Connects to a GameLink server and handles message exchange. The client
//! owns exactly one outbound connection; its lifecycle is tracked with the
//! same state machine as a server-side peer.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

use super::connection::{Connection, ConnectionError, ConnectionHandle};
use super::NetConfig;
use crate::peer::{Peer, PeerState};
use crate::protocol::{now_micros, Message, MessageType};

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Not connected")]
    NotConnected,

    #[error("Send failed: {0}")]
    SendFailed(ConnectionError),

    #[error("Connection timeout")]
    Timeout,
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Events emitted by the client
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Successfully connected; `peer_id` is the id the server assigned us
    Connected {
        peer_id: u32,
        server_addr: SocketAddr,
    },
    /// Disconnected from the server
    Disconnected { reason: String },
    /// Received a message from the server
    MessageReceived { message: Message },
    /// The connection state machine transitioned
    StateChanged { old: PeerState, new: PeerState },
}

/// Callback invoked per event when the client is polled
pub type ClientEventHandler = Box<dyn Fn(&ClientEvent) + Send + Sync>;

/// GameLink Client
pub struct Client {
    config: NetConfig,
    /// Connection state machine, shared with the connection task
    state: Arc<RwLock<PeerState>>,
    /// Peer id assigned by the server, 0 until the handshake completes
    local_peer_id: Arc<AtomicU32>,
    /// The server endpoint, populated while connected
    server_peer: Arc<RwLock<Option<Peer>>>,
    event_tx: mpsc::Sender<ClientEvent>,
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
    handlers: Vec<ClientEventHandler>,
    connection_handle: Arc<RwLock<Option<ConnectionHandle>>>,
    shutdown_tx: Arc<RwLock<Option<mpsc::Sender<()>>>>,
    /// The spawned connection task, awaited on disconnect
    task: Arc<RwLock<Option<JoinHandle<()>>>>,
}

impl Client {
    /// Create a new client
    pub fn new(config: NetConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);

        Self {
            config,
            state: Arc::new(RwLock::new(PeerState::Disconnected)),
            local_peer_id: Arc::new(AtomicU32::new(0)),
            server_peer: Arc::new(RwLock::new(None)),
            event_tx,
            event_rx: Some(event_rx),
            handlers: Vec::new(),
            connection_handle: Arc::new(RwLock::new(None)),
            shutdown_tx: Arc::new(RwLock::new(None)),
            task: Arc::new(RwLock::new(None)),
        }
    }

    /// Take the event receiver for async consumption (can only be called
    /// once; afterwards `poll` yields nothing)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Register a callback invoked for every event drained by `poll`
    pub fn on_event(&mut self, handler: impl Fn(&ClientEvent) + Send + Sync + 'static) {
        self.handlers.push(Box::new(handler));
    }

    /// Drain pending events without blocking, invoking registered
    /// handlers and returning the drained events. Suits a once-per-tick
    /// game loop; async consumers use `take_event_receiver` instead.
    pub fn poll(&mut self) -> Vec<ClientEvent> {
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

    /// Connect to a server.
    ///
    /// Fails with `AlreadyConnected` unless currently disconnected. A
    /// failed attempt leaves the client disconnected and ready to retry.
    pub async fn connect(&self, server_addr: SocketAddr) -> ClientResult<()> {
        {
            let state = self.state.read().await;
            if *state != PeerState::Disconnected {
                return Err(ClientError::AlreadyConnected);
            }
        }

        transition(&self.state, &self.event_tx, PeerState::Connecting).await;
        tracing::info!("Connecting to {}", server_addr);

        let connect_timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(server_addr))
            .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                transition(&self.state, &self.event_tx, PeerState::Disconnected).await;
                return Err(ClientError::ConnectionFailed(e));
            }
            Err(_) => {
                transition(&self.state, &self.event_tx, PeerState::Disconnected).await;
                return Err(ClientError::Timeout);
            }
        };

        let mut conn = Connection::new(stream, server_addr);

        // The server sends a handshake carrying our assigned peer id
        let peer_id = match conn.recv_timeout(connect_timeout).await {
            Ok(Some(msg)) if msg.kind == MessageType::Handshake => msg.receiver_id,
            Ok(Some(_)) => {
                transition(&self.state, &self.event_tx, PeerState::Disconnected).await;
                return Err(ClientError::Connection(ConnectionError::HandshakeFailed(
                    "expected handshake message".to_string(),
                )));
            }
            Ok(None) => {
                transition(&self.state, &self.event_tx, PeerState::Disconnected).await;
                return Err(ClientError::Connection(ConnectionError::HandshakeFailed(
                    "connection closed during handshake".to_string(),
                )));
            }
            Err(ConnectionError::Timeout) => {
                transition(&self.state, &self.event_tx, PeerState::Disconnected).await;
                return Err(ClientError::Timeout);
            }
            Err(e) => {
                transition(&self.state, &self.event_tx, PeerState::Disconnected).await;
                return Err(ClientError::Connection(e));
            }
        };

        self.local_peer_id.store(peer_id, Ordering::SeqCst);
        {
            let mut peer = self.server_peer.write().await;
            *peer = Some(Peer::new(0, server_addr, PeerState::Connected));
        }

        let (msg_tx, mut msg_rx) = mpsc::channel::<Message>(256);
        let handle = ConnectionHandle::new(msg_tx);
        {
            let mut ch = self.connection_handle.write().await;
            *ch = Some(handle.clone());
        }

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        {
            let mut st = self.shutdown_tx.write().await;
            *st = Some(shutdown_tx);
        }

        transition(&self.state, &self.event_tx, PeerState::Connected).await;
        tracing::info!("Connected to {} as peer {}", server_addr, peer_id);

        let _ = self
            .event_tx
            .send(ClientEvent::Connected {
                peer_id,
                server_addr,
            })
            .await;

        // Spawn the connection task
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let local_peer_id = self.local_peer_id.clone();
        let server_peer = self.server_peer.clone();
        let connection_handle = self.connection_handle.clone();
        let heartbeat_interval = Duration::from_millis(self.config.heartbeat_interval_ms);

        let task = tokio::spawn(async move {
            let mut heartbeat_timer = tokio::time::interval(heartbeat_interval);
            heartbeat_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            let disconnect_reason = loop {
                tokio::select! {
                    result = conn.recv() => {
                        match result {
                            Ok(Some(message)) => {
                                touch_peer(&server_peer).await;
                                match message.kind {
                                    MessageType::Disconnect => {
                                        break message.payload_str()
                                            .unwrap_or("Server disconnected")
                                            .to_string();
                                    }
                                    MessageType::Ping => {
                                        let id = local_peer_id.load(Ordering::SeqCst);
                                        let pong = Message::pong_for(&message, id);
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
                                        let mut peer = server_peer.write().await;
                                        if let Some(peer) = peer.as_mut() {
                                            peer.update_rtt(rtt_ms as u32);
                                        }
                                    }
                                    _ => {
                                        let _ = event_tx.send(ClientEvent::MessageReceived {
                                            message,
                                        }).await;
                                    }
                                }
                            }
                            Ok(None) => {
                                break "Connection closed".to_string();
                            }
                            Err(e) => {
                                break format!("Error: {}", e);
                            }
                        }
                    }

                    Some(message) = msg_rx.recv() => {
                        if let Err(e) = conn.send(&message).await {
                            break format!("Send error: {}", e);
                        }
                    }

                    _ = heartbeat_timer.tick() => {
                        let id = local_peer_id.load(Ordering::SeqCst);
                        if let Err(e) = conn.send(&Message::ping(id)).await {
                            break format!("Heartbeat error: {}", e);
                        }
                    }

                    _ = shutdown_rx.recv() => {
                        break "Client disconnect requested".to_string();
                    }
                }
            };

            // Clean up
            handle.mark_disconnected();
            transition(&state, &event_tx, PeerState::Disconnecting).await;

            {
                let mut ch = connection_handle.write().await;
                *ch = None;
            }
            {
                let mut peer = server_peer.write().await;
                *peer = None;
            }

            let id = local_peer_id.swap(0, Ordering::SeqCst);
            let _ = conn.close(id, &disconnect_reason).await;

            transition(&state, &event_tx, PeerState::Disconnected).await;
            tracing::info!("Disconnected: {}", disconnect_reason);

            let _ = event_tx
                .send(ClientEvent::Disconnected {
                    reason: disconnect_reason,
                })
                .await;
        });

        {
            let mut slot = self.task.write().await;
            *slot = Some(task);
        }

        Ok(())
    }

    /// Connect to a server by hostname
    pub async fn connect_hostname(&self, hostname: &str, port: u16) -> ClientResult<()> {
        let addr = super::resolve_host(hostname, port).await?;
        self.connect(addr).await
    }

    /// Disconnect from the server. A no-op when not connected.
    ///
    /// When this returns the connection task has fully wound down: the
    /// socket is closed, the local peer id is back to 0, and the state
    /// machine has reached `Disconnected`, so a fresh `connect` is
    /// immediately valid.
    pub async fn disconnect(&self) {
        {
            let state = self.state.read().await;
            if *state == PeerState::Disconnected {
                return;
            }
        }

        if let Some(handle) = &*self.connection_handle.read().await {
            let id = self.local_peer_id.load(Ordering::SeqCst);
            let _ = handle.send(Message::disconnect(id, "Client disconnecting")).await;
        }

        if let Some(tx) = &*self.shutdown_tx.read().await {
            let _ = tx.send(()).await;
        }

        let task = { self.task.write().await.take() };
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Send a message to the server
    pub async fn send(&self, message: Message) -> ClientResult<()> {
        let handle = self.connection_handle.read().await;
        match &*handle {
            Some(h) => h.send(message).await.map_err(ClientError::SendFailed),
            None => Err(ClientError::NotConnected),
        }
    }

    /// Current connection state
    pub async fn state(&self) -> PeerState {
        *self.state.read().await
    }

    pub async fn is_connected(&self) -> bool {
        *self.state.read().await == PeerState::Connected
    }

    /// The peer id assigned by the server, 0 while disconnected
    pub fn local_peer_id(&self) -> u32 {
        self.local_peer_id.load(Ordering::SeqCst)
    }

    /// The server endpoint as a peer, while connected
    pub async fn server_peer(&self) -> Option<Peer> {
        self.server_peer.read().await.clone()
    }

    /// Last measured round-trip time to the server in milliseconds
    pub async fn rtt_ms(&self) -> u32 {
        self.server_peer
            .read()
            .await
            .as_ref()
            .map(|p| p.rtt_ms())
            .unwrap_or(0)
    }
}

/// Apply a state transition, emitting a `StateChanged` event for actual
/// transitions only. Idempotent transitions stay silent.
async fn transition(
    state: &Arc<RwLock<PeerState>>,
    event_tx: &mpsc::Sender<ClientEvent>,
    new: PeerState,
) {
    let change = {
        let mut s = state.write().await;
        if *s != new {
            let old = *s;
            *s = new;
            Some((old, new))
        } else {
            None
        }
    };

    if let Some((old, new)) = change {
        let _ = event_tx.send(ClientEvent::StateChanged { old, new }).await;
    }
}

async fn touch_peer(server_peer: &Arc<RwLock<Option<Peer>>>) {
    let mut peer = server_peer.write().await;
    if let Some(peer) = peer.as_mut() {
        peer.touch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_client_starts_disconnected() {
        let client = Client::new(NetConfig::default());
        assert!(!client.is_connected().await);
        assert_eq!(client.local_peer_id(), 0);
        assert!(client.server_peer().await.is_none());
    }

    #[tokio::test]
    async fn test_send_when_disconnected_fails() {
        let client = Client::new(NetConfig::default());
        let result = client.send(Message::data(0, 0, Bytes::from_static(b"x"))).await;
        assert!(matches!(result, Err(ClientError::NotConnected)));
    }

    #[tokio::test]
    async fn test_disconnect_is_noop_when_disconnected() {
        let client = Client::new(NetConfig::default());
        client.disconnect().await;
        assert_eq!(client.state().await, PeerState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_refused_leaves_client_reconnectable() {
        let client = Client::new(NetConfig::default());
        // Bind and drop a listener to get a port nothing listens on
        let addr = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        assert!(client.connect(addr).await.is_err());
        assert_eq!(client.state().await, PeerState::Disconnected);
    }
}
