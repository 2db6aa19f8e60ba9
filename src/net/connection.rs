//! Connection handling for GameLink
//!
//! Manages one framed TCP connection: encoding and decoding messages,
//! buffering partial frames across reads, and tracking activity.

use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::protocol::{CodecError, Decoder, Message};

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Codec(#[from] CodecError),

    #[error("Connection closed")]
    Closed,

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Connection timeout")]
    Timeout,

    #[error("Send channel closed")]
    ChannelClosed,
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Transfer counters for one connection
#[derive(Debug, Default, Clone)]
pub struct ConnectionStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// A framed connection to a remote GameLink endpoint
pub struct Connection {
    remote_addr: SocketAddr,
    stream: TcpStream,
    decoder: Decoder,
    read_buf: BytesMut,
    write_buf: BytesMut,
    last_activity: Instant,
    stats: ConnectionStats,
}

impl Connection {
    /// Create a connection from an established TCP stream
    pub fn new(stream: TcpStream, remote_addr: SocketAddr) -> Self {
        Self {
            remote_addr,
            stream,
            decoder: Decoder::new(),
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(4096),
            last_activity: Instant::now(),
            stats: ConnectionStats::default(),
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Time since the last send or receive
    pub fn idle_time(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Send a message. The write is all-or-nothing: a short write
    /// surfaces as an IO error, never as a truncated frame.
    pub async fn send(&mut self, message: &Message) -> ConnectionResult<()> {
        self.write_buf.clear();
        message.encode(&mut self.write_buf)?;

        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;

        self.stats.messages_sent += 1;
        self.stats.bytes_sent += self.write_buf.len() as u64;
        self.last_activity = Instant::now();

        Ok(())
    }

    /// Receive the next complete message.
    ///
    /// Returns `Ok(None)` on a clean remote close. A close mid-frame is
    /// an error: the remote went away with a partial message buffered.
    pub async fn recv(&mut self) -> ConnectionResult<Option<Message>> {
        loop {
            if let Some(message) = self.decoder.decode(&mut self.read_buf)? {
                self.stats.messages_received += 1;
                self.last_activity = Instant::now();
                return Ok(Some(message));
            }

            let mut buf = [0u8; 4096];
            let n = self.stream.read(&mut buf).await?;

            if n == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None);
                } else {
                    return Err(ConnectionError::Closed);
                }
            }

            self.read_buf.extend_from_slice(&buf[..n]);
            self.stats.bytes_received += n as u64;
        }
    }

    /// Receive with a timeout
    pub async fn recv_timeout(&mut self, timeout: Duration) -> ConnectionResult<Option<Message>> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Timeout),
        }
    }

    /// Close the connection, sending a best-effort disconnect notice first
    pub async fn close(&mut self, local_id: u32, reason: &str) -> ConnectionResult<()> {
        let _ = self.send(&Message::disconnect(local_id, reason)).await;
        self.stream.shutdown().await?;
        Ok(())
    }
}

/// A cloneable handle for queueing messages to a connection's writer task.
///
/// Each socket has exactly one writer task draining the queue, so writes
/// to one peer are serialized by construction.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    sender: mpsc::Sender<Message>,
    connected: Arc<AtomicBool>,
    rtt_ms: Arc<AtomicU64>,
}

impl ConnectionHandle {
    pub fn new(sender: mpsc::Sender<Message>) -> Self {
        Self {
            sender,
            connected: Arc::new(AtomicBool::new(true)),
            rtt_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Queue a message for sending
    pub async fn send(&self, message: Message) -> ConnectionResult<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ConnectionError::Closed);
        }

        self.sender
            .send(message)
            .await
            .map_err(|_| ConnectionError::ChannelClosed)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Last measured round-trip time in milliseconds
    pub fn rtt_ms(&self) -> u64 {
        self.rtt_ms.load(Ordering::SeqCst)
    }

    /// Mark the connection as gone; later sends fail with `Closed`
    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn update_rtt(&self, rtt_ms: u64) {
        self.rtt_ms.store(rtt_ms, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_send_recv_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, peer_addr) = listener.accept().await.unwrap();
            let mut conn = Connection::new(stream, peer_addr);
            conn.recv().await.unwrap().unwrap()
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut conn = Connection::new(stream, addr);
        let sent = Message::data(5, 1, Bytes::from_static(b"over the wire"));
        conn.send(&sent).await.unwrap();

        let received = server.await.unwrap();
        assert_eq!(received, sent);
        assert_eq!(conn.stats().messages_sent, 1);
    }

    #[tokio::test]
    async fn test_recv_none_on_clean_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, peer_addr) = listener.accept().await.unwrap();
            let mut conn = Connection::new(stream, peer_addr);
            conn.recv().await
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        drop(stream);

        assert!(matches!(server.await.unwrap(), Ok(None)));
    }

    #[tokio::test]
    async fn test_handle_send_after_mark_disconnected() {
        let (tx, _rx) = mpsc::channel(4);
        let handle = ConnectionHandle::new(tx);
        handle.mark_disconnected();

        let result = handle.send(Message::ping(1)).await;
        assert!(matches!(result, Err(ConnectionError::Closed)));
    }
}
