//! Protocol message definitions
//!
//! Defines the message value type exchanged between GameLink endpoints.
//! A message is immutable once constructed; routing metadata travels in the
//! fixed header and the payload is opaque to this layer.

use bytes::Bytes;

use super::BROADCAST_ID;

/// All message types carried on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Connection establishment; the server's handshake carries the
    /// assigned peer id in `receiver_id`
    Handshake = 0,
    /// Application data, payload defined by the embedding game
    Data = 1,
    /// Latency probe, timestamp echoed back by the remote side
    Ping = 2,
    /// Response to a ping
    Pong = 3,
    /// Graceful disconnect, payload is an optional UTF-8 reason
    Disconnect = 4,
}

impl MessageType {
    /// Parse a wire ordinal, returning `None` for unknown values
    pub fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(MessageType::Handshake),
            1 => Some(MessageType::Data),
            2 => Some(MessageType::Ping),
            3 => Some(MessageType::Pong),
            4 => Some(MessageType::Disconnect),
            _ => None,
        }
    }
}

/// One unit of communication: routing metadata plus an opaque payload
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Message type
    pub kind: MessageType,
    /// Id of the sending endpoint (0 for the server or an unassigned client)
    pub sender_id: u32,
    /// Id of the receiving endpoint, 0 = broadcast
    pub receiver_id: u32,
    /// Caller-assigned ordering hint, defaults to 0
    pub sequence: u32,
    /// Microseconds since the Unix epoch, captured at construction
    pub timestamp: i64,
    /// Hint to the transport layer; delivery is not enforced by this core
    pub reliable: bool,
    /// Opaque application bytes, possibly empty
    pub payload: Bytes,
}

impl Message {
    /// Create a message with the timestamp captured now
    pub fn new(
        kind: MessageType,
        sender_id: u32,
        receiver_id: u32,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            kind,
            sender_id,
            receiver_id,
            sequence: 0,
            timestamp: now_micros(),
            reliable: false,
            payload: payload.into(),
        }
    }

    /// Application data addressed to one peer (or all, with receiver 0)
    pub fn data(sender_id: u32, receiver_id: u32, payload: impl Into<Bytes>) -> Self {
        Self::new(MessageType::Data, sender_id, receiver_id, payload)
    }

    /// Latency check; the timestamp doubles as the correlation token
    pub fn ping(sender_id: u32) -> Self {
        Self::new(MessageType::Ping, sender_id, 0, Bytes::new())
    }

    /// Response to a ping, echoing its timestamp so the sender can
    /// compute the round trip
    pub fn pong_for(ping: &Message, sender_id: u32) -> Self {
        let mut msg = Self::new(MessageType::Pong, sender_id, ping.sender_id, Bytes::new());
        msg.timestamp = ping.timestamp;
        msg
    }

    /// Server-side handshake announcing the assigned peer id
    pub fn handshake(assigned_id: u32) -> Self {
        Self::new(MessageType::Handshake, 0, assigned_id, Bytes::new())
    }

    /// Graceful disconnect with a human-readable reason
    pub fn disconnect(sender_id: u32, reason: &str) -> Self {
        Self::new(
            MessageType::Disconnect,
            sender_id,
            0,
            Bytes::copy_from_slice(reason.as_bytes()),
        )
    }

    /// Set the sequence number (builder style)
    pub fn with_sequence(mut self, sequence: u32) -> Self {
        self.sequence = sequence;
        self
    }

    /// Mark the message as reliable (a hint; see module docs)
    pub fn with_reliable(mut self, reliable: bool) -> Self {
        self.reliable = reliable;
        self
    }

    /// Whether this message is addressed to every connected peer
    pub fn is_broadcast(&self) -> bool {
        self.receiver_id == BROADCAST_ID
    }

    /// Payload interpreted as UTF-8, for reason strings and debugging
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// Current wall-clock time in microseconds since the Unix epoch
pub fn now_micros() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_flag() {
        let msg = Message::data(1, 0, Bytes::from_static(b"all"));
        assert!(msg.is_broadcast());

        let msg = Message::data(1, 7, Bytes::from_static(b"one"));
        assert!(!msg.is_broadcast());
    }

    #[test]
    fn test_message_type_wire_ordinals() {
        assert_eq!(MessageType::from_wire(0), Some(MessageType::Handshake));
        assert_eq!(MessageType::from_wire(4), Some(MessageType::Disconnect));
        assert_eq!(MessageType::from_wire(5), None);
        assert_eq!(MessageType::from_wire(0xFF), None);
    }

    #[test]
    fn test_pong_echoes_ping_timestamp() {
        let ping = Message::ping(3);
        let pong = Message::pong_for(&ping, 0);
        assert_eq!(pong.kind, MessageType::Pong);
        assert_eq!(pong.timestamp, ping.timestamp);
        assert_eq!(pong.receiver_id, 3);
    }

    #[test]
    fn test_disconnect_reason_roundtrip() {
        let msg = Message::disconnect(2, "server shutting down");
        assert_eq!(msg.payload_str(), Some("server shutting down"));
    }

    #[test]
    fn test_timestamp_captured_at_construction() {
        let before = now_micros();
        let msg = Message::data(1, 2, Bytes::new());
        let after = now_micros();
        assert!(msg.timestamp >= before && msg.timestamp <= after);
    }
}
