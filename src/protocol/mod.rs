//! Protocol module - Defines the wire protocol for GameLink communication
//!
//! The protocol uses a fixed binary header for efficiency:
//! - 1 byte message type
//! - 1 byte flags (bit0 = reliable)
//! - 4 bytes sender id (big-endian)
//! - 4 bytes receiver id (big-endian, 0 = broadcast)
//! - 4 bytes sequence number (big-endian)
//! - 8 bytes timestamp, microseconds since epoch (big-endian)
//! - 4 bytes payload length (big-endian)
//! - Variable length payload

mod message;
mod codec;

pub use message::*;
pub use codec::*;

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u32 = 1;

/// Default port for GameLink communication
pub const DEFAULT_PORT: u16 = 7667;

/// Receiver id that addresses every connected peer
pub const BROADCAST_ID: u32 = 0;
