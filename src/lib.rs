//! GameLink - Peer-to-peer networking layer for multiplayer games
//!
//! A client connects to exactly one server; the server accepts many
//! clients, assigns each a peer id, and tracks them in a registry. Both
//! sides exchange typed [`Message`](protocol::Message)s over a fixed
//! binary wire format (26-byte header plus an opaque payload).
//!
//! The crate supports two execution styles with the same API surface:
//! call `poll()` once per game-loop tick to drain events through
//! registered callbacks, or take the event receiver and consume events
//! on an async task. Message arrival is always event-delivered; there is
//! no blocking receive call.

pub mod config;
pub mod net;
pub mod peer;
pub mod protocol;

pub use net::{Client, ClientError, ClientEvent, NetConfig, Server, ServerError, ServerEvent};
pub use peer::{Peer, PeerState};
pub use protocol::{Message, MessageType};
