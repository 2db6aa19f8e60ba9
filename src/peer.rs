//! Peer representation and connection state machine
//!
//! A `Peer` describes one remote endpoint: its assigned id, address, and
//! where it sits in the connection lifecycle. Peers are exclusively owned
//! by the `Client` or `Server` that created them and are never shared.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Connection lifecycle states.
///
/// `Connecting` only appears on the client-originated path; the server
/// marks an accepted connection `Connected` immediately, since the accept
/// already implies a completed transport-level handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// A remote endpoint and its connection state
#[derive(Debug, Clone)]
pub struct Peer {
    id: u32,
    addr: SocketAddr,
    state: PeerState,
    rtt_ms: u32,
    last_activity: Instant,
}

impl Peer {
    /// Create a peer in the given initial state
    pub fn new(id: u32, addr: SocketAddr, state: PeerState) -> Self {
        Self {
            id,
            addr,
            state,
            rtt_ms: 0,
            last_activity: Instant::now(),
        }
    }

    /// Unique id within the owning server's registry (meaningless locally
    /// for a client-side peer until the handshake assigns one)
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    /// Last measured round-trip time in milliseconds, 0 = not yet measured
    pub fn rtt_ms(&self) -> u32 {
        self.rtt_ms
    }

    /// Time since the last send or receive on this peer's connection
    pub fn idle_time(&self) -> Duration {
        self.last_activity.elapsed()
    }

    pub fn is_connected(&self) -> bool {
        self.state == PeerState::Connected
    }

    /// Transition to a new state.
    ///
    /// Returns `Some((old, new))` for an actual transition, which the
    /// owning client or server forwards as a state-changed event. Setting
    /// the current state again is idempotent and returns `None`.
    pub fn set_state(&mut self, new: PeerState) -> Option<(PeerState, PeerState)> {
        if self.state == new {
            return None;
        }
        let old = self.state;
        self.state = new;
        Some((old, new))
    }

    /// Record activity on this peer's connection. Independent of the
    /// state machine; valid in any state.
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Record a round-trip time measurement. Independent of the state
    /// machine; valid in any state.
    pub fn update_rtt(&mut self, rtt_ms: u32) {
        self.rtt_ms = rtt_ms;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_peer(state: PeerState) -> Peer {
        Peer::new(1, "127.0.0.1:7667".parse().unwrap(), state)
    }

    #[test]
    fn test_transition_reports_old_and_new() {
        let mut peer = test_peer(PeerState::Disconnected);
        assert_eq!(
            peer.set_state(PeerState::Connecting),
            Some((PeerState::Disconnected, PeerState::Connecting))
        );
        assert_eq!(
            peer.set_state(PeerState::Connected),
            Some((PeerState::Connecting, PeerState::Connected))
        );
        assert_eq!(peer.state(), PeerState::Connected);
    }

    #[test]
    fn test_idempotent_transition_is_silent() {
        let mut peer = test_peer(PeerState::Connected);
        assert_eq!(peer.set_state(PeerState::Connected), None);
        assert_eq!(peer.state(), PeerState::Connected);
    }

    #[test]
    fn test_full_lifecycle() {
        let mut peer = test_peer(PeerState::Disconnected);
        let mut transitions = 0;
        for state in [
            PeerState::Connecting,
            PeerState::Connected,
            PeerState::Disconnecting,
            PeerState::Disconnected,
        ] {
            if peer.set_state(state).is_some() {
                transitions += 1;
            }
        }
        assert_eq!(transitions, 4);
        assert_eq!(peer.state(), PeerState::Disconnected);
    }

    #[test]
    fn test_rtt_and_touch_do_not_affect_state() {
        let mut peer = test_peer(PeerState::Connecting);
        peer.update_rtt(42);
        peer.touch();
        assert_eq!(peer.rtt_ms(), 42);
        assert_eq!(peer.state(), PeerState::Connecting);
    }

    #[test]
    fn test_rtt_starts_unknown() {
        let peer = test_peer(PeerState::Connected);
        assert_eq!(peer.rtt_ms(), 0);
    }
}
