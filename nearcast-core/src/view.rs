//! Aggregated sharing state as exposed to consumers.

use std::collections::HashMap;

use crate::identity::PeerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    NotConnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ConnectionState::NotConnected => "Not Connected",
            ConnectionState::Connecting => "Connecting...",
            ConnectionState::Connected => "Connected",
        })
    }
}

/// Snapshot of everything the sharing layer knows. Cloned out to subscribers; never mutated by them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionView {
    /// Discovered peers in discovery order.
    pub discovered: Vec<PeerId>,
    /// Connection state per discovered peer.
    pub states: HashMap<PeerId, ConnectionState>,
    /// Peers with a live session, in connection order. Discovery does not touch this.
    pub connected: Vec<PeerId>,
    /// Display names of connected peers, in connection order, de-duplicated.
    pub nearby: Vec<String>,
    /// Last location text received per display name.
    pub received_locations: HashMap<String, String>,
    /// Last image received per display name.
    pub received_images: HashMap<String, Vec<u8>>,
}

impl SessionView {
    /// State of a peer; peers never discovered read as `NotConnected`.
    pub fn state_of(&self, peer: &PeerId) -> ConnectionState {
        self.states.get(peer).copied().unwrap_or_default()
    }

    /// Connected peers sorted by display name.
    pub fn connected_peers(&self) -> Vec<PeerId> {
        let mut peers = self.connected.clone();
        peers.sort_by(|a, b| a.display_name().cmp(b.display_name()));
        peers
    }

    pub fn has_connected_peers(&self) -> bool {
        !self.connected.is_empty()
    }
}
