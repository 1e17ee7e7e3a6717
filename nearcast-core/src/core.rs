//! Host-driven sharing state: the host feeds discovery and session events in,
//! and asks for broadcasts to send. No I/O happens here.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::codec::{self, DecodeError, Message};
use crate::identity::{DeviceId, PeerId};
use crate::view::{ConnectionState, SessionView};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("no connected peers")]
    NoConnectedPeers,
    #[error("transport error: {0}")]
    TransportError(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    #[error("peer {0} has not been discovered")]
    UnknownPeer(DeviceId),
    #[error("already connected to {0}")]
    AlreadyConnected(PeerId),
}

/// Anything that can push one encoded frame to a set of peers.
pub trait Outbox {
    fn send(&self, frame: &[u8], to: &[PeerId]) -> Result<(), SendError>;
}

/// An encoded frame and the peers it should reach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Broadcast {
    pub frame: Vec<u8>,
    pub targets: Vec<PeerId>,
}

/// Per-peer outcome of a fan-out.
#[derive(Debug, Default)]
pub struct FanOutReport {
    pub delivered: Vec<PeerId>,
    pub failed: Vec<(PeerId, SendError)>,
}

impl FanOutReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Send `broadcast` to each target on its own, so one failing peer never blocks the others.
pub fn fan_out<O: Outbox + ?Sized>(outbox: &O, broadcast: &Broadcast) -> FanOutReport {
    let mut report = FanOutReport::default();
    for peer in &broadcast.targets {
        match outbox.send(&broadcast.frame, std::slice::from_ref(peer)) {
            Ok(()) => report.delivered.push(peer.clone()),
            Err(e) => {
                warn!(peer = %peer, error = %e, "send failed");
                report.failed.push((peer.clone(), e));
            }
        }
    }
    report
}

/// Owns the [`SessionView`] and applies events to it.
///
/// Discovery and session state are tracked apart: a peer can drop out of
/// discovery while its session stays up, and it keeps receiving shares.
#[derive(Debug, Default)]
pub struct SharingCore {
    view: SessionView,
    /// Session-reported state for peers that are Connecting or Connected.
    sessions: HashMap<PeerId, ConnectionState>,
}

impl SharingCore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn view(&self) -> &SessionView {
        &self.view
    }

    pub fn snapshot(&self) -> SessionView {
        self.view.clone()
    }

    fn session_state(&self, peer: &PeerId) -> ConnectionState {
        self.sessions.get(peer).copied().unwrap_or_default()
    }

    /// Browser found a peer. Known peers are left alone; a peer with a live
    /// session shows its session state.
    pub fn on_peer_found(&mut self, peer: PeerId) {
        if self.view.discovered.contains(&peer) {
            return;
        }
        debug!(peer = %peer, "peer found");
        let state = self.session_state(&peer);
        self.view.states.insert(peer.clone(), state);
        self.view.discovered.push(peer);
    }

    /// Browser lost sight of a peer. Its discovery entry goes whatever the state;
    /// a live session stays connected and reports its own loss separately.
    pub fn on_peer_lost(&mut self, peer: &PeerId) {
        debug!(peer = %peer, "peer lost");
        self.view.discovered.retain(|p| p != peer);
        self.view.states.remove(peer);
    }

    pub fn on_peer_state_changed(&mut self, peer: PeerId, state: ConnectionState) {
        let previous = match state {
            ConnectionState::NotConnected => self.sessions.remove(&peer),
            live => self.sessions.insert(peer.clone(), live),
        };
        // Re-insert so stored keys carry the peer's current display name.
        if let Some(slot) = self.view.discovered.iter_mut().find(|p| **p == peer) {
            *slot = peer.clone();
            self.view.states.remove(&peer);
            self.view.states.insert(peer.clone(), state);
        }
        debug!(peer = %peer, ?previous, %state, "peer state changed");

        let name = peer.display_name();
        if state == ConnectionState::Connected {
            match self.view.connected.iter_mut().find(|p| **p == peer) {
                Some(slot) => *slot = peer.clone(),
                None => self.view.connected.push(peer.clone()),
            }
            if !self.view.nearby.iter().any(|n| n == name) {
                self.view.nearby.push(name.to_string());
            }
            return;
        }

        let Some(pos) = self.view.connected.iter().position(|p| *p == peer) else {
            return;
        };
        let gone = self.view.connected.remove(pos);
        let name = gone.display_name();
        if self.name_still_connected(name) {
            return;
        }
        self.view.nearby.retain(|n| n != name);
        self.view.received_locations.remove(name);
        self.view.received_images.remove(name);
    }

    fn name_still_connected(&self, name: &str) -> bool {
        self.view.connected.iter().any(|p| p.display_name() == name)
    }

    /// Decode a frame from `from` and record it under the sender's display name.
    /// A decode failure leaves the view untouched.
    pub fn on_data_received(&mut self, from: &PeerId, bytes: &[u8]) -> Result<Message, DecodeError> {
        let msg = codec::decode(bytes).inspect_err(|e| {
            warn!(peer = %from, len = bytes.len(), error = %e, "dropping undecodable frame");
        })?;
        let name = from.display_name().to_string();
        match &msg {
            Message::Location(text) | Message::LegacyText(text) => {
                debug!(peer = %from, "received location");
                self.view.received_locations.insert(name, text.clone());
            }
            Message::Image(bytes) => {
                debug!(peer = %from, len = bytes.len(), "received image");
                self.view.received_images.insert(name, bytes.clone());
            }
        }
        Ok(msg)
    }

    /// Resolve a connect request against the discovered set.
    pub fn connect(&self, device_id: DeviceId) -> Result<PeerId, ConnectError> {
        let peer = self
            .view
            .discovered
            .iter()
            .find(|p| p.device_id() == device_id)
            .cloned()
            .ok_or(ConnectError::UnknownPeer(device_id))?;
        if self.session_state(&peer) == ConnectionState::Connected {
            return Err(ConnectError::AlreadyConnected(peer));
        }
        Ok(peer)
    }

    /// Frame a location for every connected peer. Empty text is a no-op (`Ok(None)`).
    pub fn share_location(&self, text: &str) -> Result<Option<Broadcast>, SendError> {
        if text.is_empty() {
            return Ok(None);
        }
        let targets = self.connected_targets()?;
        Ok(Some(Broadcast {
            frame: codec::encode(&Message::Location(text.to_string())),
            targets,
        }))
    }

    /// Frame an already-encoded image for every connected peer.
    pub fn share_image(&self, image: &[u8]) -> Result<Broadcast, SendError> {
        let targets = self.connected_targets()?;
        Ok(Broadcast {
            frame: codec::encode(&Message::Image(image.to_vec())),
            targets,
        })
    }

    fn connected_targets(&self) -> Result<Vec<PeerId>, SendError> {
        let targets = self.view.connected_peers();
        if targets.is_empty() {
            return Err(SendError::NoConnectedPeers);
        }
        Ok(targets)
    }

    /// Forget discovered peers with no live or pending session so they can be rediscovered.
    pub fn forget_discovered(&mut self) {
        let sessions = &self.sessions;
        let states = &mut self.view.states;
        self.view.discovered.retain(|p| {
            let keep = sessions.contains_key(p);
            if !keep {
                states.remove(p);
            }
            keep
        });
    }
}
