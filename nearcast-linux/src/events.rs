//! The single ordered event stream that discovery and the session feed into.

use nearcast_core::{ConnectionState, PeerId};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Browser: a peer with our service tag appeared.
    PeerFound(PeerId),
    /// Browser: the peer said goodbye or went quiet.
    PeerLost(PeerId),
    /// Session: connection state of a peer moved.
    PeerStateChanged(PeerId, ConnectionState),
    /// Session: one decrypted frame from a connected peer.
    DataReceived(PeerId, Vec<u8>),
}

/// Sender half of the event stream. Each holder can attach cancellation
/// tokens; once any of them fires, nothing more is delivered through it.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<Event>,
    gates: Vec<CancellationToken>,
}

impl EventSender {
    pub fn new(tx: mpsc::UnboundedSender<Event>, gate: CancellationToken) -> Self {
        Self {
            tx,
            gates: vec![gate],
        }
    }

    /// Same stream, additionally silenced when `token` is cancelled.
    pub fn gated(&self, token: CancellationToken) -> Self {
        let mut gates = self.gates.clone();
        gates.push(token);
        Self {
            tx: self.tx.clone(),
            gates,
        }
    }

    pub fn is_open(&self) -> bool {
        !self.gates.iter().any(|g| g.is_cancelled())
    }

    pub fn emit(&self, event: Event) {
        if self.is_open() {
            let _ = self.tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nearcast_core::Keypair;

    #[test]
    fn gated_sender_goes_quiet_after_cancel() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let root = CancellationToken::new();
        let events = EventSender::new(tx, root.clone());
        let browse = CancellationToken::new();
        let browser_events = events.gated(browse.clone());
        let peer = Keypair::generate().peer_id("Morty-iPhone");

        browser_events.emit(Event::PeerFound(peer.clone()));
        browse.cancel();
        browser_events.emit(Event::PeerLost(peer.clone()));
        events.emit(Event::PeerStateChanged(peer.clone(), ConnectionState::Connecting));
        root.cancel();
        events.emit(Event::PeerStateChanged(peer.clone(), ConnectionState::Connected));

        assert_eq!(rx.try_recv().unwrap(), Event::PeerFound(peer.clone()));
        assert_eq!(
            rx.try_recv().unwrap(),
            Event::PeerStateChanged(peer, ConnectionState::Connecting)
        );
        assert!(rx.try_recv().is_err());
    }
}
