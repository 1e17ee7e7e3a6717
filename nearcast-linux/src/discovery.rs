//! LAN discovery over UDP multicast: the advertiser beacons our presence,
//! the browser tracks who else is announcing the same service.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nearcast_core::wire::{decode_frame, encode_frame};
use nearcast_core::{ControlMessage, DeviceId, Keypair, PeerId, Presence, PROTOCOL_VERSION};
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{Event, EventSender};

/// Multicast group (link-local scope, TTL 1).
pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 61, 61);

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("failed to start advertising: {0}")]
    AdvertiseFailure(#[source] std::io::Error),
    #[error("failed to start browsing: {0}")]
    BrowseFailure(#[source] std::io::Error),
}

/// Broadcasts our presence every `interval` until stopped.
pub struct Advertiser {
    keypair: Arc<Keypair>,
    listen_port: u16,
    discovery_port: u16,
    interval: Duration,
    running: Mutex<Option<CancellationToken>>,
}

impl Advertiser {
    pub fn new(keypair: Arc<Keypair>, listen_port: u16, discovery_port: u16, interval: Duration) -> Self {
        Self {
            keypair,
            listen_port,
            discovery_port,
            interval,
            running: Mutex::new(None),
        }
    }

    /// Start beaconing as `peer` under `service_tag`. No-op if already advertising.
    pub fn start_advertising(&self, peer: &PeerId, service_tag: &str) -> Result<(), DiscoveryError> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Ok(());
        }
        let socket = make_send_socket().map_err(DiscoveryError::AdvertiseFailure)?;
        let presence = Presence {
            protocol_version: PROTOCOL_VERSION,
            service_tag: service_tag.to_string(),
            device_id: self.keypair.device_id(),
            public_key: self.keypair.public_key().clone(),
            display_name: peer.display_name().to_string(),
            listen_port: self.listen_port,
        };
        let announce = encode_frame(&ControlMessage::Announce(presence))
            .map_err(|e| DiscoveryError::AdvertiseFailure(invalid_data(e)))?;
        let goodbye = encode_frame(&ControlMessage::Goodbye {
            protocol_version: PROTOCOL_VERSION,
            service_tag: service_tag.to_string(),
            device_id: self.keypair.device_id(),
        })
        .map_err(|e| DiscoveryError::AdvertiseFailure(invalid_data(e)))?;

        let token = CancellationToken::new();
        let dest = SocketAddr::from((MULTICAST_GROUP, self.discovery_port));
        tokio::spawn(beacon_loop(socket, dest, announce, goodbye, self.interval, token.clone()));
        *running = Some(token);
        info!(service_tag, port = self.listen_port, "advertising");
        Ok(())
    }

    /// Stop beaconing and announce our departure. No-op if not advertising.
    pub fn stop_advertising(&self) {
        if let Some(token) = self.running.lock().take() {
            token.cancel();
            info!("stopped advertising");
        }
    }
}

async fn beacon_loop(
    socket: UdpSocket,
    dest: SocketAddr,
    announce: Vec<u8>,
    goodbye: Vec<u8>,
    interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        if let Err(e) = socket.send_to(&announce, dest).await {
            warn!(error = %e, "announce failed");
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    let _ = socket.send_to(&goodbye, dest).await;
}

struct Known {
    peer: PeerId,
    addr: SocketAddr,
    last_seen: Instant,
}

/// Peers heard from, keyed by device. Pure bookkeeping; the browser feeds it datagrams.
struct PeerTable {
    self_id: DeviceId,
    service_tag: String,
    known: HashMap<DeviceId, Known>,
}

impl PeerTable {
    fn new(self_id: DeviceId) -> Self {
        Self {
            self_id,
            service_tag: String::new(),
            known: HashMap::new(),
        }
    }

    /// Apply one control message received from `from`. Returns the event to report, if any.
    fn observe(&mut self, msg: ControlMessage, from: SocketAddr, now: Instant) -> Option<Event> {
        match msg {
            ControlMessage::Announce(p) => {
                if !p.is_compatible(&self.service_tag) || p.device_id == self.self_id {
                    return None;
                }
                let addr = SocketAddr::new(from.ip(), p.listen_port);
                match self.known.get_mut(&p.device_id) {
                    Some(k) => {
                        k.last_seen = now;
                        k.addr = addr;
                        None
                    }
                    None => {
                        let peer = p.peer_id();
                        self.known.insert(
                            p.device_id,
                            Known {
                                peer: peer.clone(),
                                addr,
                                last_seen: now,
                            },
                        );
                        Some(Event::PeerFound(peer))
                    }
                }
            }
            ControlMessage::Goodbye {
                protocol_version,
                service_tag,
                device_id,
            } => {
                if protocol_version != PROTOCOL_VERSION || service_tag != self.service_tag {
                    return None;
                }
                self.known.remove(&device_id).map(|k| Event::PeerLost(k.peer))
            }
            ControlMessage::Hello(_) => None,
        }
    }

    /// Drop peers silent for longer than `timeout`.
    fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<PeerId> {
        let stale: Vec<DeviceId> = self
            .known
            .iter()
            .filter(|(_, k)| now.duration_since(k.last_seen) >= timeout)
            .map(|(id, _)| *id)
            .collect();
        stale
            .into_iter()
            .filter_map(|id| self.known.remove(&id))
            .map(|k| k.peer)
            .collect()
    }
}

/// Listens for announcements and reports peers found and lost.
pub struct Browser {
    discovery_port: u16,
    peer_timeout: Duration,
    events: EventSender,
    table: Arc<Mutex<PeerTable>>,
    running: Mutex<Option<CancellationToken>>,
}

impl Browser {
    pub fn new(self_id: DeviceId, discovery_port: u16, peer_timeout: Duration, events: &EventSender) -> Self {
        Self {
            discovery_port,
            peer_timeout,
            events: events.clone(),
            table: Arc::new(Mutex::new(PeerTable::new(self_id))),
            running: Mutex::new(None),
        }
    }

    /// True while the receive loop is alive.
    pub fn is_browsing(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|t| !t.is_cancelled())
    }

    /// Start listening for `service_tag`. No-op if already browsing; restarts a
    /// browser whose socket failed.
    pub fn start_browsing(&self, service_tag: &str) -> Result<(), DiscoveryError> {
        let mut running = self.running.lock();
        if running.as_ref().is_some_and(|t| !t.is_cancelled()) {
            return Ok(());
        }
        let socket = make_recv_socket(self.discovery_port).map_err(DiscoveryError::BrowseFailure)?;
        {
            let mut table = self.table.lock();
            table.service_tag = service_tag.to_string();
            table.known.clear();
        }
        let token = CancellationToken::new();
        let events = self.events.gated(token.clone());
        tokio::spawn(recv_loop(socket, self.table.clone(), events.clone(), token.clone()));
        tokio::spawn(expiry_loop(self.table.clone(), self.peer_timeout, events, token.clone()));
        *running = Some(token);
        info!(service_tag, port = self.discovery_port, "browsing");
        Ok(())
    }

    /// Stop listening. No further found/lost events are reported. No-op if not browsing.
    pub fn stop_browsing(&self) {
        if let Some(token) = self.running.lock().take() {
            token.cancel();
            self.table.lock().known.clear();
            info!("stopped browsing");
        }
    }

    /// Where a discovered peer's session listener lives.
    pub fn address_of(&self, device_id: DeviceId) -> Option<SocketAddr> {
        self.table.lock().known.get(&device_id).map(|k| k.addr)
    }

    /// Forget everyone so the next announcements are reported as new.
    pub fn forget_all(&self) {
        self.table.lock().known.clear();
    }

    /// Feed a control message as if it had arrived from `from`.
    #[cfg(test)]
    pub(crate) fn inject(&self, msg: ControlMessage, from: SocketAddr) {
        let event = self.table.lock().observe(msg, from, Instant::now());
        if let Some(event) = event {
            self.events.emit(event);
        }
    }
}

async fn recv_loop(
    socket: UdpSocket,
    table: Arc<Mutex<PeerTable>>,
    events: EventSender,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; 65536];
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            r = socket.recv_from(&mut buf) => r,
        };
        let (n, from) = match received {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "discovery receive failed, browsing stopped");
                cancel.cancel();
                break;
            }
        };
        let msg = match decode_frame(&buf[..n]) {
            Ok((msg, _)) => msg,
            Err(e) => {
                debug!(%from, error = %e, "ignoring datagram");
                continue;
            }
        };
        let event = table.lock().observe(msg, from, Instant::now());
        if let Some(event) = event {
            debug!(?event, "discovery");
            events.emit(event);
        }
    }
}

async fn expiry_loop(
    table: Arc<Mutex<PeerTable>>,
    timeout: Duration,
    events: EventSender,
    cancel: CancellationToken,
) {
    let period = (timeout / 2).max(Duration::from_millis(250));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(period) => {}
        }
        let lost = table.lock().expire(Instant::now(), timeout);
        for peer in lost {
            debug!(peer = %peer, "peer timed out");
            events.emit(Event::PeerLost(peer));
        }
    }
}

fn make_send_socket() -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_multicast_loop_v4(true)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

fn make_recv_socket(discovery_port: u16) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, discovery_port))?;
    std_sock.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

fn invalid_data<E: Into<Box<dyn std::error::Error + Send + Sync>>>(e: E) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, e)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TAG: &str = "rm-locations";

    fn announce(kp: &Keypair, name: &str, tag: &str) -> ControlMessage {
        ControlMessage::Announce(Presence {
            protocol_version: PROTOCOL_VERSION,
            service_tag: tag.to_string(),
            device_id: kp.device_id(),
            public_key: kp.public_key().clone(),
            display_name: name.to_string(),
            listen_port: 45681,
        })
    }

    fn table() -> (PeerTable, Keypair) {
        let me = Keypair::generate();
        let mut t = PeerTable::new(me.device_id());
        t.service_tag = TAG.to_string();
        (t, me)
    }

    fn from() -> SocketAddr {
        "192.168.1.20:45680".parse().unwrap()
    }

    #[test]
    fn first_announce_reports_peer_once() {
        let (mut t, _) = table();
        let morty = Keypair::generate();
        let now = Instant::now();

        let first = t.observe(announce(&morty, "Morty-iPhone", TAG), from(), now);
        assert_eq!(first, Some(Event::PeerFound(morty.peer_id("Morty-iPhone"))));
        assert_eq!(t.observe(announce(&morty, "Morty-iPhone", TAG), from(), now), None);
        assert_eq!(t.known.len(), 1);
        assert_eq!(
            t.known[&morty.device_id()].addr,
            "192.168.1.20:45681".parse().unwrap()
        );
    }

    #[test]
    fn own_and_foreign_announcements_ignored() {
        let (mut t, me) = table();
        let now = Instant::now();
        assert_eq!(t.observe(announce(&me, "me", TAG), from(), now), None);
        let other = Keypair::generate();
        assert_eq!(t.observe(announce(&other, "x", "another-app"), from(), now), None);
        assert!(t.known.is_empty());
    }

    #[test]
    fn goodbye_reports_loss() {
        let (mut t, _) = table();
        let summer = Keypair::generate();
        let now = Instant::now();
        t.observe(announce(&summer, "Summer-iPad", TAG), from(), now);
        let bye = ControlMessage::Goodbye {
            protocol_version: PROTOCOL_VERSION,
            service_tag: TAG.to_string(),
            device_id: summer.device_id(),
        };
        assert_eq!(
            t.observe(bye.clone(), from(), now),
            Some(Event::PeerLost(summer.peer_id("Summer-iPad")))
        );
        assert_eq!(t.observe(bye, from(), now), None);
    }

    #[tokio::test]
    async fn failed_browser_reports_stopped_and_restarts() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let events = EventSender::new(tx, CancellationToken::new());
        let browser = Browser::new(Keypair::generate().device_id(), 0, Duration::from_secs(8), &events);
        assert!(!browser.is_browsing());
        browser.start_browsing(TAG).unwrap();
        assert!(browser.is_browsing());

        // What the receive loop does when its socket errors.
        if let Some(token) = browser.running.lock().as_ref() {
            token.cancel();
        }
        assert!(!browser.is_browsing());

        browser.start_browsing(TAG).unwrap();
        assert!(browser.is_browsing());
        browser.stop_browsing();
        assert!(!browser.is_browsing());
    }

    #[test]
    fn silent_peers_expire() {
        let (mut t, _) = table();
        let quiet = Keypair::generate();
        let chatty = Keypair::generate();
        let start = Instant::now();
        t.observe(announce(&quiet, "Quiet", TAG), from(), start);
        t.observe(announce(&chatty, "Chatty", TAG), from(), start);
        t.observe(
            announce(&chatty, "Chatty", TAG),
            from(),
            start + Duration::from_secs(6),
        );

        let lost = t.expire(start + Duration::from_secs(8), Duration::from_secs(8));
        assert_eq!(lost, vec![quiet.peer_id("Quiet")]);
        assert!(t.known.contains_key(&chatty.device_id()));
    }
}
