//! Transport session: TCP listener (inbound invitations), outbound invites to discovered
//! peers, hello handshake, then encrypted length-prefixed frames.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nearcast_core::identity::{session_ciphers, Opener, Role, Sealer, WireCryptoError};
use nearcast_core::wire::{self, FrameDecodeError, FrameEncodeError, LEN_SIZE, MAX_FRAME_LEN};
use nearcast_core::{
    ConnectionState, ControlMessage, DeviceId, Keypair, Outbox, PeerId, Presence, SendError,
    PROTOCOL_VERSION,
};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{Event, EventSender};

/// Poly1305 tag appended to every sealed frame.
const SEAL_OVERHEAD: usize = 16;

/// Largest hello accepted before the peer is known. A presence is a few hundred bytes.
const MAX_HELLO_LEN: usize = 4096;

/// Decides whether an inbound invitation is accepted.
pub trait InvitationPolicy: Send + Sync + 'static {
    fn accept(&self, from: &PeerId) -> bool;
}

/// Accept every invitation. Only suitable on a trusted LAN.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoAccept;

impl InvitationPolicy for AutoAccept {
    fn accept(&self, _from: &PeerId) -> bool {
        true
    }
}

/// Accept invitations only from the listed display names.
#[derive(Debug, Default, Clone)]
pub struct AllowList(HashSet<String>);

impl AllowList {
    pub fn new<I: IntoIterator<Item = S>, S: Into<String>>(names: I) -> Self {
        Self(names.into_iter().map(Into::into).collect())
    }
}

impl InvitationPolicy for AllowList {
    fn accept(&self, from: &PeerId) -> bool {
        self.0.contains(from.display_name())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad frame: {0}")]
    Frame(#[from] FrameDecodeError),
    #[error("encode: {0}")]
    Encode(#[from] FrameEncodeError),
    #[error("crypto: {0}")]
    Crypto(#[from] WireCryptoError),
    #[error("expected hello")]
    UnexpectedMessage,
    #[error("hello of {0} bytes exceeds limit")]
    HelloTooLarge(usize),
    #[error("peer did not finish the handshake in time")]
    TimedOut,
    #[error("incompatible peer (version, service tag or identity mismatch)")]
    Incompatible,
    #[error("peer is ourselves")]
    SelfConnection,
    #[error("reached {actual} instead of invited {expected}")]
    WrongPeer { expected: DeviceId, actual: DeviceId },
    #[error("invitation from {0} declined")]
    Declined(PeerId),
}

struct Conn {
    id: u64,
    initiator: DeviceId,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

struct Link {
    state: ConnectionState,
    conn: Option<Conn>,
}

struct Inner {
    keypair: Arc<Keypair>,
    display_name: String,
    service_tag: String,
    policy: Arc<dyn InvitationPolicy>,
    handshake_timeout: Duration,
    links: Mutex<HashMap<DeviceId, Link>>,
    listen_addr: Mutex<Option<SocketAddr>>,
    next_conn_id: AtomicU64,
    events: EventSender,
    cancel: CancellationToken,
}

/// One multi-peer session. Cheap to share behind an `Arc`; all methods take `&self`.
pub struct TransportSession {
    inner: Arc<Inner>,
}

impl TransportSession {
    /// `handshake_timeout` bounds how long an inbound connection may take to say hello.
    pub fn new(
        keypair: Arc<Keypair>,
        display_name: impl Into<String>,
        service_tag: impl Into<String>,
        policy: Arc<dyn InvitationPolicy>,
        handshake_timeout: Duration,
        events: &EventSender,
    ) -> Self {
        let cancel = CancellationToken::new();
        Self {
            inner: Arc::new(Inner {
                keypair,
                display_name: display_name.into(),
                service_tag: service_tag.into(),
                policy,
                handshake_timeout,
                links: Mutex::new(HashMap::new()),
                listen_addr: Mutex::new(None),
                next_conn_id: AtomicU64::new(1),
                events: events.gated(cancel.clone()),
                cancel,
            }),
        }
    }

    pub fn local_peer(&self) -> PeerId {
        self.inner.keypair.peer_id(self.inner.display_name.clone())
    }

    /// Bind the listener and start accepting invitations. A second call returns the bound address.
    pub async fn start(&self, port: u16) -> std::io::Result<SocketAddr> {
        let bound = *self.inner.listen_addr.lock();
        if let Some(addr) = bound {
            return Ok(addr);
        }
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let addr = listener.local_addr()?;
        {
            let mut slot = self.inner.listen_addr.lock();
            if let Some(existing) = *slot {
                return Ok(existing);
            }
            *slot = Some(addr);
        }
        info!(%addr, "session listening");
        tokio::spawn(accept_loop(self.inner.clone(), listener));
        Ok(addr)
    }

    pub fn listen_addr(&self) -> Option<SocketAddr> {
        *self.inner.listen_addr.lock()
    }

    /// Dial `peer` at `addr`. Outcome arrives as state events; gives up silently after `timeout`.
    /// A no-op while the peer is already connecting or connected.
    pub fn invite(&self, peer: PeerId, addr: SocketAddr, timeout: Duration) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        if !self.inner.begin_connecting(&peer) {
            debug!(peer = %peer, "invite ignored, session already pending or live");
            return;
        }
        info!(peer = %peer, %addr, "inviting");
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let attempt = tokio::time::timeout(timeout, dial(&inner, addr, peer.device_id()));
            let result = tokio::select! {
                _ = inner.cancel.cancelled() => return,
                r = attempt => r,
            };
            match result {
                Ok(Ok((stream, hello, sealer, opener))) => {
                    let initiator = inner.keypair.device_id();
                    run_connection(inner, stream, hello.peer_id(), initiator, sealer, opener).await;
                }
                Ok(Err(e)) => {
                    warn!(peer = %peer, error = %e, "invite failed");
                    inner.fail_pending(&peer);
                }
                Err(_) => {
                    warn!(peer = %peer, ?timeout, "invite timed out");
                    inner.fail_pending(&peer);
                }
            }
        });
    }

    /// Queue `frame` for every connected peer in `to`. Never blocks and never retries.
    pub fn send(&self, frame: &[u8], to: &[PeerId]) -> Result<(), SendError> {
        if frame.len() + SEAL_OVERHEAD > MAX_FRAME_LEN as usize {
            return Err(SendError::TransportError(format!(
                "frame of {} bytes exceeds limit",
                frame.len()
            )));
        }
        let links = self.inner.links.lock();
        let targets: Vec<(&PeerId, &Conn)> = to
            .iter()
            .filter_map(|p| {
                let link = links.get(&p.device_id())?;
                (link.state == ConnectionState::Connected)
                    .then_some(link.conn.as_ref())
                    .flatten()
                    .map(|c| (p, c))
            })
            .collect();
        if targets.is_empty() {
            return Err(SendError::NoConnectedPeers);
        }
        for (peer, conn) in targets {
            conn.tx
                .send(frame.to_vec())
                .map_err(|_| SendError::TransportError(format!("session with {peer} is closed")))?;
            debug!(peer = %peer, len = frame.len(), "frame queued");
        }
        Ok(())
    }

    pub fn state_of(&self, peer: &PeerId) -> ConnectionState {
        self.inner
            .links
            .lock()
            .get(&peer.device_id())
            .map(|l| l.state)
            .unwrap_or_default()
    }

    /// Tear everything down. No events are delivered once this starts. Idempotent.
    pub fn shutdown(&self) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        self.inner.cancel.cancel();
        self.inner.links.lock().clear();
        info!("session shut down");
    }
}

impl Outbox for TransportSession {
    fn send(&self, frame: &[u8], to: &[PeerId]) -> Result<(), SendError> {
        TransportSession::send(self, frame, to)
    }
}

impl Inner {
    fn local_presence(&self) -> Presence {
        Presence {
            protocol_version: PROTOCOL_VERSION,
            service_tag: self.service_tag.clone(),
            device_id: self.keypair.device_id(),
            public_key: self.keypair.public_key().clone(),
            display_name: self.display_name.clone(),
            listen_port: self.listen_addr.lock().map(|a| a.port()).unwrap_or(0),
        }
    }

    /// NotConnected -> Connecting. False if the peer is already connecting or connected.
    fn begin_connecting(&self, peer: &PeerId) -> bool {
        let mut links = self.links.lock();
        let link = links.entry(peer.device_id()).or_insert(Link {
            state: ConnectionState::NotConnected,
            conn: None,
        });
        if link.state != ConnectionState::NotConnected {
            return false;
        }
        link.state = ConnectionState::Connecting;
        self.events
            .emit(Event::PeerStateChanged(peer.clone(), ConnectionState::Connecting));
        true
    }

    /// Connecting -> NotConnected after a failed or timed-out attempt. Live sessions are untouched.
    fn fail_pending(&self, peer: &PeerId) {
        let mut links = self.links.lock();
        if let Some(link) = links.get_mut(&peer.device_id()) {
            if link.state == ConnectionState::Connecting {
                link.state = ConnectionState::NotConnected;
                self.events
                    .emit(Event::PeerStateChanged(peer.clone(), ConnectionState::NotConnected));
            }
        }
    }

    /// Install a finished connection. With two connections to the same peer, both sides
    /// keep the one dialed by the smaller device ID. Returns false if this one loses.
    fn install(&self, peer: &PeerId, conn: Conn) -> bool {
        let mut links = self.links.lock();
        if self.cancel.is_cancelled() {
            return false;
        }
        let link = links.entry(peer.device_id()).or_insert(Link {
            state: ConnectionState::NotConnected,
            conn: None,
        });
        if let Some(existing) = &link.conn {
            if existing.initiator <= conn.initiator {
                return false;
            }
            debug!(peer = %peer, "replacing duplicate connection");
            link.conn = Some(conn);
            return true;
        }
        link.conn = Some(conn);
        link.state = ConnectionState::Connected;
        self.events
            .emit(Event::PeerStateChanged(peer.clone(), ConnectionState::Connected));
        true
    }

    /// Connection `conn_id` ended. Ignored if a newer connection has replaced it.
    fn uninstall(&self, peer: &PeerId, conn_id: u64) {
        let mut links = self.links.lock();
        let Some(link) = links.get_mut(&peer.device_id()) else {
            return;
        };
        if link.conn.as_ref().map(|c| c.id) != Some(conn_id) {
            return;
        }
        link.conn = None;
        link.state = ConnectionState::NotConnected;
        self.events
            .emit(Event::PeerStateChanged(peer.clone(), ConnectionState::NotConnected));
    }
}

async fn accept_loop(inner: Arc<Inner>, listener: TcpListener) {
    loop {
        let accepted = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            r = listener.accept() => r,
        };
        match accepted {
            Ok((stream, from)) => {
                debug!(%from, "inbound connection");
                tokio::spawn(handle_inbound(inner.clone(), stream));
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn handle_inbound(inner: Arc<Inner>, mut stream: TcpStream) {
    let handshake = tokio::select! {
        _ = inner.cancel.cancelled() => return,
        r = handshake_accept(&inner, &mut stream) => r,
    };
    match handshake {
        Ok((hello, sealer, opener)) => {
            let peer = hello.peer_id();
            run_connection(inner, stream, peer.clone(), peer.device_id(), sealer, opener).await;
        }
        Err(e) => warn!(error = %e, "inbound handshake failed"),
    }
}

/// Responder side: read the peer's hello, consult the policy, answer with ours.
/// Each step is bounded by the handshake timeout.
async fn handshake_accept(
    inner: &Inner,
    stream: &mut TcpStream,
) -> Result<(Presence, Sealer, Opener), HandshakeError> {
    let hello = tokio::time::timeout(inner.handshake_timeout, read_hello(inner, &mut *stream))
        .await
        .map_err(|_| HandshakeError::TimedOut)??;
    let peer = hello.peer_id();
    if !inner.policy.accept(&peer) {
        return Err(HandshakeError::Declined(peer));
    }
    info!(peer = %peer, "accepting invitation");
    inner.begin_connecting(&peer);
    let reply = async {
        tokio::time::timeout(inner.handshake_timeout, write_hello(inner, &mut *stream))
            .await
            .map_err(|_| HandshakeError::TimedOut)??;
        let (sealer, opener) = session_ciphers(&inner.keypair, &hello.public_key, Role::Responder)?;
        Ok::<_, HandshakeError>((sealer, opener))
    }
    .await;
    match reply {
        Ok((sealer, opener)) => Ok((hello, sealer, opener)),
        Err(e) => {
            inner.fail_pending(&peer);
            Err(e)
        }
    }
}

/// Initiator side: connect, send our hello, read theirs.
async fn dial(
    inner: &Inner,
    addr: SocketAddr,
    expected: DeviceId,
) -> Result<(TcpStream, Presence, Sealer, Opener), HandshakeError> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    write_hello(inner, &mut stream).await?;
    let hello = read_hello(inner, &mut stream).await?;
    if hello.device_id != expected {
        return Err(HandshakeError::WrongPeer {
            expected,
            actual: hello.device_id,
        });
    }
    let (sealer, opener) = session_ciphers(&inner.keypair, &hello.public_key, Role::Initiator)?;
    Ok((stream, hello, sealer, opener))
}

async fn write_hello<W: AsyncWrite + Unpin>(inner: &Inner, w: &mut W) -> Result<(), HandshakeError> {
    let frame = wire::encode_frame(&ControlMessage::Hello(inner.local_presence()))?;
    w.write_all(&frame).await?;
    w.flush().await?;
    Ok(())
}

async fn read_hello<R: AsyncRead + Unpin>(inner: &Inner, r: &mut R) -> Result<Presence, HandshakeError> {
    let mut buf = vec![0u8; LEN_SIZE];
    r.read_exact(&mut buf).await?;
    let len = wire::frame_len(&buf)?;
    if len > MAX_HELLO_LEN {
        return Err(HandshakeError::HelloTooLarge(len));
    }
    buf.resize(LEN_SIZE + len, 0);
    r.read_exact(&mut buf[LEN_SIZE..]).await?;
    let (msg, _) = wire::decode_frame(&buf)?;
    let ControlMessage::Hello(hello) = msg else {
        return Err(HandshakeError::UnexpectedMessage);
    };
    if !hello.is_compatible(&inner.service_tag) {
        return Err(HandshakeError::Incompatible);
    }
    if hello.device_id == inner.keypair.device_id() {
        return Err(HandshakeError::SelfConnection);
    }
    Ok(hello)
}

async fn run_connection(
    inner: Arc<Inner>,
    stream: TcpStream,
    peer: PeerId,
    initiator: DeviceId,
    mut sealer: Sealer,
    mut opener: Opener,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let conn_id = inner.next_conn_id.fetch_add(1, Ordering::Relaxed);
    if !inner.install(&peer, Conn { id: conn_id, initiator, tx }) {
        debug!(peer = %peer, "dropping duplicate connection");
        return;
    }
    info!(peer = %peer, "session established");

    let (mut reader, mut writer) = stream.into_split();
    let closed = inner.cancel.child_token();

    let writer_closed = closed.clone();
    let writer_peer = peer.clone();
    tokio::spawn(async move {
        loop {
            let plain = tokio::select! {
                _ = writer_closed.cancelled() => break,
                next = rx.recv() => match next {
                    Some(p) => p,
                    None => break,
                },
            };
            let written = async {
                let cipher = sealer
                    .seal(&plain)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
                writer.write_all(&(cipher.len() as u32).to_le_bytes()).await?;
                writer.write_all(&cipher).await?;
                writer.flush().await
            }
            .await;
            if let Err(e) = written {
                warn!(peer = %writer_peer, error = %e, "write failed, closing session");
                break;
            }
        }
        writer_closed.cancel();
        let _ = writer.shutdown().await;
    });

    loop {
        let frame = tokio::select! {
            _ = closed.cancelled() => break,
            r = read_sealed(&mut reader, &mut opener) => r,
        };
        match frame {
            Ok(plain) => {
                debug!(peer = %peer, len = plain.len(), "frame received");
                inner.events.emit(Event::DataReceived(peer.clone(), plain));
            }
            Err(e) => {
                debug!(peer = %peer, error = %e, "session closed");
                break;
            }
        }
    }
    closed.cancel();
    inner.uninstall(&peer, conn_id);
    info!(peer = %peer, "session ended");
}

async fn read_sealed<R: AsyncRead + Unpin>(
    r: &mut R,
    opener: &mut Opener,
) -> std::io::Result<Vec<u8>> {
    let mut header = [0u8; LEN_SIZE];
    r.read_exact(&mut header).await?;
    let len = wire::frame_len(&header)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let mut cipher = vec![0u8; len];
    r.read_exact(&mut cipher).await?;
    opener
        .open(&cipher)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    struct Node {
        session: TransportSession,
        events: mpsc::UnboundedReceiver<Event>,
        addr: SocketAddr,
    }

    async fn node(name: &str, policy: Arc<dyn InvitationPolicy>) -> Node {
        let (tx, rx) = mpsc::unbounded_channel();
        let events = EventSender::new(tx, CancellationToken::new());
        let session = TransportSession::new(
            Arc::new(Keypair::generate()),
            name,
            "test-service",
            policy,
            Duration::from_millis(300),
            &events,
        );
        let port = session.start(0).await.unwrap().port();
        Node {
            session,
            events: rx,
            addr: SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
        }
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event stream closed")
    }

    async fn wait_state(rx: &mut mpsc::UnboundedReceiver<Event>, want: ConnectionState) -> PeerId {
        loop {
            if let Event::PeerStateChanged(p, s) = next(rx).await {
                if s == want {
                    return p;
                }
            }
        }
    }

    #[tokio::test]
    async fn invite_connects_both_sides_and_carries_frames() {
        let mut rick = node("Rick-MacBook", Arc::new(AutoAccept)).await;
        let mut morty = node("Morty-iPhone", Arc::new(AutoAccept)).await;
        let morty_id = morty.session.local_peer();

        rick.session.invite(morty_id.clone(), morty.addr, Duration::from_secs(5));
        assert_eq!(
            next(&mut rick.events).await,
            Event::PeerStateChanged(morty_id.clone(), ConnectionState::Connecting)
        );
        let seen_by_rick = wait_state(&mut rick.events, ConnectionState::Connected).await;
        assert_eq!(seen_by_rick.display_name(), "Morty-iPhone");
        let seen_by_morty = wait_state(&mut morty.events, ConnectionState::Connected).await;
        assert_eq!(seen_by_morty, rick.session.local_peer());

        rick.session
            .send(b"LOCATION:Citadel of Ricks", &[morty_id.clone()])
            .unwrap();
        rick.session.send(b"IMAGE:\x00\xff", &[morty_id]).unwrap();
        match next(&mut morty.events).await {
            Event::DataReceived(from, bytes) => {
                assert_eq!(from.display_name(), "Rick-MacBook");
                assert_eq!(bytes, b"LOCATION:Citadel of Ricks");
            }
            other => panic!("unexpected {other:?}"),
        }
        match next(&mut morty.events).await {
            Event::DataReceived(_, bytes) => assert_eq!(bytes, b"IMAGE:\x00\xff"),
            other => panic!("unexpected {other:?}"),
        }

        morty.session
            .send(b"LOCATION:Earth", &[seen_by_morty])
            .unwrap();
        match next(&mut rick.events).await {
            Event::DataReceived(_, bytes) => assert_eq!(bytes, b"LOCATION:Earth"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_without_connection_fails() {
        let rick = node("Rick-MacBook", Arc::new(AutoAccept)).await;
        let stranger = Keypair::generate().peer_id("Jerry");
        assert_eq!(
            rick.session.send(b"LOCATION:x", &[stranger]),
            Err(SendError::NoConnectedPeers)
        );
        assert_eq!(rick.session.send(b"LOCATION:x", &[]), Err(SendError::NoConnectedPeers));
    }

    #[tokio::test]
    async fn declined_invitation_reverts_to_not_connected() {
        let mut rick = node("Rick-MacBook", Arc::new(AutoAccept)).await;
        let morty = node("Morty-iPhone", Arc::new(AllowList::new(["Summer-iPad"]))).await;
        let morty_id = morty.session.local_peer();

        rick.session.invite(morty_id.clone(), morty.addr, Duration::from_secs(5));
        assert_eq!(
            next(&mut rick.events).await,
            Event::PeerStateChanged(morty_id.clone(), ConnectionState::Connecting)
        );
        assert_eq!(
            next(&mut rick.events).await,
            Event::PeerStateChanged(morty_id.clone(), ConnectionState::NotConnected)
        );
        assert_eq!(rick.session.state_of(&morty_id), ConnectionState::NotConnected);
    }

    #[tokio::test]
    async fn invite_times_out_against_silent_listener() {
        let mut rick = node("Rick-MacBook", Arc::new(AutoAccept)).await;
        // Accepts TCP but never says hello.
        let silent = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let addr = silent.local_addr().unwrap();
        let _hold = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((s, _)) = silent.accept().await {
                held.push(s);
            }
        });
        let ghost = Keypair::generate().peer_id("Ghost");

        rick.session.invite(ghost.clone(), addr, Duration::from_millis(200));
        rick.session.invite(ghost.clone(), addr, Duration::from_millis(200));
        assert_eq!(
            next(&mut rick.events).await,
            Event::PeerStateChanged(ghost.clone(), ConnectionState::Connecting)
        );
        // The second invite was a no-op: the next event is the timeout.
        assert_eq!(
            next(&mut rick.events).await,
            Event::PeerStateChanged(ghost, ConnectionState::NotConnected)
        );
    }

    /// Wait until the server side closes `stream`.
    async fn closed_by_server(mut stream: TcpStream) -> bool {
        let mut buf = [0u8; 64];
        loop {
            match tokio::time::timeout(Duration::from_secs(3), stream.read(&mut buf)).await {
                Ok(Ok(0)) | Ok(Err(_)) => return true,
                Ok(Ok(_)) => continue,
                Err(_) => return false,
            }
        }
    }

    #[tokio::test]
    async fn oversized_hello_is_refused() {
        let mut rick = node("Rick-MacBook", Arc::new(AutoAccept)).await;
        let mut client = TcpStream::connect(rick.addr).await.unwrap();
        client.write_all(&MAX_FRAME_LEN.to_le_bytes()).await.unwrap();
        assert!(closed_by_server(client).await);
        assert!(rick.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn silent_inbound_connection_is_dropped() {
        let mut rick = node("Rick-MacBook", Arc::new(AutoAccept)).await;
        let client = TcpStream::connect(rick.addr).await.unwrap();
        assert!(closed_by_server(client).await);
        assert!(rick.events.try_recv().is_err());

        // The listener still serves real peers afterwards.
        let morty = node("Morty-iPhone", Arc::new(AutoAccept)).await;
        let rick_id = rick.session.local_peer();
        morty.session.invite(rick_id, rick.addr, Duration::from_secs(5));
        wait_state(&mut rick.events, ConnectionState::Connected).await;
    }

    #[tokio::test]
    async fn no_events_after_shutdown() {
        let mut rick = node("Rick-MacBook", Arc::new(AutoAccept)).await;
        let mut morty = node("Morty-iPhone", Arc::new(AutoAccept)).await;
        let morty_id = morty.session.local_peer();

        rick.session.invite(morty_id.clone(), morty.addr, Duration::from_secs(5));
        wait_state(&mut rick.events, ConnectionState::Connected).await;
        let rick_id = wait_state(&mut morty.events, ConnectionState::Connected).await;

        rick.session.shutdown();
        rick.session.shutdown();
        assert_eq!(
            rick.session.send(b"LOCATION:x", &[morty_id.clone()]),
            Err(SendError::NoConnectedPeers)
        );

        // Morty sees the loss; Rick reports nothing more.
        assert_eq!(
            wait_state(&mut morty.events, ConnectionState::NotConnected).await,
            rick_id
        );
        let _ = morty.session.send(b"LOCATION:late", &[rick_id]);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rick.events.try_recv().is_err());
    }
}
