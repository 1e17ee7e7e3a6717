//! The sharing service: wires session, advertiser and browser together and owns the
//! state task that applies their events to the [`SharingCore`].

use std::net::SocketAddr;
use std::sync::Arc;

use nearcast_core::{
    fan_out, ConnectError, DeviceId, FanOutReport, Keypair, Outbox, PeerId, SendError,
    SessionView, SharingCore,
};
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::discovery::{Advertiser, Browser};
use crate::events::{Event, EventSender};
use crate::session::{AllowList, AutoAccept, InvitationPolicy, TransportSession};

/// Shared state plus the snapshot channel it publishes to.
#[derive(Clone)]
struct State {
    core: Arc<Mutex<SharingCore>>,
    view_tx: Arc<watch::Sender<SessionView>>,
}

impl State {
    fn new() -> Self {
        let (view_tx, _) = watch::channel(SessionView::default());
        Self {
            core: Arc::new(Mutex::new(SharingCore::new())),
            view_tx: Arc::new(view_tx),
        }
    }

    async fn apply(&self, event: Event) {
        let mut core = self.core.lock().await;
        match event {
            Event::PeerFound(peer) => core.on_peer_found(peer),
            Event::PeerLost(peer) => core.on_peer_lost(&peer),
            Event::PeerStateChanged(peer, state) => {
                info!(peer = %peer, %state, "connection state");
                core.on_peer_state_changed(peer, state);
            }
            Event::DataReceived(peer, bytes) => {
                // Decode failures are logged by the core and otherwise ignored.
                if let Ok(msg) = core.on_data_received(&peer, &bytes) {
                    match msg.as_text() {
                        Some(text) => info!(peer = %peer, text, "received location"),
                        None => info!(peer = %peer, len = bytes.len(), "received image"),
                    }
                }
            }
        }
        self.view_tx.send_replace(core.snapshot());
    }
}

/// Consume the event stream until shutdown. The only place the view is mutated from events.
async fn run_state_task(state: State, mut rx: mpsc::UnboundedReceiver<Event>, cancel: CancellationToken) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            e = rx.recv() => match e {
                Some(e) => e,
                None => break,
            },
        };
        state.apply(event).await;
    }
    debug!("state task stopped");
}

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("cannot bind session listener: {0}")]
    Listen(#[from] std::io::Error),
}

/// Context object for location and image sharing. Build one with [`SharingService::start`]
/// and pass it to whatever drives the UI; call [`SharingService::shutdown`] when done.
pub struct SharingService {
    local: PeerId,
    config: Config,
    session: Arc<TransportSession>,
    advertiser: Advertiser,
    browser: Browser,
    state: State,
    cancel: CancellationToken,
    state_task: SyncMutex<Option<JoinHandle<()>>>,
}

impl SharingService {
    /// Bind the session listener, then start advertising and browsing. Discovery failures
    /// are logged and leave the service running without discovery.
    pub async fn start(config: Config, keypair: Arc<Keypair>) -> Result<Self, StartError> {
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let events = EventSender::new(tx, cancel.clone());

        let policy: Arc<dyn InvitationPolicy> = if config.allow.is_empty() {
            warn!("accepting every inbound invitation; set `allow` in config to restrict");
            Arc::new(AutoAccept)
        } else {
            Arc::new(AllowList::new(config.allow.iter().cloned()))
        };
        let session = Arc::new(TransportSession::new(
            keypair.clone(),
            config.display_name.clone(),
            config.service_tag.clone(),
            policy,
            config.invite_timeout(),
            &events,
        ));
        let listen = session.start(config.transport_port).await?;
        let local = session.local_peer();

        let advertiser = Advertiser::new(
            keypair.clone(),
            listen.port(),
            config.discovery_port,
            config.announce_interval(),
        );
        let browser = Browser::new(
            keypair.device_id(),
            config.discovery_port,
            config.peer_timeout(),
            &events,
        );

        let state = State::new();
        let state_task = tokio::spawn(run_state_task(state.clone(), rx, cancel.clone()));

        if let Err(e) = advertiser.start_advertising(&local, &config.service_tag) {
            warn!(error = %e, "advertising unavailable");
        }
        if let Err(e) = browser.start_browsing(&config.service_tag) {
            warn!(error = %e, "browsing unavailable");
        }
        info!(peer = %local, %listen, "sharing service started");

        Ok(Self {
            local,
            config,
            session,
            advertiser,
            browser,
            state,
            cancel,
            state_task: SyncMutex::new(Some(state_task)),
        })
    }

    pub fn local_peer(&self) -> &PeerId {
        &self.local
    }

    /// Address of the session listener other peers dial.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.session.listen_addr()
    }

    /// Latest published snapshot.
    pub fn view(&self) -> SessionView {
        self.state.view_tx.borrow().clone()
    }

    /// Receive a fresh snapshot after every change.
    pub fn subscribe(&self) -> watch::Receiver<SessionView> {
        self.state.view_tx.subscribe()
    }

    /// Invite a discovered peer. The result shows up as state changes in the view.
    pub async fn connect(&self, device_id: DeviceId) -> Result<PeerId, ConnectError> {
        let peer = self.state.core.lock().await.connect(device_id)?;
        let addr = self
            .browser
            .address_of(device_id)
            .ok_or(ConnectError::UnknownPeer(device_id))?;
        self.session
            .invite(peer.clone(), addr, self.config.invite_timeout());
        Ok(peer)
    }

    /// Send a location to every connected peer. Empty text does nothing.
    pub async fn share_location(&self, text: &str) -> Result<FanOutReport, SendError> {
        let broadcast = self.state.core.lock().await.share_location(text)?;
        let Some(broadcast) = broadcast else {
            return Ok(FanOutReport::default());
        };
        let report = fan_out(self.outbox(), &broadcast);
        info!(
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            "location shared"
        );
        Ok(report)
    }

    /// Send an already-encoded image to every connected peer.
    pub async fn share_image(&self, image: &[u8]) -> Result<FanOutReport, SendError> {
        let broadcast = self.state.core.lock().await.share_image(image)?;
        let report = fan_out(self.outbox(), &broadcast);
        info!(
            bytes = image.len(),
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            "image shared"
        );
        Ok(report)
    }

    /// Drop idle discovered peers; they reappear on their next announcement.
    /// Restarts browsing if its socket had failed.
    pub async fn refresh(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        if !self.browser.is_browsing() {
            if let Err(e) = self.browser.start_browsing(&self.config.service_tag) {
                warn!(error = %e, "browsing unavailable");
            }
        }
        let mut core = self.state.core.lock().await;
        core.forget_discovered();
        self.browser.forget_all();
        self.state.view_tx.send_replace(core.snapshot());
    }

    fn outbox(&self) -> &dyn Outbox {
        self.session.as_ref()
    }

    /// Stop advertising and browsing, tear the session down and stop the state task.
    /// Nothing reaches the view afterwards. Safe to call more than once.
    pub fn shutdown(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.advertiser.stop_advertising();
        self.browser.stop_browsing();
        self.session.shutdown();
        self.cancel.cancel();
        if let Some(task) = self.state_task.lock().take() {
            task.abort();
        }
        info!("sharing service stopped");
    }
}

impl Drop for SharingService {
    fn drop(&mut self) {
        self.shutdown();
    }
}
