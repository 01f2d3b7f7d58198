#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use meshcall::config::SessionConfig;
use meshcall::connection::{
    ConnectionEvent, ConnectionEvents, Connector, IceConnectionState, PeerConnection,
    PeerConnectionState,
};
use meshcall::directory::MemoryDirectory;
use meshcall::error::{Error, Result};
use meshcall::media::{CaptureRequest, LocalMedia, MediaKind, MediaSource, RemoteTrack, TrackMediaSource};
use meshcall::metrics::TransportStats;
use meshcall::relay::{MemoryRelay, Relay, RelayChannel};
use meshcall::room::{RoomSession, SessionNotice};
use meshcall::signaling::{IceCandidate, SessionDescription, SignalingMessage};

struct FakeState {
    ice: IceConnectionState,
    pc: PeerConnectionState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    applied: Vec<String>,
    offers: u32,
    ice_restarts: u32,
    answers: u32,
    local_tracks: usize,
    stats: TransportStats,
    fail_offers: bool,
    closed: bool,
}

/// Scriptable connection: tests set its states and stats and read back what
/// the session did to it.
pub struct FakeConnection {
    events: ConnectionEvents,
    state: Mutex<FakeState>,
}

impl FakeConnection {
    fn new(events: ConnectionEvents) -> Self {
        Self {
            events,
            state: Mutex::new(FakeState {
                ice: IceConnectionState::New,
                pc: PeerConnectionState::New,
                local: None,
                remote: None,
                applied: Vec::new(),
                offers: 0,
                ice_restarts: 0,
                answers: 0,
                local_tracks: 0,
                stats: TransportStats::default(),
                fail_offers: false,
                closed: false,
            }),
        }
    }

    pub fn peer_id(&self) -> &str {
        self.events.peer_id()
    }

    /// Sets both signals and reports both changes, like a real stack would.
    pub fn set_states(&self, ice: IceConnectionState, pc: PeerConnectionState) {
        {
            let mut state = self.state.lock();
            state.ice = ice;
            state.pc = pc;
        }
        self.events.emit(ConnectionEvent::IceStateChanged(ice));
        self.events.emit(ConnectionEvent::PeerStateChanged(pc));
    }

    pub fn connect(&self) {
        self.set_states(IceConnectionState::Connected, PeerConnectionState::Connected);
    }

    pub fn set_stats(&self, stats: TransportStats) {
        self.state.lock().stats = stats;
    }

    pub fn fail_offers(&self, fail: bool) {
        self.state.lock().fail_offers = fail;
    }

    pub fn emit_local_candidate(&self, candidate: &str) {
        self.events
            .emit(ConnectionEvent::LocalCandidate(IceCandidate::new(candidate)));
    }

    pub fn emit_track(&self, id: &str, kind: MediaKind) {
        self.events.emit(ConnectionEvent::Track(RemoteTrack {
            id: id.to_string(),
            kind,
            source: None,
        }));
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.state.lock().applied.clone()
    }

    pub fn offers(&self) -> u32 {
        self.state.lock().offers
    }

    pub fn ice_restarts(&self) -> u32 {
        self.state.lock().ice_restarts
    }

    pub fn answers(&self) -> u32 {
        self.state.lock().answers
    }

    pub fn local_tracks(&self) -> usize {
        self.state.lock().local_tracks
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[async_trait]
impl PeerConnection for FakeConnection {
    async fn add_local_media(&self, media: &LocalMedia) -> Result<()> {
        self.state.lock().local_tracks += media.tracks().len();
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        let mut state = self.state.lock();
        if state.fail_offers {
            return Err(Error::Other(anyhow::anyhow!("offer creation failed")));
        }
        state.offers += 1;
        if ice_restart {
            state.ice_restarts += 1;
        }
        Ok(SessionDescription::offer(format!("offer-{}", state.offers)))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let mut state = self.state.lock();
        if state.remote.is_none() {
            return Err(Error::Other(anyhow::anyhow!("no remote offer")));
        }
        state.answers += 1;
        Ok(SessionDescription::answer(format!("answer-{}", state.answers)))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.state.lock().local = Some(description);
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        if description.sdp == "malformed" {
            return Err(Error::Other(anyhow::anyhow!("could not parse sdp")));
        }
        self.state.lock().remote = Some(description);
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.state.lock().remote.is_some()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut state = self.state.lock();
        if state.remote.is_none() {
            return Err(Error::Other(anyhow::anyhow!("remote description not set")));
        }
        state.applied.push(candidate.candidate);
        Ok(())
    }

    fn ice_connection_state(&self) -> IceConnectionState {
        self.state.lock().ice
    }

    fn connection_state(&self) -> PeerConnectionState {
        self.state.lock().pc
    }

    async fn stats(&self) -> Result<TransportStats> {
        Ok(self.state.lock().stats.clone())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.closed = true;
        state.ice = IceConnectionState::Closed;
        state.pc = PeerConnectionState::Closed;
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeConnector {
    connections: Mutex<Vec<Arc<FakeConnection>>>,
}

impl FakeConnector {
    /// The most recent connection created toward `peer_id`.
    pub fn connection(&self, peer_id: &str) -> Option<Arc<FakeConnection>> {
        self.connections
            .lock()
            .iter()
            .rev()
            .find(|c| c.peer_id() == peer_id)
            .cloned()
    }

    pub fn count(&self) -> usize {
        self.connections.lock().len()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, events: ConnectionEvents) -> Result<Arc<dyn PeerConnection>> {
        let connection = Arc::new(FakeConnection::new(events));
        self.connections.lock().push(Arc::clone(&connection));
        Ok(connection)
    }
}

/// Real sample tracks, with counters for acquisitions and stops.
#[derive(Default)]
pub struct CountingMediaSource {
    inner: TrackMediaSource,
    acquired: AtomicUsize,
    stopped: Arc<AtomicUsize>,
}

impl CountingMediaSource {
    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn stopped(&self) -> usize {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaSource for CountingMediaSource {
    async fn acquire(&self, request: CaptureRequest) -> Result<LocalMedia> {
        let media = self.inner.acquire(request).await?;
        self.acquired.fetch_add(1, Ordering::SeqCst);
        let stopped = Arc::clone(&self.stopped);
        Ok(media.with_stop_hook(move || {
            stopped.fetch_add(1, Ordering::SeqCst);
        }))
    }
}

pub struct Participant {
    pub session: RoomSession,
    pub notices: mpsc::UnboundedReceiver<SessionNotice>,
    pub connector: Arc<FakeConnector>,
    pub media: Arc<CountingMediaSource>,
}

impl Participant {
    pub fn new(directory: &Arc<MemoryDirectory>, relay: &Arc<MemoryRelay>) -> Self {
        Self::with_config(SessionConfig::default(), directory, relay)
    }

    pub fn with_config(
        config: SessionConfig,
        directory: &Arc<MemoryDirectory>,
        relay: &Arc<MemoryRelay>,
    ) -> Self {
        let connector = Arc::new(FakeConnector::default());
        let media = Arc::new(CountingMediaSource::default());
        let (session, notices) = RoomSession::new(
            config,
            directory.clone(),
            relay.clone(),
            media.clone(),
            connector.clone(),
        );
        Self {
            session,
            notices,
            connector,
            media,
        }
    }

    pub fn self_id(&self) -> String {
        self.session.self_id().unwrap_or_default().to_string()
    }

    pub fn drain_notices(&mut self) -> Vec<SessionNotice> {
        let mut notices = Vec::new();
        while let Ok(notice) = self.notices.try_recv() {
            notices.push(notice);
        }
        notices
    }
}

/// A remote participant speaking raw signaling on a room's relay channel.
pub struct RemotePeer {
    pub id: String,
    pub channel: RelayChannel,
    pub inbound: mpsc::UnboundedReceiver<SignalingMessage>,
    /// Participant this peer addresses.
    pub target: String,
}

impl RemotePeer {
    pub async fn join(relay: &MemoryRelay, room_id: &str, id: &str, target: &str) -> Self {
        let mut channel = relay
            .join(&format!("signaling:{}", room_id))
            .await
            .unwrap();
        let inbound = channel.take_inbound().unwrap();
        Self {
            id: id.to_string(),
            channel,
            inbound,
            target: target.to_string(),
        }
    }

    pub fn offer(&self, sdp: &str) {
        self.channel
            .send(SignalingMessage::Offer {
                from: self.id.clone(),
                to: self.target.clone(),
                sdp: SessionDescription::offer(sdp),
            })
            .unwrap();
    }

    pub fn answer(&self, sdp: &str) {
        self.channel
            .send(SignalingMessage::Answer {
                from: self.id.clone(),
                to: self.target.clone(),
                sdp: SessionDescription::answer(sdp),
            })
            .unwrap();
    }

    pub fn candidate(&self, candidate: &str) {
        self.channel
            .send(SignalingMessage::Candidate {
                from: self.id.clone(),
                to: self.target.clone(),
                candidate: IceCandidate::new(candidate),
            })
            .unwrap();
    }

    /// Messages addressed to this peer received so far.
    pub fn received(&mut self) -> Vec<SignalingMessage> {
        let mut messages = Vec::new();
        while let Ok(msg) = self.inbound.try_recv() {
            if msg.to_peer() == self.id {
                messages.push(msg);
            }
        }
        messages
    }
}
