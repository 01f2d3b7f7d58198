use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use super::state::{ActiveRoom, MediaState};
use super::timers::{TimerKey, TimerTable};
use super::{generate_peer_id, generate_room_code, normalize_room_code, SessionEvent, SessionNotice};
use crate::config::SessionConfig;
use crate::connection::{ConnectionEvent, ConnectionEvents, Connector, LinkHealth};
use crate::directory::{Directory, MembershipChange, ParticipantRecord, RoomRecord};
use crate::error::{Error, Result};
use crate::ice_buffer::IceCandidateBuffer;
use crate::media::{LocalMedia, MediaKind, MediaPolicy, MediaSource};
use crate::metrics::QualityMonitor;
use crate::peer::{PeerLink, PeerRegistry, Role, StreamChange};
use crate::presence::PresenceHeartbeat;
use crate::reconnect::{ReconnectionController, RecoveryEffect, RecoveryInput};
use crate::relay::Relay;
use crate::signaling::{IceCandidate, PeerId, SessionDescription, SignalingMessage, SignalingRouter};

/// What woke the session task.
pub(crate) enum Wake {
    Event(SessionEvent),
    Timer(TimerKey),
    Idle,
}

/// One participant's view of one room at a time.
///
/// All state is owned by a single task. Relay traffic, membership changes and
/// connection callbacks arrive through one event channel; timers live in a
/// table polled by the same task, so cancelling a timer is a synchronous
/// removal and a torn-down peer can never be resurrected by a late callback.
pub struct RoomSession {
    config: SessionConfig,
    directory: Arc<dyn Directory>,
    relay: Arc<dyn Relay>,
    media_source: Arc<dyn MediaSource>,
    connector: Arc<dyn Connector>,
    recovery: ReconnectionController,
    quality: QualityMonitor,
    heartbeat: PresenceHeartbeat,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    notices: mpsc::UnboundedSender<SessionNotice>,
    timers: TimerTable,
    room: Option<ActiveRoom>,
}

impl RoomSession {
    pub fn new(
        config: SessionConfig,
        directory: Arc<dyn Directory>,
        relay: Arc<dyn Relay>,
        media_source: Arc<dyn MediaSource>,
        connector: Arc<dyn Connector>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionNotice>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (notices, notices_rx) = mpsc::unbounded_channel();
        let session = Self {
            recovery: ReconnectionController::new(config.recovery),
            quality: QualityMonitor::new(config.quality_start_delay, config.quality_interval),
            heartbeat: PresenceHeartbeat::new(config.heartbeat_interval, config.stale_after),
            config,
            directory,
            relay,
            media_source,
            connector,
            events_tx,
            events_rx,
            notices,
            timers: TimerTable::new(),
            room: None,
        };
        (session, notices_rx)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn is_in_room(&self) -> bool {
        self.room.is_some()
    }

    pub fn room_code(&self) -> Option<&str> {
        self.room.as_ref().map(ActiveRoom::room_code)
    }

    pub fn self_id(&self) -> Option<&str> {
        self.room.as_ref().map(|room| room.self_id.as_str())
    }

    pub fn media_state(&self) -> Option<MediaState> {
        self.room.as_ref().map(ActiveRoom::media_state)
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.room
            .as_ref()
            .map(|room| room.peers.ids())
            .unwrap_or_default()
    }

    pub fn link(&self, peer_id: &str) -> Option<&PeerLink> {
        self.room.as_ref().and_then(|room| room.peers.get(peer_id))
    }

    pub fn buffered_candidates(&self, peer_id: &str) -> usize {
        self.room
            .as_ref()
            .map_or(0, |room| room.candidates.pending(peer_id))
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    pub fn has_timer(&self, key: &TimerKey) -> bool {
        self.timers.is_armed(key)
    }

    /// Allocates a new room, enters it and returns its code.
    pub async fn create_room(&mut self, display_name: &str, policy: MediaPolicy) -> Result<String> {
        self.ensure_idle()?;
        let code = generate_room_code();
        let record = self
            .directory
            .create_room(&code, self.config.room_capacity)
            .await?;
        info!(room = %code, room_id = %record.id, "created room");
        self.enter(record, display_name, policy).await?;
        Ok(code)
    }

    /// Enters an existing active room and initiates a link toward everyone
    /// already in it. Returns the normalized room code.
    pub async fn join_room(
        &mut self,
        room_code: &str,
        display_name: &str,
        policy: MediaPolicy,
    ) -> Result<String> {
        self.ensure_idle()?;
        let code = normalize_room_code(room_code);
        let record = self
            .directory
            .find_active_room(&code)
            .await?
            .ok_or_else(|| Error::RoomNotFound(code.clone()))?;
        self.enter(record, display_name, policy).await?;
        Ok(code)
    }

    /// Tears the room down. Timers are cancelled before any transport is
    /// released. Does nothing when not in a room.
    pub async fn leave_room(&mut self) {
        let Some(room) = self.room.take() else {
            return;
        };
        self.timers.clear();

        let ActiveRoom {
            self_id,
            record,
            local_media,
            router,
            membership,
            mut peers,
            mut candidates,
            ..
        } = room;
        membership.abort();
        router.close();
        for mut link in peers.drain() {
            link.close().await;
        }
        candidates.clear();
        local_media.stop();

        if let Err(e) = self.directory.delete_participant(&self_id).await {
            warn!(peer_id = %self_id, error = %e, "failed to deregister participant");
        }
        self.reset_events();
        info!(room = %record.room_code, peer_id = %self_id, "left room");
    }

    pub fn toggle_video(&mut self) -> bool {
        self.toggle(MediaKind::Video)
    }

    pub fn toggle_audio(&mut self) -> bool {
        self.toggle(MediaKind::Audio)
    }

    fn toggle(&mut self, kind: MediaKind) -> bool {
        let Some(room) = self.room.as_ref() else {
            return false;
        };
        if !room.local_media.has(kind) {
            debug!(?kind, "no local track to toggle");
            return false;
        }
        let enabled = room.local_media.toggle(kind);
        info!(?kind, enabled, "toggled local media");
        enabled
    }

    /// Drives the session for `duration`, handling events and timers as they come.
    pub async fn run_for(&mut self, duration: Duration) {
        let deadline = Instant::now() + duration;
        loop {
            tokio::select! {
                biased;
                wake = self.next_wake() => self.dispatch(wake).await,
                _ = sleep_until(deadline) => break,
            }
        }
    }

    pub(crate) async fn next_wake(&mut self) -> Wake {
        let deadline = self.timers.next_deadline();
        let timer = async move {
            match deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            Some(event) = self.events_rx.recv() => Wake::Event(event),
            _ = timer => match self.timers.pop_due(Instant::now()) {
                Some(key) => Wake::Timer(key),
                None => Wake::Idle,
            },
        }
    }

    pub(crate) async fn dispatch(&mut self, wake: Wake) {
        match wake {
            Wake::Event(SessionEvent::Signal(msg)) => self.handle_signal(msg).await,
            Wake::Event(SessionEvent::Membership(change)) => self.handle_membership(change).await,
            Wake::Event(SessionEvent::Connection { peer_id, event }) => {
                self.handle_connection(&peer_id, event).await
            }
            Wake::Timer(key) => self.handle_timer(key).await,
            Wake::Idle => {}
        }
    }

    fn ensure_idle(&self) -> Result<()> {
        match &self.room {
            Some(room) => Err(Error::AlreadyInRoom(room.room_code().to_string())),
            None => Ok(()),
        }
    }

    fn notify(&self, notice: SessionNotice) {
        let _ = self.notices.send(notice);
    }

    fn report(&self, peer_id: Option<&str>, error: Error) {
        warn!(peer_id = peer_id.unwrap_or("-"), error = %error, "session error");
        self.notify(SessionNotice::Error {
            peer_id: peer_id.map(str::to_string),
            message: error.to_string(),
        });
    }

    /// Swaps in a fresh event channel so callbacks queued by a previous room
    /// are never delivered.
    fn reset_events(&mut self) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.events_tx = events_tx;
        self.events_rx = events_rx;
    }

    async fn enter(&mut self, record: RoomRecord, display_name: &str, policy: MediaPolicy) -> Result<()> {
        let self_id = generate_peer_id();
        let local_media = self.media_source.acquire(policy.into()).await?;
        self.reset_events();

        let participant = ParticipantRecord {
            room_id: record.id.clone(),
            peer_id: self_id.clone(),
            username: display_name.to_string(),
            is_video_enabled: policy.video,
            is_audio_enabled: policy.audio,
        };
        if let Err(e) = self.directory.insert_participant(&participant).await {
            warn!(peer_id = %self_id, error = %e, "failed to register participant");
        }

        let router = match SignalingRouter::open(
            self.relay.as_ref(),
            &record.id,
            &self_id,
            self.events_tx.clone(),
        )
        .await
        {
            Ok(router) => router,
            Err(e) => {
                self.abandon(&self_id, local_media).await;
                return Err(e);
            }
        };
        let membership = match self.directory.watch_participants(&record.id).await {
            Ok(changes) => forward_membership(changes, self.events_tx.clone()),
            Err(e) => {
                router.close();
                self.abandon(&self_id, local_media).await;
                return Err(e);
            }
        };
        let existing = match self.directory.list_participants(&record.id).await {
            Ok(existing) => existing,
            Err(e) => {
                warn!(room = %record.room_code, error = %e, "failed to list participants");
                Vec::new()
            }
        };

        info!(room = %record.room_code, peer_id = %self_id, "entered room");
        self.room = Some(ActiveRoom {
            self_id: self_id.clone(),
            record,
            local_media,
            router,
            membership,
            peers: PeerRegistry::new(),
            candidates: IceCandidateBuffer::new(self.config.max_buffered_candidates),
        });

        for participant in existing.into_iter().filter(|p| p.peer_id != self_id) {
            self.initiate(&participant.peer_id).await;
        }
        self.start_heartbeat().await;
        Ok(())
    }

    async fn abandon(&mut self, self_id: &str, local_media: LocalMedia) {
        local_media.stop();
        if let Err(e) = self.directory.delete_participant(self_id).await {
            warn!(peer_id = self_id, error = %e, "failed to deregister participant");
        }
    }

    async fn start_heartbeat(&mut self) {
        let Some(room) = self.room.as_ref() else {
            return;
        };
        let removed = self
            .heartbeat
            .sweep(self.directory.as_ref(), room.room_id(), &room.self_id)
            .await;
        match removed {
            Ok(removed) => {
                for peer_id in removed {
                    self.remove_peer(&peer_id).await;
                }
            }
            Err(e) => warn!(error = %e, "initial presence sweep failed"),
        }
        self.timers
            .arm(TimerKey::Heartbeat, Instant::now() + self.heartbeat.interval());
    }

    /// Creates the link if it does not exist yet. Returns whether it was created.
    async fn ensure_link(&mut self, peer_id: &str, role: Role) -> Result<bool> {
        let Some(room) = self.room.as_mut() else {
            return Err(Error::NotInRoom);
        };
        if room.peers.contains(peer_id) {
            return Ok(false);
        }
        let events = ConnectionEvents::new(peer_id, self.events_tx.clone());
        let link = PeerLink::open(peer_id, role, self.connector.as_ref(), events, &room.local_media)
            .await
            .map_err(|e| Error::negotiation(peer_id, e))?;
        room.peers.insert(link);
        self.timers.arm(
            TimerKey::Quality(peer_id.to_string()),
            Instant::now() + self.quality.start_delay(),
        );
        Ok(true)
    }

    async fn initiate(&mut self, peer_id: &str) {
        match self.ensure_link(peer_id, Role::Initiator).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                self.report(Some(peer_id), e);
                return;
            }
        }
        let Some(room) = self.room.as_mut() else {
            return;
        };
        let Some(link) = room.peers.get_mut(peer_id) else {
            return;
        };
        let result = match link.create_offer(false).await {
            Ok(offer) => {
                room.router.send_offer(peer_id, offer);
                Ok(())
            }
            Err(e) => Err(Error::negotiation(peer_id, e)),
        };
        if let Err(e) = result {
            self.report(Some(peer_id), e);
        }
    }

    async fn handle_signal(&mut self, msg: SignalingMessage) {
        let Some(room) = self.room.as_ref() else {
            return;
        };
        if !room.router.accepts(&msg) || msg.from_peer() == room.self_id {
            return;
        }
        let peer_id = msg.from_peer().to_string();
        debug!(peer_id = %peer_id, kind = msg.kind(), "received signaling message");

        let result = match msg {
            SignalingMessage::Offer { sdp, .. } => self.on_offer(&peer_id, sdp).await,
            SignalingMessage::Answer { sdp, .. } => self.on_answer(&peer_id, sdp).await,
            SignalingMessage::Candidate { candidate, .. } => {
                self.on_candidate(&peer_id, candidate).await
            }
        };
        if let Err(e) = result {
            self.report(Some(&peer_id), e);
        }
    }

    async fn on_offer(&mut self, peer_id: &str, offer: SessionDescription) -> Result<()> {
        let Some(room) = self.room.as_mut() else {
            return Ok(());
        };
        // Offer collision: the higher id keeps its own offer, the lower one
        // drops its link and answers on a fresh connection.
        if room.peers.get(peer_id).is_some_and(PeerLink::has_pending_offer) {
            if room.self_id.as_str() > peer_id {
                debug!(peer_id, "offer collision, keeping local offer");
                return Ok(());
            }
            info!(peer_id, "offer collision, yielding to remote offer");
            self.timers.cancel_peer(peer_id);
            if let Some(mut link) = room.peers.remove(peer_id) {
                link.close().await;
            }
        }
        if self.ensure_link(peer_id, Role::Responder).await? {
            info!(peer_id, "accepting offer from new peer");
        }
        let Some(room) = self.room.as_mut() else {
            return Ok(());
        };
        let Some(link) = room.peers.get_mut(peer_id) else {
            return Ok(());
        };
        let answer = link.accept_offer(offer, &mut room.candidates).await?;
        room.router.send_answer(peer_id, answer);
        Ok(())
    }

    async fn on_answer(&mut self, peer_id: &str, answer: SessionDescription) -> Result<()> {
        let Some(room) = self.room.as_mut() else {
            return Ok(());
        };
        match room.peers.get_mut(peer_id) {
            Some(link) => link.accept_answer(answer, &mut room.candidates).await,
            None => {
                debug!(peer_id, "ignoring answer for unknown peer");
                Ok(())
            }
        }
    }

    async fn on_candidate(&mut self, peer_id: &str, candidate: IceCandidate) -> Result<()> {
        let Some(room) = self.room.as_mut() else {
            return Ok(());
        };
        match room.peers.get_mut(peer_id) {
            Some(link) => link.add_remote_candidate(candidate, &mut room.candidates).await,
            // The offer that creates the link may still be in flight.
            None => {
                room.candidates.enqueue(peer_id, candidate);
                Ok(())
            }
        }
    }

    async fn handle_membership(&mut self, change: MembershipChange) {
        let Some(self_id) = self.self_id().map(str::to_string) else {
            return;
        };
        match change {
            MembershipChange::Joined(record) if record.peer_id != self_id => {
                info!(peer_id = %record.peer_id, username = %record.username, "participant joined");
                self.notify(SessionNotice::PeerJoined {
                    peer_id: record.peer_id,
                    username: record.username,
                });
            }
            MembershipChange::Left(record) if record.peer_id != self_id => {
                info!(peer_id = %record.peer_id, "participant left");
                self.remove_peer(&record.peer_id).await;
                self.notify(SessionNotice::PeerLeft {
                    peer_id: record.peer_id,
                });
            }
            _ => {}
        }
    }

    async fn handle_connection(&mut self, peer_id: &str, event: ConnectionEvent) {
        let Some(room) = self.room.as_mut() else {
            return;
        };
        let Some(link) = room.peers.get_mut(peer_id) else {
            debug!(peer_id, "dropping event for removed link");
            return;
        };
        match event {
            ConnectionEvent::LocalCandidate(candidate) => {
                room.router.send_candidate(peer_id, candidate);
            }
            ConnectionEvent::Track(track) => {
                let notice = match link.attach_remote_track(track) {
                    StreamChange::Created(stream) => SessionNotice::RemoteStreamCreated {
                        peer_id: peer_id.to_string(),
                        stream,
                    },
                    StreamChange::Updated(stream) => SessionNotice::RemoteStreamUpdated {
                        peer_id: peer_id.to_string(),
                        stream,
                    },
                };
                self.notify(notice);
            }
            ConnectionEvent::IceStateChanged(_) | ConnectionEvent::PeerStateChanged(_) => {
                self.on_state_change(peer_id).await;
            }
        }
    }

    async fn on_state_change(&mut self, peer_id: &str) {
        let Some(link) = link_in(&mut self.room, peer_id) else {
            return;
        };
        let before = link.state();
        let health = link.observe_health();
        let after = link.state();
        let stop_quality = QualityMonitor::should_stop(link.connection().as_ref());

        if before != after {
            info!(peer_id, state = %after, "link state changed");
            self.notify(SessionNotice::LinkStateChanged {
                peer_id: peer_id.to_string(),
                state: after,
            });
        }

        let quality_key = TimerKey::Quality(peer_id.to_string());
        if stop_quality {
            self.timers.cancel(&quality_key);
        } else if health == LinkHealth::Connected && !self.timers.is_armed(&quality_key) {
            debug!(peer_id, "restarting quality monitoring");
            self.timers
                .arm(quality_key, Instant::now() + self.quality.interval());
        }

        self.drive_recovery(peer_id, RecoveryInput::Health(health)).await;
    }

    /// Feeds the recovery state machine and carries out its effects. Effects
    /// that produce a follow-up input (sending a restart offer) are fed back in order.
    async fn drive_recovery(&mut self, peer_id: &str, input: RecoveryInput) {
        let mut inputs = VecDeque::from([input]);
        while let Some(input) = inputs.pop_front() {
            let Some(link) = link_in(&mut self.room, peer_id) else {
                return;
            };
            let (record, effects) = self.recovery.step(link.recovery, input);
            link.recovery = record;

            for effect in effects {
                match effect {
                    RecoveryEffect::Schedule(check, delay) => {
                        debug!(peer_id, ?check, delay_ms = delay.as_millis() as u64, "recovery check scheduled");
                        self.timers
                            .arm_recovery(peer_id, check, Instant::now() + delay);
                    }
                    RecoveryEffect::CancelTimer => self.timers.cancel_recovery(peer_id),
                    RecoveryEffect::IceRestart { attempt } => {
                        let next = self.restart_ice(peer_id, attempt).await;
                        inputs.push_back(next);
                    }
                    RecoveryEffect::GiveUp { attempts } => {
                        warn!(peer_id, attempts, "peer unreachable, removing link");
                        self.remove_peer(peer_id).await;
                        self.notify(SessionNotice::PeerUnreachable {
                            peer_id: peer_id.to_string(),
                            attempts,
                        });
                        return;
                    }
                }
            }
        }
    }

    async fn restart_ice(&mut self, peer_id: &str, attempt: u32) -> RecoveryInput {
        let max_attempts = self.recovery.policy().max_attempts;
        let Some(room) = self.room.as_mut() else {
            return RecoveryInput::OfferFailed;
        };
        let Some(link) = room.peers.get_mut(peer_id) else {
            return RecoveryInput::OfferFailed;
        };
        info!(peer_id, attempt, max_attempts, "attempting ICE restart");
        match link.create_offer(true).await {
            Ok(offer) => {
                room.router.send_offer(peer_id, offer);
                RecoveryInput::OfferSent
            }
            Err(e) => {
                warn!(peer_id, attempt, error = %e, "failed to create ICE restart offer");
                RecoveryInput::OfferFailed
            }
        }
    }

    /// Cancels the peer's timers, then forgets its candidates and closes its link.
    async fn remove_peer(&mut self, peer_id: &str) {
        self.timers.cancel_peer(peer_id);
        let Some(room) = self.room.as_mut() else {
            return;
        };
        room.candidates.discard(peer_id);
        if let Some(mut link) = room.peers.remove(peer_id) {
            link.close().await;
            info!(peer_id, "removed peer link");
        }
    }

    async fn handle_timer(&mut self, key: TimerKey) {
        match key {
            TimerKey::Heartbeat => self.on_heartbeat().await,
            TimerKey::Quality(peer_id) => self.on_quality_tick(&peer_id).await,
            TimerKey::Recovery(peer_id, check) => {
                let Some(link) = link_in(&mut self.room, &peer_id) else {
                    return;
                };
                let health = link.connection().health();
                debug!(peer_id = %peer_id, ?check, ?health, "recovery check fired");
                self.drive_recovery(&peer_id, RecoveryInput::TimerFired(check, health))
                    .await;
            }
        }
    }

    async fn on_heartbeat(&mut self) {
        let Some(room) = self.room.as_ref() else {
            return;
        };
        let room_id = room.room_id().to_string();
        let self_id = room.self_id.clone();
        match self
            .heartbeat
            .beat(self.directory.as_ref(), &room_id, &self_id)
            .await
        {
            Ok(removed) => {
                for peer_id in removed {
                    self.remove_peer(&peer_id).await;
                }
            }
            Err(e) => warn!(error = %e, "presence sweep failed"),
        }
        if self.room.is_some() {
            self.timers
                .arm(TimerKey::Heartbeat, Instant::now() + self.heartbeat.interval());
        }
    }

    async fn on_quality_tick(&mut self, peer_id: &str) {
        let Some(link) = link_in(&mut self.room, peer_id) else {
            return;
        };
        let connection = Arc::clone(link.connection());
        if QualityMonitor::should_stop(connection.as_ref()) {
            debug!(peer_id, "quality monitoring stopped");
            return;
        }
        let sample = self.quality.sample(peer_id, connection.as_ref()).await;
        self.timers.arm(
            TimerKey::Quality(peer_id.to_string()),
            Instant::now() + self.quality.interval(),
        );

        let Some(sample) = sample else {
            return;
        };
        let Some(link) = link_in(&mut self.room, peer_id) else {
            return;
        };
        let changed = link.quality.map(|previous| previous.level) != Some(sample.level);
        link.quality = Some(sample);
        if changed {
            info!(peer_id, level = %sample.level, "connection quality changed");
            self.notify(SessionNotice::QualityChanged {
                peer_id: peer_id.to_string(),
                sample,
            });
        }
    }
}

fn link_in<'a>(room: &'a mut Option<ActiveRoom>, peer_id: &str) -> Option<&'a mut PeerLink> {
    room.as_mut().and_then(|room| room.peers.get_mut(peer_id))
}

fn forward_membership(
    mut changes: mpsc::UnboundedReceiver<MembershipChange>,
    events: mpsc::UnboundedSender<SessionEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(change) = changes.recv().await {
            if events.send(SessionEvent::Membership(change)).is_err() {
                break;
            }
        }
    })
}
