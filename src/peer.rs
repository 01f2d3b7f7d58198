use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::connection::{ConnectionEvents, Connector, LinkHealth, NegotiationState, PeerConnection};
use crate::error::{Error, Result};
use crate::ice_buffer::IceCandidateBuffer;
use crate::media::{LocalMedia, RemoteStream, RemoteTrack};
use crate::metrics::QualitySample;
use crate::reconnect::ReconnectRecord;
use crate::signaling::{IceCandidate, PeerId, SessionDescription};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Initiator,
    Responder,
}

/// How a remote track changed the peer's stream.
#[derive(Debug, Clone)]
pub enum StreamChange {
    Created(Arc<RemoteStream>),
    Updated(Arc<RemoteStream>),
}

/// One remote participant: the connection, its remote media and its
/// recovery/quality bookkeeping.
pub struct PeerLink {
    peer_id: PeerId,
    role: Role,
    connection: Arc<dyn PeerConnection>,
    state: NegotiationState,
    /// A local offer is out and its answer has not been applied yet.
    offer_pending: bool,
    remote_stream: Option<Arc<RemoteStream>>,
    pub(crate) recovery: ReconnectRecord,
    pub(crate) quality: Option<QualitySample>,
}

impl PeerLink {
    /// Creates the connection and attaches the shared local tracks.
    pub async fn open(
        peer_id: &str,
        role: Role,
        connector: &dyn Connector,
        events: ConnectionEvents,
        local_media: &LocalMedia,
    ) -> Result<Self> {
        let connection = connector.connect(events).await?;
        connection.add_local_media(local_media).await?;
        info!(peer_id, ?role, "created peer link");
        Ok(Self {
            peer_id: peer_id.to_string(),
            role,
            connection,
            state: NegotiationState::New,
            offer_pending: false,
            remote_stream: None,
            recovery: ReconnectRecord::default(),
            quality: None,
        })
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn connection(&self) -> &Arc<dyn PeerConnection> {
        &self.connection
    }

    pub fn remote_stream(&self) -> Option<&Arc<RemoteStream>> {
        self.remote_stream.as_ref()
    }

    pub fn quality(&self) -> Option<QualitySample> {
        self.quality
    }

    pub fn attempts(&self) -> u32 {
        self.recovery.attempts
    }

    pub fn has_pending_offer(&self) -> bool {
        self.offer_pending
    }

    /// Produces a local offer and sets it as the local description.
    pub async fn create_offer(&mut self, ice_restart: bool) -> Result<SessionDescription> {
        let offer = self.connection.create_offer(ice_restart).await?;
        self.connection.set_local_description(offer.clone()).await?;
        self.state = NegotiationState::Negotiating;
        self.offer_pending = true;
        debug!(peer_id = %self.peer_id, ice_restart, "local offer ready");
        Ok(offer)
    }

    /// Applies a remote offer, flushes buffered candidates and answers.
    pub async fn accept_offer(
        &mut self,
        offer: SessionDescription,
        buffer: &mut IceCandidateBuffer,
    ) -> Result<SessionDescription> {
        self.connection
            .set_remote_description(offer)
            .await
            .map_err(|e| Error::negotiation(&self.peer_id, e))?;
        buffer.flush(&self.peer_id, self.connection.as_ref()).await;

        let answer = self
            .connection
            .create_answer()
            .await
            .map_err(|e| Error::negotiation(&self.peer_id, e))?;
        self.connection
            .set_local_description(answer.clone())
            .await
            .map_err(|e| Error::negotiation(&self.peer_id, e))?;
        if self.state != NegotiationState::Connected {
            self.state = NegotiationState::Negotiating;
        }
        self.offer_pending = false;
        Ok(answer)
    }

    pub async fn accept_answer(
        &mut self,
        answer: SessionDescription,
        buffer: &mut IceCandidateBuffer,
    ) -> Result<()> {
        self.connection
            .set_remote_description(answer)
            .await
            .map_err(|e| Error::negotiation(&self.peer_id, e))?;
        self.offer_pending = false;
        buffer.flush(&self.peer_id, self.connection.as_ref()).await;
        Ok(())
    }

    /// Applies a remote candidate now, or buffers it until the remote
    /// description is known.
    pub async fn add_remote_candidate(
        &mut self,
        candidate: IceCandidate,
        buffer: &mut IceCandidateBuffer,
    ) -> Result<()> {
        if self.connection.has_remote_description().await {
            self.connection
                .add_ice_candidate(candidate)
                .await
                .map_err(|e| Error::negotiation(&self.peer_id, e))
        } else {
            buffer.enqueue(&self.peer_id, candidate);
            Ok(())
        }
    }

    /// Merges a remote track into the peer's single stream object.
    pub fn attach_remote_track(&mut self, track: RemoteTrack) -> StreamChange {
        debug!(peer_id = %self.peer_id, kind = ?track.kind, "received remote track");
        match &self.remote_stream {
            Some(stream) => {
                stream.add_track(track);
                StreamChange::Updated(Arc::clone(stream))
            }
            None => {
                let stream = Arc::new(RemoteStream::new(&self.peer_id));
                stream.add_track(track);
                self.remote_stream = Some(Arc::clone(&stream));
                StreamChange::Created(stream)
            }
        }
    }

    /// Re-reads both state signals and moves the negotiation state along.
    pub fn observe_health(&mut self) -> LinkHealth {
        let health = self.connection.health();
        if self.state == NegotiationState::Closed {
            return health;
        }
        self.state = match health {
            LinkHealth::Connected => NegotiationState::Connected,
            LinkHealth::Disconnected => NegotiationState::Disconnected,
            LinkHealth::Failed => NegotiationState::Failed,
            LinkHealth::Closed => NegotiationState::Closed,
            LinkHealth::Pending => self.state,
        };
        health
    }

    pub async fn close(&mut self) {
        if self.state == NegotiationState::Closed {
            return;
        }
        self.state = NegotiationState::Closed;
        self.quality = None;
        if let Err(e) = self.connection.close().await {
            warn!(peer_id = %self.peer_id, error = %e, "error closing peer connection");
        }
    }
}

/// All links of one session, keyed by remote peer identifier.
#[derive(Default)]
pub struct PeerRegistry {
    links: HashMap<PeerId, PeerLink>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.links.contains_key(peer_id)
    }

    pub fn get(&self, peer_id: &str) -> Option<&PeerLink> {
        self.links.get(peer_id)
    }

    pub fn get_mut(&mut self, peer_id: &str) -> Option<&mut PeerLink> {
        self.links.get_mut(peer_id)
    }

    /// Inserts unless a link for the peer already exists; returns the link
    /// that is registered afterwards.
    pub fn insert(&mut self, link: PeerLink) -> &mut PeerLink {
        self.links.entry(link.peer_id.clone()).or_insert(link)
    }

    pub fn remove(&mut self, peer_id: &str) -> Option<PeerLink> {
        self.links.remove(peer_id)
    }

    pub fn ids(&self) -> Vec<PeerId> {
        self.links.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn drain(&mut self) -> Vec<PeerLink> {
        self.links.drain().map(|(_, link)| link).collect()
    }
}
