use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::media::{LocalMedia, RemoteTrack};
use crate::metrics::TransportStats;
use crate::room::SessionEvent;
use crate::signaling::{IceCandidate, PeerId, SessionDescription};

/// Low-level connectivity state of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

/// Aggregate connection state of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// The two state signals folded into one verdict.
///
/// Either signal reporting `failed` wins; `connected` needs both signals to agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkHealth {
    Pending,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl LinkHealth {
    pub fn from_states(ice: IceConnectionState, peer: PeerConnectionState) -> Self {
        use IceConnectionState as Ice;
        use PeerConnectionState as Pc;

        if ice == Ice::Failed || peer == Pc::Failed {
            return LinkHealth::Failed;
        }
        if matches!(ice, Ice::Connected | Ice::Completed) && peer == Pc::Connected {
            return LinkHealth::Connected;
        }
        if ice == Ice::Disconnected || peer == Pc::Disconnected {
            return LinkHealth::Disconnected;
        }
        if ice == Ice::Closed || peer == Pc::Closed {
            return LinkHealth::Closed;
        }
        LinkHealth::Pending
    }

    pub fn is_degraded(self) -> bool {
        matches!(self, LinkHealth::Disconnected | LinkHealth::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NegotiationState {
    New,
    Negotiating,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NegotiationState::New => write!(f, "New"),
            NegotiationState::Negotiating => write!(f, "Negotiating"),
            NegotiationState::Connected => write!(f, "Connected"),
            NegotiationState::Disconnected => write!(f, "Disconnected"),
            NegotiationState::Failed => write!(f, "Failed"),
            NegotiationState::Closed => write!(f, "Closed"),
        }
    }
}

/// Something a connection reported from its own callbacks.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    LocalCandidate(IceCandidate),
    IceStateChanged(IceConnectionState),
    PeerStateChanged(PeerConnectionState),
    Track(RemoteTrack),
}

/// Sink handed to a connection so its callbacks reach the owning session.
#[derive(Debug, Clone)]
pub struct ConnectionEvents {
    peer_id: PeerId,
    sink: mpsc::UnboundedSender<SessionEvent>,
}

impl ConnectionEvents {
    pub fn new(peer_id: &str, sink: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            sink,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn emit(&self, event: ConnectionEvent) {
        let _ = self.sink.send(SessionEvent::Connection {
            peer_id: self.peer_id.clone(),
            event,
        });
    }
}

/// One peer-to-peer connection object.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Attaches the shared local tracks.
    async fn add_local_media(&self, media: &LocalMedia) -> Result<()>;
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription>;
    async fn create_answer(&self) -> Result<SessionDescription>;
    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;
    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;
    async fn has_remote_description(&self) -> bool;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;
    fn ice_connection_state(&self) -> IceConnectionState;
    fn connection_state(&self) -> PeerConnectionState;
    async fn stats(&self) -> Result<TransportStats>;
    async fn close(&self) -> Result<()>;

    fn health(&self) -> LinkHealth {
        LinkHealth::from_states(self.ice_connection_state(), self.connection_state())
    }
}

/// Creates connections wired to a session's event stream.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, events: ConnectionEvents) -> Result<Arc<dyn PeerConnection>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use IceConnectionState as Ice;
    use PeerConnectionState as Pc;

    #[test]
    fn failed_on_either_signal_wins() {
        assert_eq!(LinkHealth::from_states(Ice::Failed, Pc::Connected), LinkHealth::Failed);
        assert_eq!(LinkHealth::from_states(Ice::Connected, Pc::Failed), LinkHealth::Failed);
    }

    #[test]
    fn connected_needs_both_signals() {
        assert_eq!(LinkHealth::from_states(Ice::Connected, Pc::Connecting), LinkHealth::Pending);
        assert_eq!(LinkHealth::from_states(Ice::Completed, Pc::Connected), LinkHealth::Connected);
        assert_eq!(
            LinkHealth::from_states(Ice::Connected, Pc::Disconnected),
            LinkHealth::Disconnected
        );
    }

    #[test]
    fn fresh_link_is_pending() {
        assert_eq!(LinkHealth::from_states(Ice::New, Pc::New), LinkHealth::Pending);
        assert_eq!(LinkHealth::from_states(Ice::Checking, Pc::Connecting), LinkHealth::Pending);
    }
}
