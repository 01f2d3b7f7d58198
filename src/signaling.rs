use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::Result;
use crate::relay::{Relay, RelayChannel};
use crate::room::SessionEvent;

pub type PeerId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Session description as carried over the relay: `{"type": "offer", "sdp": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
            username_fragment: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignalingMessage {
    Offer {
        from: PeerId,
        to: PeerId,
        sdp: SessionDescription,
    },
    Answer {
        from: PeerId,
        to: PeerId,
        sdp: SessionDescription,
    },
    Candidate {
        from: PeerId,
        to: PeerId,
        candidate: IceCandidate,
    },
}

impl SignalingMessage {
    pub fn from_peer(&self) -> &str {
        match self {
            SignalingMessage::Offer { from, .. }
            | SignalingMessage::Answer { from, .. }
            | SignalingMessage::Candidate { from, .. } => from,
        }
    }

    pub fn to_peer(&self) -> &str {
        match self {
            SignalingMessage::Offer { to, .. }
            | SignalingMessage::Answer { to, .. }
            | SignalingMessage::Candidate { to, .. } => to,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::Offer { .. } => "offer",
            SignalingMessage::Answer { .. } => "answer",
            SignalingMessage::Candidate { .. } => "candidate",
        }
    }

    pub fn decode(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Per-room signaling endpoint: forwards relay traffic addressed to this
/// participant into the session and sends outbound messages fire-and-forget.
pub struct SignalingRouter {
    self_id: PeerId,
    channel: RelayChannel,
    forwarder: JoinHandle<()>,
}

impl SignalingRouter {
    pub async fn open(
        relay: &dyn Relay,
        room_id: &str,
        self_id: &str,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Self> {
        let mut channel = relay.join(&format!("signaling:{}", room_id)).await?;
        let mut inbound = channel.take_inbound()?;
        let me = self_id.to_string();

        let forwarder = tokio::spawn(async move {
            while let Some(msg) = inbound.recv().await {
                if msg.to_peer() != me {
                    continue;
                }
                if events.send(SessionEvent::Signal(msg)).is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            self_id: self_id.to_string(),
            channel,
            forwarder,
        })
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    /// Whether an inbound message is addressed to this participant.
    pub fn accepts(&self, msg: &SignalingMessage) -> bool {
        msg.to_peer() == self.self_id
    }

    pub fn send_offer(&self, to: &str, sdp: SessionDescription) {
        self.send(SignalingMessage::Offer {
            from: self.self_id.clone(),
            to: to.to_string(),
            sdp,
        });
    }

    pub fn send_answer(&self, to: &str, sdp: SessionDescription) {
        self.send(SignalingMessage::Answer {
            from: self.self_id.clone(),
            to: to.to_string(),
            sdp,
        });
    }

    pub fn send_candidate(&self, to: &str, candidate: IceCandidate) {
        self.send(SignalingMessage::Candidate {
            from: self.self_id.clone(),
            to: to.to_string(),
            candidate,
        });
    }

    /// Not retried; loss is recovered by the reconnection state machine.
    pub fn send(&self, msg: SignalingMessage) {
        debug!(kind = msg.kind(), to = msg.to_peer(), "sending signaling message");
        if self.channel.send(msg).is_err() {
            warn!("signaling relay closed, dropping outbound message");
        }
    }

    pub fn close(self) {
        self.forwarder.abort();
        drop(self.channel);
    }
}
