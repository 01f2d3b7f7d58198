use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;
use webrtc::Error as WebRTCError;

#[derive(Debug, Error)]
pub enum Error {
    /// Room lookup/creation or participant bookkeeping failed.
    #[error("directory service error: {0}")]
    Directory(String),

    #[error("room {0} not found or no longer active")]
    RoomNotFound(String),

    #[error("could not access camera/microphone: {0}")]
    MediaAcquisition(String),

    /// A remote description or candidate could not be applied. The link stays open.
    #[error("negotiation with {peer_id} failed: {reason}")]
    Negotiation { peer_id: String, reason: String },

    #[error("already in room {0}")]
    AlreadyInRoom(String),

    #[error("not in a room")]
    NotInRoom,

    #[error("relay error: {0}")]
    Relay(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("control channel error: {0}")]
    Control(String),

    #[error("session is no longer running")]
    SessionClosed,

    #[error("WebRTC error: {0}")]
    WebRTC(#[from] WebRTCError),

    #[error("WebSocket error: {0}")]
    Ws(#[from] WsError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub(crate) fn negotiation(peer_id: &str, reason: impl ToString) -> Self {
        Error::Negotiation {
            peer_id: peer_id.to_string(),
            reason: reason.to_string(),
        }
    }

}

pub type Result<T> = std::result::Result<T, Error>;
