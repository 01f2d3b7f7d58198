//! Room sessions: membership, the set of peer links and the single task
//! that drives them.

mod handle;
mod session;
mod state;
mod timers;

use std::sync::Arc;

use chrono::Utc;
use rand::Rng;

use crate::connection::{ConnectionEvent, NegotiationState};
use crate::directory::MembershipChange;
use crate::media::RemoteStream;
use crate::metrics::QualitySample;
use crate::signaling::{PeerId, SignalingMessage};

pub use handle::{SessionCommand, SessionHandle};
pub use session::RoomSession;
pub use state::{ActiveRoom, MediaState};
pub use timers::{TimerKey, TimerTable};

const ROOM_CODE_LEN: usize = 6;
const ROOM_CODE_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Input to the session task from relay, directory and connection callbacks.
#[derive(Debug)]
pub enum SessionEvent {
    Signal(SignalingMessage),
    Membership(MembershipChange),
    Connection {
        peer_id: PeerId,
        event: ConnectionEvent,
    },
}

/// What the presentation layer is told.
#[derive(Debug, Clone)]
pub enum SessionNotice {
    PeerJoined {
        peer_id: PeerId,
        username: String,
    },
    PeerLeft {
        peer_id: PeerId,
    },
    LinkStateChanged {
        peer_id: PeerId,
        state: NegotiationState,
    },
    RemoteStreamCreated {
        peer_id: PeerId,
        stream: Arc<RemoteStream>,
    },
    /// A track was added to the stream announced by `RemoteStreamCreated`.
    RemoteStreamUpdated {
        peer_id: PeerId,
        stream: Arc<RemoteStream>,
    },
    QualityChanged {
        peer_id: PeerId,
        sample: QualitySample,
    },
    PeerUnreachable {
        peer_id: PeerId,
        attempts: u32,
    },
    Error {
        peer_id: Option<PeerId>,
        message: String,
    },
}

/// `peer_<unix millis>_<9 base36 chars>`.
pub fn generate_peer_id() -> PeerId {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..9)
        .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
        .collect();
    format!("peer_{}_{}", Utc::now().timestamp_millis(), suffix)
}

pub fn generate_room_code() -> String {
    let mut rng = rand::thread_rng();
    (0..ROOM_CODE_LEN)
        .map(|_| ROOM_CODE_CHARSET[rng.gen_range(0..ROOM_CODE_CHARSET.len())] as char)
        .collect()
}

/// Room codes are matched case-insensitively by upper-casing what was typed.
pub fn normalize_room_code(code: &str) -> String {
    code.trim().to_uppercase()
}

pub fn is_valid_room_code(code: &str) -> bool {
    code.len() == ROOM_CODE_LEN && code.bytes().all(|b| ROOM_CODE_CHARSET.contains(&b))
}
