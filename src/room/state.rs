use tokio::task::JoinHandle;

use crate::directory::RoomRecord;
use crate::ice_buffer::IceCandidateBuffer;
use crate::media::{LocalMedia, MediaKind};
use crate::peer::PeerRegistry;
use crate::signaling::{PeerId, SignalingRouter};

/// Everything a session holds while it is in a room. Dropped as a whole on leave.
pub struct ActiveRoom {
    pub self_id: PeerId,
    pub record: RoomRecord,
    pub local_media: LocalMedia,
    pub router: SignalingRouter,
    pub membership: JoinHandle<()>,
    pub peers: PeerRegistry,
    pub candidates: IceCandidateBuffer,
}

impl ActiveRoom {
    pub fn room_code(&self) -> &str {
        &self.record.room_code
    }

    pub fn room_id(&self) -> &str {
        &self.record.id
    }

    pub fn media_state(&self) -> MediaState {
        MediaState {
            video: self.local_media.is_enabled(MediaKind::Video),
            audio: self.local_media.is_enabled(MediaKind::Audio),
        }
    }
}

/// Whether the local tracks of each kind are currently enabled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MediaState {
    pub video: bool,
    pub audio: bool,
}
