//! Room and participant records.
//!
//! The directory is an external store; [`MemoryDirectory`] keeps everything in
//! process and [`RestDirectory`] talks to a PostgREST-style HTTP API.

mod memory;
mod rest;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::signaling::PeerId;

pub use memory::MemoryDirectory;
pub use rest::RestDirectory;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomRecord {
    pub id: String,
    pub room_code: String,
    pub is_active: bool,
    pub max_participants: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantRecord {
    pub room_id: String,
    pub peer_id: PeerId,
    pub username: String,
    pub is_video_enabled: bool,
    pub is_audio_enabled: bool,
}

/// Row-level change on a room's participant set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipChange {
    Joined(ParticipantRecord),
    Left(ParticipantRecord),
}

#[async_trait]
pub trait Directory: Send + Sync {
    async fn create_room(&self, room_code: &str, max_participants: u32) -> Result<RoomRecord>;

    /// Looks up an active room by its (already upper-cased) code.
    async fn find_active_room(&self, room_code: &str) -> Result<Option<RoomRecord>>;

    async fn insert_participant(&self, participant: &ParticipantRecord) -> Result<()>;

    async fn list_participants(&self, room_id: &str) -> Result<Vec<ParticipantRecord>>;

    /// Refreshes the participant's last-seen time.
    async fn touch_participant(&self, peer_id: &str) -> Result<()>;

    /// Participants of the room not seen for longer than `max_age`.
    async fn stale_participants(
        &self,
        room_id: &str,
        max_age: Duration,
    ) -> Result<Vec<ParticipantRecord>>;

    async fn delete_participant(&self, peer_id: &str) -> Result<()>;

    /// Insert/delete notifications for one room's participants.
    async fn watch_participants(
        &self,
        room_id: &str,
    ) -> Result<mpsc::UnboundedReceiver<MembershipChange>>;
}
