use std::time::Duration;

use tracing::{debug, info, warn};

use crate::directory::Directory;
use crate::error::Result;
use crate::signaling::PeerId;

/// Liveness refresh for this participant plus a room-wide sweep of
/// participants that stopped refreshing theirs.
#[derive(Debug, Clone, Copy)]
pub struct PresenceHeartbeat {
    interval: Duration,
    stale_after: Duration,
}

impl PresenceHeartbeat {
    pub fn new(interval: Duration, stale_after: Duration) -> Self {
        Self {
            interval,
            stale_after,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// One heartbeat: touch our own record, then sweep. A failed touch is
    /// logged and does not prevent the sweep.
    pub async fn beat(
        &self,
        directory: &dyn Directory,
        room_id: &str,
        self_id: &str,
    ) -> Result<Vec<PeerId>> {
        if let Err(e) = directory.touch_participant(self_id).await {
            warn!(peer_id = self_id, error = %e, "failed to refresh presence");
        }
        self.sweep(directory, room_id, self_id).await
    }

    /// Deletes the records of stale participants and returns their ids. Our
    /// own record is never swept.
    pub async fn sweep(
        &self,
        directory: &dyn Directory,
        room_id: &str,
        self_id: &str,
    ) -> Result<Vec<PeerId>> {
        let stale = directory.stale_participants(room_id, self.stale_after).await?;
        let mut removed = Vec::new();
        for record in stale {
            if record.peer_id == self_id {
                continue;
            }
            match directory.delete_participant(&record.peer_id).await {
                Ok(()) => {
                    info!(peer_id = %record.peer_id, "removed stale participant");
                    removed.push(record.peer_id);
                }
                Err(e) => warn!(peer_id = %record.peer_id, error = %e, "failed to remove stale participant"),
            }
        }
        debug!(room_id, removed = removed.len(), "presence sweep done");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{MemoryDirectory, ParticipantRecord};

    fn participant(room_id: &str, peer_id: &str) -> ParticipantRecord {
        ParticipantRecord {
            room_id: room_id.to_string(),
            peer_id: peer_id.to_string(),
            username: "Guest".to_string(),
            is_video_enabled: true,
            is_audio_enabled: true,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn beat_keeps_self_and_sweeps_silent_peers() {
        let directory = MemoryDirectory::new();
        let room = directory.create_room("ABC123", 10).await.unwrap();
        directory.insert_participant(&participant(&room.id, "me")).await.unwrap();
        directory.insert_participant(&participant(&room.id, "ghost")).await.unwrap();

        let heartbeat = PresenceHeartbeat::new(Duration::from_secs(30), Duration::from_secs(300));
        tokio::time::advance(Duration::from_secs(301)).await;

        let removed = heartbeat.beat(&directory, &room.id, "me").await.unwrap();
        assert_eq!(removed, vec!["ghost".to_string()]);
        assert!(directory.participant("me").is_some());
        assert!(directory.participant("ghost").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_never_removes_self() {
        let directory = MemoryDirectory::new();
        let room = directory.create_room("ABC123", 10).await.unwrap();
        directory.insert_participant(&participant(&room.id, "me")).await.unwrap();
        tokio::time::advance(Duration::from_secs(600)).await;

        let heartbeat = PresenceHeartbeat::new(Duration::from_secs(30), Duration::from_secs(300));
        let removed = heartbeat.sweep(&directory, &room.id, "me").await.unwrap();
        assert!(removed.is_empty());
        assert!(directory.participant("me").is_some());
    }
}
