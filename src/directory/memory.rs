use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::{Directory, MembershipChange, ParticipantRecord, RoomRecord};
use crate::error::{Error, Result};

#[derive(Default)]
struct Inner {
    next_room: u64,
    rooms: HashMap<String, RoomRecord>,
    participants: HashMap<String, (ParticipantRecord, Instant)>,
    watchers: Vec<(String, mpsc::UnboundedSender<MembershipChange>)>,
    unavailable: bool,
}

impl Inner {
    fn check(&self) -> Result<()> {
        if self.unavailable {
            return Err(Error::Directory("directory unavailable".to_string()));
        }
        Ok(())
    }

    fn notify(&mut self, room_id: &str, change: MembershipChange) {
        self.watchers.retain(|(room, tx)| {
            if room != room_id {
                return !tx.is_closed();
            }
            tx.send(change.clone()).is_ok()
        });
    }
}

/// In-process directory on the tokio clock.
#[derive(Default)]
pub struct MemoryDirectory {
    inner: Mutex<Inner>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail with a directory error until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.lock().unavailable = unavailable;
    }

    pub fn deactivate_room(&self, room_code: &str) {
        let mut inner = self.inner.lock();
        for room in inner.rooms.values_mut() {
            if room.room_code == room_code {
                room.is_active = false;
            }
        }
    }

    pub fn participant(&self, peer_id: &str) -> Option<ParticipantRecord> {
        self.inner
            .lock()
            .participants
            .get(peer_id)
            .map(|(record, _)| record.clone())
    }

    pub fn room_by_code(&self, room_code: &str) -> Option<RoomRecord> {
        self.inner
            .lock()
            .rooms
            .values()
            .find(|room| room.room_code == room_code)
            .cloned()
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn create_room(&self, room_code: &str, max_participants: u32) -> Result<RoomRecord> {
        let mut inner = self.inner.lock();
        inner.check()?;
        if inner
            .rooms
            .values()
            .any(|room| room.is_active && room.room_code == room_code)
        {
            return Err(Error::Directory(format!("room code {} already in use", room_code)));
        }
        inner.next_room += 1;
        let room = RoomRecord {
            id: format!("room-{}", inner.next_room),
            room_code: room_code.to_string(),
            is_active: true,
            max_participants,
        };
        inner.rooms.insert(room.id.clone(), room.clone());
        Ok(room)
    }

    async fn find_active_room(&self, room_code: &str) -> Result<Option<RoomRecord>> {
        let inner = self.inner.lock();
        inner.check()?;
        Ok(inner
            .rooms
            .values()
            .find(|room| room.is_active && room.room_code == room_code)
            .cloned())
    }

    async fn insert_participant(&self, participant: &ParticipantRecord) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check()?;
        inner.participants.insert(
            participant.peer_id.clone(),
            (participant.clone(), Instant::now()),
        );
        let room_id = participant.room_id.clone();
        inner.notify(&room_id, MembershipChange::Joined(participant.clone()));
        Ok(())
    }

    async fn list_participants(&self, room_id: &str) -> Result<Vec<ParticipantRecord>> {
        let inner = self.inner.lock();
        inner.check()?;
        Ok(inner
            .participants
            .values()
            .filter(|(record, _)| record.room_id == room_id)
            .map(|(record, _)| record.clone())
            .collect())
    }

    async fn touch_participant(&self, peer_id: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check()?;
        if let Some((_, last_seen)) = inner.participants.get_mut(peer_id) {
            *last_seen = Instant::now();
        }
        Ok(())
    }

    async fn stale_participants(
        &self,
        room_id: &str,
        max_age: Duration,
    ) -> Result<Vec<ParticipantRecord>> {
        let inner = self.inner.lock();
        inner.check()?;
        let now = Instant::now();
        Ok(inner
            .participants
            .values()
            .filter(|(record, last_seen)| {
                record.room_id == room_id && now.duration_since(*last_seen) > max_age
            })
            .map(|(record, _)| record.clone())
            .collect())
    }

    async fn delete_participant(&self, peer_id: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check()?;
        if let Some((record, _)) = inner.participants.remove(peer_id) {
            let room_id = record.room_id.clone();
            inner.notify(&room_id, MembershipChange::Left(record));
        }
        Ok(())
    }

    async fn watch_participants(
        &self,
        room_id: &str,
    ) -> Result<mpsc::UnboundedReceiver<MembershipChange>> {
        let mut inner = self.inner.lock();
        inner.check()?;
        let (tx, rx) = mpsc::unbounded_channel();
        inner.watchers.push((room_id.to_string(), tx));
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn participant(room_id: &str, peer_id: &str) -> ParticipantRecord {
        ParticipantRecord {
            room_id: room_id.to_string(),
            peer_id: peer_id.to_string(),
            username: peer_id.to_uppercase(),
            is_video_enabled: true,
            is_audio_enabled: true,
        }
    }

    #[tokio::test]
    async fn inactive_rooms_are_not_found() {
        let directory = MemoryDirectory::new();
        directory.create_room("ABC123", 10).await.unwrap();
        assert!(directory.find_active_room("ABC123").await.unwrap().is_some());
        directory.deactivate_room("ABC123");
        assert!(directory.find_active_room("ABC123").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn watchers_see_inserts_and_deletes() {
        let directory = MemoryDirectory::new();
        let room = directory.create_room("ABC123", 10).await.unwrap();
        let mut changes = directory.watch_participants(&room.id).await.unwrap();

        directory
            .insert_participant(&participant(&room.id, "peer_a"))
            .await
            .unwrap();
        directory.delete_participant("peer_a").await.unwrap();

        assert!(matches!(changes.recv().await, Some(MembershipChange::Joined(p)) if p.peer_id == "peer_a"));
        assert!(matches!(changes.recv().await, Some(MembershipChange::Left(p)) if p.peer_id == "peer_a"));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_participants_use_last_seen() {
        let directory = MemoryDirectory::new();
        let room = directory.create_room("ABC123", 10).await.unwrap();
        directory
            .insert_participant(&participant(&room.id, "peer_a"))
            .await
            .unwrap();
        directory
            .insert_participant(&participant(&room.id, "peer_b"))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(200)).await;
        directory.touch_participant("peer_b").await.unwrap();
        tokio::time::advance(Duration::from_secs(150)).await;

        let stale = directory
            .stale_participants(&room.id, Duration::from_secs(300))
            .await
            .unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].peer_id, "peer_a");
    }

    #[tokio::test]
    async fn unavailable_directory_errors() {
        let directory = MemoryDirectory::new();
        directory.set_unavailable(true);
        assert!(matches!(
            directory.create_room("ABC123", 10).await,
            Err(Error::Directory(_))
        ));
    }
}
