use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use url::Url;

use super::{Directory, MembershipChange, ParticipantRecord, RoomRecord};
use crate::error::{Error, Result};

/// Directory backed by a PostgREST-style HTTP API with `rooms` and
/// `participants` tables. Membership changes are derived by polling.
#[derive(Clone)]
pub struct RestDirectory {
    http: Client,
    base_url: Url,
    api_key: String,
    poll_interval: Duration,
}

impl RestDirectory {
    pub fn new(base_url: &str, api_key: impl Into<String>, poll_interval: Duration) -> Result<Self> {
        let mut base_url = Url::parse(base_url)
            .map_err(|e| Error::Directory(format!("invalid directory url {}: {}", base_url, e)))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        if poll_interval.is_zero() {
            return Err(Error::Config("directory poll interval must be non-zero".into()));
        }
        Ok(Self {
            http: Client::new(),
            base_url,
            api_key: api_key.into(),
            poll_interval,
        })
    }

    fn table(&self, name: &str) -> Result<Url> {
        self.base_url
            .join(&format!("rest/v1/{}", name))
            .map_err(|e| Error::Directory(e.to_string()))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }

    async fn fetch_participants(&self, room_id: &str) -> Result<Vec<ParticipantRecord>> {
        let mut url = self.table("participants")?;
        url.query_pairs_mut()
            .append_pair("select", "*")
            .append_pair("room_id", &format!("eq.{}", room_id));
        let res = send(self.authorize(self.http.get(url))).await?;
        decode(res).await
    }
}

async fn send(request: RequestBuilder) -> Result<Response> {
    let res = request
        .send()
        .await
        .map_err(|e| Error::Directory(format!("request failed: {}", e)))?;
    if res.status().is_success() {
        Ok(res)
    } else {
        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        Err(Error::Directory(format!("unexpected status: {} body={}", status, body)))
    }
}

async fn decode<T: DeserializeOwned>(res: Response) -> Result<T> {
    res.json::<T>()
        .await
        .map_err(|e| Error::Directory(format!("malformed response: {}", e)))
}

/// Changes between two snapshots of a room's participant set.
fn diff(
    previous: &HashMap<String, ParticipantRecord>,
    current: &HashMap<String, ParticipantRecord>,
) -> Vec<MembershipChange> {
    let mut changes: Vec<MembershipChange> = current
        .iter()
        .filter(|(peer_id, _)| !previous.contains_key(*peer_id))
        .map(|(_, record)| MembershipChange::Joined(record.clone()))
        .collect();
    changes.extend(
        previous
            .iter()
            .filter(|(peer_id, _)| !current.contains_key(*peer_id))
            .map(|(_, record)| MembershipChange::Left(record.clone())),
    );
    changes
}

fn snapshot(records: Vec<ParticipantRecord>) -> HashMap<String, ParticipantRecord> {
    records
        .into_iter()
        .map(|record| (record.peer_id.clone(), record))
        .collect()
}

#[async_trait]
impl Directory for RestDirectory {
    async fn create_room(&self, room_code: &str, max_participants: u32) -> Result<RoomRecord> {
        let url = self.table("rooms")?;
        let body = json!({
            "room_code": room_code,
            "is_active": true,
            "max_participants": max_participants,
        });
        let res = send(
            self.authorize(self.http.post(url))
                .header("Prefer", "return=representation")
                .json(&body),
        )
        .await?;
        let rooms: Vec<RoomRecord> = decode(res).await?;
        rooms
            .into_iter()
            .next()
            .ok_or_else(|| Error::Directory("room insert returned no row".to_string()))
    }

    async fn find_active_room(&self, room_code: &str) -> Result<Option<RoomRecord>> {
        let mut url = self.table("rooms")?;
        url.query_pairs_mut()
            .append_pair("select", "*")
            .append_pair("room_code", &format!("eq.{}", room_code))
            .append_pair("is_active", "eq.true")
            .append_pair("limit", "1");
        let res = send(self.authorize(self.http.get(url))).await?;
        let rooms: Vec<RoomRecord> = decode(res).await?;
        Ok(rooms.into_iter().next())
    }

    async fn insert_participant(&self, participant: &ParticipantRecord) -> Result<()> {
        let url = self.table("participants")?;
        send(self.authorize(self.http.post(url)).json(participant)).await?;
        Ok(())
    }

    async fn list_participants(&self, room_id: &str) -> Result<Vec<ParticipantRecord>> {
        self.fetch_participants(room_id).await
    }

    async fn touch_participant(&self, peer_id: &str) -> Result<()> {
        let mut url = self.table("participants")?;
        url.query_pairs_mut()
            .append_pair("peer_id", &format!("eq.{}", peer_id));
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        send(
            self.authorize(self.http.patch(url))
                .json(&json!({ "last_seen": now })),
        )
        .await?;
        Ok(())
    }

    async fn stale_participants(
        &self,
        room_id: &str,
        max_age: Duration,
    ) -> Result<Vec<ParticipantRecord>> {
        let max_age = chrono::Duration::from_std(max_age)
            .map_err(|e| Error::Directory(format!("invalid stale age: {}", e)))?;
        let threshold = (Utc::now() - max_age).to_rfc3339_opts(SecondsFormat::Millis, true);
        let mut url = self.table("participants")?;
        url.query_pairs_mut()
            .append_pair("select", "*")
            .append_pair("room_id", &format!("eq.{}", room_id))
            .append_pair("last_seen", &format!("lt.{}", threshold));
        let res = send(self.authorize(self.http.get(url))).await?;
        decode(res).await
    }

    async fn delete_participant(&self, peer_id: &str) -> Result<()> {
        let mut url = self.table("participants")?;
        url.query_pairs_mut()
            .append_pair("peer_id", &format!("eq.{}", peer_id));
        send(self.authorize(self.http.delete(url))).await?;
        Ok(())
    }

    async fn watch_participants(
        &self,
        room_id: &str,
    ) -> Result<mpsc::UnboundedReceiver<MembershipChange>> {
        let mut known = snapshot(self.fetch_participants(room_id).await?);
        let (tx, rx) = mpsc::unbounded_channel();
        let directory = self.clone();
        let room_id = room_id.to_string();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(directory.poll_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if tx.is_closed() {
                    break;
                }
                let current = match directory.fetch_participants(&room_id).await {
                    Ok(records) => snapshot(records),
                    Err(e) => {
                        warn!(room_id = %room_id, error = %e, "participant poll failed");
                        continue;
                    }
                };
                for change in diff(&known, &current) {
                    if tx.send(change).is_err() {
                        return;
                    }
                }
                known = current;
            }
            debug!(room_id = %room_id, "stopped watching participants");
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(peer_id: &str) -> ParticipantRecord {
        ParticipantRecord {
            room_id: "room-1".into(),
            peer_id: peer_id.into(),
            username: "Guest".into(),
            is_video_enabled: true,
            is_audio_enabled: false,
        }
    }

    #[test]
    fn table_urls_keep_base_path() {
        let directory =
            RestDirectory::new("https://example.test/project", "key", Duration::from_secs(2)).unwrap();
        assert_eq!(
            directory.table("rooms").unwrap().as_str(),
            "https://example.test/project/rest/v1/rooms"
        );
    }

    #[test]
    fn invalid_url_is_a_directory_error() {
        let err = RestDirectory::new("not a url", "key", Duration::from_secs(2))
            .err()
            .unwrap();
        assert!(matches!(err, Error::Directory(_)));
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let err = RestDirectory::new("https://example.test", "key", Duration::ZERO)
            .err()
            .unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn diff_reports_arrivals_and_departures() {
        let previous = snapshot(vec![record("peer_a"), record("peer_b")]);
        let current = snapshot(vec![record("peer_b"), record("peer_c")]);
        let changes = diff(&previous, &current);
        assert_eq!(changes.len(), 2);
        assert!(changes.contains(&MembershipChange::Joined(record("peer_c"))));
        assert!(changes.contains(&MembershipChange::Left(record("peer_a"))));
    }

    #[test]
    fn participant_rows_deserialize_with_extra_columns() {
        let raw = r#"[{"id":7,"room_id":"room-1","peer_id":"peer_a","username":"Guest","is_video_enabled":true,"is_audio_enabled":false,"last_seen":"2024-01-01T00:00:00Z"}]"#;
        let rows: Vec<ParticipantRecord> = serde_json::from_str(raw).unwrap();
        assert_eq!(rows, vec![record("peer_a")]);
    }
}
