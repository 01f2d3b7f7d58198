use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use crate::error::{Error, Result};
use crate::signaling::PeerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

/// What the participant asked for when joining.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaPolicy {
    pub video: bool,
    pub audio: bool,
}

impl Default for MediaPolicy {
    fn default() -> Self {
        Self {
            video: true,
            audio: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureRequest {
    pub video: Option<Resolution>,
    pub audio: bool,
}

impl From<MediaPolicy> for CaptureRequest {
    fn from(policy: MediaPolicy) -> Self {
        Self {
            video: policy.video.then_some(Resolution {
                width: 1280,
                height: 720,
            }),
            audio: policy.audio,
        }
    }
}

/// A local track shared read-only by every link.
#[derive(Clone)]
pub struct LocalTrack {
    kind: MediaKind,
    track: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
}

impl LocalTrack {
    pub fn new(kind: MediaKind, track: Arc<TrackLocalStaticSample>) -> Self {
        Self {
            kind,
            track,
            enabled: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.track)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Feeds one encoded frame; dropped while the track is disabled.
    pub async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        self.track
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await?;
        Ok(())
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

type StopHook = Box<dyn FnOnce() + Send + Sync>;

/// The captured local media. Stopping consumes it, so it can only happen once.
pub struct LocalMedia {
    tracks: Vec<LocalTrack>,
    on_stop: Option<StopHook>,
}

impl LocalMedia {
    pub fn new(tracks: Vec<LocalTrack>) -> Self {
        Self {
            tracks,
            on_stop: None,
        }
    }

    /// Runs `hook` when the media is stopped, e.g. to release a capture device.
    pub fn with_stop_hook(mut self, hook: impl FnOnce() + Send + Sync + 'static) -> Self {
        self.on_stop = Some(Box::new(hook));
        self
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn has(&self, kind: MediaKind) -> bool {
        self.tracks.iter().any(|t| t.kind == kind)
    }

    pub fn is_enabled(&self, kind: MediaKind) -> bool {
        self.tracks
            .iter()
            .filter(|t| t.kind == kind)
            .any(LocalTrack::is_enabled)
    }

    /// Flips every track of `kind`; false when there is no such track.
    pub fn toggle(&self, kind: MediaKind) -> bool {
        if !self.has(kind) {
            return false;
        }
        let enabled = !self.is_enabled(kind);
        for track in self.tracks.iter().filter(|t| t.kind == kind) {
            track.set_enabled(enabled);
        }
        enabled
    }

    pub fn stop(mut self) {
        for track in &self.tracks {
            track.set_enabled(false);
        }
        if let Some(hook) = self.on_stop.take() {
            hook();
        }
        info!(tracks = self.tracks.len(), "local media stopped");
    }
}

impl fmt::Debug for LocalMedia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalMedia")
            .field("tracks", &self.tracks)
            .finish()
    }
}

#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Fails with `MediaAcquisition` on permission denial or missing devices.
    async fn acquire(&self, request: CaptureRequest) -> Result<LocalMedia>;
}

/// Builds encoded-sample tracks that an external capture pipeline feeds.
#[derive(Debug, Clone)]
pub struct TrackMediaSource {
    stream_id: String,
}

impl TrackMediaSource {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
        }
    }
}

impl Default for TrackMediaSource {
    fn default() -> Self {
        Self::new("meshcall")
    }
}

#[async_trait]
impl MediaSource for TrackMediaSource {
    async fn acquire(&self, request: CaptureRequest) -> Result<LocalMedia> {
        if request.video.is_none() && !request.audio {
            return Err(Error::MediaAcquisition(
                "at least one of audio or video must be requested".to_string(),
            ));
        }

        let mut tracks = Vec::new();
        if request.audio {
            let track = TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_owned(),
                    clock_rate: 48000,
                    channels: 2,
                    ..Default::default()
                },
                "audio".to_owned(),
                self.stream_id.clone(),
            );
            tracks.push(LocalTrack::new(MediaKind::Audio, Arc::new(track)));
        }
        if let Some(resolution) = request.video {
            debug!(
                width = resolution.width,
                height = resolution.height,
                "creating local video track"
            );
            let track = TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_owned(),
                    clock_rate: 90000,
                    ..Default::default()
                },
                "video".to_owned(),
                self.stream_id.clone(),
            );
            tracks.push(LocalTrack::new(MediaKind::Video, Arc::new(track)));
        }

        Ok(LocalMedia::new(tracks))
    }
}

/// A track received from a remote peer.
#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: MediaKind,
    pub source: Option<Arc<TrackRemote>>,
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Per-peer remote stream. Presentation keys off the identity of this object,
/// so new tracks are added to it in place rather than replacing it.
#[derive(Debug)]
pub struct RemoteStream {
    peer_id: PeerId,
    tracks: RwLock<Vec<RemoteTrack>>,
}

impl RemoteStream {
    pub fn new(peer_id: &str) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            tracks: RwLock::new(Vec::new()),
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn add_track(&self, track: RemoteTrack) {
        self.tracks.write().push(track);
    }

    pub fn tracks(&self) -> Vec<RemoteTrack> {
        self.tracks.read().clone()
    }

    pub fn len(&self) -> usize {
        self.tracks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn nothing_requested_is_an_acquisition_error() {
        let source = TrackMediaSource::default();
        let err = source
            .acquire(MediaPolicy { video: false, audio: false }.into())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MediaAcquisition(_)));
    }

    #[tokio::test]
    async fn toggle_flips_only_existing_kinds() {
        let source = TrackMediaSource::default();
        let media = source
            .acquire(MediaPolicy { video: false, audio: true }.into())
            .await
            .unwrap();
        assert!(!media.toggle(MediaKind::Video));
        assert!(!media.toggle(MediaKind::Audio));
        assert!(media.toggle(MediaKind::Audio));
    }

    #[tokio::test]
    async fn stop_runs_hook() {
        let stops = Arc::new(AtomicUsize::new(0));
        let counter = stops.clone();
        let media = TrackMediaSource::default()
            .acquire(MediaPolicy::default().into())
            .await
            .unwrap()
            .with_stop_hook(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        media.stop();
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn remote_stream_grows_in_place() {
        let stream = Arc::new(RemoteStream::new("peer_b"));
        let same = Arc::clone(&stream);
        stream.add_track(RemoteTrack {
            id: "audio".into(),
            kind: MediaKind::Audio,
            source: None,
        });
        assert_eq!(same.len(), 1);
        assert!(Arc::ptr_eq(&stream, &same));
    }
}
