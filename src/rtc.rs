//! [`Connector`] and [`PeerConnection`] on top of webrtc-rs.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::config::IceServerConfig;
use crate::connection::{
    ConnectionEvent, ConnectionEvents, Connector, IceConnectionState, PeerConnection,
    PeerConnectionState,
};
use crate::error::{Error, Result};
use crate::media::{LocalMedia, MediaKind, RemoteTrack};
use crate::metrics::TransportStats;
use crate::signaling::{IceCandidate, SdpType, SessionDescription};

impl From<RTCIceConnectionState> for IceConnectionState {
    fn from(state: RTCIceConnectionState) -> Self {
        match state {
            RTCIceConnectionState::Unspecified | RTCIceConnectionState::New => IceConnectionState::New,
            RTCIceConnectionState::Checking => IceConnectionState::Checking,
            RTCIceConnectionState::Connected => IceConnectionState::Connected,
            RTCIceConnectionState::Completed => IceConnectionState::Completed,
            RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
            RTCIceConnectionState::Failed => IceConnectionState::Failed,
            RTCIceConnectionState::Closed => IceConnectionState::Closed,
        }
    }
}

impl From<RTCPeerConnectionState> for PeerConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => {
                PeerConnectionState::New
            }
            RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
            RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
            RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
            RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
            RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
        }
    }
}

impl From<&IceServerConfig> for RTCIceServer {
    fn from(server: &IceServerConfig) -> Self {
        RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(candidate: IceCandidate) -> Self {
        RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_m_line_index,
            username_fragment: candidate.username_fragment,
        }
    }
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        IceCandidate {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_m_line_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription> {
    let description = match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp)?,
        SdpType::Answer => RTCSessionDescription::answer(description.sdp)?,
    };
    Ok(description)
}

fn from_rtc_description(description: RTCSessionDescription) -> Result<SessionDescription> {
    match description.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(description.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(description.sdp)),
        other => Err(Error::Other(anyhow::anyhow!(
            "unsupported session description type {:?}",
            other
        ))),
    }
}

/// Builds webrtc-rs peer connections sharing one API instance.
pub struct RtcConnector {
    api: API,
    ice_servers: Vec<RTCIceServer>,
}

impl RtcConnector {
    pub fn new(ice_servers: &[IceServerConfig]) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            api,
            ice_servers: ice_servers.iter().map(RTCIceServer::from).collect(),
        })
    }
}

#[async_trait]
impl Connector for RtcConnector {
    async fn connect(&self, events: ConnectionEvents) -> Result<Arc<dyn PeerConnection>> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let pc = Arc::new(self.api.new_peer_connection(config).await?);
        wire_callbacks(&pc, events);
        Ok(Arc::new(RtcPeerConnection { pc }))
    }
}

fn wire_callbacks(pc: &RTCPeerConnection, events: ConnectionEvents) {
    let sink = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let sink = sink.clone();
        Box::pin(async move {
            // `None` marks the end of gathering.
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => sink.emit(ConnectionEvent::LocalCandidate(init.into())),
                Err(e) => warn!(peer_id = sink.peer_id(), error = %e, "failed to serialize local candidate"),
            }
        })
    }));

    let sink = events.clone();
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        let sink = sink.clone();
        Box::pin(async move {
            debug!(peer_id = sink.peer_id(), %state, "ICE connection state changed");
            sink.emit(ConnectionEvent::IceStateChanged(state.into()));
        })
    }));

    let sink = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let sink = sink.clone();
        Box::pin(async move {
            debug!(peer_id = sink.peer_id(), %state, "peer connection state changed");
            sink.emit(ConnectionEvent::PeerStateChanged(state.into()));
        })
    }));

    let sink = events;
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>, _: Arc<RTCRtpReceiver>, _: Arc<RTCRtpTransceiver>| {
            let sink = sink.clone();
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Audio => MediaKind::Audio,
                    RTPCodecType::Video => MediaKind::Video,
                    _ => return,
                };
                sink.emit(ConnectionEvent::Track(RemoteTrack {
                    id: track.id(),
                    kind,
                    source: Some(track),
                }));
            })
        },
    ));
}

pub struct RtcPeerConnection {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerConnection for RtcPeerConnection {
    async fn add_local_media(&self, media: &LocalMedia) -> Result<()> {
        for local in media.tracks() {
            let sender = self
                .pc
                .add_track(local.track() as Arc<dyn TrackLocal + Send + Sync>)
                .await?;
            // Drain RTCP so the interceptors keep running.
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1500];
                while sender.read(&mut buf).await.is_ok() {}
            });
        }
        info!(tracks = media.tracks().len(), "attached local tracks");
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        let options = ice_restart.then(|| RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        });
        let offer = self.pc.create_offer(options).await?;
        from_rtc_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await?;
        from_rtc_description(answer)
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.pc
            .set_local_description(to_rtc_description(description)?)
            .await?;
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.pc
            .set_remote_description(to_rtc_description(description)?)
            .await?;
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc.add_ice_candidate(candidate.into()).await?;
        Ok(())
    }

    fn ice_connection_state(&self) -> IceConnectionState {
        self.pc.ice_connection_state().into()
    }

    fn connection_state(&self) -> PeerConnectionState {
        self.pc.connection_state().into()
    }

    async fn stats(&self) -> Result<TransportStats> {
        let report = self.pc.get_stats().await;
        let mut stats = TransportStats::default();
        for entry in report.reports.values() {
            // Inbound RTP reports carry no loss counters in webrtc-rs, so
            // quality is judged from what the peer reports about our streams.
            if let StatsReportType::RemoteInboundRTP(remote) = entry {
                let kind = if remote.kind == "video" {
                    MediaKind::Video
                } else if remote.kind == "audio" {
                    MediaKind::Audio
                } else {
                    continue;
                };
                stats.record_remote_inbound(
                    kind,
                    remote.packets_received,
                    remote.packets_lost,
                    remote.round_trip_time,
                );
            }
        }
        Ok(stats)
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unspecified_states_read_as_new() {
        assert_eq!(
            IceConnectionState::from(RTCIceConnectionState::Unspecified),
            IceConnectionState::New
        );
        assert_eq!(
            PeerConnectionState::from(RTCPeerConnectionState::Failed),
            PeerConnectionState::Failed
        );
    }

    #[test]
    fn candidate_fields_survive_conversion() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 2130706431 10.0.0.1 5000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
            username_fragment: None,
        };
        let init: RTCIceCandidateInit = candidate.clone().into();
        assert_eq!(init.sdp_mline_index, Some(0));
        assert_eq!(IceCandidate::from(init), candidate);
    }

    #[test]
    fn turn_credentials_are_passed_through() {
        let server = IceServerConfig {
            urls: vec!["turn:turn.example:3478".into()],
            username: Some("user".into()),
            credential: Some("secret".into()),
        };
        let rtc = RTCIceServer::from(&server);
        assert_eq!(rtc.username, "user");
        assert_eq!(rtc.credential, "secret");
    }

    #[tokio::test]
    async fn connector_builds_connections() {
        let connector = RtcConnector::new(&[]).unwrap();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let connection = connector
            .connect(ConnectionEvents::new("peer_b", tx))
            .await
            .unwrap();
        assert_eq!(connection.ice_connection_state(), IceConnectionState::New);
        assert!(!connection.has_remote_description().await);
        connection.close().await.unwrap();
    }
}
