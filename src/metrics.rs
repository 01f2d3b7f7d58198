use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::connection::{PeerConnection, PeerConnectionState};
use crate::media::MediaKind;

/// Raw numbers pulled from a connection's stats report.
///
/// Each stream's counters come from the same RTCP receiver report, so the
/// received/lost pair always describes one direction of one stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportStats {
    pub video: Option<StreamStats>,
    pub audio: Option<StreamStats>,
    /// Remote-reported round-trip time, seconds. Worst across streams.
    pub round_trip_time: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamStats {
    pub packets_received: u64,
    pub packets_lost: i64,
    /// Seconds.
    pub jitter: f64,
}

impl StreamStats {
    /// Loss percentage over everything this report has seen.
    pub fn loss_percent(&self) -> f64 {
        let lost = self.packets_lost.max(0) as f64;
        let total = self.packets_received as f64 + lost;
        if total > 0.0 {
            lost / total * 100.0
        } else {
            0.0
        }
    }
}

impl TransportStats {
    /// Folds in one receiver report for a stream we send.
    pub fn record_remote_inbound(
        &mut self,
        kind: MediaKind,
        packets_received: u64,
        packets_lost: i64,
        round_trip_time: Option<f64>,
    ) {
        let stream = match kind {
            MediaKind::Video => &mut self.video,
            MediaKind::Audio => &mut self.audio,
        };
        let stream = stream.get_or_insert_with(StreamStats::default);
        stream.packets_received += packets_received;
        stream.packets_lost += packets_lost;
        if let Some(rtt) = round_trip_time {
            self.round_trip_time = Some(self.round_trip_time.map_or(rtt, |v| v.max(rtt)));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityLevel {
    Excellent,
    Fair,
    Poor,
}

impl fmt::Display for QualityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QualityLevel::Excellent => write!(f, "Excellent"),
            QualityLevel::Fair => write!(f, "Fair"),
            QualityLevel::Poor => write!(f, "Poor"),
        }
    }
}

/// Worst-first classification of one sample.
pub fn classify(packet_loss: f64, jitter_ms: f64, rtt_ms: f64) -> QualityLevel {
    if packet_loss > 5.0 || jitter_ms > 50.0 || rtt_ms > 300.0 {
        QualityLevel::Poor
    } else if packet_loss > 2.0 || jitter_ms > 30.0 || rtt_ms > 150.0 {
        QualityLevel::Fair
    } else {
        QualityLevel::Excellent
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualitySample {
    pub packet_loss: f64, // percentage (0-100)
    pub jitter: f64,      // milliseconds
    pub round_trip_time: f64, // milliseconds
    pub level: QualityLevel,
}

impl QualitySample {
    pub fn new(packet_loss: f64, jitter: f64, round_trip_time: f64) -> Self {
        Self {
            packet_loss,
            jitter,
            round_trip_time,
            level: classify(packet_loss, jitter, round_trip_time),
        }
    }

    pub fn from_stats(stats: &TransportStats) -> Self {
        let (packet_loss, jitter) = match stats.video.as_ref().or(stats.audio.as_ref()) {
            Some(stream) => (stream.loss_percent(), stream.jitter * 1000.0),
            None => (0.0, 0.0),
        };
        let rtt = stats.round_trip_time.unwrap_or(0.0) * 1000.0;
        Self::new(packet_loss, jitter, rtt)
    }
}

/// Sampling cadence and the per-tick stats pull.
#[derive(Debug, Clone)]
pub struct QualityMonitor {
    start_delay: Duration,
    interval: Duration,
}

impl QualityMonitor {
    pub fn new(start_delay: Duration, interval: Duration) -> Self {
        Self {
            start_delay,
            interval,
        }
    }

    pub fn start_delay(&self) -> Duration {
        self.start_delay
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Whether monitoring of this connection should end.
    pub fn should_stop(connection: &dyn PeerConnection) -> bool {
        matches!(
            connection.connection_state(),
            PeerConnectionState::Closed | PeerConnectionState::Failed
        )
    }

    /// One tick. `None` is a missed tick: not connected yet, or stats failed.
    pub async fn sample(&self, peer_id: &str, connection: &dyn PeerConnection) -> Option<QualitySample> {
        if connection.connection_state() != PeerConnectionState::Connected {
            return None;
        }
        match connection.stats().await {
            Ok(stats) => {
                let sample = QualitySample::from_stats(&stats);
                debug!(
                    peer_id,
                    loss = sample.packet_loss,
                    jitter_ms = sample.jitter,
                    rtt_ms = sample.round_trip_time,
                    level = %sample.level,
                    "quality sample"
                );
                Some(sample)
            }
            Err(e) => {
                warn!(peer_id, error = %e, "error monitoring quality");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_thresholds() {
        assert_eq!(classify(0.0, 10.0, 50.0), QualityLevel::Excellent);
        assert_eq!(classify(3.0, 10.0, 50.0), QualityLevel::Fair);
        assert_eq!(classify(6.0, 10.0, 50.0), QualityLevel::Poor);
        assert_eq!(classify(0.0, 0.0, 310.0), QualityLevel::Poor);
        assert_eq!(classify(0.0, 31.0, 0.0), QualityLevel::Fair);
        assert_eq!(classify(0.0, 0.0, 151.0), QualityLevel::Fair);
    }

    #[test]
    fn boundaries_are_exclusive() {
        assert_eq!(classify(2.0, 30.0, 150.0), QualityLevel::Excellent);
        assert_eq!(classify(5.0, 50.0, 300.0), QualityLevel::Fair);
    }

    #[test]
    fn sample_from_stats_converts_units() {
        let stats = TransportStats {
            video: Some(StreamStats {
                packets_received: 97,
                packets_lost: 3,
                jitter: 0.012,
            }),
            audio: None,
            round_trip_time: Some(0.2),
        };
        let sample = QualitySample::from_stats(&stats);
        assert!((sample.packet_loss - 3.0).abs() < 1e-9);
        assert!((sample.jitter - 12.0).abs() < 1e-9);
        assert!((sample.round_trip_time - 200.0).abs() < 1e-9);
        assert_eq!(sample.level, QualityLevel::Fair);
    }

    #[test]
    fn empty_stats_are_excellent() {
        let sample = QualitySample::from_stats(&TransportStats::default());
        assert_eq!(sample.packet_loss, 0.0);
        assert_eq!(sample.level, QualityLevel::Excellent);
    }

    #[test]
    fn loss_pairs_counters_from_one_report() {
        let mut stats = TransportStats::default();
        stats.record_remote_inbound(MediaKind::Video, 980, 20, Some(0.04));
        stats.record_remote_inbound(MediaKind::Audio, 500, 0, Some(0.09));
        let video = stats.video.clone().unwrap();
        assert_eq!(video.packets_received, 980);
        assert_eq!(video.packets_lost, 20);
        assert_eq!(stats.round_trip_time, Some(0.09));

        let sample = QualitySample::from_stats(&stats);
        assert!((sample.packet_loss - 2.0).abs() < 1e-9);
        assert_eq!(sample.level, QualityLevel::Excellent);
    }

    #[test]
    fn audio_only_links_report_audio_loss() {
        let mut stats = TransportStats::default();
        stats.record_remote_inbound(MediaKind::Audio, 90, 10, None);
        let sample = QualitySample::from_stats(&stats);
        assert!((sample.packet_loss - 10.0).abs() < 1e-9);
        assert_eq!(sample.level, QualityLevel::Poor);
        assert_eq!(sample.round_trip_time, 0.0);
    }
}
