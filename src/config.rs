use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::reconnect::{Backoff, RecoveryPolicy};

pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServerConfig {
    pub fn stun(url: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: None,
            credential: None,
        }
    }
}

/// Tunables for one room session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub ice_servers: Vec<IceServerConfig>,
    /// Capacity written into rooms this session creates.
    pub room_capacity: u32,
    /// Per-peer cap on candidates held while a remote description is missing.
    pub max_buffered_candidates: usize,
    pub quality_start_delay: Duration,
    pub quality_interval: Duration,
    pub heartbeat_interval: Duration,
    pub stale_after: Duration,
    pub recovery: RecoveryPolicy,
}

impl SessionConfig {
    /// Defaults overridden by `MESHCALL_*` environment variables.
    pub fn from_env() -> Result<Self> {
        EnvSettings::load(env_source())?.session()
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_STUN_SERVERS
                .iter()
                .map(|url| IceServerConfig::stun(url))
                .collect(),
            room_capacity: 10,
            max_buffered_candidates: 256,
            quality_start_delay: Duration::from_millis(2000),
            quality_interval: Duration::from_millis(1500),
            heartbeat_interval: Duration::from_secs(30),
            stale_after: Duration::from_secs(5 * 60),
            recovery: RecoveryPolicy {
                max_attempts: 5,
                grace: Duration::from_millis(3000),
                offer_backoff: Backoff::new(2000, 1.5, 8000),
                failure_backoff: Backoff::new(1000, 2.0, 10000),
            },
        }
    }
}

/// Endpoints used by the command-line client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub directory_url: String,
    pub directory_key: String,
    pub relay_url: String,
    pub poll_interval: Duration,
    pub control_origin: Option<String>,
}

impl ClientConfig {
    pub fn from_env() -> Result<Self> {
        EnvSettings::load(env_source())?.client()
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            directory_url: "http://127.0.0.1:54321".to_string(),
            directory_key: String::new(),
            relay_url: "ws://127.0.0.1:8080".to_string(),
            poll_interval: Duration::from_millis(2000),
            control_origin: None,
        }
    }
}

fn env_source() -> config::Environment {
    config::Environment::with_prefix("MESHCALL")
}

/// Flat view of the `MESHCALL_*` variables. Unset keys keep the defaults;
/// values that do not parse are an error rather than silently ignored.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct EnvSettings {
    stun_urls: Option<String>,
    turn_url: Option<String>,
    turn_username: Option<String>,
    turn_credential: Option<String>,
    room_capacity: Option<u32>,
    max_buffered_candidates: Option<usize>,
    max_reconnect_attempts: Option<u32>,
    quality_interval_ms: Option<u64>,
    heartbeat_secs: Option<u64>,
    stale_secs: Option<u64>,
    directory_url: Option<String>,
    directory_key: Option<String>,
    relay_url: Option<String>,
    poll_interval_ms: Option<u64>,
    control_origin: Option<String>,
}

impl EnvSettings {
    fn load(source: config::Environment) -> Result<Self> {
        config::Config::builder()
            .add_source(source)
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| Error::Config(e.to_string()))
    }

    fn session(self) -> Result<SessionConfig> {
        let defaults = SessionConfig::default();

        let mut ice_servers = match non_blank(self.stun_urls) {
            Some(urls) => urls
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(IceServerConfig::stun)
                .collect(),
            None => defaults.ice_servers.clone(),
        };
        if let Some(turn) = non_blank(self.turn_url) {
            ice_servers.push(IceServerConfig {
                urls: vec![turn],
                username: self.turn_username,
                credential: self.turn_credential,
            });
        }

        Ok(SessionConfig {
            ice_servers,
            room_capacity: positive("room_capacity", self.room_capacity)?
                .unwrap_or(defaults.room_capacity),
            max_buffered_candidates: positive("max_buffered_candidates", self.max_buffered_candidates)?
                .unwrap_or(defaults.max_buffered_candidates),
            quality_start_delay: defaults.quality_start_delay,
            quality_interval: positive("quality_interval_ms", self.quality_interval_ms)?
                .map(Duration::from_millis)
                .unwrap_or(defaults.quality_interval),
            heartbeat_interval: positive("heartbeat_secs", self.heartbeat_secs)?
                .map(Duration::from_secs)
                .unwrap_or(defaults.heartbeat_interval),
            stale_after: positive("stale_secs", self.stale_secs)?
                .map(Duration::from_secs)
                .unwrap_or(defaults.stale_after),
            recovery: RecoveryPolicy {
                max_attempts: self
                    .max_reconnect_attempts
                    .unwrap_or(defaults.recovery.max_attempts),
                ..defaults.recovery
            },
        })
    }

    fn client(self) -> Result<ClientConfig> {
        let defaults = ClientConfig::default();
        Ok(ClientConfig {
            directory_url: non_blank(self.directory_url).unwrap_or(defaults.directory_url),
            directory_key: self.directory_key.unwrap_or(defaults.directory_key),
            relay_url: non_blank(self.relay_url).unwrap_or(defaults.relay_url),
            poll_interval: positive("poll_interval_ms", self.poll_interval_ms)?
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            control_origin: non_blank(self.control_origin),
        })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn positive<T: Default + PartialEq>(key: &str, value: Option<T>) -> Result<Option<T>> {
    match value {
        Some(v) if v == T::default() => Err(Error::Config(format!(
            "MESHCALL_{} must be greater than zero",
            key.to_uppercase()
        ))),
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_timings() {
        let config = SessionConfig::default();
        assert_eq!(config.room_capacity, 10);
        assert_eq!(config.quality_start_delay, Duration::from_secs(2));
        assert_eq!(config.quality_interval, Duration::from_millis(1500));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.stale_after, Duration::from_secs(300));
        assert_eq!(config.recovery.max_attempts, 5);
        assert_eq!(config.recovery.grace, Duration::from_secs(3));
        assert_eq!(config.ice_servers.len(), 2);
    }

    fn settings(vars: &[(&str, &str)]) -> Result<EnvSettings> {
        EnvSettings::load(
            config::Environment::with_prefix("MESHCALL").source(Some(
                vars.iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            )),
        )
    }

    #[test]
    fn environment_overrides_defaults() {
        let session = settings(&[
            ("MESHCALL_STUN_URLS", "stun:a.example:3478, stun:b.example:3478"),
            ("MESHCALL_TURN_URL", "turn:t.example:3478"),
            ("MESHCALL_TURN_USERNAME", "user"),
            ("MESHCALL_MAX_RECONNECT_ATTEMPTS", "3"),
            ("MESHCALL_QUALITY_INTERVAL_MS", "500"),
        ])
        .unwrap()
        .session()
        .unwrap();
        assert_eq!(session.ice_servers.len(), 3);
        assert_eq!(session.ice_servers[2].username.as_deref(), Some("user"));
        assert_eq!(session.recovery.max_attempts, 3);
        assert_eq!(session.quality_interval, Duration::from_millis(500));
        assert_eq!(session.heartbeat_interval, Duration::from_secs(30));

        let client = settings(&[("MESHCALL_CONTROL_ORIGIN", "  ")])
            .unwrap()
            .client()
            .unwrap();
        assert_eq!(client.control_origin, None);
        assert_eq!(client.poll_interval, Duration::from_millis(2000));
    }

    #[test]
    fn unparseable_values_are_rejected() {
        assert!(settings(&[("MESHCALL_MAX_RECONNECT_ATTEMPTS", "five")]).is_err());
        assert!(settings(&[("MESHCALL_HEARTBEAT_SECS", "30s")]).is_err());
    }

    #[test]
    fn zero_intervals_are_rejected() {
        let err = settings(&[("MESHCALL_QUALITY_INTERVAL_MS", "0")])
            .unwrap()
            .session()
            .unwrap_err();
        assert!(matches!(err, Error::Config(ref m) if m.contains("MESHCALL_QUALITY_INTERVAL_MS")));
        assert!(settings(&[("MESHCALL_HEARTBEAT_SECS", "0")])
            .unwrap()
            .session()
            .is_err());
        assert!(settings(&[("MESHCALL_POLL_INTERVAL_MS", "0")])
            .unwrap()
            .client()
            .is_err());
    }
}
