//! Embedding channel: `{"type": "callconnect:<command>", "data": {...}}`
//! messages from a host page, and notifications sent back to it.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::media::MediaPolicy;
use crate::room::SessionHandle;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbedMode {
    Video,
    Audio,
    #[default]
    Both,
}

impl EmbedMode {
    pub fn policy(self) -> MediaPolicy {
        MediaPolicy {
            video: matches!(self, EmbedMode::Video | EmbedMode::Both),
            audio: matches!(self, EmbedMode::Audio | EmbedMode::Both),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Create { username: Option<String> },
    Join { room_code: String, username: Option<String> },
    Leave,
    /// Desired state; only flips the track when it differs from the current one.
    ToggleVideo { enabled: bool },
    ToggleAudio { enabled: bool },
}

#[derive(Deserialize)]
struct RawMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RoomData {
    room_code: Option<String>,
    username: Option<String>,
}

#[derive(Deserialize)]
struct ToggleData {
    enabled: bool,
}

impl ControlCommand {
    /// Parses one message. Unknown `type` tags are rejected.
    pub fn parse(raw: &str) -> Result<Self> {
        let message: RawMessage = serde_json::from_str(raw)?;
        let room_data = |data: Value| -> Result<RoomData> {
            if data.is_null() {
                Ok(RoomData::default())
            } else {
                Ok(serde_json::from_value(data)?)
            }
        };

        match message.kind.as_str() {
            "callconnect:create" => Ok(ControlCommand::Create {
                username: non_empty(room_data(message.data)?.username),
            }),
            "callconnect:join" => {
                let data = room_data(message.data)?;
                let room_code = non_empty(data.room_code)
                    .ok_or_else(|| Error::Control("join requires a roomCode".to_string()))?;
                Ok(ControlCommand::Join {
                    room_code,
                    username: non_empty(data.username),
                })
            }
            "callconnect:leave" => Ok(ControlCommand::Leave),
            "callconnect:toggleVideo" => {
                let data: ToggleData = serde_json::from_value(message.data)?;
                Ok(ControlCommand::ToggleVideo {
                    enabled: data.enabled,
                })
            }
            "callconnect:toggleAudio" => {
                let data: ToggleData = serde_json::from_value(message.data)?;
                Ok(ControlCommand::ToggleAudio {
                    enabled: data.enabled,
                })
            }
            other => Err(Error::Control(format!("unknown message type {}", other))),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinAction {
    Created,
    Joined,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ControlNotification {
    #[serde(rename = "callconnect:ready")]
    Ready { mode: EmbedMode },
    #[serde(rename = "callconnect:joined")]
    Joined {
        #[serde(rename = "roomCode")]
        room_code: String,
        action: JoinAction,
    },
    #[serde(rename = "callconnect:left")]
    Left {},
    #[serde(rename = "callconnect:error")]
    Error { message: String },
}

/// Origin check in front of [`ControlCommand::parse`].
#[derive(Debug, Clone)]
pub struct ControlChannel {
    expected_origin: Option<String>,
}

impl ControlChannel {
    pub fn new(expected_origin: Option<String>) -> Self {
        Self { expected_origin }
    }

    pub fn expected_origin(&self) -> Option<&str> {
        self.expected_origin.as_deref()
    }

    /// Returns the command if the message came from the expected origin and
    /// parses. Everything is dropped when no origin was configured.
    pub fn accept(&self, origin: &str, raw: &str) -> Option<ControlCommand> {
        let Some(expected) = self.expected_origin.as_deref() else {
            error!("no control origin configured, dropping message");
            return None;
        };
        if origin != expected {
            warn!(origin, "ignoring message from untrusted origin");
            return None;
        }
        match ControlCommand::parse(raw) {
            Ok(command) => Some(command),
            Err(e) => {
                warn!(error = %e, "rejecting control message");
                None
            }
        }
    }
}

/// Runs control commands against a session and reports the outcome.
pub struct ControlBridge {
    session: SessionHandle,
    channel: ControlChannel,
    mode: EmbedMode,
    default_username: String,
    outbound: mpsc::UnboundedSender<ControlNotification>,
}

impl ControlBridge {
    /// Builds the bridge and announces readiness to the host.
    pub fn new(
        session: SessionHandle,
        channel: ControlChannel,
        mode: EmbedMode,
        default_username: impl Into<String>,
    ) -> (Self, mpsc::UnboundedReceiver<ControlNotification>) {
        let (outbound, notifications) = mpsc::unbounded_channel();
        let bridge = Self {
            session,
            channel,
            mode,
            default_username: default_username.into(),
            outbound,
        };
        bridge.emit(ControlNotification::Ready { mode });
        (bridge, notifications)
    }

    fn emit(&self, notification: ControlNotification) {
        if self.channel.expected_origin().is_none() {
            return;
        }
        let _ = self.outbound.send(notification);
    }

    pub async fn handle(&self, origin: &str, raw: &str) {
        let Some(command) = self.channel.accept(origin, raw) else {
            return;
        };
        debug!(?command, "control command");
        if let Err(e) = self.execute(command).await {
            self.emit(ControlNotification::Error {
                message: e.to_string(),
            });
        }
    }

    async fn execute(&self, command: ControlCommand) -> Result<()> {
        match command {
            ControlCommand::Create { username } => {
                let username = username.unwrap_or_else(|| self.default_username.clone());
                let room_code = self
                    .session
                    .create_room(&username, self.mode.policy())
                    .await?;
                info!(room = %room_code, "room created from control channel");
                self.emit(ControlNotification::Joined {
                    room_code,
                    action: JoinAction::Created,
                });
            }
            ControlCommand::Join {
                room_code,
                username,
            } => {
                let username = username.unwrap_or_else(|| self.default_username.clone());
                let room_code = self
                    .session
                    .join_room(&room_code, &username, self.mode.policy())
                    .await?;
                self.emit(ControlNotification::Joined {
                    room_code,
                    action: JoinAction::Joined,
                });
            }
            ControlCommand::Leave => {
                self.session.leave_room().await?;
                self.emit(ControlNotification::Left {});
            }
            ControlCommand::ToggleVideo { enabled } => {
                if let Some(state) = self.session.media_state().await? {
                    if state.video != enabled {
                        self.session.toggle_video().await?;
                    }
                }
            }
            ControlCommand::ToggleAudio { enabled } => {
                if let Some(state) = self.session.media_state().await? {
                    if state.audio != enabled {
                        self.session.toggle_audio().await?;
                    }
                }
            }
        }
        Ok(())
    }
}
