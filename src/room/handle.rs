use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use super::session::RoomSession;
use super::state::MediaState;
use crate::error::{Error, Result};
use crate::media::MediaPolicy;

/// Requests served by a running session task.
#[derive(Debug)]
pub enum SessionCommand {
    Create {
        display_name: String,
        policy: MediaPolicy,
        reply: oneshot::Sender<Result<String>>,
    },
    Join {
        room_code: String,
        display_name: String,
        policy: MediaPolicy,
        reply: oneshot::Sender<Result<String>>,
    },
    Leave {
        reply: oneshot::Sender<()>,
    },
    ToggleVideo {
        reply: oneshot::Sender<bool>,
    },
    ToggleAudio {
        reply: oneshot::Sender<bool>,
    },
    MediaState {
        reply: oneshot::Sender<Option<MediaState>>,
    },
}

/// Cloneable front end to a session running on its own task.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    pub fn new(commands: mpsc::Sender<SessionCommand>) -> Self {
        Self { commands }
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> SessionCommand) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| Error::SessionClosed)?;
        response.await.map_err(|_| Error::SessionClosed)
    }

    pub async fn create_room(&self, display_name: &str, policy: MediaPolicy) -> Result<String> {
        let display_name = display_name.to_string();
        self.request(|reply| SessionCommand::Create {
            display_name,
            policy,
            reply,
        })
        .await?
    }

    pub async fn join_room(
        &self,
        room_code: &str,
        display_name: &str,
        policy: MediaPolicy,
    ) -> Result<String> {
        let room_code = room_code.to_string();
        let display_name = display_name.to_string();
        self.request(|reply| SessionCommand::Join {
            room_code,
            display_name,
            policy,
            reply,
        })
        .await?
    }

    pub async fn leave_room(&self) -> Result<()> {
        self.request(|reply| SessionCommand::Leave { reply }).await
    }

    pub async fn toggle_video(&self) -> Result<bool> {
        self.request(|reply| SessionCommand::ToggleVideo { reply })
            .await
    }

    pub async fn toggle_audio(&self) -> Result<bool> {
        self.request(|reply| SessionCommand::ToggleAudio { reply })
            .await
    }

    pub async fn media_state(&self) -> Result<Option<MediaState>> {
        self.request(|reply| SessionCommand::MediaState { reply })
            .await
    }
}

impl RoomSession {
    /// Moves the session onto its own task.
    pub fn spawn(self) -> (SessionHandle, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::channel(32);
        let task = tokio::spawn(self.run(commands_rx));
        (SessionHandle::new(commands_tx), task)
    }

    /// Serves commands and session events until every handle is dropped, then
    /// leaves the room.
    pub async fn run(mut self, mut commands: mpsc::Receiver<SessionCommand>) {
        loop {
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(command) => self.execute(command).await,
                    None => break,
                },
                wake = self.next_wake() => self.dispatch(wake).await,
            }
        }
        debug!("session handles dropped, shutting down");
        self.leave_room().await;
    }

    async fn execute(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Create {
                display_name,
                policy,
                reply,
            } => {
                let _ = reply.send(self.create_room(&display_name, policy).await);
            }
            SessionCommand::Join {
                room_code,
                display_name,
                policy,
                reply,
            } => {
                let _ = reply.send(self.join_room(&room_code, &display_name, policy).await);
            }
            SessionCommand::Leave { reply } => {
                self.leave_room().await;
                let _ = reply.send(());
            }
            SessionCommand::ToggleVideo { reply } => {
                let _ = reply.send(self.toggle_video());
            }
            SessionCommand::ToggleAudio { reply } => {
                let _ = reply.send(self.toggle_audio());
            }
            SessionCommand::MediaState { reply } => {
                let _ = reply.send(self.media_state());
            }
        }
    }
}
