use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use meshcall::control::{ControlBridge, ControlChannel, EmbedMode};
use meshcall::directory::RestDirectory;
use meshcall::media::{MediaPolicy, TrackMediaSource};
use meshcall::relay::WebSocketRelay;
use meshcall::rtc::RtcConnector;
use meshcall::{ClientConfig, RoomSession, SessionConfig, SessionHandle, SessionNotice};

#[derive(Debug, Parser)]
#[command(name = "meshcall", about = "Mesh WebRTC room client")]
struct Cli {
    #[arg(long, env = "MESHCALL_DIRECTORY_URL")]
    directory_url: Option<String>,

    #[arg(long, env = "MESHCALL_DIRECTORY_KEY", hide_env_values = true)]
    directory_key: Option<String>,

    #[arg(long, env = "MESHCALL_RELAY_URL")]
    relay_url: Option<String>,

    /// Origin whose control messages are accepted in embed mode.
    #[arg(long, env = "MESHCALL_CONTROL_ORIGIN")]
    control_origin: Option<String>,

    #[arg(long, default_value = "Guest")]
    username: String,

    #[arg(long)]
    no_video: bool,

    #[arg(long)]
    no_audio: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a new room and print its code.
    Create,
    /// Join an existing room by code.
    Join { code: String },
    /// Read control messages as JSON lines on stdin and write notifications to stdout.
    Embed,
}

impl Cli {
    fn client_config(&self) -> Result<ClientConfig> {
        let mut config = ClientConfig::from_env()?;
        if let Some(url) = &self.directory_url {
            config.directory_url = url.clone();
        }
        if let Some(key) = &self.directory_key {
            config.directory_key = key.clone();
        }
        if let Some(url) = &self.relay_url {
            config.relay_url = url.clone();
        }
        if self.control_origin.is_some() {
            config.control_origin = self.control_origin.clone();
        }
        Ok(config)
    }

    fn policy(&self) -> MediaPolicy {
        MediaPolicy {
            video: !self.no_video,
            audio: !self.no_audio,
        }
    }

    fn embed_mode(&self) -> EmbedMode {
        match (self.no_video, self.no_audio) {
            (true, false) => EmbedMode::Audio,
            (false, true) => EmbedMode::Video,
            _ => EmbedMode::Both,
        }
    }
}

/// One stdin line in embed mode.
#[derive(Debug, Deserialize)]
struct ControlEnvelope {
    origin: String,
    message: serde_json::Value,
}

fn init_tracing() {
    let filter_layer = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter_layer)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn log_notice(notice: SessionNotice) {
    match notice {
        SessionNotice::PeerJoined { peer_id, username } => info!(%peer_id, %username, "peer joined"),
        SessionNotice::PeerLeft { peer_id } => info!(%peer_id, "peer left"),
        SessionNotice::LinkStateChanged { peer_id, state } => info!(%peer_id, %state, "link state"),
        SessionNotice::RemoteStreamCreated { peer_id, stream } => {
            info!(%peer_id, tracks = stream.len(), "remote stream created")
        }
        SessionNotice::RemoteStreamUpdated { peer_id, stream } => {
            info!(%peer_id, tracks = stream.len(), "remote stream updated")
        }
        SessionNotice::QualityChanged { peer_id, sample } => info!(
            %peer_id,
            level = %sample.level,
            loss = sample.packet_loss,
            rtt_ms = sample.round_trip_time,
            "quality changed"
        ),
        SessionNotice::PeerUnreachable { peer_id, attempts } => {
            warn!(%peer_id, attempts, "peer unreachable")
        }
        SessionNotice::Error { peer_id, message } => {
            warn!(peer_id = peer_id.as_deref().unwrap_or("-"), %message, "session error")
        }
    }
}

async fn run_embed(handle: SessionHandle, origin: Option<String>, mode: EmbedMode, username: String) -> Result<()> {
    let (bridge, mut notifications) = ControlBridge::new(handle, ControlChannel::new(origin), mode, username);

    tokio::spawn(async move {
        while let Some(notification) = notifications.recv().await {
            match serde_json::to_string(&notification) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!(error = %e, "failed to encode notification"),
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ControlEnvelope>(&line) {
            Ok(envelope) => {
                bridge
                    .handle(&envelope.origin, &envelope.message.to_string())
                    .await
            }
            Err(e) => warn!(error = %e, "ignoring malformed control line"),
        }
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let client = cli.client_config()?;
    let session_config = SessionConfig::from_env()?;
    info!(
        directory = %client.directory_url,
        relay = %client.relay_url,
        "starting meshcall"
    );

    let directory = Arc::new(RestDirectory::new(
        &client.directory_url,
        client.directory_key.clone(),
        client.poll_interval,
    )?);
    let relay = Arc::new(WebSocketRelay::new(client.relay_url.clone()));
    let media = Arc::new(TrackMediaSource::default());
    let connector = Arc::new(RtcConnector::new(&session_config.ice_servers)?);

    let (session, mut notices) = RoomSession::new(session_config, directory, relay, media, connector);
    let (handle, task) = session.spawn();
    tokio::spawn(async move {
        while let Some(notice) = notices.recv().await {
            log_notice(notice);
        }
    });

    match &cli.command {
        Command::Create => {
            let code = handle.create_room(&cli.username, cli.policy()).await?;
            info!(room = %code, "room created, share this code to invite others");
        }
        Command::Join { code } => {
            let code = handle.join_room(code, &cli.username, cli.policy()).await?;
            info!(room = %code, "joined room");
        }
        Command::Embed => {
            let bridge = run_embed(
                handle.clone(),
                client.control_origin.clone(),
                cli.embed_mode(),
                cli.username.clone(),
            );
            tokio::select! {
                result = bridge => result?,
                _ = tokio::signal::ctrl_c() => {}
            }
        }
    }

    if !matches!(cli.command, Command::Embed) {
        tokio::signal::ctrl_c().await?;
    }
    info!("shutting down");
    handle.leave_room().await?;
    drop(handle);
    task.await?;
    Ok(())
}
