//! Pub/sub relays carrying signaling messages between the participants of a room.
//!
//! The relay gives no delivery or ordering guarantees beyond "probably delivered
//! once"; callers treat a failed send exactly like a lost message.

use std::collections::HashMap;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::signaling::SignalingMessage;

#[async_trait]
pub trait Relay: Send + Sync {
    /// Joins a named broadcast channel.
    async fn join(&self, channel: &str) -> Result<RelayChannel>;
}

/// A joined relay channel. Dropping it leaves the channel.
pub struct RelayChannel {
    outbound: mpsc::UnboundedSender<SignalingMessage>,
    inbound: Option<mpsc::UnboundedReceiver<SignalingMessage>>,
    tasks: Vec<JoinHandle<()>>,
}

impl RelayChannel {
    pub fn new(
        outbound: mpsc::UnboundedSender<SignalingMessage>,
        inbound: mpsc::UnboundedReceiver<SignalingMessage>,
        tasks: Vec<JoinHandle<()>>,
    ) -> Self {
        Self {
            outbound,
            inbound: Some(inbound),
            tasks,
        }
    }

    pub fn send(&self, msg: SignalingMessage) -> Result<()> {
        self.outbound
            .send(msg)
            .map_err(|_| Error::Relay("relay channel closed".to_string()))
    }

    pub fn take_inbound(&mut self) -> Result<mpsc::UnboundedReceiver<SignalingMessage>> {
        self.inbound
            .take()
            .ok_or_else(|| Error::Relay("inbound stream already taken".to_string()))
    }
}

impl Drop for RelayChannel {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// In-process relay: one broadcast channel per name.
#[derive(Debug, Default)]
pub struct MemoryRelay {
    channels: RwLock<HashMap<String, broadcast::Sender<SignalingMessage>>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender_for(&self, channel: &str) -> broadcast::Sender<SignalingMessage> {
        let mut guard = self.channels.write();
        guard
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .clone()
    }

    /// Observes every message published on `channel`.
    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<SignalingMessage> {
        self.sender_for(channel).subscribe()
    }
}

#[async_trait]
impl Relay for MemoryRelay {
    async fn join(&self, channel: &str) -> Result<RelayChannel> {
        let sender = self.sender_for(channel);
        let mut receiver = sender.subscribe();

        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<SignalingMessage>();

        let inbound = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(msg) => {
                        if in_tx.send(msg).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "relay subscriber lagged, messages lost");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let outbound = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let _ = sender.send(msg);
            }
        });

        Ok(RelayChannel::new(out_tx, in_rx, vec![inbound, outbound]))
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RelayFrame {
    Join {
        channel: String,
    },
    Broadcast {
        channel: String,
        message: serde_json::Value,
    },
}

/// Relay over a WebSocket pub/sub server speaking JSON `join`/`broadcast` frames.
#[derive(Debug, Clone)]
pub struct WebSocketRelay {
    url: String,
}

impl WebSocketRelay {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Relay for WebSocketRelay {
    async fn join(&self, channel: &str) -> Result<RelayChannel> {
        let (ws_stream, _) = connect_async(self.url.as_str()).await?;
        let (mut write, mut read) = ws_stream.split();

        let join = serde_json::to_string(&RelayFrame::Join {
            channel: channel.to_string(),
        })?;
        write.send(Message::Text(join)).await?;
        info!(url = %self.url, channel, "joined relay channel");

        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<SignalingMessage>();

        let name = channel.to_string();
        let outgoing = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let frame = match serde_json::to_value(&msg) {
                    Ok(message) => RelayFrame::Broadcast {
                        channel: name.clone(),
                        message,
                    },
                    Err(e) => {
                        warn!(error = %e, "failed to encode signaling message");
                        continue;
                    }
                };
                let Ok(json) = serde_json::to_string(&frame) else {
                    continue;
                };
                if write.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
            let _ = write.close().await;
        });

        let name = channel.to_string();
        let incoming = tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!(error = %e, "relay socket error");
                        break;
                    }
                };
                match serde_json::from_str::<RelayFrame>(&text) {
                    Ok(RelayFrame::Broadcast { channel, message }) if channel == name => {
                        match serde_json::from_value::<SignalingMessage>(message) {
                            Ok(msg) => {
                                if in_tx.send(msg).is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!(error = %e, "rejecting unknown signaling message"),
                        }
                    }
                    Ok(_) => {}
                    Err(e) => debug!(error = %e, "ignoring unparseable relay frame"),
                }
            }
        });

        Ok(RelayChannel::new(out_tx, in_rx, vec![outgoing, incoming]))
    }
}
