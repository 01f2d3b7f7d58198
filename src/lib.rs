//! Mesh room sessions over WebRTC: one peer connection per remote participant,
//! signaling over a pub/sub relay, and a room directory for membership.

pub mod config;
pub mod connection;
pub mod control;
pub mod directory;
pub mod error;
pub mod ice_buffer;
pub mod media;
pub mod metrics;
pub mod peer;
pub mod presence;
pub mod reconnect;
pub mod relay;
pub mod room;
pub mod rtc;
pub mod signaling;

pub use config::{ClientConfig, IceServerConfig, SessionConfig};
pub use error::{Error, Result};
pub use room::{RoomSession, SessionHandle, SessionNotice};
