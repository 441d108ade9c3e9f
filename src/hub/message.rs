//! Messages exchanged with connected clients
//!
//! Both directions are closed sets of variants, encoded as JSON objects with a
//! `type` discriminator:
//!
//! ```json
//! {"type":"chat","sender_id":"u1","sender":"alice","message":"hi","time":1700000000000}
//! {"type":"status","status":{"current_time":12.5,"rate":1.0,"is_playing":true}}
//! ```

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::room::{Current, RoomSettings, Status};

/// Message sent from the room to clients
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// A request from this client failed
    Error { message: String },

    /// Chat line from a room member
    Chat {
        sender_id: String,
        sender: String,
        message: String,
        /// Unix time in milliseconds
        time: u64,
    },

    /// Playback status changed
    Status { status: Status },

    /// The current movie changed
    Current { current: Current },

    /// The movie list changed
    Movies { count: usize },

    /// Number of connected clients changed
    ViewerCount { count: usize },

    /// Room settings changed
    Settings { settings: RoomSettings },

    /// The client's credential is no longer valid; the connection is closing
    Expired,
}

impl OutboundMessage {
    /// Build a chat message stamped with the current wall-clock time
    pub fn chat(
        sender_id: impl Into<String>,
        sender: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        OutboundMessage::Chat {
            sender_id: sender_id.into(),
            sender: sender.into(),
            message: message.into(),
            time,
        }
    }

    /// Build an error message
    pub fn error(message: impl Into<String>) -> Self {
        OutboundMessage::Error {
            message: message.into(),
        }
    }

    /// Short name of the variant, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundMessage::Error { .. } => "error",
            OutboundMessage::Chat { .. } => "chat",
            OutboundMessage::Status { .. } => "status",
            OutboundMessage::Current { .. } => "current",
            OutboundMessage::Movies { .. } => "movies",
            OutboundMessage::ViewerCount { .. } => "viewer_count",
            OutboundMessage::Settings { .. } => "settings",
            OutboundMessage::Expired => "expired",
        }
    }

    /// Encode into one wire frame
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }
}

/// Message received from a client
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    /// Send a chat line to the room
    Chat { message: String },

    /// Change play/pause, position and rate
    Status {
        is_playing: bool,
        current_time: f64,
        rate: f64,
        /// Seconds since the client observed `current_time`
        #[serde(default)]
        time_diff: f64,
    },

    /// Report the client's own playback state for drift correction
    CheckStatus {
        is_playing: bool,
        current_time: f64,
        rate: f64,
        #[serde(default)]
        time_diff: f64,
    },

    /// Ask for the full current state
    Sync,
}

impl InboundMessage {
    /// Decode one wire frame
    pub fn decode(frame: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(frame)?)
    }
}
