//! Wire messages for the videoroom signaling relay
//!
//! Every message is a JSON object carried in one WebSocket text frame and
//! tagged by its `type` field.
//!
//! ## Client → server
//!
//! - `{"type":"join","roomId":"<room>","name":"<display name>"}`
//! - `{"type":"signal","to":"<member id>","data":<any JSON>}`
//! - `{"type":"leave"}`
//!
//! ## Server → client
//!
//! - `{"type":"welcome","clientId":"<member id>","roomId":"<room>"}`
//! - `{"type":"peers","peers":[{"id":"<member id>","name":"<name>"}]}`
//! - `{"type":"peer-joined","peer":{"id":"<member id>","name":"<name>"}}`
//! - `{"type":"peer-left","peerId":"<member id>"}`
//! - `{"type":"signal","from":"<member id>","data":<any JSON>}`
//! - `{"type":"error","message":"<text>"}`
//!
//! The `data` of a signal is relayed as the exact JSON text the sender wrote.

#![forbid(unsafe_code)]

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use serde_json::value::RawValue;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A request sent by a client
#[derive(Debug, Clone)]
pub enum ClientMessage {
    /// Enter a room under a display name. Missing fields decode as empty.
    Join { room_id: String, name: String },
    /// Relay `data` to one member of the sender's room.
    ///
    /// `data` is `None` only when the key is absent; an explicit `null` is kept.
    Signal {
        to: String,
        data: Option<Box<RawValue>>,
    },
    /// Leave the current room
    Leave,
    /// Anything whose `type` is missing or not recognised
    Unknown,
}

/// Why an inbound frame could not be turned into a [`ClientMessage`]
#[derive(Error, Debug)]
pub enum DecodeError {
    /// The frame is not valid JSON
    #[error("invalid JSON: {0}")]
    Json(#[source] serde_json::Error),

    /// A known message type carried fields of the wrong JSON type
    #[error("malformed message: {0}")]
    Malformed(#[source] serde_json::Error),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JoinBody {
    #[serde(default)]
    room_id: String,
    #[serde(default)]
    name: String,
}

#[derive(Deserialize)]
struct SignalBody {
    #[serde(default)]
    to: String,
    #[serde(default, deserialize_with = "present")]
    data: Option<Box<RawValue>>,
}

/// Treats a key that is present as `Some`, even when its value is `null`.
fn present<'de, D>(deserializer: D) -> Result<Option<Box<RawValue>>, D::Error>
where
    D: Deserializer<'de>,
{
    Box::<RawValue>::deserialize(deserializer).map(Some)
}

impl FromStr for ClientMessage {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value: Value = serde_json::from_str(s).map_err(DecodeError::Json)?;

        // Only objects carry a tag; bodies are re-read from the text so that
        // signal data keeps its exact bytes
        match value.get("type").and_then(Value::as_str) {
            Some("join") => {
                let body: JoinBody = serde_json::from_str(s).map_err(DecodeError::Malformed)?;
                Ok(Self::Join {
                    room_id: body.room_id,
                    name: body.name,
                })
            }
            Some("signal") => {
                let body: SignalBody = serde_json::from_str(s).map_err(DecodeError::Malformed)?;
                Ok(Self::Signal {
                    to: body.to,
                    data: body.data,
                })
            }
            Some("leave") => Ok(Self::Leave),
            _ => Ok(Self::Unknown),
        }
    }
}

/// A peer as it appears in `peers` and `peer-joined`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSummary {
    pub id: String,
    pub name: String,
}

/// A message sent by the server
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// First reply to a successful join
    Welcome { client_id: String, room_id: String },
    /// Members already in the room when the recipient joined
    Peers { peers: Vec<PeerSummary> },
    PeerJoined { peer: PeerSummary },
    PeerLeft { peer_id: String },
    /// A relayed signal; `data` is the sender's JSON text, untouched
    Signal { from: String, data: Box<RawValue> },
    Error { message: String },
}

impl ServerMessage {
    /// Shorthand for an `error` reply
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

impl fmt::Display for ServerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
        f.write_str(&json)
    }
}
