//! This module contains the frames that are exchanged with the chat server.
//!
//! Every frame is a single JSON object tagged by its `type` field. Frames sent by the client are modelled by
//! [Outbound], frames sent by the server by [Inbound]. Positions are flattened into `lat` / `lon` fields on the wire.
use std::fmt;

use serde_derive::*;

use crate::geo::Position;

/// The opaque identifier the server assigns to a client after the `connect` handshake.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A chat message. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// The identity of the client that authored the message.
    #[serde(rename = "client_id")]
    pub author_id: ClientId,
    /// The display name of the author.
    #[serde(rename = "username")]
    pub author_name: String,
    /// The text payload.
    pub content: String,
    /// Where the message was written.
    #[serde(flatten)]
    pub position: Position,
    /// Milliseconds since the unix epoch.
    pub timestamp: u64,
    /// A server side delivery id, when the server provides one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_id: Option<String>,
}

/// Another user currently within radius, as reported by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Peer {
    pub client_id: ClientId,
    pub username: String,
    #[serde(flatten)]
    pub position: Position,
}

/// Frames sent from the client to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    /// Registers the user. Sent once, on the first open without an identity.
    Connect { username: String, lat: f64, lon: f64 },
    /// The periodic location heartbeat.
    SentLocation { client_id: ClientId, lat: f64, lon: f64 },
    /// Requests the history of messages around the given position.
    GetHistoryMessages { client_id: ClientId, lat: f64, lon: f64 },
    /// A message written by the local user.
    SentMessage {
        client_id: ClientId,
        content: String,
        lat: f64,
        lon: f64,
        username: String,
        timestamp: u64,
    },
    /// Best-effort notice sent on graceful teardown.
    Disconnect { client_id: ClientId },
}

impl Outbound {
    /// The wire name of the frame, used for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Outbound::Connect { .. } => "connect",
            Outbound::SentLocation { .. } => "sent_location",
            Outbound::GetHistoryMessages { .. } => "get_history_messages",
            Outbound::SentMessage { .. } => "sent_message",
            Outbound::Disconnect { .. } => "disconnect",
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Frames sent from the server to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    /// Assigns the session identity. May be received more than once.
    Connected { client_id: ClientId },
    /// The full set of peers currently within radius.
    UsersInRange { users: Vec<Peer> },
    /// The message history snapshot used to bootstrap the log.
    MessagesHistory { messages: Vec<Message> },
    /// A single message written by another user.
    NewMessage { message: Message },
    /// A non-fatal error reported by the server.
    Error { message: String },
    /// Any frame type this client does not understand.
    #[serde(other)]
    Unknown,
}

impl Inbound {
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}
