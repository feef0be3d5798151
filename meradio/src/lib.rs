#![doc = include_str!("../../README.md")]

pub mod api;
pub mod config;
mod connection;
mod connection_manager;
pub mod controller;
pub mod error;
pub mod geo;
pub mod heartbeat;
pub mod location;
pub mod retry;
pub mod store;

use tokio::sync::mpsc;

use tokio_stream::{StreamExt, wrappers::UnboundedReceiverStream};

pub use crate::{
    api::{ClientId, Message, Peer},
    config::Config,
    controller::{CloseReason, ConnectionState},
    error::{Error, Result},
    geo::Position,
    location::{LocationError, LocationMode, LocationSource},
};
use crate::connection_manager::ConnectionManager;

/// A running chat session.
///
/// The session connects as soon as a position is known, keeps the connection alive with a location heartbeat, and
/// reconnects with backoff after unexpected closes.
pub struct Session {
    /// The connection manager.
    manager: ConnectionManager,
    /// The event stream.
    event_stream: UnboundedReceiverStream<Event>,
}

impl Session {
    /// Starts a session on a task, tracking the live position reported by `source`.
    ///
    /// Fails when the configuration is invalid or the username is blank; nothing is spawned in that case.
    pub fn spawn<L: LocationSource>(config: Config, username: impl Into<String>, source: L) -> Result<Self> {
        Self::spawn_with_mode(config, username, source, LocationMode::Live)
    }

    /// Like [Self::spawn], but starts in `mode`. With [LocationMode::Preset] the live source is not read until
    /// [LocationMode::Live] is selected.
    pub fn spawn_with_mode<L: LocationSource>(
        config: Config,
        username: impl Into<String>,
        source: L,
        mode: LocationMode,
    ) -> Result<Self> {
        let username = username.into().trim().to_string();
        if username.is_empty() {
            return Err(Error::EmptyUsername);
        }
        config.validate()?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let stream = UnboundedReceiverStream::new(event_rx);

        Ok(Self {
            manager: ConnectionManager::spawn(config, username, source, mode, event_tx),
            event_stream: stream,
        })
    }

    /// An asynchronous method to get the next event that occurs.
    ///
    /// Returns `None` once the session has terminated, either after [Self::shutdown], a clean close by the server, or
    /// [Event::Abandoned].
    pub async fn next_event(&mut self) -> Option<Event> {
        self.event_stream.next().await
    }

    /// Sends a chat message at the current position.
    ///
    /// Messages can only be sent while connected; otherwise the message is dropped. A successful send is followed by
    /// an [Event::VisibleMessages] containing it.
    pub async fn send_message(&self, content: impl Into<String>) {
        self.send_command(Command::SendMessage {
            content: content.into(),
        })
        .await;
    }

    /// Switches between live tracking and a fixed preset position.
    pub async fn select_location(&self, mode: LocationMode) {
        self.send_command(Command::SelectLocation(mode)).await;
    }

    /// Notifies the server, closes the connection and waits for the session task to finish.
    pub async fn shutdown(self) {
        self.manager.shutdown().await;
    }

    /// Sends a command to the manager task.
    async fn send_command(&self, command: Command) {
        self.manager.send_command(command).await;
    }
}

enum Command {
    SendMessage { content: String },
    SelectLocation(LocationMode),
}

/// Events emitted by the session via [Session::next_event].
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// The connection moved to a new lifecycle state.
    StateChanged(ConnectionState),
    /// The server assigned an identity to this client.
    Connected {
        /// The assigned identity
        client_id: ClientId,
    },
    /// Reconnecting failed too many times in a row. The session is over.
    Abandoned,
    /// The messages within radius of the current position, oldest first.
    VisibleMessages(Vec<Message>),
    /// The server's latest list of nearby users.
    PeersInRange(Vec<Peer>),
    /// The location source failed; the fallback position is used instead.
    LocationError(String),
    /// The server reported an error.
    ServerError(String),
}
