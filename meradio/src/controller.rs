//! The session state machine.
//!
//! [Controller] is the pure core of a session. It owns the connection state, the message log, the peer roster and
//! the heartbeat bookkeeping, and it never performs I/O: every [Input] is turned into an ordered list of [Effect]s
//! that the connection manager carries out (opening sockets, sending frames, arming timers, emitting events).
//!
//! ## Connection lifecycle
//!
//! ```text
//! Idle -> Connecting -> Open -> Closed(Clean)                         (terminal)
//!                        |  \-> Closing -> Closed(Clean)              (terminal)
//!                        \----> Closed(Abnormal) -> Connecting -> ... -> Abandoned (terminal)
//! ```
//!
//! A connection is only attempted once a position is resolved and the username is not empty. An abnormal close
//! arms a retry timer following [crate::retry::RetryPolicy]; the attempt counter resets on every successful open.
//!
//! ## Identity
//!
//! The `client_id` assigned by the first `connected` frame is kept across abnormal closes, so a reconnect does not
//! register the user again. The *session identity*, the one the heartbeat and the history bootstrap observe, is
//! that id only while the socket is open.
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::{
    Event,
    api::{ClientId, Inbound, Message, Outbound},
    geo::Position,
    heartbeat::{Heartbeat, HeartbeatChange, HistoryLatch},
    retry::{Backoff, RetryPolicy},
    store::{MessageStore, PeerRoster},
};

/// The lifecycle state of the session's connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket exists yet.
    Idle,
    /// A socket is being opened.
    Connecting,
    /// The socket is open and frames may be sent.
    Open,
    /// A graceful shutdown is in progress.
    Closing,
    /// The socket closed. Terminal when the close was clean; otherwise a retry is pending.
    Closed(CloseReason),
    /// The retry attempts are exhausted. Terminal.
    Abandoned,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed(CloseReason::Clean) | ConnectionState::Abandoned)
    }
}

/// Why a socket closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// An intentional shutdown. Never retried.
    Clean,
    /// A network failure or an unexpected close code. Retried with backoff.
    Abnormal { code: Option<u16>, reason: String },
}

impl CloseReason {
    pub fn abnormal(code: Option<u16>, reason: impl Into<String>) -> Self {
        CloseReason::Abnormal {
            code,
            reason: reason.into(),
        }
    }
}

/// Something that happened, fed to [Controller::handle].
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    /// The application wants to connect as soon as the identity material is complete.
    Start,
    /// The location source produced a new position.
    PositionChanged(Position),
    /// The location source failed.
    LocationFailed(String),
    /// The socket requested by [Effect::OpenSocket] is open.
    Opened,
    /// The current socket closed, or failed to open.
    Closed(CloseReason),
    /// A text frame arrived on the current socket.
    Frame(String),
    /// The timer armed by [Effect::ScheduleRetry] fired.
    RetryElapsed,
    /// The heartbeat interval ticked.
    HeartbeatTick,
    /// The user sent a message. `timestamp` is in milliseconds since the unix epoch.
    SendMessage { content: String, timestamp: u64 },
    /// The application is tearing the session down.
    Shutdown,
}

/// Work the connection manager must carry out, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Discard the current socket, if any, and open a new one.
    OpenSocket,
    /// Write a frame to the current socket.
    Send(Outbound),
    /// Close the current socket gracefully, after every frame queued before it.
    CloseSocket,
    /// Arm the retry timer.
    ScheduleRetry(Duration),
    /// Disarm the retry timer.
    CancelRetry,
    /// Replace the heartbeat interval with a new one that ticks immediately.
    StartHeartbeat,
    /// Drop the heartbeat interval.
    StopHeartbeat,
    /// Signal the application.
    Emit(Event),
}

/// Static settings of a [Controller].
#[derive(Debug, Clone)]
pub struct Settings {
    pub username: String,
    pub radius_m: f64,
    pub retry: RetryPolicy,
    /// Used when the location source fails.
    pub fallback_position: Position,
}

pub struct Controller {
    username: String,
    fallback_position: Position,
    state: ConnectionState,
    started: bool,
    backoff: Backoff,
    client_id: Option<ClientId>,
    position: Option<Position>,
    store: MessageStore,
    roster: PeerRoster,
    heartbeat: Heartbeat,
    history: HistoryLatch,
}

impl Controller {
    pub fn new(settings: Settings) -> Self {
        Self {
            username: settings.username,
            fallback_position: settings.fallback_position,
            state: ConnectionState::Idle,
            started: false,
            backoff: Backoff::new(settings.retry),
            client_id: None,
            position: None,
            store: MessageStore::new(settings.radius_m),
            roster: PeerRoster::default(),
            heartbeat: Heartbeat::default(),
            history: HistoryLatch::default(),
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn position(&self) -> Option<Position> {
        self.position
    }

    /// The identity the server assigned, valid only while the socket is open.
    pub fn session_identity(&self) -> Option<&ClientId> {
        match self.state {
            ConnectionState::Open => self.client_id.as_ref(),
            _ => None,
        }
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn roster(&self) -> &PeerRoster {
        &self.roster
    }

    pub fn visible_messages(&self) -> Vec<Message> {
        self.store.visible_messages(self.position)
    }

    /// Applies `input` and returns the effects to carry out.
    pub fn handle(&mut self, input: Input) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.is_terminal() {
            debug!(state = ?self.state, ?input, "session terminated, ignoring input");
            return effects;
        }

        match input {
            Input::Start => {
                self.started = true;
                self.try_connect(&mut effects);
            }
            Input::PositionChanged(position) => self.set_position(position, &mut effects),
            Input::LocationFailed(reason) => {
                warn!(%reason, fallback = ?self.fallback_position, "location unavailable, using fallback position");
                effects.push(Effect::Emit(Event::LocationError(reason)));
                self.set_position(self.fallback_position, &mut effects);
            }
            Input::Opened => self.on_opened(&mut effects),
            Input::Closed(reason) => self.on_closed(reason, &mut effects),
            Input::Frame(text) => self.process_incoming_frame(&text, &mut effects),
            Input::RetryElapsed => {
                if matches!(self.state, ConnectionState::Closed(CloseReason::Abnormal { .. })) {
                    info!(attempt = self.backoff.attempt(), "reconnecting");
                    self.transition(ConnectionState::Connecting, &mut effects);
                    effects.push(Effect::OpenSocket);
                } else {
                    debug!(state = ?self.state, "stale retry timer");
                }
            }
            Input::HeartbeatTick => self.on_heartbeat(&mut effects),
            Input::SendMessage { content, timestamp } => self.send_message(content, timestamp, &mut effects),
            Input::Shutdown => self.shutdown(&mut effects),
        }

        self.reconcile(&mut effects);
        effects
    }

    fn transition(&mut self, state: ConnectionState, effects: &mut Vec<Effect>) {
        debug!(from = ?self.state, to = ?state, "connection state changed");
        self.state = state.clone();
        effects.push(Effect::Emit(Event::StateChanged(state)));
    }

    fn try_connect(&mut self, effects: &mut Vec<Effect>) {
        if !self.started || self.state != ConnectionState::Idle {
            return;
        }
        if self.position.is_none() {
            debug!("waiting for a position fix before connecting");
            return;
        }
        if self.username.trim().is_empty() {
            warn!("refusing to connect without a username");
            return;
        }
        self.transition(ConnectionState::Connecting, effects);
        effects.push(Effect::OpenSocket);
    }

    fn set_position(&mut self, position: Position, effects: &mut Vec<Effect>) {
        self.position = Some(position);
        self.emit_visible(effects);
        self.try_connect(effects);
    }

    fn on_opened(&mut self, effects: &mut Vec<Effect>) {
        if self.state != ConnectionState::Connecting {
            debug!(state = ?self.state, "ignoring open outside of connecting");
            return;
        }
        self.backoff.reset();
        self.transition(ConnectionState::Open, effects);

        // The handshake must be the first frame on the socket.
        if self.client_id.is_none() {
            if let Some(position) = self.position {
                self.send(
                    Outbound::Connect {
                        username: self.username.clone(),
                        lat: position.lat,
                        lon: position.lon,
                    },
                    effects,
                );
            }
        } else {
            debug!(client_id = ?self.client_id, "reopened with an existing identity, skipping connect");
        }
    }

    fn on_closed(&mut self, reason: CloseReason, effects: &mut Vec<Effect>) {
        match (self.state.clone(), reason) {
            (ConnectionState::Closing, _) | (ConnectionState::Open | ConnectionState::Connecting, CloseReason::Clean) => {
                info!("connection closed");
                effects.push(Effect::CancelRetry);
                self.transition(ConnectionState::Closed(CloseReason::Clean), effects);
            }
            (ConnectionState::Open | ConnectionState::Connecting, reason) => {
                warn!(?reason, "connection lost");
                self.transition(ConnectionState::Closed(reason), effects);
                match self.backoff.next_delay() {
                    Some(delay) => {
                        info!(
                            attempt = self.backoff.attempt(),
                            max_attempts = self.backoff.policy().max_attempts,
                            ?delay,
                            "scheduling reconnect"
                        );
                        effects.push(Effect::ScheduleRetry(delay));
                    }
                    None => {
                        warn!(attempts = self.backoff.attempt(), "reconnect attempts exhausted, giving up");
                        self.transition(ConnectionState::Abandoned, effects);
                        effects.push(Effect::Emit(Event::Abandoned));
                    }
                }
            }
            (state, reason) => debug!(?state, ?reason, "ignoring close of an inactive socket"),
        }
    }

    fn process_incoming_frame(&mut self, text: &str, effects: &mut Vec<Effect>) {
        let frame = match Inbound::from_json(text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, raw = text, "dropping malformed frame");
                return;
            }
        };

        match frame {
            Inbound::Connected { client_id } => {
                if self.client_id.as_ref() == Some(&client_id) {
                    debug!(%client_id, "identity confirmed again");
                    return;
                }
                info!(%client_id, "session identity assigned");
                self.client_id = Some(client_id.clone());
                effects.push(Effect::Emit(Event::Connected { client_id }));
            }
            Inbound::UsersInRange { users } => {
                debug!(count = users.len(), "peers in range");
                self.roster.replace(users);
                effects.push(Effect::Emit(Event::PeersInRange(self.roster.peers())));
            }
            Inbound::MessagesHistory { messages } => {
                debug!(count = messages.len(), "message history received");
                self.store.ingest_history(messages);
                self.emit_visible(effects);
            }
            Inbound::NewMessage { message } => {
                if self.store.ingest_message(message, self.client_id.as_ref()) {
                    self.emit_visible(effects);
                } else {
                    debug!("ignoring echo of a self-authored message");
                }
            }
            Inbound::Error { message } => {
                warn!(%message, "server reported an error");
                effects.push(Effect::Emit(Event::ServerError(message)));
            }
            Inbound::Unknown => warn!(raw = text, "ignoring unrecognized frame"),
        }
    }

    fn on_heartbeat(&mut self, effects: &mut Vec<Effect>) {
        if !self.heartbeat.is_running() {
            debug!("stale heartbeat tick");
            return;
        }
        if let (Some(client_id), Some(position)) = (self.client_id.clone(), self.position) {
            self.send(
                Outbound::SentLocation {
                    client_id,
                    lat: position.lat,
                    lon: position.lon,
                },
                effects,
            );
        }
        self.emit_visible(effects);
    }

    fn send_message(&mut self, content: String, timestamp: u64, effects: &mut Vec<Effect>) {
        if content.trim().is_empty() {
            debug!("ignoring empty message");
            return;
        }
        let (ConnectionState::Open, Some(client_id), Some(position)) = (&self.state, self.client_id.clone(), self.position)
        else {
            warn!(state = ?self.state, has_identity = self.client_id.is_some(), "cannot send message now, dropping it");
            return;
        };

        self.store.append_local(Message {
            author_id: client_id.clone(),
            author_name: self.username.clone(),
            content: content.clone(),
            position,
            timestamp,
            delivery_id: None,
        });
        self.emit_visible(effects);
        self.send(
            Outbound::SentMessage {
                client_id,
                content,
                lat: position.lat,
                lon: position.lon,
                username: self.username.clone(),
                timestamp,
            },
            effects,
        );
    }

    fn shutdown(&mut self, effects: &mut Vec<Effect>) {
        effects.push(Effect::CancelRetry);
        match self.state {
            ConnectionState::Open => {
                if let Some(client_id) = self.client_id.clone() {
                    self.send(Outbound::Disconnect { client_id }, effects);
                }
                effects.push(Effect::CloseSocket);
                self.transition(ConnectionState::Closing, effects);
            }
            ConnectionState::Connecting => {
                effects.push(Effect::CloseSocket);
                self.transition(ConnectionState::Closing, effects);
            }
            ConnectionState::Closing => {}
            _ => self.transition(ConnectionState::Closed(CloseReason::Clean), effects),
        }
    }

    /// Queues `frame` if the socket is open. Otherwise the frame is dropped and logged.
    fn send(&self, frame: Outbound, effects: &mut Vec<Effect>) {
        if self.state == ConnectionState::Open {
            effects.push(Effect::Send(frame));
        } else {
            warn!(kind = frame.kind(), state = ?self.state, "socket not open, dropping frame");
        }
    }

    fn emit_visible(&self, effects: &mut Vec<Effect>) {
        effects.push(Effect::Emit(Event::VisibleMessages(self.visible_messages())));
    }

    /// Re-derives the bootstrap and heartbeat decisions from the current inputs.
    fn reconcile(&mut self, effects: &mut Vec<Effect>) {
        let position = self.position;
        let identity = self.session_identity().cloned();

        if let (Some(client_id), Some(position)) = (identity.clone(), position) {
            if self.history.try_fire(Some(&client_id), true) {
                info!(%client_id, "requesting message history");
                self.send(
                    Outbound::GetHistoryMessages {
                        client_id,
                        lat: position.lat,
                        lon: position.lon,
                    },
                    effects,
                );
            }
        }

        match self.heartbeat.reconcile(identity.as_ref(), position.is_some()) {
            Some(HeartbeatChange::Start) => effects.push(Effect::StartHeartbeat),
            Some(HeartbeatChange::Stop) => effects.push(Effect::StopHeartbeat),
            None => {}
        }
    }
}
