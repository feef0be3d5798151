use std::{
    collections::VecDeque,
    pin::Pin,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use futures_util::StreamExt;
use tokio::{
    sync::mpsc,
    time::{Interval, MissedTickBehavior, Sleep},
};
use tracing::{debug, info, warn};

use crate::{
    Command, Event,
    config::Config,
    connection::{Connection, ConnectionEvent, ConnectionId},
    controller::{CloseReason, Controller, Effect, Input, Settings},
    geo::Position,
    location::{self, LocationError, LocationMode, LocationSource, LocationStream},
};

/// The session's connection manager, responsible for driving the [Controller] with real sockets, timers and
/// location updates.
pub(crate) struct ConnectionManager {
    /// A channel to send commands to the manager task.
    sender: mpsc::Sender<Command>,
    /// A token to signal to the manager task to shut the session down.
    token: tokio_util::sync::CancellationToken,
    /// The running manager task's join handle.
    handle: tokio::task::JoinHandle<()>,
}

impl ConnectionManager {
    /// Shuts the session down and waits until the disconnect notice has been written and the socket closed.
    pub(crate) async fn shutdown(self) {
        self.token.cancel();
        let _ = self.handle.await;
    }

    pub(crate) async fn send_command(&self, command: Command) {
        if self.sender.send(command).await.is_err() {
            debug!("session already terminated, command dropped");
        }
    }

    /// Spawns the task that runs the session.
    ///
    /// The [Command] enum is used to interact with the session. Every signal for the application is sent to
    /// `event_tx`; the channel closes once the session terminates.
    pub(crate) fn spawn<L: LocationSource>(
        config: Config,
        username: String,
        source: L,
        initial: LocationMode,
        event_tx: mpsc::UnboundedSender<Event>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(100);
        let token = tokio_util::sync::CancellationToken::new();
        let cancellation_token = token.clone();

        let handle = tokio::spawn(async move {
            let mut driver = Driver::new(config, username, source, event_tx);
            driver.run(initial, rx, cancellation_token).await;
        });

        Self {
            sender: tx,
            token,
            handle,
        }
    }
}

/// State owned by the manager task.
struct Driver<L> {
    controller: Controller,
    endpoint: String,
    heartbeat_period: Duration,
    source: L,
    /// The live location subscription. `None` while a preset is selected.
    location: Option<LocationStream>,
    /// The current socket, if any.
    connection: Option<Connection>,
    /// The id of the current socket. Events from any other id are stale.
    current: Option<ConnectionId>,
    last_id: ConnectionId,
    /// Given to each connection so it can report back to this task.
    conn_tx: mpsc::UnboundedSender<ConnectionEvent>,
    conn_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    retry: Option<Pin<Box<Sleep>>>,
    heartbeat: Option<Interval>,
    event_tx: mpsc::UnboundedSender<Event>,
}

impl<L: LocationSource> Driver<L> {
    fn new(config: Config, username: String, source: L, event_tx: mpsc::UnboundedSender<Event>) -> Self {
        let controller = Controller::new(Settings {
            username,
            radius_m: config.radius_m,
            retry: config.retry_policy(),
            fallback_position: config.default_position,
        });
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();

        Self {
            controller,
            heartbeat_period: config.heartbeat_interval(),
            endpoint: config.endpoint,
            source,
            location: None,
            connection: None,
            current: None,
            last_id: ConnectionId { generation: 0 },
            conn_tx,
            conn_rx,
            retry: None,
            heartbeat: None,
            event_tx,
        }
    }

    async fn run(
        &mut self,
        initial: LocationMode,
        mut commands: mpsc::Receiver<Command>,
        token: tokio_util::sync::CancellationToken,
    ) {
        // A preset position is applied before the first connect attempt.
        if let Some(input) = self.select_location(initial) {
            self.dispatch(input).await;
        }
        self.dispatch(Input::Start).await;

        while !self.controller.is_terminal() {
            tokio::select! {
                // The application is tearing the session down.
                _ = token.cancelled() => {
                    self.dispatch(Input::Shutdown).await;
                    break;
                }
                // A command from the session handle.
                cmd = commands.recv() => match cmd {
                    Some(Command::SendMessage { content }) => {
                        self.dispatch(Input::SendMessage { content, timestamp: now_millis() }).await;
                    }
                    Some(Command::SelectLocation(mode)) => {
                        if let Some(input) = self.select_location(mode) {
                            self.dispatch(input).await;
                        }
                    }
                    // Every handle is gone, nobody is listening anymore.
                    None => {
                        self.dispatch(Input::Shutdown).await;
                        break;
                    }
                },
                // Something happened on a socket.
                Some(event) = self.conn_rx.recv() => {
                    if let Some(input) = self.on_connection_event(event) {
                        self.dispatch(input).await;
                    }
                }
                // The live location source produced an update.
                update = next_location(&mut self.location) => {
                    let input = match update {
                        Ok(position) => Input::PositionChanged(position),
                        Err(err) => Input::LocationFailed(err.to_string()),
                    };
                    self.dispatch(input).await;
                }
                _ = elapsed(&mut self.retry) => {
                    self.retry = None;
                    self.dispatch(Input::RetryElapsed).await;
                }
                _ = tick(&mut self.heartbeat) => {
                    self.dispatch(Input::HeartbeatTick).await;
                }
            }
        }

        if let Some(connection) = self.connection.take() {
            connection.abort();
        }
        info!(state = ?self.controller.state(), "session ended");
    }

    /// Feeds `input` to the controller and carries out the resulting effects, along with any follow-up input they
    /// produce.
    async fn dispatch(&mut self, input: Input) {
        let mut queue = VecDeque::from([input]);
        while let Some(input) = queue.pop_front() {
            for effect in self.controller.handle(input) {
                if let Some(follow_up) = self.apply(effect).await {
                    queue.push_back(follow_up);
                }
            }
        }
    }

    async fn apply(&mut self, effect: Effect) -> Option<Input> {
        match effect {
            Effect::OpenSocket => {
                if let Some(old) = self.connection.take() {
                    old.abort();
                }
                let id = self.last_id.next();
                self.last_id = id;
                self.current = Some(id);
                debug!(generation = id.generation, endpoint = %self.endpoint, "opening socket");
                self.connection = Some(Connection::spawn(self.endpoint.clone(), id, self.conn_tx.clone()));
            }
            Effect::Send(frame) => {
                let kind = frame.kind();
                match (frame.to_json(), &self.connection) {
                    (Ok(text), Some(connection)) => {
                        debug!(kind, "sending frame");
                        connection.send(text);
                    }
                    (Ok(_), None) => warn!(kind, "no socket, frame dropped"),
                    (Err(err), _) => warn!(kind, error = %err, "failed to encode frame"),
                }
            }
            Effect::CloseSocket => {
                self.current = None;
                if let Some(connection) = self.connection.take() {
                    connection.close().await;
                }
                return Some(Input::Closed(CloseReason::Clean));
            }
            Effect::ScheduleRetry(delay) => self.retry = Some(Box::pin(tokio::time::sleep(delay))),
            Effect::CancelRetry => self.retry = None,
            Effect::StartHeartbeat => {
                // The first tick of a fresh interval completes immediately.
                let mut interval = tokio::time::interval(self.heartbeat_period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                self.heartbeat = Some(interval);
            }
            Effect::StopHeartbeat => self.heartbeat = None,
            Effect::Emit(event) => {
                let _ = self.event_tx.send(event);
            }
        }
        None
    }

    fn on_connection_event(&mut self, event: ConnectionEvent) -> Option<Input> {
        if self.current != Some(event.id()) {
            debug!(generation = event.id().generation, "dropping event from a stale socket");
            return None;
        }
        match event {
            ConnectionEvent::Opened { .. } => Some(Input::Opened),
            ConnectionEvent::Frame { text, .. } => Some(Input::Frame(text)),
            ConnectionEvent::Closed { reason, .. } => {
                self.current = None;
                self.connection = None;
                Some(Input::Closed(reason))
            }
        }
    }

    /// Switches the position source. Any live subscription is dropped before the new source is activated.
    fn select_location(&mut self, mode: LocationMode) -> Option<Input> {
        self.location = None;
        match mode {
            LocationMode::Live => {
                debug!("tracking live location");
                self.location = Some(location::live_updates(&self.source));
                None
            }
            LocationMode::Preset(position) => {
                debug!(?position, "using preset location");
                Some(Input::PositionChanged(position))
            }
        }
    }
}

async fn next_location(stream: &mut Option<LocationStream>) -> Result<Position, LocationError> {
    if let Some(updates) = stream.as_mut() {
        if let Some(update) = updates.next().await {
            return update;
        }
        debug!("location source ended");
    }
    *stream = None;
    std::future::pending().await
}

async fn elapsed(retry: &mut Option<Pin<Box<Sleep>>>) {
    match retry {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

async fn tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::FixedLocation;

    fn driver() -> Driver<FixedLocation> {
        let (event_tx, _event_rx) = mpsc::unbounded_channel();
        Driver::new(
            Config::default(),
            "ana".into(),
            FixedLocation(Position::new(0.0, 0.0)),
            event_tx,
        )
    }

    #[test]
    fn events_from_superseded_sockets_are_dropped() {
        let mut driver = driver();
        let old = ConnectionId { generation: 1 };
        let current = old.next();
        driver.current = Some(current);

        let late_close = ConnectionEvent::Closed {
            id: old,
            reason: CloseReason::abnormal(Some(1006), "reset"),
        };
        assert_eq!(driver.on_connection_event(late_close), None);
        let late_frame = ConnectionEvent::Frame {
            id: old,
            text: r#"{"type":"connected","client_id":"old"}"#.into(),
        };
        assert_eq!(driver.on_connection_event(late_frame), None);
        assert_eq!(driver.current, Some(current));

        assert_eq!(
            driver.on_connection_event(ConnectionEvent::Opened { id: current }),
            Some(Input::Opened)
        );
        assert_eq!(
            driver.on_connection_event(ConnectionEvent::Closed {
                id: current,
                reason: CloseReason::Clean
            }),
            Some(Input::Closed(CloseReason::Clean))
        );
        assert_eq!(driver.current, None);
    }

    #[test]
    fn nothing_is_current_before_the_first_socket() {
        let mut driver = driver();
        let first = ConnectionId { generation: 0 }.next();
        assert_eq!(driver.on_connection_event(ConnectionEvent::Opened { id: first }), None);
    }
}
