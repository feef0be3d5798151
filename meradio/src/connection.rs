//! A single WebSocket connection to the chat server.
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{
    Message as WsMessage,
    protocol::{CloseFrame, frame::coding::CloseCode},
};
use tracing::{debug, warn};

use crate::controller::CloseReason;

pub(crate) const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Frames queued beyond this are dropped instead of blocking the session.
const QUEUE_CAPACITY: usize = 32;

/// Identifies one socket instance of a session.
///
/// Every reconnect creates a new instance with the next generation, so events still in flight from a superseded
/// socket can be recognised and dropped.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub(crate) struct ConnectionId {
    pub generation: u64,
}

impl ConnectionId {
    pub fn next(self) -> Self {
        Self {
            generation: self.generation + 1,
        }
    }
}

/// What a connection reports back to the connection manager.
#[derive(Debug)]
pub(crate) enum ConnectionEvent {
    Opened { id: ConnectionId },
    Frame { id: ConnectionId, text: String },
    Closed { id: ConnectionId, reason: CloseReason },
}

impl ConnectionEvent {
    pub fn id(&self) -> ConnectionId {
        match self {
            ConnectionEvent::Opened { id } | ConnectionEvent::Frame { id, .. } | ConnectionEvent::Closed { id, .. } => {
                *id
            }
        }
    }
}

/// Work queued for the connection's task, processed in order.
enum Outgoing {
    Text(String),
    Close,
}

/// A WebSocket connection to the chat server.
///
/// During [Self::spawn] a task is created that opens the socket and then serves it until it closes. The task wakes up
/// for three reasons:
///
/// 1. The cancellation token is triggered by [Self::abort]. The socket is dropped without a closing handshake and
///    nothing is reported; this is used when the connection has been superseded.
/// 2. Outgoing work is queued by [Self::send] or [Self::close]. Text frames are written in order; a close request
///    writes a normal close frame after every frame queued before it, and ends the task.
/// 3. A frame arrives from the server. Text frames are reported as [ConnectionEvent::Frame]; a close frame, an error
///    or the end of the stream ends the task.
///
/// Whenever the task ends on its own, it reports a final [ConnectionEvent::Closed].
pub(crate) struct Connection {
    /// A channel to queue outgoing work for the connection's running task.
    sender: mpsc::Sender<Outgoing>,
    /// A token to signal the running task to drop the socket and stop.
    token: tokio_util::sync::CancellationToken,
    /// The running task's join handle so it is possible to await its termination.
    handle: tokio::task::JoinHandle<()>,
}

impl Connection {
    pub fn spawn(url: String, id: ConnectionId, events: mpsc::UnboundedSender<ConnectionEvent>) -> Self {
        let (tx, mut rx) = mpsc::channel(QUEUE_CAPACITY);
        let token = tokio_util::sync::CancellationToken::new();
        let cancellation_token = token.clone();

        let handle = tokio::spawn(async move {
            let reason = tokio::select! {
                _ = cancellation_token.cancelled() => {
                    debug!(generation = id.generation, "connection superseded");
                    return;
                }
                reason = serve(&url, id, &mut rx, &events) => reason,
            };
            let _ = events.send(ConnectionEvent::Closed { id, reason });
        });

        Self {
            sender: tx,
            token,
            handle,
        }
    }

    /// Queues a text frame without waiting. Returns false when the frame was dropped.
    pub fn send(&self, text: String) -> bool {
        match self.sender.try_send(Outgoing::Text(text)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("socket is not draining, frame dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("connection task already stopped, frame dropped");
                false
            }
        }
    }

    /// Closes the socket after every queued frame has been written, and waits for the task to stop.
    ///
    /// A socket that does not finish closing within [CLOSE_TIMEOUT], queueing included, is dropped.
    pub async fn close(mut self) {
        let closed = tokio::time::timeout(CLOSE_TIMEOUT, async {
            let _ = self.sender.send(Outgoing::Close).await;
            let _ = (&mut self.handle).await;
        })
        .await;
        if closed.is_err() {
            warn!("socket did not close in time, dropping it");
            self.token.cancel();
        }
    }

    /// Drops the socket without waiting for anything.
    pub fn abort(self) {
        self.token.cancel();
    }
}

async fn serve(
    url: &str,
    id: ConnectionId,
    outgoing: &mut mpsc::Receiver<Outgoing>,
    events: &mpsc::UnboundedSender<ConnectionEvent>,
) -> CloseReason {
    let stream = match tokio_tungstenite::connect_async(url).await {
        Ok((stream, _response)) => stream,
        Err(err) => {
            warn!(%url, error = %err, "websocket connect failed");
            return CloseReason::abnormal(None, err.to_string());
        }
    };
    debug!(%url, generation = id.generation, "websocket open");
    let _ = events.send(ConnectionEvent::Opened { id });

    let (mut sink, mut frames) = stream.split();
    loop {
        tokio::select! {
            work = outgoing.recv() => match work {
                Some(Outgoing::Text(text)) => {
                    if let Err(err) = sink.send(WsMessage::Text(text.into())).await {
                        return CloseReason::abnormal(None, err.to_string());
                    }
                }
                // The manager dropped its handle, or asked for a graceful close.
                Some(Outgoing::Close) | None => {
                    let frame = CloseFrame {
                        code: CloseCode::Normal,
                        reason: String::from("client shutdown").into(),
                    };
                    if let Err(err) = sink.send(WsMessage::Close(Some(frame))).await {
                        debug!(error = %err, "close frame not delivered");
                    }
                    return CloseReason::Clean;
                }
            },
            frame = frames.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    let _ = events.send(ConnectionEvent::Frame { id, text: text.to_string() });
                }
                Some(Ok(WsMessage::Close(frame))) => return close_reason(frame),
                // Pings are answered by tungstenite itself.
                Some(Ok(_)) => {}
                Some(Err(err)) => return CloseReason::abnormal(None, err.to_string()),
                None => return CloseReason::abnormal(Some(1006), "stream ended without a close frame"),
            },
        }
    }
}

/// Classifies a close frame sent by the server.
///
/// A normal close, or a close without a status code, is clean. Anything else is unexpected and will be retried.
fn close_reason(frame: Option<CloseFrame>) -> CloseReason {
    match frame {
        None => CloseReason::Clean,
        Some(frame) if frame.code == CloseCode::Normal => CloseReason::Clean,
        Some(frame) => CloseReason::abnormal(Some(u16::from(frame.code)), frame.reason.to_string()),
    }
}
