//! Location sources.
//!
//! The session reads positions from a [LocationSource]: a one-shot [LocationSource::current] fetch followed by a
//! [LocationSource::watch] subscription. [LocationMode::Preset] replaces live tracking with a fixed coordinate.
use futures::{
    future::BoxFuture,
    stream::{self, BoxStream},
};
use futures_util::{FutureExt, StreamExt};
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use crate::geo::Position;

/// A stream of position updates from a live source.
pub type LocationStream = BoxStream<'static, Result<Position, LocationError>>;

/// Why a position could not be resolved.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LocationError {
    #[error("location permission denied")]
    PermissionDenied,
    #[error("location unavailable: {0}")]
    Unavailable(String),
    #[error("timed out waiting for a location fix")]
    Timeout,
}

/// Something that knows where the user is.
pub trait LocationSource: Send + 'static {
    /// Resolves the current position once.
    fn current(&self) -> BoxFuture<'static, Result<Position, LocationError>>;

    /// Subscribes to position changes. Dropping the stream ends the subscription.
    fn watch(&self) -> LocationStream;
}

/// Where the session takes its position from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LocationMode {
    /// Track the [LocationSource].
    Live,
    /// Use a fixed coordinate instead of tracking.
    Preset(Position),
}

/// Subscribes to `source`: its current position first, then every change.
pub(crate) fn live_updates<L: LocationSource>(source: &L) -> LocationStream {
    stream::once(source.current()).chain(source.watch()).boxed()
}

/// A source that never moves.
#[derive(Debug, Clone, Copy)]
pub struct FixedLocation(pub Position);

impl LocationSource for FixedLocation {
    fn current(&self) -> BoxFuture<'static, Result<Position, LocationError>> {
        futures::future::ready(Ok(self.0)).boxed()
    }

    fn watch(&self) -> LocationStream {
        stream::pending().boxed()
    }
}

type Fix = Option<Result<Position, LocationError>>;

/// Creates a source fed by hand, e.g. from user input or a platform location service.
pub fn channel() -> (LocationFeed, ChannelLocation) {
    let (tx, rx) = watch::channel(None);
    (LocationFeed { tx }, ChannelLocation { rx })
}

/// The writing half of [channel].
#[derive(Debug)]
pub struct LocationFeed {
    tx: watch::Sender<Fix>,
}

impl LocationFeed {
    pub fn set(&self, position: Position) {
        self.tx.send_replace(Some(Ok(position)));
    }

    pub fn fail(&self, error: LocationError) {
        self.tx.send_replace(Some(Err(error)));
    }
}

/// The reading half of [channel]. `current` waits for the first fix.
#[derive(Debug, Clone)]
pub struct ChannelLocation {
    rx: watch::Receiver<Fix>,
}

impl LocationSource for ChannelLocation {
    fn current(&self) -> BoxFuture<'static, Result<Position, LocationError>> {
        let mut rx = self.rx.clone();
        async move {
            let fix = {
                let fix = rx
                    .wait_for(Option::is_some)
                    .await
                    .map_err(|_| LocationError::Unavailable("location feed closed".into()))?;
                fix.clone()
            };
            fix.unwrap_or_else(|| Err(LocationError::Unavailable("no fix".into())))
        }
        .boxed()
    }

    fn watch(&self) -> LocationStream {
        WatchStream::from_changes(self.rx.clone())
            .filter_map(|fix| std::future::ready(fix))
            .boxed()
    }
}
