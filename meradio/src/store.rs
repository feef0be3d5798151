//! The geofenced message store and the roster of peers in range.
use std::collections::BTreeMap;

use crate::{
    api::{ClientId, Message, Peer},
    geo::Position,
};

/// An append-only log of every message seen during the session.
///
/// The set of messages shown to the user is never stored. It is derived from the log on demand by
/// [MessageStore::visible_messages], so it can never go stale relative to the current position or the log.
#[derive(Debug, Clone)]
pub struct MessageStore {
    log: Vec<Message>,
    radius_m: f64,
}

impl MessageStore {
    pub fn new(radius_m: f64) -> Self {
        Self {
            log: Vec::new(),
            radius_m,
        }
    }

    /// Replaces the whole log with a history snapshot from the server.
    pub fn ingest_history(&mut self, messages: Vec<Message>) {
        self.log = messages;
    }

    /// Appends a message received from the stream.
    ///
    /// Messages authored under the `local` identity are dropped: those were already appended by
    /// [Self::append_local] when they were sent. Returns whether the log changed.
    pub fn ingest_message(&mut self, message: Message, local: Option<&ClientId>) -> bool {
        if local.is_some_and(|id| *id == message.author_id) {
            return false;
        }
        self.log.push(message);
        true
    }

    /// Appends a self-authored message before the server has seen it.
    pub fn append_local(&mut self, message: Message) {
        self.log.push(message);
    }

    /// The messages within radius of `position`, in log order. Empty while the position is unresolved.
    pub fn visible_messages(&self, position: Option<Position>) -> Vec<Message> {
        let Some(position) = position else {
            return Vec::new();
        };
        self.log
            .iter()
            .filter(|message| position.within(&message.position, self.radius_m))
            .cloned()
            .collect()
    }

    pub fn messages(&self) -> &[Message] {
        &self.log
    }

    pub fn len(&self) -> usize {
        self.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }
}

/// The other users the server reports as being within radius.
#[derive(Debug, Clone, Default)]
pub struct PeerRoster {
    peers: BTreeMap<ClientId, Peer>,
}

impl PeerRoster {
    /// Replaces the roster wholesale. Nothing from the previous roster is kept.
    pub fn replace(&mut self, users: Vec<Peer>) {
        self.peers = users
            .into_iter()
            .map(|peer| (peer.client_id.clone(), peer))
            .collect();
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.peers.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
