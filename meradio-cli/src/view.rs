//! Turns session events into lines for the terminal.
use meradio::{CloseReason, ClientId, ConnectionState, Event, Message, Peer};

/// Which side of the conversation a message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Written by someone else.
    Left,
    /// Written by this client.
    Right,
}

/// What has been shown so far.
///
/// The session always reports the full list of visible messages; only the ones not printed yet are rendered.
#[derive(Debug, Default)]
pub struct ChatView {
    own_id: Option<ClientId>,
    shown: Vec<Message>,
    peers: Vec<Peer>,
}

impl ChatView {
    /// Processes an event and returns the lines to print.
    pub fn process_event(&mut self, event: &Event) -> Vec<String> {
        match event {
            Event::StateChanged(state) => status_line(state).into_iter().collect(),
            Event::Connected { client_id } => {
                self.own_id = Some(client_id.clone());
                vec![format!("* connected as {client_id}")]
            }
            Event::Abandoned => vec!["* could not reach the server, giving up".to_string()],
            Event::VisibleMessages(messages) => {
                let lines = messages
                    .iter()
                    .filter(|message| !self.shown.contains(message))
                    .map(|message| format_message(message, self.side(message)))
                    .collect();
                self.shown = messages.clone();
                lines
            }
            Event::PeersInRange(peers) => {
                self.peers = peers.clone();
                Vec::new()
            }
            Event::LocationError(reason) => vec![format!("* location unavailable ({reason}), using the default position")],
            Event::ServerError(message) => vec![format!("* server error: {message}")],
        }
    }

    /// The latest users in range, one line each.
    pub fn peer_lines(&self) -> Vec<String> {
        if self.peers.is_empty() {
            return vec!["* nobody in range".to_string()];
        }
        self.peers
            .iter()
            .map(|peer| {
                format!(
                    "* {} at {:.5}, {:.5}",
                    peer.username, peer.position.lat, peer.position.lon
                )
            })
            .collect()
    }

    fn side(&self, message: &Message) -> Side {
        if self.own_id.as_ref() == Some(&message.author_id) {
            Side::Right
        } else {
            Side::Left
        }
    }
}

fn status_line(state: &ConnectionState) -> Option<String> {
    let line = match state {
        ConnectionState::Connecting => "* connecting...".to_string(),
        ConnectionState::Open => "* online".to_string(),
        ConnectionState::Closed(CloseReason::Abnormal { reason, .. }) => format!("* connection lost: {reason}"),
        ConnectionState::Closed(CloseReason::Clean) => "* disconnected".to_string(),
        ConnectionState::Idle | ConnectionState::Closing | ConnectionState::Abandoned => return None,
    };
    Some(line)
}

pub fn format_message(message: &Message, side: Side) -> String {
    match side {
        Side::Left => format!("<{}> {}", message.author_name, message.content),
        Side::Right => format!("{:>width$}", format!("{} <you>", message.content), width = 40),
    }
}
