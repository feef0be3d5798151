//! Parsing of the lines typed at the prompt.
use meradio::Position;

/// What a line of input asks for.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Plain text is sent as a chat message.
    Send(String),
    /// `/move <lat> <lon>` reports a live position fix.
    Move(Position),
    /// `/at <preset>` pins the position to a named preset.
    At(String),
    /// `/live` goes back to live tracking.
    Live,
    /// `/peers` lists the users in range.
    Peers,
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseError {
    #[error("unknown command `/{0}`, try /help")]
    UnknownCommand(String),
    #[error("usage: {0}")]
    Usage(&'static str),
}

pub const HELP: &str = "\
commands:
  <text>             send a message to everyone nearby
  /move <lat> <lon>  report your live position
  /at <preset>       pin your position to a named preset
  /live              go back to live tracking
  /peers             list the users in range
  /help              show this help
  /quit              leave the chat";

/// Parses one line of input. Blank lines yield `None`.
pub fn parse(line: &str) -> Result<Option<Command>, ParseError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Some(Command::Send(line.to_string())));
    };

    let mut words = rest.split_whitespace();
    let name = words.next().unwrap_or_default();
    let args: Vec<&str> = words.collect();

    let command = match (name, args.as_slice()) {
        ("move", [lat, lon]) => match (lat.parse::<f64>(), lon.parse::<f64>()) {
            (Ok(lat), Ok(lon)) if (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon) => {
                Command::Move(Position::new(lat, lon))
            }
            _ => return Err(ParseError::Usage("/move <lat> <lon> with lat in -90..90 and lon in -180..180")),
        },
        ("move", _) => return Err(ParseError::Usage("/move <lat> <lon>")),
        ("at", [preset]) => Command::At(preset.to_string()),
        ("at", _) => return Err(ParseError::Usage("/at <preset>")),
        ("live", []) => Command::Live,
        ("peers", []) => Command::Peers,
        ("help", _) => Command::Help,
        ("quit" | "exit", _) => Command::Quit,
        ("live" | "peers", _) => return Err(ParseError::Usage("the command takes no arguments")),
        (other, _) => return Err(ParseError::UnknownCommand(other.to_string())),
    };
    Ok(Some(command))
}
