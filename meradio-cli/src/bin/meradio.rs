//! A line based terminal client for the proximity chat.
use std::path::PathBuf;

use clap::Parser;
use meradio::{Config, LocationError, LocationMode, Position, Session, location};
use meradio_cli::{
    input::{self, Command, HELP},
    view::ChatView,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "meradio", version, about = "Chat with the people around you")]
struct Args {
    /// The name shown to other users
    #[arg(long, short)]
    username: String,
    /// A TOML config file
    #[arg(long, short)]
    config: Option<PathBuf>,
    /// Overrides the server endpoint, e.g. ws://localhost:8000/ws
    #[arg(long)]
    endpoint: Option<String>,
    /// Initial latitude
    #[arg(long, requires = "lon", allow_negative_numbers = true)]
    lat: Option<f64>,
    /// Initial longitude
    #[arg(long, requires = "lat", allow_negative_numbers = true)]
    lon: Option<f64>,
    /// Start pinned to a named preset instead of tracking
    #[arg(long)]
    at: Option<String>,
    /// Verbose logging (-v for debug, -vv for trace)
    #[arg(long, short, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> meradio::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(endpoint) = args.endpoint {
        config.endpoint = endpoint;
    }
    let start_preset = args.at.as_deref().map(|name| config.preset(name)).transpose()?;

    // A terminal has no location provider; fixes come from the command line and `/move`.
    let (feed, source) = location::channel();
    match (args.lat, args.lon) {
        (Some(lat), Some(lon)) => feed.set(Position::new(lat, lon)),
        _ => feed.fail(LocationError::Unavailable("no position given".into())),
    }

    tracing::info!(endpoint = %config.endpoint, "meradio v{} starting", env!("CARGO_PKG_VERSION"));
    let mode = start_preset.map_or(LocationMode::Live, LocationMode::Preset);
    let mut session = Session::spawn_with_mode(config.clone(), args.username, source, mode)?;

    let mut view = ChatView::default();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("type /help for commands");

    loop {
        tokio::select! {
            event = session.next_event() => match event {
                Some(event) => {
                    for line in view.process_event(&event) {
                        println!("{line}");
                    }
                }
                None => break,
            },
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    // stdin closed
                    Ok(None) => break,
                    Err(err) => {
                        tracing::error!("failed to read input: {err}");
                        break;
                    }
                };
                match input::parse(&line) {
                    Ok(Some(Command::Send(content))) => session.send_message(content).await,
                    Ok(Some(Command::Move(position))) => {
                        feed.set(position);
                        session.select_location(LocationMode::Live).await;
                    }
                    Ok(Some(Command::At(name))) => match config.preset(&name) {
                        Ok(position) => session.select_location(LocationMode::Preset(position)).await,
                        Err(err) => println!("* {err}"),
                    },
                    Ok(Some(Command::Live)) => session.select_location(LocationMode::Live).await,
                    Ok(Some(Command::Peers)) => {
                        for line in view.peer_lines() {
                            println!("{line}");
                        }
                    }
                    Ok(Some(Command::Help)) => println!("{HELP}"),
                    Ok(Some(Command::Quit)) => break,
                    Ok(None) => {}
                    Err(err) => println!("* {err}"),
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    session.shutdown().await;
    tracing::info!("bye");
    Ok(())
}

fn init_tracing(verbosity: u8) {
    // RUST_LOG wins over -v
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = match verbosity {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        EnvFilter::new(format!("{level},tungstenite=warn,tokio_tungstenite=warn"))
    });

    // Logs go to stderr, the chat to stdout.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
