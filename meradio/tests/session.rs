use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use meradio::{
    ClientId, CloseReason, Config, ConnectionState, Error, Event, LocationMode, Message, Position, Session,
    config::RetryConfig,
    location::{self, FixedLocation, LocationError},
};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{
    WebSocketStream,
    tungstenite::{
        Message as WsMessage,
        protocol::{CloseFrame, frame::coding::CloseCode},
    },
};

const KIOSKO: Position = Position::new(-31.3684186, -64.238123);
const Q2: Position = Position::new(-31.270729, -64.4587293);
const ORIGIN: Position = Position::new(0.0, 0.0);

fn config(endpoint: String) -> Config {
    Config {
        endpoint,
        heartbeat_interval_ms: 60_000,
        retry: RetryConfig {
            base_delay_ms: 20,
            max_delay_ms: 80,
            max_attempts: 5,
        },
        ..Config::default()
    }
}

async fn listen() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = format!("ws://{}", listener.local_addr().unwrap());
    (listener, endpoint)
}

async fn accept(listener: &TcpListener) -> WebSocketStream<TcpStream> {
    let (stream, _) = listener.accept().await.unwrap();
    tokio_tungstenite::accept_async(stream).await.unwrap()
}

/// Reads the next text frame as JSON. `None` once the client closes.
async fn next_json(ws: &mut WebSocketStream<TcpStream>) -> Option<Value> {
    while let Some(frame) = ws.next().await {
        match frame.ok()? {
            WsMessage::Text(text) => return Some(serde_json::from_str(&text).unwrap()),
            WsMessage::Close(_) => return None,
            _ => {}
        }
    }
    None
}

async fn send_json(ws: &mut WebSocketStream<TcpStream>, value: Value) {
    ws.send(WsMessage::Text(value.to_string().into())).await.unwrap();
}

/// Plays the server's side of the handshake and returns the client's bootstrap frames.
async fn handshake(ws: &mut WebSocketStream<TcpStream>, client_id: &str) -> (Value, Vec<Value>) {
    let connect = next_json(ws).await.unwrap();
    send_json(ws, json!({ "type": "connected", "client_id": client_id })).await;
    let bootstrap = vec![next_json(ws).await.unwrap(), next_json(ws).await.unwrap()];
    (connect, bootstrap)
}

fn contents(messages: &[Message]) -> Vec<&str> {
    messages.iter().map(|message| message.content.as_str()).collect()
}

fn kinds(frames: &[Value]) -> Vec<&str> {
    frames.iter().map(|frame| frame["type"].as_str().unwrap()).collect()
}

async fn wait_for(session: &mut Session, mut predicate: impl FnMut(&Event) -> bool) -> Event {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = session.next_event().await.expect("session ended early");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for an event")
}

#[tokio::test]
async fn handshake_history_send_and_shutdown() {
    let (listener, endpoint) = listen().await;

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let (connect, bootstrap) = handshake(&mut ws, "c1").await;
        assert_eq!(connect["type"], "connect");
        assert_eq!(connect["username"], "ana");
        assert_eq!(kinds(&bootstrap), ["get_history_messages", "sent_location"]);
        assert_eq!(bootstrap[0]["client_id"], "c1");

        send_json(
            &mut ws,
            json!({
                "type": "messages_history",
                "messages": [
                    { "client_id": "c2", "username": "bob", "content": "nearby", "lat": KIOSKO.lat, "lon": KIOSKO.lon, "timestamp": 1 },
                    { "client_id": "c3", "username": "eve", "content": "far away", "lat": Q2.lat, "lon": Q2.lon, "timestamp": 2 },
                ],
            }),
        )
        .await;

        let sent = next_json(&mut ws).await.unwrap();
        assert_eq!(sent["type"], "sent_message");
        assert_eq!(sent["content"], "hola");
        assert_eq!(sent["client_id"], "c1");
        assert_eq!(sent["username"], "ana");

        let goodbye = next_json(&mut ws).await.unwrap();
        assert_eq!(goodbye, json!({ "type": "disconnect", "client_id": "c1" }));
        assert!(next_json(&mut ws).await.is_none());
    });

    let mut session = Session::spawn(config(endpoint), "ana", FixedLocation(KIOSKO)).unwrap();

    let connected = wait_for(&mut session, |event| matches!(event, Event::Connected { .. })).await;
    assert_eq!(
        connected,
        Event::Connected {
            client_id: ClientId::new("c1")
        }
    );

    let Event::VisibleMessages(visible) =
        wait_for(&mut session, |event| matches!(event, Event::VisibleMessages(m) if !m.is_empty())).await
    else {
        unreachable!()
    };
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].content, "nearby");

    session.send_message("hola").await;
    let Event::VisibleMessages(visible) =
        wait_for(&mut session, |event| matches!(event, Event::VisibleMessages(m) if m.len() == 2)).await
    else {
        unreachable!()
    };
    assert_eq!(visible[1].content, "hola");
    assert_eq!(visible[1].author_name, "ana");

    session.shutdown().await;
    server.await.unwrap();
}

#[tokio::test]
async fn reconnect_keeps_the_identity() {
    let (listener, endpoint) = listen().await;
    let (resumed_tx, resumed_rx) = tokio::sync::oneshot::channel();

    let server = tokio::spawn(async move {
        let mut first = accept(&listener).await;
        let (connect, _) = handshake(&mut first, "c1").await;
        assert_eq!(connect["type"], "connect");
        // Vanish without a closing handshake.
        drop(first);

        let mut second = accept(&listener).await;
        let resumed = next_json(&mut second).await.unwrap();
        assert_eq!(resumed["type"], "sent_location");
        assert_eq!(resumed["client_id"], "c1");
        let _ = resumed_tx.send(());
        let goodbye = next_json(&mut second).await.unwrap();
        assert_eq!(goodbye["type"], "disconnect");
    });

    let mut session = Session::spawn(config(endpoint), "ana", FixedLocation(KIOSKO)).unwrap();

    wait_for(&mut session, |event| {
        matches!(event, Event::StateChanged(ConnectionState::Closed(CloseReason::Abnormal { .. })))
    })
    .await;
    wait_for(&mut session, |event| *event == Event::StateChanged(ConnectionState::Open)).await;
    tokio::time::timeout(Duration::from_secs(10), resumed_rx)
        .await
        .unwrap()
        .unwrap();

    session.shutdown().await;
    server.await.unwrap();
}

#[tokio::test]
async fn gives_up_after_the_retry_budget() {
    let (listener, endpoint) = listen().await;
    drop(listener);

    let mut session = Session::spawn(config(endpoint), "ana", FixedLocation(KIOSKO)).unwrap();

    let events = tokio::time::timeout(Duration::from_secs(10), async {
        let mut events = Vec::new();
        while let Some(event) = session.next_event().await {
            events.push(event);
        }
        events
    })
    .await
    .expect("session did not terminate");

    let attempts = events
        .iter()
        .filter(|event| **event == Event::StateChanged(ConnectionState::Connecting))
        .count();
    assert_eq!(attempts, 6);
    assert_eq!(events.iter().filter(|event| **event == Event::Abandoned).count(), 1);
    assert_eq!(events.last(), Some(&Event::Abandoned));
}

#[tokio::test]
async fn preset_location_and_clean_server_close() {
    let (listener, endpoint) = listen().await;

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let (connect, _) = handshake(&mut ws, "c9").await;
        assert_eq!(connect["lat"], KIOSKO.lat);
        assert_eq!(connect["lon"], KIOSKO.lon);
        ws.close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "bye".to_string().into(),
        }))
        .await
        .unwrap();
    });

    // The live source never produces a fix, so the session waits for the preset.
    let (_feed, source) = location::channel();
    let mut session = Session::spawn(config(endpoint), "ana", source).unwrap();
    session.select_location(LocationMode::Preset(KIOSKO)).await;

    wait_for(&mut session, |event| {
        *event == Event::StateChanged(ConnectionState::Closed(CloseReason::Clean))
    })
    .await;
    // A clean close by the server ends the session without a retry.
    tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = session.next_event().await {
            assert_ne!(event, Event::StateChanged(ConnectionState::Connecting));
        }
    })
    .await
    .unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn starting_on_a_preset_never_reads_the_live_source() {
    let (listener, endpoint) = listen().await;

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let (connect, _) = handshake(&mut ws, "c5").await;
        assert_eq!(connect["lat"], KIOSKO.lat);
        assert_eq!(connect["lon"], KIOSKO.lon);
        while next_json(&mut ws).await.is_some() {}
    });

    let (feed, source) = location::channel();
    feed.fail(LocationError::Unavailable("no gps".into()));
    let mut session =
        Session::spawn_with_mode(config(endpoint), "ana", source, LocationMode::Preset(KIOSKO)).unwrap();

    let mut advisories = 0;
    wait_for(&mut session, |event| {
        if matches!(event, Event::LocationError(_)) {
            advisories += 1;
        }
        matches!(event, Event::Connected { .. })
    })
    .await;
    assert_eq!(advisories, 0);

    session.shutdown().await;
    server.await.unwrap();
}

#[tokio::test]
async fn a_preset_replaces_the_live_subscription() {
    let (listener, endpoint) = listen().await;

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let (connect, _) = handshake(&mut ws, "c7").await;
        assert_eq!(connect["lat"], KIOSKO.lat);
        send_json(
            &mut ws,
            json!({
                "type": "messages_history",
                "messages": [
                    { "client_id": "c2", "username": "bob", "content": "pinned", "lat": Q2.lat, "lon": Q2.lon, "timestamp": 1 },
                    { "client_id": "c3", "username": "eve", "content": "elsewhere", "lat": ORIGIN.lat, "lon": ORIGIN.lon, "timestamp": 2 },
                ],
            }),
        )
        .await;

        // Once the preset shows up in the heartbeat it must never leave it.
        let mut pinned = 0;
        while let Some(frame) = next_json(&mut ws).await {
            if frame["type"] != "sent_location" {
                continue;
            }
            if frame["lat"] == Q2.lat && frame["lon"] == Q2.lon {
                pinned += 1;
            } else {
                assert_eq!(pinned, 0, "heartbeat left the preset: {frame}");
            }
        }
        pinned
    });

    let (feed, source) = location::channel();
    feed.set(KIOSKO);
    let mut session = Session::spawn(
        Config {
            heartbeat_interval_ms: 50,
            ..config(endpoint)
        },
        "ana",
        source,
    )
    .unwrap();

    wait_for(&mut session, |event| matches!(event, Event::Connected { .. })).await;
    session.select_location(LocationMode::Preset(Q2)).await;
    wait_for(&mut session, |event| {
        matches!(event, Event::VisibleMessages(messages) if contents(messages) == ["pinned"])
    })
    .await;

    // The live feed moves, but nobody is subscribed to it anymore.
    feed.set(ORIGIN);
    for _ in 0..5 {
        let Event::VisibleMessages(visible) =
            wait_for(&mut session, |event| matches!(event, Event::VisibleMessages(_))).await
        else {
            unreachable!()
        };
        assert_eq!(contents(&visible), ["pinned"]);
    }

    session.shutdown().await;
    assert!(server.await.unwrap() >= 5);
}

#[test]
fn blank_usernames_are_rejected() {
    let result = Session::spawn(Config::default(), "  ", FixedLocation(KIOSKO));
    assert!(matches!(result, Err(Error::EmptyUsername)));
}
