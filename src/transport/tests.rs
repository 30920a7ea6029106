use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::mpsc::Receiver;

use super::message::{ClientMessage, ControlMessage, Request, ServerMessage};
use super::session::{Session, SessionState};
use crate::broker::PriceFeed;
use crate::bus::MemoryTransport;
use crate::config::Settings;
use crate::store::MemoryPriceStore;

fn feed_with(settings: Settings) -> (Arc<PriceFeed>, MemoryTransport, Arc<MemoryPriceStore>) {
    let transport = MemoryTransport::new();
    let store = Arc::new(MemoryPriceStore::new());
    let feed = Arc::new(PriceFeed::new(
        settings,
        Arc::new(transport.clone()),
        store.clone(),
    ));
    (feed, transport, store)
}

fn feed() -> (Arc<PriceFeed>, MemoryTransport, Arc<MemoryPriceStore>) {
    feed_with(Settings::default())
}

async fn next_json(rx: &mut Receiver<ServerMessage>) -> Value {
    let message = tokio::time::timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("outbound queue closed");
    serde_json::from_str(&message.to_json().unwrap()).unwrap()
}

#[test]
fn test_parse_subscribe_and_unsubscribe() {
    let request =
        ClientMessage::parse(r#"{"action":"subscribe","securities":["AAPL"," MSFT ",""]}"#)
            .unwrap();
    assert_eq!(
        request,
        Request::Subscribe(vec!["AAPL".to_string(), "MSFT".to_string()])
    );

    let request = ClientMessage::parse(r#"{"action":"unsubscribe","securities":["AAPL"]}"#).unwrap();
    assert_eq!(request, Request::Unsubscribe(vec!["AAPL".to_string()]));

    // securities defaults to empty
    let request = ClientMessage::parse(r#"{"action":"subscribe"}"#).unwrap();
    assert_eq!(request, Request::Subscribe(Vec::new()));
}

#[test]
fn test_parse_unknown_actions() {
    assert_eq!(
        ClientMessage::parse(r#"{"action":"publish"}"#).unwrap(),
        Request::Unknown("publish".to_string())
    );
    assert_eq!(
        ClientMessage::parse(r#"{"securities":["AAPL"]}"#).unwrap(),
        Request::Unknown("none".to_string())
    );
    assert_eq!(
        ClientMessage::parse(r#"{"action":42}"#).unwrap(),
        Request::Unknown("42".to_string())
    );
    assert!(ClientMessage::parse("{not json").is_err());
}

#[test]
fn test_server_message_wire_format() {
    let price: Value = serde_json::from_str(&ServerMessage::price("AAPL", 150.25).to_json().unwrap()).unwrap();
    assert_eq!(price, json!({"ticker": "AAPL", "price": 150.25}));

    let hello: Value =
        serde_json::from_str(&ServerMessage::connection_established().to_json().unwrap()).unwrap();
    assert_eq!(
        hello,
        json!({"type": "connection_established", "message": "Connected to WebSocket server"})
    );

    let echo: Value = serde_json::from_str(&ServerMessage::echo("hi").to_json().unwrap()).unwrap();
    assert_eq!(echo, json!({"type": "echo", "message": "hi"}));

    let error: Value = serde_json::from_str(&ServerMessage::error("bad").to_json().unwrap()).unwrap();
    assert_eq!(error, json!({"type": "error", "message": "bad"}));

    match ServerMessage::heartbeat() {
        ServerMessage::Control(ControlMessage::Heartbeat { timestamp }) => {
            assert!(chrono::DateTime::parse_from_rfc3339(&timestamp).is_ok());
        }
        other => panic!("unexpected message: {other:?}"),
    }
}

#[tokio::test]
async fn test_session_open_acknowledges_and_registers() {
    let (feed, _, _) = feed();
    let (mut session, mut rx) = Session::open(Arc::clone(&feed));

    assert_eq!(session.state(), SessionState::Active);
    assert!(feed.clients().is_registered(session.id()));

    let hello = next_json(&mut rx).await;
    assert_eq!(hello["type"], "connection_established");
    assert_eq!(hello["message"], "Connected to WebSocket server");

    session.close().await;
}

#[tokio::test]
async fn test_subscribe_sends_snapshot_and_registers_interest() {
    let (feed, _, store) = feed();
    store.set("AAPL", 189.5);
    let (mut session, mut rx) = Session::open(Arc::clone(&feed));
    next_json(&mut rx).await;

    session
        .handle_text(r#"{"action":"subscribe","securities":["AAPL","MSFT"]}"#)
        .await;

    assert_eq!(next_json(&mut rx).await, json!({"ticker": "AAPL", "price": 189.5}));
    assert!(session.topics().contains("AAPL"));
    assert!(session.topics().contains("MSFT"));
    assert_eq!(feed.subscriptions().interested_clients("MSFT"), vec![session.id().to_string()]);

    // already held: no second snapshot
    session
        .handle_text(r#"{"action":"subscribe","securities":["AAPL"]}"#)
        .await;
    assert!(rx.try_recv().is_err());

    session
        .handle_text(r#"{"action":"unsubscribe","securities":["AAPL","IBM"]}"#)
        .await;
    assert!(!session.topics().contains("AAPL"));
    assert!(!feed.subscriptions().is_active("AAPL"));
    assert!(feed.subscriptions().is_active("MSFT"));

    session.close().await;
}

#[tokio::test]
async fn test_unknown_action_and_bad_json_get_replies() {
    let (feed, _, _) = feed();
    let (mut session, mut rx) = Session::open(feed);
    next_json(&mut rx).await;

    session.handle_text(r#"{"action":"dance"}"#).await;
    assert_eq!(
        next_json(&mut rx).await,
        json!({"type": "echo", "message": "Received unknown action: dance"})
    );

    session.handle_text("not json at all").await;
    let error = next_json(&mut rx).await;
    assert_eq!(error["type"], "error");
    assert!(
        error["message"]
            .as_str()
            .unwrap()
            .starts_with("Error processing message: ")
    );
    assert_eq!(session.state(), SessionState::Active);

    session.close().await;
}

#[tokio::test]
async fn test_failed_upstream_subscribe_is_reported() {
    let mut settings = Settings::default();
    settings.bus.restart_delay_ms = 10;
    settings.bus.reconnect.initial_delay_ms = 5;
    let (feed, transport, _) = feed_with(settings);
    let _stream = feed.bus().connect().await.unwrap();

    let (mut session, mut rx) = Session::open(Arc::clone(&feed));
    next_json(&mut rx).await;

    transport.set_available(false);
    session
        .handle_text(r#"{"action":"subscribe","securities":["AAPL"]}"#)
        .await;

    let error = next_json(&mut rx).await;
    assert_eq!(error["type"], "error");
    assert!(
        error["message"]
            .as_str()
            .unwrap()
            .starts_with("Failed to subscribe to AAPL: ")
    );
    assert!(session.topics().is_empty());
    assert!(!feed.subscriptions().is_active("AAPL"));

    session.close().await;
}

#[tokio::test]
async fn test_close_releases_everything_and_is_idempotent() {
    let (feed, _, _) = feed();
    let (mut session, _rx) = Session::open(Arc::clone(&feed));
    let (mut other, _other_rx) = Session::open(Arc::clone(&feed));

    session
        .handle_text(r#"{"action":"subscribe","securities":["A","B"]}"#)
        .await;
    other
        .handle_text(r#"{"action":"subscribe","securities":["A"]}"#)
        .await;

    let id = session.id().to_string();
    session.close().await;
    assert_eq!(session.state(), SessionState::Closed);
    assert!(session.token().is_cancelled());
    assert!(!feed.clients().is_registered(&id));
    assert!(feed.subscriptions().topics_of(&id).is_empty());
    assert!(feed.subscriptions().is_active("A"));
    assert!(!feed.subscriptions().is_active("B"));

    session.close().await;
    assert_eq!(session.state(), SessionState::Closed);

    // requests after close are ignored
    session
        .handle_text(r#"{"action":"subscribe","securities":["C"]}"#)
        .await;
    assert!(!feed.subscriptions().is_active("C"));

    other.close().await;
}

#[tokio::test]
async fn test_keepalive_sends_heartbeats() {
    let mut settings = Settings::default();
    settings.clients.heartbeat_interval_secs = 1;
    let (feed, _, _) = feed_with(settings);
    let (mut session, mut rx) = Session::open(feed);
    next_json(&mut rx).await;

    let heartbeat = next_json(&mut rx).await;
    assert_eq!(heartbeat["type"], "heartbeat");
    assert!(heartbeat["timestamp"].is_string());

    session.close().await;
}

#[tokio::test]
async fn test_stuck_client_is_closed_by_keepalive() {
    let mut settings = Settings::default();
    settings.clients.heartbeat_interval_secs = 1;
    settings.clients.outbound_capacity = 1;
    let (feed, _, _) = feed_with(settings);

    // the acknowledgement fills the queue and nobody drains it
    let (mut session, _rx) = Session::open(Arc::clone(&feed));
    let token = session.token();

    tokio::time::timeout(Duration::from_secs(5), token.cancelled())
        .await
        .expect("keepalive should give up on a stuck client");

    session.close().await;
    assert!(feed.clients().is_empty());
}

#[tokio::test]
async fn test_dropped_session_is_cleaned_up() {
    let (feed, _, _) = feed();
    let (mut session, _rx) = Session::open(Arc::clone(&feed));
    session
        .handle_text(r#"{"action":"subscribe","securities":["AAPL"]}"#)
        .await;
    drop(session);

    assert!(feed.clients().is_empty());
    for _ in 0..100 {
        if !feed.subscriptions().is_active("AAPL") {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("interest was not released");
}
