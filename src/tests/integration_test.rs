use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tungstenite::protocol::Message as WsMessage;

use crate::broker::PriceFeed;
use crate::bus::{MemoryTransport, Transport};
use crate::config::Settings;
use crate::store::MemoryPriceStore;
use crate::transport::serve;

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Harness {
    feed: Arc<PriceFeed>,
    transport: MemoryTransport,
    url: String,
    shutdown: CancellationToken,
}

impl Harness {
    async fn start() -> Self {
        let mut settings = Settings::default();
        settings.bus.restart_delay_ms = 10;
        settings.bus.reconnect.initial_delay_ms = 5;
        settings.bus.reconnect.max_delay_ms = 20;

        let transport = MemoryTransport::new();
        let feed = Arc::new(PriceFeed::new(
            settings,
            Arc::new(transport.clone()),
            Arc::new(MemoryPriceStore::new()),
        ));
        feed.start().await.unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let shutdown = CancellationToken::new();
        tokio::spawn(serve(listener, Arc::clone(&feed), shutdown.clone()));

        let harness = Self {
            feed,
            transport,
            url,
            shutdown,
        };
        eventually(|| harness.feed.bus().is_connected()).await;
        harness
    }

    async fn connect(&self) -> Ws {
        let (mut ws, _) = connect_async(self.url.as_str()).await.expect("client connect");
        let hello = next_json(&mut ws).await;
        assert_eq!(hello["type"], "connection_established");
        ws
    }

    async fn publish(&self, ticker: &str, price: f64) {
        let payload = json!({"ticker": ticker, "price": price, "timestamp": 1717000000.0});
        self.transport
            .publish(&format!("stock:price:{ticker}"), &payload.to_string())
            .await
            .unwrap();
    }

    fn upstream(&self, ticker: &str) -> bool {
        self.transport
            .subscribed_channels()
            .contains(&format!("stock:price:{ticker}"))
    }

    async fn stop(self) {
        self.shutdown.cancel();
        self.feed.stop().await;
    }
}

async fn eventually(check: impl Fn() -> bool) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

async fn send(ws: &mut Ws, request: Value) {
    ws.send(WsMessage::text(request.to_string())).await.unwrap();
}

/// Next JSON frame, skipping heartbeats.
async fn next_json(ws: &mut Ws) -> Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(3), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection closed")
            .expect("websocket error");

        if let WsMessage::Text(text) = frame {
            let value: Value = serde_json::from_str(text.as_str()).unwrap();
            if value["type"] != "heartbeat" {
                return value;
            }
        }
    }
}

async fn assert_silent(ws: &mut Ws) {
    let next = tokio::time::timeout(Duration::from_millis(200), ws.next()).await;
    assert!(next.is_err(), "unexpected frame: {next:?}");
}

#[tokio::test]
async fn subscribe_receive_unsubscribe() {
    let harness = Harness::start().await;
    let mut c1 = harness.connect().await;

    send(&mut c1, json!({"action": "subscribe", "securities": ["AAPL"]})).await;
    eventually(|| harness.upstream("AAPL")).await;

    harness.publish("AAPL", 150.25).await;
    assert_eq!(next_json(&mut c1).await, json!({"ticker": "AAPL", "price": 150.25}));

    send(&mut c1, json!({"action": "unsubscribe", "securities": ["AAPL"]})).await;
    eventually(|| !harness.upstream("AAPL")).await;
    assert!(!harness.feed.subscriptions().is_active("AAPL"));

    harness.publish("AAPL", 151.0).await;
    assert_silent(&mut c1).await;

    harness.stop().await;
}

#[tokio::test]
async fn updates_arrive_in_publish_order() {
    let harness = Harness::start().await;
    let mut c1 = harness.connect().await;

    send(&mut c1, json!({"action": "subscribe", "securities": ["GOOG"]})).await;
    eventually(|| harness.upstream("GOOG")).await;

    for i in 0..20 {
        harness.publish("GOOG", 100.0 + i as f64).await;
    }
    for i in 0..20 {
        let update = next_json(&mut c1).await;
        assert_eq!(update["price"], json!(100.0 + i as f64));
    }

    harness.stop().await;
}

#[tokio::test]
async fn abnormal_disconnect_leaves_other_subscribers_alone() {
    let harness = Harness::start().await;
    let mut c1 = harness.connect().await;
    let mut c2 = harness.connect().await;

    let subscribe = json!({"action": "subscribe", "securities": ["MSFT"]});
    send(&mut c1, subscribe.clone()).await;
    send(&mut c2, subscribe).await;
    eventually(|| harness.feed.subscriptions().interested_clients("MSFT").len() == 2).await;

    // no close handshake
    drop(c1);
    eventually(|| harness.feed.clients().len() == 1).await;
    eventually(|| harness.feed.subscriptions().interested_clients("MSFT").len() == 1).await;
    assert!(harness.upstream("MSFT"));

    harness.publish("MSFT", 410.5).await;
    assert_eq!(next_json(&mut c2).await, json!({"ticker": "MSFT", "price": 410.5}));

    harness.stop().await;
}

#[tokio::test]
async fn subscriptions_survive_a_bus_outage() {
    let harness = Harness::start().await;
    let mut c1 = harness.connect().await;

    send(&mut c1, json!({"action": "subscribe", "securities": ["AAPL"]})).await;
    eventually(|| harness.upstream("AAPL")).await;

    harness.transport.set_available(false);
    harness.transport.drop_sessions();
    eventually(|| !harness.feed.bus().is_connected()).await;

    // accepted while the bus is down
    send(&mut c1, json!({"action": "subscribe", "securities": ["NVDA"]})).await;
    eventually(|| harness.feed.subscriptions().is_active("NVDA")).await;

    harness.transport.set_available(true);
    eventually(|| harness.upstream("AAPL") && harness.upstream("NVDA")).await;

    harness.publish("NVDA", 880.0).await;
    assert_eq!(next_json(&mut c1).await, json!({"ticker": "NVDA", "price": 880.0}));
    harness.publish("AAPL", 152.0).await;
    assert_eq!(next_json(&mut c1).await, json!({"ticker": "AAPL", "price": 152.0}));

    harness.stop().await;
}

#[tokio::test]
async fn malformed_requests_get_diagnostics() {
    let harness = Harness::start().await;
    let mut c1 = harness.connect().await;

    send(&mut c1, json!({"action": "publish", "securities": ["AAPL"]})).await;
    assert_eq!(
        next_json(&mut c1).await,
        json!({"type": "echo", "message": "Received unknown action: publish"})
    );

    c1.send(WsMessage::text("{oops")).await.unwrap();
    let error = next_json(&mut c1).await;
    assert_eq!(error["type"], "error");

    // the connection is still usable
    send(&mut c1, json!({"action": "subscribe", "securities": ["IBM"]})).await;
    eventually(|| harness.upstream("IBM")).await;

    harness.stop().await;
}

#[tokio::test]
async fn shutdown_closes_client_connections() {
    let harness = Harness::start().await;
    let mut c1 = harness.connect().await;
    send(&mut c1, json!({"action": "subscribe", "securities": ["AAPL"]})).await;
    eventually(|| harness.upstream("AAPL")).await;

    let feed = Arc::clone(&harness.feed);
    harness.stop().await;

    let frame = tokio::time::timeout(Duration::from_secs(3), c1.next())
        .await
        .expect("timed out waiting for close");
    assert!(matches!(frame, Some(Ok(WsMessage::Close(_))) | None | Some(Err(_))));

    eventually(|| feed.clients().is_empty()).await;
    assert!(!feed.subscriptions().is_active("AAPL"));
}
