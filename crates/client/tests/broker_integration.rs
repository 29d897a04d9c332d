//! Broker integration tests
//!
//! Runs the client against a local axum broker exposing the publish endpoint
//! and the WebSocket event endpoint, exercising the full network stack.

use axum::{
    Json, Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::Response,
    routing::{get, post},
};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use pubsub_client::{
    ClientConfig, ClientError, ClientState, ConnectionError, EventFrame, PubSubClient,
    ReconnectionConfig, TransportError,
};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

// ============================================================================
// Test Broker
// ============================================================================

enum SessionCommand {
    Send(String),
    Close,
}

#[derive(Clone, Default)]
struct TestBroker {
    published: Arc<Mutex<Vec<Value>>>,
    received: Arc<Mutex<Vec<EventFrame>>>,
    sessions: Arc<Mutex<Vec<mpsc::UnboundedSender<SessionCommand>>>>,
    connects: Arc<AtomicUsize>,
    reject_publish: Arc<AtomicBool>,
    slow_handshake: Arc<AtomicBool>,
}

impl TestBroker {
    /// Push an event to the most recent session
    fn deliver(&self, event: &str, data: Value) -> bool {
        let text = EventFrame::new(event, data).to_text().unwrap();
        match self.sessions.lock().last() {
            Some(session) => session.send(SessionCommand::Send(text)).is_ok(),
            None => false,
        }
    }

    /// Close every live session from the server side
    fn drop_sessions(&self) {
        for session in self.sessions.lock().drain(..) {
            let _ = session.send(SessionCommand::Close);
        }
    }

    fn received_named(&self, event: &str) -> Vec<Value> {
        self.received
            .lock()
            .iter()
            .filter(|frame| frame.event == event)
            .map(|frame| frame.data.clone())
            .collect()
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(broker): State<TestBroker>) -> Response {
    if broker.slow_handshake.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(300)).await;
    }
    ws.on_upgrade(move |socket| handle_socket(socket, broker))
}

async fn handle_socket(socket: WebSocket, broker: TestBroker) {
    let (tx, mut commands) = mpsc::unbounded_channel();
    broker.sessions.lock().push(tx);
    broker.connects.fetch_add(1, Ordering::SeqCst);

    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(SessionCommand::Send(text)) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Some(SessionCommand::Close) | None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if let Ok(frame) = EventFrame::from_text(text.as_str()) {
                        broker.received.lock().push(frame);
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            }
        }
    }
}

async fn publish_handler(
    State(broker): State<TestBroker>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    if broker.reject_publish.load(Ordering::SeqCst) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "broker unavailable"})),
        );
    }
    broker.published.lock().push(body);
    (StatusCode::OK, Json(json!({"status": "ok"})))
}

/// Start a test broker and return its address
async fn start_test_broker() -> (SocketAddr, TestBroker) {
    let _ = env_logger::builder().is_test(true).try_init();
    let broker = TestBroker::default();

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/publish", post(publish_handler))
        .with_state(broker.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give server time to start
    tokio::time::sleep(Duration::from_millis(50)).await;

    (addr, broker)
}

fn fast_reconnection() -> ReconnectionConfig {
    ReconnectionConfig {
        delay_ms: 50,
        delay_max_ms: 200,
        ..Default::default()
    }
}

fn client_for(addr: SocketAddr, topics: &[&str]) -> PubSubClient {
    let config = ClientConfig::new(format!("http://{}/", addr), "integration", topics.to_vec())
        .with_reconnection(fast_reconnection());
    PubSubClient::new(config).unwrap()
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

// ============================================================================
// Subscription and Delivery
// ============================================================================

#[tokio::test]
async fn test_subscribes_on_connect() {
    let (addr, broker) = start_test_broker().await;
    let client = client_for(addr, &["market_data", "signals"]);

    client.start().await.unwrap();

    assert!(wait_until(|| !broker.received_named("subscribe").is_empty()).await);
    assert_eq!(
        broker.received_named("subscribe"),
        vec![json!({"consumer": "integration", "topics": ["market_data", "signals"]})]
    );
    assert_eq!(client.state(), ClientState::Connected);
    client.stop().await;
}

#[tokio::test]
async fn test_pushed_message_reaches_handler_and_is_acknowledged() {
    let (addr, broker) = start_test_broker().await;
    let client = client_for(addr, &["market_data"]);
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    client.register_handler("market_data", move |payload: &Value| -> anyhow::Result<()> {
        sink.lock().push(payload.clone());
        Ok(())
    });

    client.start().await.unwrap();
    assert!(wait_until(|| !broker.received_named("subscribe").is_empty()).await);

    let representation = json!({
        "message_id": "m1",
        "topic": "market_data",
        "message": {"symbol": "BTC/USD", "price": 50000},
        "producer": "feed",
    });
    assert!(broker.deliver("message", representation));

    assert!(wait_until(|| received.lock().len() == 1).await);
    assert_eq!(
        received.lock()[0],
        json!({"symbol": "BTC/USD", "price": 50000})
    );

    assert!(wait_until(|| !broker.received_named("consumed").is_empty()).await);
    assert_eq!(
        broker.received_named("consumed"),
        vec![json!({
            "consumer": "integration",
            "topic": "market_data",
            "message_id": "m1",
            "message": {"symbol": "BTC/USD", "price": 50000},
        })]
    );
    client.stop().await;
}

#[tokio::test]
async fn test_malformed_frames_are_skipped() {
    let (addr, broker) = start_test_broker().await;
    let client = client_for(addr, &["orders"]);
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    client.register_handler("orders", move |payload: &Value| -> anyhow::Result<()> {
        sink.lock().push(payload.clone());
        Ok(())
    });

    client.start().await.unwrap();
    assert!(wait_until(|| !broker.received_named("subscribe").is_empty()).await);

    broker.deliver("message", json!({"topic": "orders"}));
    broker.deliver(
        "message",
        json!({"message_id": "m2", "topic": "orders", "message": 2, "producer": "p"}),
    );

    assert!(wait_until(|| received.lock().len() == 1).await);
    assert_eq!(*received.lock(), vec![json!(2)]);
    assert_eq!(client.malformed_count(), 1);
    client.stop().await;
}

// ============================================================================
// Reconnection
// ============================================================================

#[tokio::test]
async fn test_reconnects_and_resubscribes() {
    let (addr, broker) = start_test_broker().await;
    let client = client_for(addr, &["orders", "trades"]);

    client.start().await.unwrap();
    assert!(wait_until(|| broker.received_named("subscribe").len() == 1).await);

    broker.drop_sessions();

    assert!(wait_until(|| broker.connects.load(Ordering::SeqCst) == 2).await);
    assert!(wait_until(|| broker.received_named("subscribe").len() == 2).await);
    let subscriptions = broker.received_named("subscribe");
    assert_eq!(subscriptions[0], subscriptions[1]);

    tokio::time::timeout(
        Duration::from_secs(2),
        client.wait_for_state(ClientState::Connected),
    )
    .await
    .unwrap();
    client.stop().await;
}

#[tokio::test]
async fn test_start_fails_when_broker_unreachable() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = client_for(addr, &["orders"]);
    let result = client.start().await;

    assert!(matches!(
        result,
        Err(ClientError::Transport(TransportError::Connection(_)))
    ));
    assert_eq!(client.state(), ClientState::Disconnected);
}

#[tokio::test]
async fn test_stop_does_not_reconnect() {
    let (addr, broker) = start_test_broker().await;
    let client = client_for(addr, &["orders"]);

    client.start().await.unwrap();
    assert!(wait_until(|| broker.received_named("subscribe").len() == 1).await);

    client.stop().await;
    assert_eq!(client.state(), ClientState::Disconnected);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(broker.connects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_stop_during_slow_handshake_leaves_no_session() {
    let (addr, broker) = start_test_broker().await;
    broker.slow_handshake.store(true, Ordering::SeqCst);
    let client = Arc::new(client_for(addr, &["orders"]));

    let starting = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.start().await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    client.stop().await;

    let result = starting.await.unwrap();
    assert!(matches!(result, Err(ClientError::StoppedDuringStart)));
    assert_eq!(client.state(), ClientState::Disconnected);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(broker.connects.load(Ordering::SeqCst), 0);
    assert!(broker.received_named("subscribe").is_empty());
    assert_eq!(client.state(), ClientState::Disconnected);
}

// ============================================================================
// Publishing
// ============================================================================

#[tokio::test]
async fn test_publish_posts_representation() {
    let (addr, broker) = start_test_broker().await;
    let client = client_for(addr, &[]);

    let ack = client
        .publish("signals", json!({"action": "BUY"}), "gen", None)
        .await
        .unwrap();

    assert_eq!(ack.status, 200);
    assert_eq!(ack.body, json!({"status": "ok"}));

    let published = broker.published.lock();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0]["topic"], "signals");
    assert_eq!(published[0]["message"], json!({"action": "BUY"}));
    assert_eq!(published[0]["producer"], "gen");
    assert!(!published[0]["message_id"].as_str().unwrap().is_empty());
    assert!(published[0]["created_at"].is_string());
}

#[tokio::test]
async fn test_publish_rejected_by_broker() {
    let (addr, broker) = start_test_broker().await;
    broker.reject_publish.store(true, Ordering::SeqCst);
    let client = client_for(addr, &[]);

    let result = client.publish("signals", json!(1), "gen", None).await;

    match result {
        Err(ClientError::Connection(ConnectionError::Rejected { status, body })) => {
            assert_eq!(status, 500);
            assert!(body.contains("broker unavailable"));
        }
        other => panic!("expected rejection, got {:?}", other),
    }
    assert!(broker.published.lock().is_empty());
}

#[tokio::test]
async fn test_publish_to_unreachable_broker() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = client_for(addr, &[]);
    let result = client.publish("signals", json!(1), "gen", None).await;

    assert!(matches!(
        result,
        Err(ClientError::Connection(ConnectionError::Network(_)))
    ));
}
