use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;

use vmq_api::{NoopMetrics, SystemClock};
use vmq_engine::{Broker, BrokerConfig};
use vmq_storage_memory::MemoryStorage;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start() -> (String, Arc<Broker>, CancellationToken, tokio::task::JoinHandle<Result<(), String>>) {
    let broker = Arc::new(
        Broker::open(
            BrokerConfig::default(),
            Arc::new(MemoryStorage::default()),
            Arc::new(SystemClock),
            Arc::new(NoopMetrics),
        )
        .unwrap(),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let token = CancellationToken::new();
    let server = tokio::spawn(vmq_api_server::serve(listener, broker.clone(), token.clone()));
    (format!("ws://{addr}"), broker, token, server)
}

async fn connect(base: &str) -> Client {
    connect_async(format!("{base}/ws")).await.unwrap().0
}

async fn send(ws: &mut Client, frame: Value) {
    ws.send(Message::Text(frame.to_string().into())).await.unwrap();
}

async fn next_json(ws: &mut Client) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("frame within 5s")
            .expect("stream open")
            .expect("valid frame");
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

#[tokio::test]
async fn publish_subscribe_ack_over_websocket() {
    let (base, broker, token, server) = start().await;

    let mut producer = connect(&base).await;
    send(&mut producer, json!({"action": "publish", "topic": "jobs", "text": "hello"})).await;
    let published = next_json(&mut producer).await;
    assert_eq!(published["type"], "published");
    assert_eq!(published["offset"], 0);

    let mut consumer = connect(&base).await;
    send(&mut consumer, json!({"action": "subscribe", "group": "g", "topics": ["jobs"]})).await;
    let subscribed = next_json(&mut consumer).await;
    assert_eq!(subscribed["type"], "subscribed");
    assert_eq!(subscribed["assignment"], json!([{"topic": "jobs", "partition": 0}]));

    let delivery = next_json(&mut consumer).await;
    assert_eq!(delivery["type"], "delivery");
    assert_eq!(delivery["payload"], "aGVsbG8=");
    assert_eq!(delivery["attempt"], 1);

    send(
        &mut consumer,
        json!({"action": "ack", "group": "g", "topic": "jobs", "partition": 0, "offset": 0}),
    )
    .await;
    let acked = next_json(&mut consumer).await;
    assert_eq!(acked["type"], "acked");
    assert_eq!(acked["committed"], 0);

    // A later publish is pushed without the consumer asking.
    send(&mut producer, json!({"action": "publish", "topic": "jobs", "text": "again"})).await;
    next_json(&mut producer).await;
    let pushed = next_json(&mut consumer).await;
    assert_eq!(pushed["type"], "delivery");
    assert_eq!(pushed["offset"], 1);

    drop(consumer);
    drop(producer);
    token.cancel();
    tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(
        broker.committed_offset("g", &vmq_api::TopicPartition::new("jobs", 0)),
        Some(0)
    );
}

#[tokio::test]
async fn malformed_frame_closes_only_that_session() {
    let (base, _broker, token, _server) = start().await;

    let mut bad = connect(&base).await;
    let mut good = connect(&base).await;

    bad.send(Message::Text("{not json".into())).await.unwrap();
    let error = next_json(&mut bad).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["error_type"], "invalid_request");
    assert_eq!(error["retryable"], false);

    send(&mut good, json!({"action": "ping"})).await;
    assert_eq!(next_json(&mut good).await["type"], "pong");

    // Operation errors do not close the session.
    send(
        &mut good,
        json!({"action": "nack", "group": "none", "topic": "t", "partition": 0, "offset": 0}),
    )
    .await;
    assert_eq!(next_json(&mut good).await["error_type"], "not_member");
    send(&mut good, json!({"action": "heartbeat"})).await;
    assert_eq!(next_json(&mut good).await["type"], "heartbeat_ok");

    token.cancel();
}
