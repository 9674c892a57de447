//! Webhook delivery against a loopback receiver: body shape, event-type
//! filtering, and per-target failure isolation.

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use valet_server::models::{EventType, WebhookSubscription};
use valet_server::notify::{Notifier, SseRegistry};
use valet_server::store::{MemoryStore, Store};

type Received = Arc<Mutex<Vec<serde_json::Value>>>;

async fn capture(
    State(received): State<Received>,
    Json(body): Json<serde_json::Value>,
) -> StatusCode {
    received.lock().unwrap().push(body);
    StatusCode::OK
}

async fn always_fail() -> StatusCode {
    StatusCode::INTERNAL_SERVER_ERROR
}

/// Bind a capture server on an ephemeral port; returns its address and the
/// received-body log.
async fn spawn_receiver() -> (SocketAddr, Received) {
    let received: Received = Arc::new(Mutex::new(Vec::new()));
    let app = Router::new()
        .route("/hook", post(capture))
        .route("/broken", post(always_fail))
        .with_state(received.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, received)
}

fn subscription(user: &str, name: &str, url: String, event_types: &[&str]) -> WebhookSubscription {
    WebhookSubscription {
        id: uuid::Uuid::new_v4().to_string(),
        user_id: user.into(),
        name: name.into(),
        url,
        enabled: true,
        event_types: event_types.iter().map(|t| t.to_string()).collect(),
    }
}

fn notifier(store: Arc<MemoryStore>) -> Notifier {
    let registry = Arc::new(SseRegistry::new(16));
    let store_dyn: Arc<dyn Store> = store;
    Notifier::new(registry, store_dyn)
}

#[tokio::test]
async fn webhook_body_matches_the_wire_contract() {
    let (addr, received) = spawn_receiver().await;
    let store = Arc::new(MemoryStore::new());
    store
        .insert_webhook(&subscription(
            "u1",
            "primary",
            format!("http://{}/hook", addr),
            &["focus_started"],
        ))
        .await
        .unwrap();

    let notifier = notifier(store);
    let summary = notifier
        .publish(
            "u1",
            EventType::FocusStarted,
            serde_json::json!({ "mode": "simple", "duration_minutes": 30 }),
        )
        .await;

    assert_eq!(summary.webhook_deliveries.len(), 1);
    let delivery = &summary.webhook_deliveries[0];
    assert!(delivery.success);
    assert_eq!(delivery.status_code, Some(200));

    let bodies = received.lock().unwrap();
    assert_eq!(bodies.len(), 1);
    let body = &bodies[0];
    assert_eq!(body["type"], "focus_started");
    assert_eq!(body["user_id"], "u1");
    assert_eq!(body["data"]["mode"], "simple");
    assert_eq!(body["data"]["duration_minutes"], 30);
    // ISO-8601 timestamp.
    let timestamp = body["timestamp"].as_str().unwrap();
    assert!(chrono::DateTime::parse_from_rfc3339(timestamp).is_ok());
}

#[tokio::test]
async fn unsubscribed_event_types_are_not_delivered() {
    let (addr, received) = spawn_receiver().await;
    let store = Arc::new(MemoryStore::new());
    store
        .insert_webhook(&subscription(
            "u1",
            "endings-only",
            format!("http://{}/hook", addr),
            &["focus_ended"],
        ))
        .await
        .unwrap();

    let notifier = notifier(store);
    let summary = notifier
        .publish("u1", EventType::FocusStarted, serde_json::json!({}))
        .await;

    assert!(summary.webhook_deliveries.is_empty());
    assert!(received.lock().unwrap().is_empty());
}

#[tokio::test]
async fn failures_are_isolated_per_target() {
    let (addr, received) = spawn_receiver().await;
    let store = Arc::new(MemoryStore::new());

    store
        .insert_webhook(&subscription(
            "u1",
            "broken",
            format!("http://{}/broken", addr),
            &["focus_ended"],
        ))
        .await
        .unwrap();
    // A port that nothing listens on: transport error.
    store
        .insert_webhook(&subscription(
            "u1",
            "unreachable",
            "http://127.0.0.1:1/hook".to_string(),
            &["focus_ended"],
        ))
        .await
        .unwrap();
    store
        .insert_webhook(&subscription(
            "u1",
            "healthy",
            format!("http://{}/hook", addr),
            &["focus_ended"],
        ))
        .await
        .unwrap();

    let notifier = notifier(store);
    let summary = notifier
        .publish("u1", EventType::FocusEnded, serde_json::json!({}))
        .await;

    assert_eq!(summary.webhook_deliveries.len(), 3);
    let by_name = |name: &str| {
        summary
            .webhook_deliveries
            .iter()
            .find(|d| d.name == name)
            .unwrap()
    };

    let broken = by_name("broken");
    assert!(!broken.success);
    assert_eq!(broken.status_code, Some(500));

    let unreachable = by_name("unreachable");
    assert!(!unreachable.success);
    assert!(unreachable.error.is_some());

    // The healthy target still got its delivery.
    assert!(by_name("healthy").success);
    assert_eq!(received.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn cross_user_subscriptions_are_invisible() {
    let (addr, received) = spawn_receiver().await;
    let store = Arc::new(MemoryStore::new());
    store
        .insert_webhook(&subscription(
            "someone-else",
            "other",
            format!("http://{}/hook", addr),
            &["focus_started"],
        ))
        .await
        .unwrap();

    let notifier = notifier(store);
    let summary = notifier
        .publish("u1", EventType::FocusStarted, serde_json::json!({}))
        .await;

    assert!(summary.webhook_deliveries.is_empty());
    assert!(received.lock().unwrap().is_empty());
}
