//! Event fanout: in-process SSE subscribers and user-configured webhooks.
//!
//! A single `publish` call delivers to SSE queues first (non-blocking,
//! drop-on-full), then POSTs to each matching webhook with per-target error
//! isolation. The registry assumes a single API replica.

pub mod sse;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::models::EventType;
use crate::store::Store;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// A published event, before wire formatting.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    #[serde(skip)]
    pub payload: serde_json::Value,
}

impl OutboundEvent {
    pub fn new(event_type: EventType, payload: serde_json::Value) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            payload,
        }
    }

    /// SSE data body: payload fields flattened next to type and timestamp.
    pub fn sse_json(&self) -> serde_json::Value {
        let mut body = json!({
            "type": self.event_type.as_str(),
            "timestamp": self.timestamp.to_rfc3339(),
        });
        if let (Some(map), Some(payload)) = (body.as_object_mut(), self.payload.as_object()) {
            for (key, value) in payload {
                map.insert(key.clone(), value.clone());
            }
        }
        body
    }

    /// Webhook POST body: payload nested under `data`.
    pub fn webhook_body(&self, user_id: &str) -> serde_json::Value {
        json!({
            "type": self.event_type.as_str(),
            "timestamp": self.timestamp.to_rfc3339(),
            "user_id": user_id,
            "data": self.payload,
        })
    }
}

// =============================================================================
// SSE registry
// =============================================================================

struct SseClient {
    id: u64,
    tx: mpsc::Sender<OutboundEvent>,
}

/// Process-wide map of `user_id -> subscriber queues`, mutated under a short
/// mutex. Delivery never blocks: a full queue drops the event with a warning.
pub struct SseRegistry {
    clients: Mutex<HashMap<String, Vec<SseClient>>>,
    next_id: AtomicU64,
    queue_capacity: usize,
}

/// Removes the subscription when the connection drops. Unregistration is
/// idempotent and safe under concurrent publish.
pub struct SseGuard {
    registry: Arc<SseRegistry>,
    user_id: String,
    id: u64,
}

impl Drop for SseGuard {
    fn drop(&mut self) {
        self.registry.unregister(&self.user_id, self.id);
    }
}

impl SseRegistry {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            queue_capacity: queue_capacity.max(1),
        }
    }

    pub fn register(self: &Arc<Self>, user_id: &str) -> (SseGuard, mpsc::Receiver<OutboundEvent>) {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.clients
            .lock()
            .entry(user_id.to_string())
            .or_default()
            .push(SseClient {
                id,
                tx,
            });
        debug!(user = user_id, subscriber = id, "SSE client registered");
        (
            SseGuard {
                registry: Arc::clone(self),
                user_id: user_id.to_string(),
                id,
            },
            rx,
        )
    }

    pub fn unregister(&self, user_id: &str, id: u64) {
        let mut clients = self.clients.lock();
        if let Some(list) = clients.get_mut(user_id) {
            list.retain(|client| client.id != id);
            if list.is_empty() {
                clients.remove(user_id);
            }
        }
        debug!(user = user_id, subscriber = id, "SSE client unregistered");
    }

    pub fn subscriber_count(&self, user_id: &str) -> usize {
        self.clients
            .lock()
            .get(user_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Deliver to every subscriber of `user_id`; returns how many queues
    /// accepted the event.
    pub fn publish(&self, user_id: &str, event: &OutboundEvent) -> usize {
        // Snapshot the senders under the lock, deliver outside it.
        let senders: Vec<mpsc::Sender<OutboundEvent>> = {
            let clients = self.clients.lock();
            clients
                .get(user_id)
                .map(|list| list.iter().map(|c| c.tx.clone()).collect())
                .unwrap_or_default()
        };

        let mut notified = 0;
        for tx in senders {
            match tx.try_send(event.clone()) {
                Ok(()) => notified += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(user = user_id, "SSE queue full, dropping event");
                }
                // Receiver already gone; the guard will clean up.
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        notified
    }
}

// =============================================================================
// Notifier
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct WebhookDelivery {
    pub name: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Default)]
pub struct PublishSummary {
    pub sse_notified: usize,
    pub webhook_deliveries: Vec<WebhookDelivery>,
}

pub struct Notifier {
    registry: Arc<SseRegistry>,
    store: Arc<dyn Store>,
    http: reqwest::Client,
}

impl Notifier {
    pub fn new(registry: Arc<SseRegistry>, store: Arc<dyn Store>) -> Self {
        Self {
            registry,
            store,
            http: reqwest::Client::new(),
        }
    }

    pub fn registry(&self) -> &Arc<SseRegistry> {
        &self.registry
    }

    /// Fan an event out to SSE subscribers, then to webhooks. Infallible by
    /// design: failures are logged and reported per target, never raised, so
    /// a committed state transition cannot be rolled back by delivery.
    pub async fn publish(
        &self,
        user_id: &str,
        event_type: EventType,
        payload: serde_json::Value,
    ) -> PublishSummary {
        let event = OutboundEvent::new(event_type, payload);

        let sse_notified = self.registry.publish(user_id, &event);
        metrics::counter!("events_published_total", 1, "type" => event_type.as_str());

        let webhook_deliveries = self.dispatch_webhooks(user_id, &event).await;

        debug!(
            user = user_id,
            event = event_type.as_str(),
            sse = sse_notified,
            webhooks = webhook_deliveries.len(),
            "event published"
        );
        PublishSummary {
            sse_notified,
            webhook_deliveries,
        }
    }

    async fn dispatch_webhooks(
        &self,
        user_id: &str,
        event: &OutboundEvent,
    ) -> Vec<WebhookDelivery> {
        let subscriptions = match self
            .store
            .webhooks_for_event(user_id, event.event_type.as_str())
            .await
        {
            Ok(subscriptions) => subscriptions,
            Err(e) => {
                error!(user = user_id, error = %e, "webhook lookup failed");
                return Vec::new();
            }
        };
        if subscriptions.is_empty() {
            return Vec::new();
        }

        let body = event.webhook_body(user_id);
        let mut results = Vec::with_capacity(subscriptions.len());
        for subscription in subscriptions {
            let result = self
                .send_webhook(&subscription.name, &subscription.url, &body)
                .await;
            if !result.success {
                metrics::counter!("webhook_failures_total", 1);
                warn!(
                    user = user_id,
                    webhook = %result.name,
                    error = result.error.as_deref().unwrap_or("non-success status"),
                    "webhook delivery failed"
                );
            }
            results.push(result);
        }
        results
    }

    async fn send_webhook(
        &self,
        name: &str,
        url: &str,
        body: &serde_json::Value,
    ) -> WebhookDelivery {
        match self
            .http
            .post(url)
            .timeout(WEBHOOK_TIMEOUT)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
        {
            Ok(response) => WebhookDelivery {
                name: name.to_string(),
                success: response.status().is_success(),
                status_code: Some(response.status().as_u16()),
                error: None,
            },
            Err(e) => WebhookDelivery {
                name: name.to_string(),
                success: false,
                status_code: None,
                error: Some(e.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> OutboundEvent {
        OutboundEvent::new(EventType::FocusStarted, json!({ "mode": "simple" }))
    }

    #[tokio::test]
    async fn register_publish_unregister() {
        let registry = Arc::new(SseRegistry::new(8));
        let (guard, mut rx) = registry.register("u1");
        assert_eq!(registry.subscriber_count("u1"), 1);

        assert_eq!(registry.publish("u1", &event()), 1);
        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_type, EventType::FocusStarted);

        drop(guard);
        assert_eq!(registry.subscriber_count("u1"), 0);
        assert_eq!(registry.publish("u1", &event()), 0);
    }

    #[tokio::test]
    async fn publish_is_scoped_to_the_user() {
        let registry = Arc::new(SseRegistry::new(8));
        let (_guard_a, mut rx_a) = registry.register("alice");
        let (_guard_b, mut rx_b) = registry.register("bob");

        registry.publish("alice", &event());
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_blocking() {
        let registry = Arc::new(SseRegistry::new(1));
        let (_guard, mut rx) = registry.register("u1");

        assert_eq!(registry.publish("u1", &event()), 1);
        // Queue holds one item; this delivery is dropped.
        assert_eq!(registry.publish("u1", &event()), 0);

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let registry = Arc::new(SseRegistry::new(8));
        let (guard, _rx) = registry.register("u1");
        let id = guard.id;
        drop(guard);
        // Explicit second unregister of the same id is harmless.
        registry.unregister("u1", id);
        assert_eq!(registry.subscriber_count("u1"), 0);
    }

    #[test]
    fn wire_formats() {
        let event = OutboundEvent::new(
            EventType::FocusEnded,
            json!({ "reason": "expired" }),
        );

        let sse = event.sse_json();
        assert_eq!(sse["type"], "focus_ended");
        assert_eq!(sse["reason"], "expired");
        assert!(sse.get("data").is_none());

        let hook = event.webhook_body("u1");
        assert_eq!(hook["type"], "focus_ended");
        assert_eq!(hook["user_id"], "u1");
        assert_eq!(hook["data"]["reason"], "expired");
    }
}
