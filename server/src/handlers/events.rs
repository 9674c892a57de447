//! Inbound Slack event callbacks.
//!
//! Requests are authenticated with the v0 signing scheme, answered within
//! Slack's three-second window, and deduplicated by event id. The bypass
//! notification path behind these events is reserved; deduplicated events
//! are acknowledged and logged only.

use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    Json,
};
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Config;
use crate::dedup::EventDedup;
use crate::error::{Error, Result};

const SIGNATURE_VERSION: &str = "v0";
const TIMESTAMP_TOLERANCE_SECS: i64 = 300;

type HmacSha256 = Hmac<Sha256>;

/// Compute the `v0=<hex>` signature for a request body.
pub fn sign(signing_secret: &str, timestamp: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(signing_secret.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(SIGNATURE_VERSION.as_bytes());
    mac.update(b":");
    mac.update(timestamp.as_bytes());
    mac.update(b":");
    mac.update(body);
    format!("{}={}", SIGNATURE_VERSION, hex::encode(mac.finalize().into_bytes()))
}

/// Verify an inbound request signature, rejecting stale timestamps to blunt
/// replay. Comparison is constant-time via the MAC verifier.
pub fn verify_signature(
    signing_secret: &str,
    timestamp: &str,
    body: &[u8],
    signature: &str,
) -> bool {
    let Ok(ts) = timestamp.parse::<i64>() else {
        return false;
    };
    if (chrono::Utc::now().timestamp() - ts).abs() > TIMESTAMP_TOLERANCE_SECS {
        return false;
    }

    let Some(hex_part) = signature.strip_prefix("v0=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_part) else {
        return false;
    };

    let mut mac = HmacSha256::new_from_slice(signing_secret.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(SIGNATURE_VERSION.as_bytes());
    mac.update(b":");
    mac.update(timestamp.as_bytes());
    mac.update(b":");
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| Error::Auth(format!("missing {} header", name)))
}

pub async fn slack_events(
    State(config): State<Arc<Config>>,
    State(dedup): State<Arc<EventDedup>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>> {
    let signing_secret = config
        .slack_signing_secret
        .as_deref()
        .ok_or_else(|| Error::Validation("SLACK_SIGNING_SECRET not configured".into()))?;

    let timestamp = header(&headers, "x-slack-request-timestamp")?;
    let signature = header(&headers, "x-slack-signature")?;
    if !verify_signature(signing_secret, timestamp, &body, signature) {
        return Err(Error::Auth("invalid request signature".into()));
    }

    let payload: Value = serde_json::from_slice(&body)
        .map_err(|e| Error::Validation(format!("malformed event payload: {}", e)))?;

    match payload.get("type").and_then(Value::as_str) {
        Some("url_verification") => {
            let challenge = payload
                .get("challenge")
                .and_then(Value::as_str)
                .unwrap_or_default();
            Ok(Json(json!({ "challenge": challenge })))
        }
        Some("event_callback") => {
            if let Some(event_id) = payload.get("event_id").and_then(Value::as_str) {
                if !dedup.first_sighting(event_id).await? {
                    info!(event_id, "duplicate slack event skipped");
                    return Ok(Json(json!({ "ok": true })));
                }
            }

            let event_type = payload
                .pointer("/event/type")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            info!(event_type, "slack event received");
            Ok(Json(json!({ "ok": true })))
        }
        other => {
            warn!(event_type = ?other, "unhandled slack payload type");
            Ok(Json(json!({ "ok": true })))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_round_trip() {
        let secret = "8f742231b10e8888abcd99yyyzzz85a5";
        let ts = chrono::Utc::now().timestamp().to_string();
        let body = br#"{"type":"event_callback","event_id":"Ev1"}"#;

        let signature = sign(secret, &ts, body);
        assert!(verify_signature(secret, &ts, body, &signature));
    }

    #[test]
    fn tampered_body_fails_verification() {
        let secret = "secret";
        let ts = chrono::Utc::now().timestamp().to_string();
        let signature = sign(secret, &ts, b"original");
        assert!(!verify_signature(secret, &ts, b"tampered", &signature));
    }

    #[test]
    fn wrong_secret_fails_verification() {
        let ts = chrono::Utc::now().timestamp().to_string();
        let signature = sign("secret-a", &ts, b"body");
        assert!(!verify_signature("secret-b", &ts, b"body", &signature));
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let secret = "secret";
        let stale = (chrono::Utc::now().timestamp() - 3600).to_string();
        let signature = sign(secret, &stale, b"body");
        assert!(!verify_signature(secret, &stale, b"body", &signature));
    }

    #[test]
    fn malformed_signatures_are_rejected() {
        let secret = "secret";
        let ts = chrono::Utc::now().timestamp().to_string();
        assert!(!verify_signature(secret, &ts, b"body", "nonsense"));
        assert!(!verify_signature(secret, &ts, b"body", "v0=zz not hex"));
        assert!(!verify_signature(secret, "not-a-number", b"body", "v0=00"));
    }
}
