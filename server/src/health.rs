use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::{sync::Arc, time::SystemTime};

use crate::store::Store;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: String,
    timestamp: u64,
    version: String,
    checks: HealthChecks,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    store: CheckStatus,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    ready: bool,
}

/// Liveness probe - checks if the application is running
pub async fn liveness() -> (StatusCode, &'static str) {
    (StatusCode::OK, "OK")
}

/// Readiness probe - the store must answer before we accept traffic.
pub async fn readiness(
    State(store): State<Arc<dyn Store>>,
) -> (StatusCode, Json<ReadinessResponse>) {
    let ready = check_store(&store).await;
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(ReadinessResponse { ready }))
}

/// Health endpoint - detailed health information.
pub async fn health(State(store): State<Arc<dyn Store>>) -> (StatusCode, Json<HealthResponse>) {
    let store_healthy = check_store(&store).await;
    let status = if store_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let timestamp = match SystemTime::now().duration_since(SystemTime::UNIX_EPOCH) {
        Ok(d) => d.as_secs(),
        Err(_) => 0,
    };

    (
        status,
        Json(HealthResponse {
            status: if store_healthy {
                "healthy".to_string()
            } else {
                "unhealthy".to_string()
            },
            timestamp,
            version: env!("CARGO_PKG_VERSION").to_string(),
            checks: HealthChecks {
                store: if store_healthy {
                    CheckStatus::Healthy
                } else {
                    CheckStatus::Unhealthy
                },
            },
        }),
    )
}

async fn check_store(store: &Arc<dyn Store>) -> bool {
    store.kv_get("healthcheck").await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_liveness() {
        let (status, body) = liveness().await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "OK");
    }

    #[tokio::test]
    async fn readiness_with_memory_store() {
        let store: Arc<dyn Store> = Arc::new(crate::store::MemoryStore::new());
        let (status, _) = readiness(State(store)).await;
        assert_eq!(status, StatusCode::OK);
    }
}
