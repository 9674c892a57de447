//! Webhook subscription management.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::auth::AuthUser;
use crate::error::{Error, Result};
use crate::models::WebhookSubscription;
use crate::store::Store;

#[derive(Debug, Deserialize)]
pub struct CreateWebhookRequest {
    pub name: String,
    pub url: String,
    pub event_types: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub id: String,
    pub name: String,
    pub url: String,
    pub enabled: bool,
    pub event_types: Vec<String>,
}

pub async fn create(
    State(store): State<Arc<dyn Store>>,
    auth_user: AuthUser,
    Json(request): Json<CreateWebhookRequest>,
) -> Result<(StatusCode, Json<WebhookResponse>)> {
    if request.name.trim().is_empty() {
        return Err(Error::Validation("name must not be empty".into()));
    }
    let url = url::Url::parse(&request.url)
        .map_err(|_| Error::Validation("url is not a valid URL".into()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::Validation("url must be http or https".into()));
    }
    if request.event_types.is_empty() {
        return Err(Error::Validation("event_types must not be empty".into()));
    }

    let subscription = WebhookSubscription {
        id: uuid::Uuid::new_v4().to_string(),
        user_id: auth_user.user_id,
        name: request.name,
        url: request.url,
        enabled: request.enabled,
        event_types: request.event_types,
    };
    store.insert_webhook(&subscription).await?;

    Ok((
        StatusCode::CREATED,
        Json(WebhookResponse {
            id: subscription.id,
            name: subscription.name,
            url: subscription.url,
            enabled: subscription.enabled,
            event_types: subscription.event_types,
        }),
    ))
}

pub async fn remove(
    State(store): State<Arc<dyn Store>>,
    auth_user: AuthUser,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    if store.delete_webhook(&auth_user.user_id, &id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(Error::NotFound("webhook subscription".into()))
    }
}
