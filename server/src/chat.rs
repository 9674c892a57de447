//! Chat-provider seam and the Slack implementation.
//!
//! The state machine only sees the four side-effecting operations. Every
//! call runs on the user's own OAuth token from the vault; a user without a
//! connected account degrades to a logged no-op rather than an error.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

use crate::error::{Error, Result};
use crate::models::{ChatStatus, Provider};
use crate::tokens::{StoreTokenRequest, TokenVault};

pub const SLACK_API_BASE: &str = "https://slack.com/api";

#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Current profile status, or None when the user has no token.
    async fn profile(&self, user_id: &str) -> Result<Option<ChatStatus>>;

    /// Returns false when skipped for lack of a token.
    async fn set_profile(&self, user_id: &str, status: &ChatStatus) -> Result<bool>;

    async fn set_dnd(&self, user_id: &str, duration_minutes: u32) -> Result<bool>;

    /// "Not currently snoozed" counts as success.
    async fn end_dnd(&self, user_id: &str) -> Result<bool>;
}

// =============================================================================
// Slack
// =============================================================================

#[derive(Debug, Deserialize)]
struct SlackEnvelope {
    ok: bool,
    error: Option<String>,
    profile: Option<SlackProfile>,
}

#[derive(Debug, Deserialize)]
struct SlackProfile {
    #[serde(default)]
    status_text: String,
    #[serde(default)]
    status_emoji: String,
    #[serde(default)]
    status_expiration: i64,
}

#[derive(Debug, Deserialize)]
pub struct SlackOAuthTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub scope: Option<String>,
    pub slack_user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SlackOAuthResponse {
    ok: bool,
    error: Option<String>,
    authed_user: Option<SlackAuthedUser>,
}

#[derive(Debug, Deserialize)]
struct SlackAuthedUser {
    id: Option<String>,
    access_token: Option<String>,
    refresh_token: Option<String>,
    scope: Option<String>,
}

pub struct SlackChat {
    vault: Arc<TokenVault>,
    http: reqwest::Client,
    base_url: String,
}

impl SlackChat {
    pub fn new(vault: Arc<TokenVault>) -> Self {
        Self::with_base_url(vault, SLACK_API_BASE.to_string())
    }

    /// Test constructor pointing at a loopback Slack stub.
    pub fn with_base_url(vault: Arc<TokenVault>, base_url: String) -> Self {
        Self {
            vault,
            http: reqwest::Client::new(),
            base_url,
        }
    }

    async fn user_token(&self, user_id: &str) -> Result<Option<String>> {
        let token = self
            .vault
            .valid_token_or_none(user_id, Provider::Slack, "default")
            .await?;
        if token.is_none() {
            warn!(user = user_id, "no Slack OAuth token; skipping chat operation");
        }
        Ok(token)
    }

    /// JSON-body Web API call (`users.profile.*`).
    async fn call_json(
        &self,
        method: &str,
        token: &str,
        body: serde_json::Value,
    ) -> Result<SlackEnvelope> {
        let url = format!("{}/{}", self.base_url, method);
        let response = self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::ProviderRejected(format!("slack {}: {}", method, e)))?;
        response
            .json::<SlackEnvelope>()
            .await
            .map_err(|e| Error::ProviderRejected(format!("slack {} parse: {}", method, e)))
    }

    /// Form-body Web API call (`dnd.*`, `auth.revoke` do not accept JSON).
    async fn call_form(
        &self,
        method: &str,
        token: &str,
        form: &[(&str, String)],
    ) -> Result<SlackEnvelope> {
        let url = format!("{}/{}", self.base_url, method);
        let response = self
            .http
            .post(&url)
            .bearer_auth(token)
            .form(form)
            .send()
            .await
            .map_err(|e| Error::ProviderRejected(format!("slack {}: {}", method, e)))?;
        response
            .json::<SlackEnvelope>()
            .await
            .map_err(|e| Error::ProviderRejected(format!("slack {} parse: {}", method, e)))
    }

    /// Exchange an OAuth v2 code and persist the user token.
    pub async fn exchange_and_store(
        &self,
        user_id: &str,
        code: &str,
        client_id: &str,
        client_secret: &str,
        redirect_uri: Option<&str>,
    ) -> Result<SlackOAuthTokens> {
        let url = format!("{}/oauth.v2.access", self.base_url);
        let mut form = vec![
            ("code", code.to_string()),
            ("client_id", client_id.to_string()),
            ("client_secret", client_secret.to_string()),
        ];
        if let Some(redirect_uri) = redirect_uri {
            form.push(("redirect_uri", redirect_uri.to_string()));
        }

        let response = self
            .http
            .post(&url)
            .form(&form)
            .send()
            .await
            .map_err(|e| Error::ProviderRejected(format!("slack oauth.v2.access: {}", e)))?
            .json::<SlackOAuthResponse>()
            .await
            .map_err(|e| Error::ProviderRejected(format!("slack oauth parse: {}", e)))?;

        if !response.ok {
            return Err(Error::ProviderRejected(format!(
                "slack oauth.v2.access: {}",
                response.error.unwrap_or_else(|| "unknown_error".into())
            )));
        }
        let authed = response
            .authed_user
            .ok_or_else(|| Error::ProviderRejected("slack oauth: missing authed_user".into()))?;
        let access_token = authed
            .access_token
            .ok_or_else(|| Error::ProviderRejected("slack oauth: missing user token".into()))?;

        let tokens = SlackOAuthTokens {
            access_token,
            refresh_token: authed.refresh_token,
            scope: authed.scope,
            slack_user_id: authed.id,
        };

        self.vault
            .store(StoreTokenRequest {
                refresh_token: tokens.refresh_token.clone(),
                scope: tokens.scope.clone(),
                external_account_id: tokens.slack_user_id.clone(),
                ..StoreTokenRequest::new(user_id, Provider::Slack, tokens.access_token.clone())
            })
            .await?;

        Ok(tokens)
    }

    /// Best-effort `auth.revoke`, then delete the stored token.
    pub async fn revoke(&self, user_id: &str) -> Result<bool> {
        if let Some(token) = self.vault.token(user_id, Provider::Slack, "default").await? {
            if let Ok(plaintext) = self.vault.access_token(&token).await {
                match self.call_form("auth.revoke", &plaintext, &[]).await {
                    Ok(envelope) if !envelope.ok => warn!(
                        user = user_id,
                        error = envelope.error.as_deref().unwrap_or("unknown"),
                        "slack token revocation refused"
                    ),
                    Err(e) => warn!(user = user_id, error = %e, "slack token revocation failed"),
                    Ok(_) => {}
                }
            }
        }
        self.vault.delete(user_id, Provider::Slack, "default").await
    }
}

#[async_trait]
impl ChatProvider for SlackChat {
    async fn profile(&self, user_id: &str) -> Result<Option<ChatStatus>> {
        let Some(token) = self.user_token(user_id).await? else {
            return Ok(None);
        };

        let envelope = self.call_form("users.profile.get", &token, &[]).await?;
        if !envelope.ok {
            return Err(Error::ProviderRejected(format!(
                "users.profile.get: {}",
                envelope.error.unwrap_or_else(|| "unknown_error".into())
            )));
        }
        let profile = envelope.profile.unwrap_or(SlackProfile {
            status_text: String::new(),
            status_emoji: String::new(),
            status_expiration: 0,
        });
        Ok(Some(ChatStatus {
            text: profile.status_text,
            emoji: profile.status_emoji,
            expiration: profile.status_expiration,
        }))
    }

    async fn set_profile(&self, user_id: &str, status: &ChatStatus) -> Result<bool> {
        let Some(token) = self.user_token(user_id).await? else {
            return Ok(false);
        };

        let body = json!({
            "profile": {
                "status_text": status.text,
                "status_emoji": status.emoji,
                "status_expiration": status.expiration,
            }
        });
        let envelope = self.call_json("users.profile.set", &token, body).await?;
        if !envelope.ok {
            return Err(Error::ProviderRejected(format!(
                "users.profile.set: {}",
                envelope.error.unwrap_or_else(|| "unknown_error".into())
            )));
        }
        Ok(true)
    }

    async fn set_dnd(&self, user_id: &str, duration_minutes: u32) -> Result<bool> {
        let Some(token) = self.user_token(user_id).await? else {
            return Ok(false);
        };

        let form = [("num_minutes", duration_minutes.to_string())];
        let envelope = self.call_form("dnd.setSnooze", &token, &form).await?;
        if !envelope.ok {
            return Err(Error::ProviderRejected(format!(
                "dnd.setSnooze: {}",
                envelope.error.unwrap_or_else(|| "unknown_error".into())
            )));
        }
        Ok(true)
    }

    async fn end_dnd(&self, user_id: &str) -> Result<bool> {
        let Some(token) = self.user_token(user_id).await? else {
            return Ok(false);
        };

        let envelope = self.call_form("dnd.endSnooze", &token, &[]).await?;
        if !envelope.ok {
            // Ending a snooze that is not running is success for our purposes.
            if envelope.error.as_deref() == Some("snooze_not_active") {
                return Ok(true);
            }
            return Err(Error::ProviderRejected(format!(
                "dnd.endSnooze: {}",
                envelope.error.unwrap_or_else(|| "unknown_error".into())
            )));
        }
        Ok(true)
    }
}
