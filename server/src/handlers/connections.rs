//! Third-party account connection flows (OAuth redirects, PATs, revocation).

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use url::Url;

use crate::auth::AuthUser;
use crate::chat::SlackChat;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::github::GithubClient;
use crate::oauth_state::OAuthStateStore;

const SLACK_AUTHORIZE_URL: &str = "https://slack.com/oauth/v2/authorize";
const SLACK_USER_SCOPES: &str = "users.profile:read,users.profile:write,dnd:read,dnd:write";

#[derive(Debug, Deserialize)]
pub struct AuthorizeQuery {
    pub label: Option<String>,
    pub app_config_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub code: String,
    pub state: String,
}

#[derive(Debug, Serialize)]
pub struct AuthorizeResponse {
    pub url: String,
}

// =============================================================================
// GitHub
// =============================================================================

pub async fn github_authorize(
    State(github): State<Arc<GithubClient>>,
    auth_user: AuthUser,
    Query(query): Query<AuthorizeQuery>,
) -> Result<Json<AuthorizeResponse>> {
    let label = query.label.as_deref().unwrap_or("default");
    let url = github
        .authorize_url(&auth_user.user_id, label, query.app_config_id.as_deref())
        .await?;
    Ok(Json(AuthorizeResponse { url }))
}

/// Redirect target; identity comes from the one-shot state token, not from
/// a session.
pub async fn github_callback(
    State(github): State<Arc<GithubClient>>,
    State(oauth_states): State<Arc<OAuthStateStore>>,
    Query(query): Query<CallbackQuery>,
) -> Result<Json<serde_json::Value>> {
    let state = oauth_states
        .consume(&query.state)
        .await?
        .ok_or_else(|| Error::Auth("OAuth state is invalid or expired".into()))?;

    let tokens = github
        .exchange_code(&query.code, state.app_config_id.as_deref())
        .await?;
    let token = github
        .store_oauth_token(
            &state.user_id,
            tokens,
            &state.account_label,
            state.app_config_id.as_deref(),
        )
        .await?;

    Ok(Json(json!({
        "connected": true,
        "provider": "github",
        "account_label": token.account_label,
        "login": token.external_account_id,
    })))
}

#[derive(Debug, Deserialize)]
pub struct StorePatRequest {
    pub pat: String,
    pub label: Option<String>,
}

pub async fn github_pat(
    State(github): State<Arc<GithubClient>>,
    auth_user: AuthUser,
    Json(request): Json<StorePatRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>)> {
    let label = request.label.as_deref().unwrap_or("default");
    let token = github
        .store_pat(&auth_user.user_id, &request.pat, label)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "connected": true,
            "provider": "github",
            "account_label": token.account_label,
            "login": token.external_account_id,
        })),
    ))
}

pub async fn github_disconnect(
    State(github): State<Arc<GithubClient>>,
    auth_user: AuthUser,
    Path(label): Path<String>,
) -> Result<StatusCode> {
    if github.revoke(&auth_user.user_id, &label).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(Error::NotFound("github connection".into()))
    }
}

// =============================================================================
// Slack
// =============================================================================

pub async fn slack_authorize(
    State(config): State<Arc<Config>>,
    State(oauth_states): State<Arc<OAuthStateStore>>,
    auth_user: AuthUser,
) -> Result<Json<AuthorizeResponse>> {
    let client_id = config
        .slack_client_id
        .as_deref()
        .ok_or_else(|| Error::Validation("SLACK_CLIENT_ID not configured".into()))?;
    let redirect_uri = config
        .slack_oauth_redirect_uri
        .as_deref()
        .ok_or_else(|| Error::Validation("SLACK_OAUTH_REDIRECT_URI not configured".into()))?;

    let state = oauth_states
        .issue(&auth_user.user_id, "default", None)
        .await?;

    let mut url = Url::parse(SLACK_AUTHORIZE_URL)
        .map_err(|e| Error::Validation(format!("bad authorize URL: {}", e)))?;
    url.query_pairs_mut()
        .append_pair("client_id", client_id)
        .append_pair("user_scope", SLACK_USER_SCOPES)
        .append_pair("redirect_uri", redirect_uri)
        .append_pair("state", &state);
    Ok(Json(AuthorizeResponse { url: url.into() }))
}

pub async fn slack_callback(
    State(config): State<Arc<Config>>,
    State(slack): State<Arc<SlackChat>>,
    State(oauth_states): State<Arc<OAuthStateStore>>,
    Query(query): Query<CallbackQuery>,
) -> Result<Json<serde_json::Value>> {
    let state = oauth_states
        .consume(&query.state)
        .await?
        .ok_or_else(|| Error::Auth("OAuth state is invalid or expired".into()))?;

    let client_id = config
        .slack_client_id
        .as_deref()
        .ok_or_else(|| Error::Validation("SLACK_CLIENT_ID not configured".into()))?;
    let client_secret = config
        .slack_client_secret
        .as_deref()
        .ok_or_else(|| Error::Validation("SLACK_CLIENT_SECRET not configured".into()))?;

    let tokens = slack
        .exchange_and_store(
            &state.user_id,
            &query.code,
            client_id,
            client_secret,
            config.slack_oauth_redirect_uri.as_deref(),
        )
        .await?;

    Ok(Json(json!({
        "connected": true,
        "provider": "slack",
        "slack_user_id": tokens.slack_user_id,
    })))
}

pub async fn slack_disconnect(
    State(slack): State<Arc<SlackChat>>,
    auth_user: AuthUser,
) -> Result<StatusCode> {
    if slack.revoke(&auth_user.user_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(Error::NotFound("slack connection".into()))
    }
}
