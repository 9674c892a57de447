//! GitHub OAuth, PAT, and token-refresh operations over the vault.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::Deserialize;
use std::sync::Arc;
use tracing::warn;
use url::Url;

use crate::error::{Error, Result};
use crate::models::{OAuthToken, Provider, TokenType};
use crate::oauth_state::OAuthStateStore;
use crate::store::Store;
use crate::tokens::{StoreTokenRequest, TokenRefresher, TokenVault};

pub const GITHUB_AUTHORIZE_URL: &str = "https://github.com/login/oauth/authorize";
pub const GITHUB_TOKEN_URL: &str = "https://github.com/login/oauth/access_token";
pub const GITHUB_API_URL: &str = "https://api.github.com";

const OAUTH_SCOPES: &str = "repo,read:user,user:email";

#[derive(Debug, Deserialize)]
pub struct GithubTokenResponse {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub scope: Option<String>,
    pub expires_in: Option<i64>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct GithubUser {
    pub login: String,
}

#[derive(Debug, Clone)]
pub struct GithubEndpoints {
    pub authorize_url: String,
    pub token_url: String,
    pub api_base: String,
}

impl Default for GithubEndpoints {
    fn default() -> Self {
        Self {
            authorize_url: GITHUB_AUTHORIZE_URL.to_string(),
            token_url: GITHUB_TOKEN_URL.to_string(),
            api_base: GITHUB_API_URL.to_string(),
        }
    }
}

pub struct GithubClient {
    vault: Arc<TokenVault>,
    store: Arc<dyn Store>,
    oauth_states: Arc<OAuthStateStore>,
    http: reqwest::Client,
    client_id: Option<String>,
    client_secret: Option<String>,
    redirect_uri: Option<String>,
    endpoints: GithubEndpoints,
}

impl GithubClient {
    pub fn new(
        vault: Arc<TokenVault>,
        store: Arc<dyn Store>,
        oauth_states: Arc<OAuthStateStore>,
        client_id: Option<String>,
        client_secret: Option<String>,
        redirect_uri: Option<String>,
    ) -> Self {
        Self::with_endpoints(
            vault,
            store,
            oauth_states,
            client_id,
            client_secret,
            redirect_uri,
            GithubEndpoints::default(),
        )
    }

    pub fn with_endpoints(
        vault: Arc<TokenVault>,
        store: Arc<dyn Store>,
        oauth_states: Arc<OAuthStateStore>,
        client_id: Option<String>,
        client_secret: Option<String>,
        redirect_uri: Option<String>,
        endpoints: GithubEndpoints,
    ) -> Self {
        Self {
            vault,
            store,
            oauth_states,
            http: reqwest::Client::new(),
            client_id,
            client_secret,
            redirect_uri,
            endpoints,
        }
    }

    /// App credentials: the per-user app config when one is referenced,
    /// otherwise the globally configured app.
    async fn app_credentials(&self, app_config_id: Option<&str>) -> Result<(String, String)> {
        if let Some(config_id) = app_config_id {
            if let Some(config) = self.store.github_app_config(config_id).await? {
                let key = self
                    .store
                    .encryption_key(&config.encryption_key_id)
                    .await?
                    .ok_or_else(|| {
                        Error::Kek(format!(
                            "encryption key {} for app config missing",
                            config.encryption_key_id
                        ))
                    })?;
                let client_secret = self
                    .vault
                    .cipher()
                    .decrypt(&config.encrypted_client_secret, &key.encrypted_dek)
                    .await?;
                return Ok((config.client_id, client_secret));
            }
        }

        match (&self.client_id, &self.client_secret) {
            (Some(id), Some(secret)) => Ok((id.clone(), secret.clone())),
            _ => Err(Error::Validation("No GitHub App configured".into())),
        }
    }

    /// OAuth authorization URL; the state token guards the redirect.
    pub async fn authorize_url(
        &self,
        user_id: &str,
        account_label: &str,
        app_config_id: Option<&str>,
    ) -> Result<String> {
        let (client_id, _) = self.app_credentials(app_config_id).await?;
        let redirect_uri = self
            .redirect_uri
            .clone()
            .ok_or_else(|| Error::Validation("GITHUB_OAUTH_REDIRECT_URI not configured".into()))?;

        let state = self
            .oauth_states
            .issue(user_id, account_label, app_config_id)
            .await?;

        let mut url = Url::parse(&self.endpoints.authorize_url)
            .map_err(|e| Error::Validation(format!("bad authorize URL: {}", e)))?;
        url.query_pairs_mut()
            .append_pair("client_id", &client_id)
            .append_pair("redirect_uri", &redirect_uri)
            .append_pair("scope", OAUTH_SCOPES)
            .append_pair("state", &state);
        Ok(url.into())
    }

    /// Exchange an authorization code for tokens.
    pub async fn exchange_code(
        &self,
        code: &str,
        app_config_id: Option<&str>,
    ) -> Result<GithubTokenResponse> {
        let (client_id, client_secret) = self.app_credentials(app_config_id).await?;
        self.token_grant(&[
            ("client_id", client_id.as_str()),
            ("client_secret", client_secret.as_str()),
            ("code", code),
        ])
        .await
    }

    async fn token_grant(&self, form: &[(&str, &str)]) -> Result<GithubTokenResponse> {
        let response = self
            .http
            .post(&self.endpoints.token_url)
            .header("Accept", "application/json")
            .form(form)
            .send()
            .await
            .map_err(|e| Error::ProviderRejected(format!("github token endpoint: {}", e)))?
            .json::<GithubTokenResponse>()
            .await
            .map_err(|e| Error::ProviderRejected(format!("github token parse: {}", e)))?;

        if let Some(error) = &response.error {
            return Err(Error::ProviderRejected(format!(
                "github oauth: {}",
                response.error_description.as_deref().unwrap_or(error)
            )));
        }
        Ok(response)
    }

    /// Persist an exchanged OAuth token under `(user, github, label)`.
    pub async fn store_oauth_token(
        &self,
        user_id: &str,
        response: GithubTokenResponse,
        account_label: &str,
        app_config_id: Option<&str>,
    ) -> Result<OAuthToken> {
        let access_token = response
            .access_token
            .ok_or_else(|| Error::ProviderRejected("github oauth: no access_token".into()))?;
        let login = self.authenticated_user(&access_token).await?.login;
        let expires_at = response.expires_in.map(|s| Utc::now() + Duration::seconds(s));

        self.vault
            .store(StoreTokenRequest {
                refresh_token: response.refresh_token,
                scope: response.scope,
                expires_at,
                account_label: account_label.to_string(),
                external_account_id: Some(login),
                app_config_id: app_config_id.map(str::to_string),
                ..StoreTokenRequest::new(user_id, Provider::Github, access_token)
            })
            .await
    }

    /// Validate and persist a personal access token. The PAT is checked
    /// against the "who am I" endpoint before anything is stored.
    pub async fn store_pat(
        &self,
        user_id: &str,
        pat: &str,
        account_label: &str,
    ) -> Result<OAuthToken> {
        let login = self.authenticated_user(pat).await?.login;

        self.vault
            .store(StoreTokenRequest {
                scope: Some("pat".to_string()),
                account_label: account_label.to_string(),
                external_account_id: Some(login),
                token_type: TokenType::Pat,
                ..StoreTokenRequest::new(user_id, Provider::Github, pat)
            })
            .await
    }

    /// Refresh an expiring GitHub App OAuth token and persist the new pair
    /// under the same `(user, provider, label)`.
    pub async fn refresh(&self, token: &OAuthToken) -> Result<OAuthToken> {
        let refresh_token = self
            .vault
            .refresh_token(token)
            .await?
            .ok_or_else(|| Error::ProviderRejected("no refresh token available".into()))?;
        let (client_id, client_secret) =
            self.app_credentials(token.app_config_id.as_deref()).await?;

        let response = self
            .token_grant(&[
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
            ])
            .await?;

        let access_token = response
            .access_token
            .ok_or_else(|| Error::ProviderRejected("github refresh: no access_token".into()))?;
        let expires_at = response.expires_in.map(|s| Utc::now() + Duration::seconds(s));

        self.vault
            .store(StoreTokenRequest {
                refresh_token: response.refresh_token,
                scope: response.scope,
                expires_at,
                account_label: token.account_label.clone(),
                external_account_id: token.external_account_id.clone(),
                app_config_id: token.app_config_id.clone(),
                ..StoreTokenRequest::new(&token.user_id, Provider::Github, access_token)
            })
            .await
    }

    /// A currently-usable access token, refreshing if expired.
    pub async fn valid_token(&self, user_id: &str, account_label: &str) -> Result<Option<String>> {
        self.vault
            .valid_token_or_none(user_id, Provider::Github, account_label)
            .await
    }

    /// Best-effort server-side revocation, then delete the record.
    pub async fn revoke(&self, user_id: &str, account_label: &str) -> Result<bool> {
        if let Some(token) = self
            .vault
            .token(user_id, Provider::Github, account_label)
            .await?
        {
            if let Err(e) = self.revoke_upstream(&token).await {
                warn!(user = user_id, error = %e, "github token revocation failed (best effort)");
            }
        }
        self.vault
            .delete(user_id, Provider::Github, account_label)
            .await
    }

    async fn revoke_upstream(&self, token: &OAuthToken) -> Result<()> {
        let access_token = self.vault.access_token(token).await?;
        let (client_id, client_secret) =
            self.app_credentials(token.app_config_id.as_deref()).await?;

        self.http
            .delete(format!(
                "{}/applications/{}/token",
                self.endpoints.api_base, client_id
            ))
            .basic_auth(&client_id, Some(&client_secret))
            .header("Accept", "application/vnd.github+json")
            .json(&serde_json::json!({ "access_token": access_token }))
            .send()
            .await
            .map_err(|e| Error::ProviderRejected(format!("github revoke: {}", e)))?;
        Ok(())
    }

    /// `GET /user` with the given token; rejects on any non-200.
    pub async fn authenticated_user(&self, access_token: &str) -> Result<GithubUser> {
        let response = self
            .http
            .get(format!("{}/user", self.endpoints.api_base))
            .bearer_auth(access_token)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "valet-server")
            .header("X-GitHub-Api-Version", "2022-11-28")
            .send()
            .await
            .map_err(|e| Error::ProviderRejected(format!("github /user: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::ProviderRejected(format!(
                "github /user returned {}",
                response.status()
            )));
        }
        response
            .json::<GithubUser>()
            .await
            .map_err(|e| Error::ProviderRejected(format!("github /user parse: {}", e)))
    }
}

#[async_trait]
impl TokenRefresher for GithubClient {
    async fn refresh(&self, token: &OAuthToken) -> Result<OAuthToken> {
        GithubClient::refresh(self, token).await
    }
}
