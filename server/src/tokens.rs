//! Token vault: encrypted storage and lifecycle of third-party credentials.
//!
//! All writes go through a named singleton DEK (`oauth_tokens_dek_v1`),
//! created lazily on the first store and reused until rotation. The legacy
//! plaintext column is kept satisfied with a sentinel; reads fall back to it
//! only for rows that predate encryption.

use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::encryption::EnvelopeCipher;
use crate::error::{Error, Result};
use crate::models::{EncryptionKey, OAuthToken, Provider, TokenType};
use crate::store::Store;

pub const DEK_KEY_NAME: &str = "oauth_tokens_dek_v1";

/// Sentinel written to the non-null legacy plaintext column.
pub const ENCRYPTED_SENTINEL: &str = "encrypted";

/// Provider-specific refresh, registered by the provider clients so the
/// vault can renew expired OAuth tokens without knowing grant mechanics.
#[async_trait::async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, token: &OAuthToken) -> Result<OAuthToken>;
}

pub struct StoreTokenRequest {
    pub user_id: String,
    pub provider: Provider,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub scope: Option<String>,
    pub expires_at: Option<chrono::DateTime<Utc>>,
    pub account_label: String,
    pub external_account_id: Option<String>,
    pub token_type: TokenType,
    pub app_config_id: Option<String>,
}

impl StoreTokenRequest {
    pub fn new(user_id: impl Into<String>, provider: Provider, access_token: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            provider,
            access_token: access_token.into(),
            refresh_token: None,
            scope: None,
            expires_at: None,
            account_label: "default".to_string(),
            external_account_id: None,
            token_type: TokenType::Oauth,
            app_config_id: None,
        }
    }
}

pub struct TokenVault {
    store: Arc<dyn Store>,
    cipher: Arc<EnvelopeCipher>,
    refreshers: RwLock<HashMap<Provider, Arc<dyn TokenRefresher>>>,
}

impl TokenVault {
    pub fn new(store: Arc<dyn Store>, cipher: Arc<EnvelopeCipher>) -> Self {
        Self {
            store,
            cipher,
            refreshers: RwLock::new(HashMap::new()),
        }
    }

    pub fn register_refresher(&self, provider: Provider, refresher: Arc<dyn TokenRefresher>) {
        self.refreshers.write().insert(provider, refresher);
    }

    pub fn cipher(&self) -> &Arc<EnvelopeCipher> {
        &self.cipher
    }

    /// The active token DEK, generated and persisted on first use.
    pub async fn active_dek(&self) -> Result<EncryptionKey> {
        if let Some(key) = self.store.active_encryption_key(DEK_KEY_NAME).await? {
            return Ok(key);
        }

        let (encrypted_dek, _) = self.cipher.generate_dek().await?;
        let key = EncryptionKey {
            id: uuid::Uuid::new_v4().to_string(),
            key_name: DEK_KEY_NAME.to_string(),
            encrypted_dek,
            kek_provider: self.cipher.kek_name().to_string(),
            is_active: true,
        };
        match self.store.insert_encryption_key(&key).await {
            Ok(()) => {
                info!(key_name = DEK_KEY_NAME, "generated token encryption DEK");
                Ok(key)
            }
            // A concurrent writer won the race; use its key.
            Err(crate::store::StoreError::UniqueViolation(_)) => self
                .store
                .active_encryption_key(DEK_KEY_NAME)
                .await?
                .ok_or_else(|| Error::Kek("token DEK vanished after insert race".into())),
            Err(e) => Err(e.into()),
        }
    }

    /// Encrypt and upsert a credential by `(user, provider, account_label)`.
    pub async fn store(&self, request: StoreTokenRequest) -> Result<OAuthToken> {
        let key = self.active_dek().await?;

        let encrypted_access = self
            .cipher
            .encrypt(&request.access_token, &key.encrypted_dek)
            .await?;
        let encrypted_refresh = match &request.refresh_token {
            Some(refresh) => Some(self.cipher.encrypt(refresh, &key.encrypted_dek).await?),
            None => None,
        };

        let token = OAuthToken {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: request.user_id,
            provider: request.provider,
            account_label: request.account_label,
            access_token: ENCRYPTED_SENTINEL.to_string(),
            refresh_token: None,
            scope: request.scope,
            expires_at: request.expires_at,
            encrypted_access_token: Some(encrypted_access),
            encrypted_refresh_token: encrypted_refresh,
            encryption_key_id: Some(key.id),
            external_account_id: request.external_account_id,
            token_type: request.token_type,
            app_config_id: request.app_config_id,
        };

        Ok(self.store.upsert_oauth_token(&token).await?)
    }

    async fn decrypt_field(
        &self,
        token: &OAuthToken,
        ciphertext: Option<&str>,
        legacy: Option<&str>,
    ) -> Result<Option<String>> {
        if let (Some(ciphertext), Some(key_id)) = (ciphertext, token.encryption_key_id.as_deref())
        {
            let key = self
                .store
                .encryption_key(key_id)
                .await?
                .ok_or_else(|| Error::Kek(format!("encryption key {} not found", key_id)))?;
            let plaintext = self.cipher.decrypt(ciphertext, &key.encrypted_dek).await?;
            return Ok(Some(plaintext));
        }
        // Row predates encryption: the legacy column still holds plaintext.
        Ok(legacy
            .filter(|value| *value != ENCRYPTED_SENTINEL)
            .map(str::to_string))
    }

    /// Decrypted access token for a loaded row.
    pub async fn access_token(&self, token: &OAuthToken) -> Result<String> {
        self.decrypt_field(
            token,
            token.encrypted_access_token.as_deref(),
            Some(token.access_token.as_str()),
        )
        .await?
        .ok_or_else(|| Error::Auth("token record has no usable access token".into()))
    }

    /// Decrypted refresh token, if the row has one.
    pub async fn refresh_token(&self, token: &OAuthToken) -> Result<Option<String>> {
        self.decrypt_field(
            token,
            token.encrypted_refresh_token.as_deref(),
            token.refresh_token.as_deref(),
        )
        .await
    }

    pub async fn token(
        &self,
        user_id: &str,
        provider: Provider,
        account_label: &str,
    ) -> Result<Option<OAuthToken>> {
        Ok(self
            .store
            .oauth_token(user_id, provider, account_label)
            .await?)
    }

    /// Delete the stored credential. Server-side revocation happens in the
    /// provider clients before this is called; deletion always proceeds.
    pub async fn delete(
        &self,
        user_id: &str,
        provider: Provider,
        account_label: &str,
    ) -> Result<bool> {
        Ok(self
            .store
            .delete_oauth_token(user_id, provider, account_label)
            .await?)
    }

    /// A currently-usable plaintext access token, refreshing an expired
    /// OAuth token through the registered provider refresher. Returns None
    /// when there is no record or the refresh was refused.
    pub async fn valid_token_or_none(
        &self,
        user_id: &str,
        provider: Provider,
        account_label: &str,
    ) -> Result<Option<String>> {
        let Some(mut token) = self
            .store
            .oauth_token(user_id, provider, account_label)
            .await?
        else {
            return Ok(None);
        };

        if token.is_expired(Utc::now()) && token.token_type == TokenType::Oauth {
            let refresher = self.refreshers.read().get(&provider).cloned();
            let Some(refresher) = refresher else {
                warn!(user = user_id, provider = provider.as_str(), "expired token and no refresher registered");
                return Ok(None);
            };
            token = match refresher.refresh(&token).await {
                Ok(refreshed) => refreshed,
                Err(e) => {
                    warn!(
                        user = user_id,
                        provider = provider.as_str(),
                        error = %e,
                        "token refresh failed"
                    );
                    return Ok(None);
                }
            };
        }

        match self.access_token(&token).await {
            Ok(plaintext) => Ok(Some(plaintext)),
            Err(Error::Auth(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encryption::LocalKek;
    use crate::store::MemoryStore;

    fn vault() -> (Arc<MemoryStore>, TokenVault) {
        let store = Arc::new(MemoryStore::new());
        let cipher = Arc::new(EnvelopeCipher::new(Arc::new(
            LocalKek::new(&[3u8; 32]).unwrap(),
        )));
        let vault = TokenVault::new(store.clone(), cipher);
        (store, vault)
    }

    #[tokio::test]
    async fn store_then_load_round_trips_both_tokens() {
        let (_, vault) = vault();

        let stored = vault
            .store(StoreTokenRequest {
                refresh_token: Some("ghr_xyz".into()),
                scope: Some("repo".into()),
                ..StoreTokenRequest::new("u1", Provider::Github, "ghp_abc")
            })
            .await
            .unwrap();

        // Ciphertext actually differs from the secret and the plaintext
        // column only carries the sentinel.
        assert_eq!(stored.access_token, ENCRYPTED_SENTINEL);
        assert_ne!(
            stored.encrypted_access_token.as_deref(),
            Some("ghp_abc"),
        );

        let loaded = vault
            .token("u1", Provider::Github, "default")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(vault.access_token(&loaded).await.unwrap(), "ghp_abc");
        assert_eq!(
            vault.refresh_token(&loaded).await.unwrap(),
            Some("ghr_xyz".into())
        );
    }

    #[tokio::test]
    async fn dek_is_created_once_and_reused() {
        let (store, vault) = vault();

        vault
            .store(StoreTokenRequest::new("u1", Provider::Github, "a"))
            .await
            .unwrap();
        vault
            .store(StoreTokenRequest::new(
                "u2",
                Provider::Slack,
                "xoxp-something",
            ))
            .await
            .unwrap();

        let key = store
            .active_encryption_key(DEK_KEY_NAME)
            .await
            .unwrap()
            .unwrap();
        let t1 = store
            .oauth_token("u1", Provider::Github, "default")
            .await
            .unwrap()
            .unwrap();
        let t2 = store
            .oauth_token("u2", Provider::Slack, "default")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(t1.encryption_key_id.as_deref(), Some(key.id.as_str()));
        assert_eq!(t2.encryption_key_id.as_deref(), Some(key.id.as_str()));
    }

    #[tokio::test]
    async fn legacy_plaintext_rows_still_read() {
        let (store, vault) = vault();

        // A row written before encryption existed: plaintext column only.
        let legacy = OAuthToken {
            id: "legacy".into(),
            user_id: "u1".into(),
            provider: Provider::Slack,
            account_label: "default".into(),
            access_token: "xoxp-legacy".into(),
            refresh_token: None,
            scope: None,
            expires_at: None,
            encrypted_access_token: None,
            encrypted_refresh_token: None,
            encryption_key_id: None,
            external_account_id: None,
            token_type: TokenType::Oauth,
            app_config_id: None,
        };
        store.upsert_oauth_token(&legacy).await.unwrap();

        let loaded = vault
            .token("u1", Provider::Slack, "default")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(vault.access_token(&loaded).await.unwrap(), "xoxp-legacy");
    }

    #[tokio::test]
    async fn delete_removes_the_row() {
        let (store, vault) = vault();
        vault
            .store(StoreTokenRequest::new("u1", Provider::Github, "ghp_abc"))
            .await
            .unwrap();

        assert!(vault.delete("u1", Provider::Github, "default").await.unwrap());
        assert!(store
            .oauth_token("u1", Provider::Github, "default")
            .await
            .unwrap()
            .is_none());
        // Second delete is a no-op.
        assert!(!vault.delete("u1", Provider::Github, "default").await.unwrap());
    }

    #[tokio::test]
    async fn valid_token_skips_refresh_for_pat_and_unexpired() {
        let (_, vault) = vault();

        vault
            .store(StoreTokenRequest {
                token_type: TokenType::Pat,
                scope: Some("pat".into()),
                expires_at: Some(Utc::now() - chrono::Duration::hours(1)),
                ..StoreTokenRequest::new("u1", Provider::Github, "ghp_pat")
            })
            .await
            .unwrap();

        // Expired but a PAT: returned as-is, no refresher involved.
        assert_eq!(
            vault
                .valid_token_or_none("u1", Provider::Github, "default")
                .await
                .unwrap(),
            Some("ghp_pat".into())
        );
    }

    #[tokio::test]
    async fn expired_oauth_without_refresher_yields_none() {
        let (_, vault) = vault();

        vault
            .store(StoreTokenRequest {
                expires_at: Some(Utc::now() - chrono::Duration::hours(1)),
                ..StoreTokenRequest::new("u1", Provider::Github, "ghp_old")
            })
            .await
            .unwrap();

        assert_eq!(
            vault
                .valid_token_or_none("u1", Provider::Github, "default")
                .await
                .unwrap(),
            None
        );
    }
}
