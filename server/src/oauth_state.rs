//! One-shot OAuth state tokens guarding redirect callbacks against CSRF.

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::store::Store;

const STATE_TTL: Duration = Duration::from_secs(600);
const STATE_TOKEN_LEN: usize = 43;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OAuthStateData {
    pub user_id: String,
    pub account_label: String,
    pub app_config_id: Option<String>,
}

pub struct OAuthStateStore {
    store: Arc<dyn Store>,
}

impl OAuthStateStore {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    fn key(state: &str) -> String {
        format!("oauth_state:{}", state)
    }

    /// Issue a fresh state token bound to the initiating user. Valid for
    /// ten minutes, consumable once.
    pub async fn issue(
        &self,
        user_id: &str,
        account_label: &str,
        app_config_id: Option<&str>,
    ) -> Result<String> {
        let state: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(STATE_TOKEN_LEN)
            .map(char::from)
            .collect();

        let data = OAuthStateData {
            user_id: user_id.to_string(),
            account_label: account_label.to_string(),
            app_config_id: app_config_id.map(str::to_string),
        };
        let value = serde_json::to_string(&data)
            .map_err(|e| Error::Validation(format!("oauth state encode: {}", e)))?;

        self.store.kv_put(&Self::key(&state), &value, STATE_TTL).await?;
        Ok(state)
    }

    /// Consume a state token. None when unknown, expired, or already used.
    pub async fn consume(&self, state: &str) -> Result<Option<OAuthStateData>> {
        let Some(value) = self.store.kv_take(&Self::key(state)).await? else {
            return Ok(None);
        };
        let data = serde_json::from_str(&value)
            .map_err(|e| Error::Validation(format!("oauth state decode: {}", e)))?;
        Ok(Some(data))
    }
}
