//! In-memory `Store` implementation.
//!
//! Single-process only; backs the integration tests and local development
//! without a database. TTL entries are enforced on read.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::{Store, StoreError};
use crate::models::{
    DeferredJob, EncryptionKey, FocusRecord, FocusSettings, GithubAppConfig, OAuthToken, Provider,
    WebhookSubscription,
};

#[derive(Default)]
struct Inner {
    focus: HashMap<String, FocusRecord>,
    settings: HashMap<String, FocusSettings>,
    tokens: HashMap<(String, Provider, String), OAuthToken>,
    keys: HashMap<String, EncryptionKey>,
    app_configs: HashMap<String, GithubAppConfig>,
    webhooks: HashMap<String, WebhookSubscription>,
    jobs: HashMap<String, DeferredJob>,
    kv: HashMap<String, (String, Instant)>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn token_key(user_id: &str, provider: Provider, label: &str) -> (String, Provider, String) {
        (user_id.to_string(), provider, label.to_string())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn focus_record(&self, user_id: &str) -> Result<Option<FocusRecord>, StoreError> {
        Ok(self.inner.lock().focus.get(user_id).cloned())
    }

    async fn put_focus_record(&self, record: &FocusRecord) -> Result<(), StoreError> {
        self.inner
            .lock()
            .focus
            .insert(record.user_id.clone(), record.clone());
        Ok(())
    }

    async fn active_expired_focus(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<FocusRecord>, StoreError> {
        Ok(self
            .inner
            .lock()
            .focus
            .values()
            .filter(|r| r.is_active() && matches!(r.state.ends_at(), Some(e) if e < now))
            .cloned()
            .collect())
    }

    async fn focus_settings(&self, user_id: &str) -> Result<Option<FocusSettings>, StoreError> {
        Ok(self.inner.lock().settings.get(user_id).cloned())
    }

    async fn put_focus_settings(&self, settings: &FocusSettings) -> Result<(), StoreError> {
        self.inner
            .lock()
            .settings
            .insert(settings.user_id.clone(), settings.clone());
        Ok(())
    }

    async fn oauth_token(
        &self,
        user_id: &str,
        provider: Provider,
        account_label: &str,
    ) -> Result<Option<OAuthToken>, StoreError> {
        Ok(self
            .inner
            .lock()
            .tokens
            .get(&Self::token_key(user_id, provider, account_label))
            .cloned())
    }

    async fn upsert_oauth_token(&self, token: &OAuthToken) -> Result<OAuthToken, StoreError> {
        let key = Self::token_key(&token.user_id, token.provider, &token.account_label);
        let mut inner = self.inner.lock();
        let stored = match inner.tokens.get(&key) {
            // Keep the original row id across refreshes, like the unique
            // constraint upsert does.
            Some(existing) => OAuthToken {
                id: existing.id.clone(),
                ..token.clone()
            },
            None => token.clone(),
        };
        inner.tokens.insert(key, stored.clone());
        Ok(stored)
    }

    async fn delete_oauth_token(
        &self,
        user_id: &str,
        provider: Provider,
        account_label: &str,
    ) -> Result<bool, StoreError> {
        Ok(self
            .inner
            .lock()
            .tokens
            .remove(&Self::token_key(user_id, provider, account_label))
            .is_some())
    }

    async fn encryption_key(&self, id: &str) -> Result<Option<EncryptionKey>, StoreError> {
        Ok(self.inner.lock().keys.get(id).cloned())
    }

    async fn active_encryption_key(
        &self,
        key_name: &str,
    ) -> Result<Option<EncryptionKey>, StoreError> {
        Ok(self
            .inner
            .lock()
            .keys
            .values()
            .find(|k| k.key_name == key_name && k.is_active)
            .cloned())
    }

    async fn insert_encryption_key(&self, key: &EncryptionKey) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if inner.keys.contains_key(&key.id) {
            return Err(StoreError::UniqueViolation("encryption_keys_pkey".into()));
        }
        inner.keys.insert(key.id.clone(), key.clone());
        Ok(())
    }

    async fn github_app_config(&self, id: &str) -> Result<Option<GithubAppConfig>, StoreError> {
        Ok(self.inner.lock().app_configs.get(id).cloned())
    }

    async fn insert_github_app_config(
        &self,
        config: &GithubAppConfig,
    ) -> Result<(), StoreError> {
        self.inner
            .lock()
            .app_configs
            .insert(config.id.clone(), config.clone());
        Ok(())
    }

    async fn webhooks_for_event(
        &self,
        user_id: &str,
        event_type: &str,
    ) -> Result<Vec<WebhookSubscription>, StoreError> {
        Ok(self
            .inner
            .lock()
            .webhooks
            .values()
            .filter(|w| {
                w.user_id == user_id && w.enabled && w.event_types.iter().any(|t| t == event_type)
            })
            .cloned()
            .collect())
    }

    async fn insert_webhook(&self, subscription: &WebhookSubscription) -> Result<(), StoreError> {
        self.inner
            .lock()
            .webhooks
            .insert(subscription.id.clone(), subscription.clone());
        Ok(())
    }

    async fn delete_webhook(&self, user_id: &str, id: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        match inner.webhooks.get(id) {
            Some(w) if w.user_id == user_id => {
                inner.webhooks.remove(id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert_job(&self, job: &DeferredJob) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if inner.jobs.contains_key(&job.job_id) {
            return Err(StoreError::UniqueViolation("deferred_jobs_pkey".into()));
        }
        inner.jobs.insert(job.job_id.clone(), job.clone());
        Ok(())
    }

    async fn remove_job(&self, job_id: &str) -> Result<bool, StoreError> {
        Ok(self.inner.lock().jobs.remove(job_id).is_some())
    }

    async fn claim_due_jobs(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<DeferredJob>, StoreError> {
        let mut inner = self.inner.lock();
        let mut due: Vec<DeferredJob> = inner
            .jobs
            .values()
            .filter(|j| j.fire_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|j| j.fire_at);
        due.truncate(limit.max(0) as usize);
        for job in &due {
            inner.jobs.remove(&job.job_id);
        }
        Ok(due)
    }

    async fn kv_put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.inner
            .lock()
            .kv
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn kv_get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut inner = self.inner.lock();
        match inner.kv.get(key) {
            Some((value, deadline)) if *deadline > Instant::now() => Ok(Some(value.clone())),
            Some(_) => {
                inner.kv.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn kv_take(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut inner = self.inner.lock();
        match inner.kv.remove(key) {
            Some((value, deadline)) if deadline > Instant::now() => Ok(Some(value)),
            _ => Ok(None),
        }
    }

    async fn kv_set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        let live = matches!(inner.kv.get(key), Some((_, deadline)) if *deadline > Instant::now());
        if live {
            return Ok(false);
        }
        inner
            .kv
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(true)
    }

    async fn kv_delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.inner.lock().kv.remove(key).is_some())
    }

    async fn kv_purge_expired(&self) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let before = inner.kv.len();
        inner.kv.retain(|_, entry| entry.1 > now);
        Ok((before - inner.kv.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FocusState, JobFunction};

    #[tokio::test]
    async fn focus_record_round_trip() {
        let store = MemoryStore::new();
        assert!(store.focus_record("u1").await.unwrap().is_none());

        let record = FocusRecord::off("u1");
        store.put_focus_record(&record).await.unwrap();
        assert_eq!(store.focus_record("u1").await.unwrap(), Some(record));
    }

    #[tokio::test]
    async fn expired_sweep_skips_inactive_and_unexpired() {
        let store = MemoryStore::new();
        let now = Utc::now();

        store.put_focus_record(&FocusRecord::off("off")).await.unwrap();
        store
            .put_focus_record(&FocusRecord {
                user_id: "running".into(),
                state: FocusState::Simple {
                    started_at: now,
                    ends_at: Some(now + chrono::Duration::minutes(5)),
                },
                custom_message: None,
                saved_chat_status: None,
            })
            .await
            .unwrap();
        store
            .put_focus_record(&FocusRecord {
                user_id: "stale".into(),
                state: FocusState::Simple {
                    started_at: now - chrono::Duration::minutes(40),
                    ends_at: Some(now - chrono::Duration::minutes(10)),
                },
                custom_message: None,
                saved_chat_status: None,
            })
            .await
            .unwrap();

        let expired = store.active_expired_focus(now).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].user_id, "stale");
    }

    #[tokio::test]
    async fn job_claim_is_destructive_and_ordered() {
        let store = MemoryStore::new();
        let now = Utc::now();
        for (id, offset) in [("b", 2), ("a", 1), ("future", 300)] {
            store
                .insert_job(&DeferredJob {
                    job_id: id.into(),
                    fire_at: now + chrono::Duration::seconds(offset - 10),
                    function: JobFunction::ExpireFocusSession,
                    argument: "u1".into(),
                })
                .await
                .unwrap();
        }

        let claimed = store.claim_due_jobs(now, 10).await.unwrap();
        let ids: Vec<_> = claimed.iter().map(|j| j.job_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        // Claimed jobs are gone; the future one is untouched.
        assert!(store.claim_due_jobs(now, 10).await.unwrap().is_empty());
        assert!(store.remove_job("future").await.unwrap());
    }

    #[tokio::test]
    async fn kv_ttl_and_nx_semantics() {
        let store = MemoryStore::new();

        assert!(store
            .kv_set_nx("dedup:1", "1", Duration::from_secs(60))
            .await
            .unwrap());
        assert!(!store
            .kv_set_nx("dedup:1", "1", Duration::from_secs(60))
            .await
            .unwrap());

        store
            .kv_put("gone", "x", Duration::from_millis(0))
            .await
            .unwrap();
        assert_eq!(store.kv_get("gone").await.unwrap(), None);
        // Expired key counts as absent for SET NX.
        assert!(store
            .kv_set_nx("gone", "y", Duration::from_secs(60))
            .await
            .unwrap());

        assert_eq!(store.kv_take("gone").await.unwrap(), Some("y".into()));
        assert_eq!(store.kv_take("gone").await.unwrap(), None);
    }
}
