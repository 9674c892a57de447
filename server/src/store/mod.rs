//! Abstract repository over the relational store plus a TTL key-value
//! facility (OAuth CSRF state, event dedup, scheduler sidecars).
//!
//! The control plane only ever talks to `Arc<dyn Store>`; tests substitute
//! the in-memory implementation.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

use crate::models::{
    DeferredJob, EncryptionKey, FocusRecord, FocusSettings, GithubAppConfig, OAuthToken, Provider,
    WebhookSubscription,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),

    /// A persisted row no longer satisfies the model invariants.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.code().as_deref() == Some("23505") {
                return StoreError::UniqueViolation(
                    db_err.constraint().unwrap_or("unknown").to_string(),
                );
            }
        }
        StoreError::Database(err.to_string())
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    // -------------------------------------------------------------------------
    // Focus records
    // -------------------------------------------------------------------------

    async fn focus_record(&self, user_id: &str) -> Result<Option<FocusRecord>, StoreError>;

    /// Upsert; this is the commit point of every state transition.
    async fn put_focus_record(&self, record: &FocusRecord) -> Result<(), StoreError>;

    /// Active records whose phase end has passed. Used by the backup sweep.
    async fn active_expired_focus(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<FocusRecord>, StoreError>;

    // -------------------------------------------------------------------------
    // Focus settings
    // -------------------------------------------------------------------------

    async fn focus_settings(&self, user_id: &str) -> Result<Option<FocusSettings>, StoreError>;

    async fn put_focus_settings(&self, settings: &FocusSettings) -> Result<(), StoreError>;

    // -------------------------------------------------------------------------
    // OAuth tokens
    // -------------------------------------------------------------------------

    async fn oauth_token(
        &self,
        user_id: &str,
        provider: Provider,
        account_label: &str,
    ) -> Result<Option<OAuthToken>, StoreError>;

    /// Upsert by `(user, provider, account_label)`; returns the stored row.
    async fn upsert_oauth_token(&self, token: &OAuthToken) -> Result<OAuthToken, StoreError>;

    async fn delete_oauth_token(
        &self,
        user_id: &str,
        provider: Provider,
        account_label: &str,
    ) -> Result<bool, StoreError>;

    // -------------------------------------------------------------------------
    // Encryption keys (create-only)
    // -------------------------------------------------------------------------

    async fn encryption_key(&self, id: &str) -> Result<Option<EncryptionKey>, StoreError>;

    async fn active_encryption_key(
        &self,
        key_name: &str,
    ) -> Result<Option<EncryptionKey>, StoreError>;

    async fn insert_encryption_key(&self, key: &EncryptionKey) -> Result<(), StoreError>;

    // -------------------------------------------------------------------------
    // GitHub app configs
    // -------------------------------------------------------------------------

    async fn github_app_config(&self, id: &str) -> Result<Option<GithubAppConfig>, StoreError>;

    async fn insert_github_app_config(&self, config: &GithubAppConfig)
        -> Result<(), StoreError>;

    // -------------------------------------------------------------------------
    // Webhook subscriptions
    // -------------------------------------------------------------------------

    /// Enabled subscriptions for `user_id` matching `event_type`.
    async fn webhooks_for_event(
        &self,
        user_id: &str,
        event_type: &str,
    ) -> Result<Vec<WebhookSubscription>, StoreError>;

    async fn insert_webhook(&self, subscription: &WebhookSubscription) -> Result<(), StoreError>;

    async fn delete_webhook(&self, user_id: &str, id: &str) -> Result<bool, StoreError>;

    // -------------------------------------------------------------------------
    // Deferred jobs
    // -------------------------------------------------------------------------

    async fn insert_job(&self, job: &DeferredJob) -> Result<(), StoreError>;

    /// Atomically remove a pending job; `false` if it already fired or never
    /// existed.
    async fn remove_job(&self, job_id: &str) -> Result<bool, StoreError>;

    /// Claim-and-delete up to `limit` due jobs, oldest first. A claimed job
    /// belongs to the caller; a crash between claim and run loses the job,
    /// which the backup sweep tolerates.
    async fn claim_due_jobs(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<DeferredJob>, StoreError>;

    // -------------------------------------------------------------------------
    // TTL key-value store
    // -------------------------------------------------------------------------

    async fn kv_put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    async fn kv_get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// One-shot consume: returns and deletes the live value.
    async fn kv_take(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// SET NX: `true` iff the key was absent (or expired) and is now set.
    async fn kv_set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError>;

    async fn kv_delete(&self, key: &str) -> Result<bool, StoreError>;

    async fn kv_purge_expired(&self) -> Result<u64, StoreError>;
}
