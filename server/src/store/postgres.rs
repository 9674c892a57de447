//! Postgres `Store` implementation over sqlx.
//!
//! Queries are runtime-checked (`query_as` with explicit binds); the schema
//! lives under `migrations/`. Row structs are private; conversions into the
//! domain models validate the state invariants and surface violations as
//! `StoreError::Corrupt`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::FromRow;
use std::time::Duration;

use super::{Store, StoreError};
use crate::db::DbPool;
use crate::models::{
    ChatStatus, DeferredJob, EncryptionKey, FocusRecord, FocusSettings, FocusState,
    GithubAppConfig, JobFunction, OAuthToken, PomodoroSpec, Provider, TokenType,
    WebhookSubscription,
};

pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn ttl_deadline(ttl: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(0))
}

// =============================================================================
// Row types
// =============================================================================

#[derive(Debug, FromRow)]
struct FocusRow {
    user_id: String,
    state: String,
    started_at: Option<DateTime<Utc>>,
    ends_at: Option<DateTime<Utc>>,
    custom_message: Option<String>,
    saved_chat_status: Option<Json<ChatStatus>>,
    session_count: Option<i32>,
    total_sessions: Option<i32>,
    work_minutes: Option<i32>,
    break_minutes: Option<i32>,
}

impl TryFrom<FocusRow> for FocusRecord {
    type Error = StoreError;

    fn try_from(row: FocusRow) -> Result<Self, StoreError> {
        let corrupt = |what: &str| {
            StoreError::Corrupt(format!("focus_records[{}]: {}", row.user_id, what))
        };

        let state = match row.state.as_str() {
            "off" => FocusState::Off,
            "simple_active" => FocusState::Simple {
                started_at: row.started_at.ok_or_else(|| corrupt("missing started_at"))?,
                ends_at: row.ends_at,
            },
            "pomodoro_work" | "pomodoro_break" => {
                let pomodoro = PomodoroSpec {
                    session_count: row
                        .session_count
                        .filter(|c| *c >= 1)
                        .ok_or_else(|| corrupt("missing session_count"))?
                        as u32,
                    total_sessions: row.total_sessions.map(|t| t as u32),
                    work_minutes: row
                        .work_minutes
                        .ok_or_else(|| corrupt("missing work_minutes"))?
                        as u32,
                    break_minutes: row
                        .break_minutes
                        .ok_or_else(|| corrupt("missing break_minutes"))?
                        as u32,
                };
                let started_at = row.started_at.ok_or_else(|| corrupt("missing started_at"))?;
                let ends_at = row.ends_at.ok_or_else(|| corrupt("missing ends_at"))?;
                if row.state == "pomodoro_work" {
                    FocusState::PomodoroWork {
                        started_at,
                        ends_at,
                        pomodoro,
                    }
                } else {
                    FocusState::PomodoroBreak {
                        started_at,
                        ends_at,
                        pomodoro,
                    }
                }
            }
            other => return Err(corrupt(&format!("unknown state '{}'", other))),
        };

        Ok(FocusRecord {
            user_id: row.user_id,
            state,
            custom_message: row.custom_message,
            saved_chat_status: row.saved_chat_status.map(|json| json.0),
        })
    }
}

#[derive(Debug, FromRow)]
struct FocusSettingsRow {
    user_id: String,
    default_message: Option<String>,
    work_minutes: i32,
    break_minutes: i32,
    simple_status_text: Option<String>,
    simple_status_emoji: Option<String>,
    work_status_text: Option<String>,
    work_status_emoji: Option<String>,
    break_status_text: Option<String>,
    break_status_emoji: Option<String>,
    bypass_notification_config: Option<serde_json::Value>,
}

impl From<FocusSettingsRow> for FocusSettings {
    fn from(row: FocusSettingsRow) -> Self {
        Self {
            user_id: row.user_id,
            default_message: row.default_message,
            work_minutes: row.work_minutes.max(1) as u32,
            break_minutes: row.break_minutes.max(1) as u32,
            simple_status_text: row.simple_status_text,
            simple_status_emoji: row.simple_status_emoji,
            work_status_text: row.work_status_text,
            work_status_emoji: row.work_status_emoji,
            break_status_text: row.break_status_text,
            break_status_emoji: row.break_status_emoji,
            bypass_notification_config: row.bypass_notification_config,
        }
    }
}

#[derive(Debug, FromRow)]
struct OAuthTokenRow {
    id: String,
    user_id: String,
    provider: String,
    account_label: String,
    access_token: String,
    refresh_token: Option<String>,
    scope: Option<String>,
    expires_at: Option<DateTime<Utc>>,
    encrypted_access_token: Option<String>,
    encrypted_refresh_token: Option<String>,
    encryption_key_id: Option<String>,
    external_account_id: Option<String>,
    token_type: String,
    app_config_id: Option<String>,
}

impl TryFrom<OAuthTokenRow> for OAuthToken {
    type Error = StoreError;

    fn try_from(row: OAuthTokenRow) -> Result<Self, StoreError> {
        let provider = Provider::parse(&row.provider).ok_or_else(|| {
            StoreError::Corrupt(format!("oauth_tokens[{}]: provider '{}'", row.id, row.provider))
        })?;
        let token_type = TokenType::parse(&row.token_type).ok_or_else(|| {
            StoreError::Corrupt(format!(
                "oauth_tokens[{}]: token_type '{}'",
                row.id, row.token_type
            ))
        })?;
        Ok(OAuthToken {
            id: row.id,
            user_id: row.user_id,
            provider,
            account_label: row.account_label,
            access_token: row.access_token,
            refresh_token: row.refresh_token,
            scope: row.scope,
            expires_at: row.expires_at,
            encrypted_access_token: row.encrypted_access_token,
            encrypted_refresh_token: row.encrypted_refresh_token,
            encryption_key_id: row.encryption_key_id,
            external_account_id: row.external_account_id,
            token_type,
            app_config_id: row.app_config_id,
        })
    }
}

#[derive(Debug, FromRow)]
struct WebhookRow {
    id: String,
    user_id: String,
    name: String,
    url: String,
    enabled: bool,
    event_types: Json<Vec<String>>,
}

impl From<WebhookRow> for WebhookSubscription {
    fn from(row: WebhookRow) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            name: row.name,
            url: row.url,
            enabled: row.enabled,
            event_types: row.event_types.0,
        }
    }
}

#[derive(Debug, FromRow)]
struct JobRow {
    job_id: String,
    fire_at: DateTime<Utc>,
    function_name: String,
    argument: String,
}

impl TryFrom<JobRow> for DeferredJob {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, StoreError> {
        let function = JobFunction::parse(&row.function_name).ok_or_else(|| {
            StoreError::Corrupt(format!(
                "deferred_jobs[{}]: function '{}'",
                row.job_id, row.function_name
            ))
        })?;
        Ok(DeferredJob {
            job_id: row.job_id,
            fire_at: row.fire_at,
            function,
            argument: row.argument,
        })
    }
}

#[derive(Debug, FromRow)]
struct EncryptionKeyRow {
    id: String,
    key_name: String,
    encrypted_dek: Vec<u8>,
    kek_provider: String,
    is_active: bool,
}

impl From<EncryptionKeyRow> for EncryptionKey {
    fn from(row: EncryptionKeyRow) -> Self {
        Self {
            id: row.id,
            key_name: row.key_name,
            encrypted_dek: row.encrypted_dek,
            kek_provider: row.kek_provider,
            is_active: row.is_active,
        }
    }
}

#[derive(Debug, FromRow)]
struct GithubAppConfigRow {
    id: String,
    user_id: String,
    label: String,
    client_id: String,
    encrypted_client_secret: String,
    encryption_key_id: String,
    github_app_id: Option<String>,
}

impl From<GithubAppConfigRow> for GithubAppConfig {
    fn from(row: GithubAppConfigRow) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            label: row.label,
            client_id: row.client_id,
            encrypted_client_secret: row.encrypted_client_secret,
            encryption_key_id: row.encryption_key_id,
            github_app_id: row.github_app_id,
        }
    }
}

// =============================================================================
// Store implementation
// =============================================================================

#[async_trait]
impl Store for PgStore {
    async fn focus_record(&self, user_id: &str) -> Result<Option<FocusRecord>, StoreError> {
        let row = sqlx::query_as::<_, FocusRow>(
            r#"
            SELECT user_id, state, started_at, ends_at, custom_message, saved_chat_status,
                   session_count, total_sessions, work_minutes, break_minutes
            FROM focus_records
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(FocusRecord::try_from).transpose()
    }

    async fn put_focus_record(&self, record: &FocusRecord) -> Result<(), StoreError> {
        let pomodoro = record.state.pomodoro();
        sqlx::query(
            r#"
            INSERT INTO focus_records
                (user_id, state, started_at, ends_at, custom_message, saved_chat_status,
                 session_count, total_sessions, work_minutes, break_minutes, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (user_id) DO UPDATE SET
                state = EXCLUDED.state,
                started_at = EXCLUDED.started_at,
                ends_at = EXCLUDED.ends_at,
                custom_message = EXCLUDED.custom_message,
                saved_chat_status = EXCLUDED.saved_chat_status,
                session_count = EXCLUDED.session_count,
                total_sessions = EXCLUDED.total_sessions,
                work_minutes = EXCLUDED.work_minutes,
                break_minutes = EXCLUDED.break_minutes,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&record.user_id)
        .bind(record.state.name())
        .bind(record.state.started_at())
        .bind(record.state.ends_at())
        .bind(&record.custom_message)
        .bind(record.saved_chat_status.as_ref().map(|s| Json(s.clone())))
        .bind(pomodoro.map(|p| p.session_count as i32))
        .bind(pomodoro.and_then(|p| p.total_sessions).map(|t| t as i32))
        .bind(pomodoro.map(|p| p.work_minutes as i32))
        .bind(pomodoro.map(|p| p.break_minutes as i32))
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn active_expired_focus(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<FocusRecord>, StoreError> {
        let rows = sqlx::query_as::<_, FocusRow>(
            r#"
            SELECT user_id, state, started_at, ends_at, custom_message, saved_chat_status,
                   session_count, total_sessions, work_minutes, break_minutes
            FROM focus_records
            WHERE state <> 'off' AND ends_at IS NOT NULL AND ends_at < $1
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(FocusRecord::try_from).collect()
    }

    async fn focus_settings(&self, user_id: &str) -> Result<Option<FocusSettings>, StoreError> {
        let row = sqlx::query_as::<_, FocusSettingsRow>(
            r#"
            SELECT user_id, default_message, work_minutes, break_minutes,
                   simple_status_text, simple_status_emoji,
                   work_status_text, work_status_emoji,
                   break_status_text, break_status_emoji,
                   bypass_notification_config
            FROM focus_settings
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(FocusSettings::from))
    }

    async fn put_focus_settings(&self, settings: &FocusSettings) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO focus_settings
                (user_id, default_message, work_minutes, break_minutes,
                 simple_status_text, simple_status_emoji,
                 work_status_text, work_status_emoji,
                 break_status_text, break_status_emoji,
                 bypass_notification_config, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (user_id) DO UPDATE SET
                default_message = EXCLUDED.default_message,
                work_minutes = EXCLUDED.work_minutes,
                break_minutes = EXCLUDED.break_minutes,
                simple_status_text = EXCLUDED.simple_status_text,
                simple_status_emoji = EXCLUDED.simple_status_emoji,
                work_status_text = EXCLUDED.work_status_text,
                work_status_emoji = EXCLUDED.work_status_emoji,
                break_status_text = EXCLUDED.break_status_text,
                break_status_emoji = EXCLUDED.break_status_emoji,
                bypass_notification_config = EXCLUDED.bypass_notification_config,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&settings.user_id)
        .bind(&settings.default_message)
        .bind(settings.work_minutes as i32)
        .bind(settings.break_minutes as i32)
        .bind(&settings.simple_status_text)
        .bind(&settings.simple_status_emoji)
        .bind(&settings.work_status_text)
        .bind(&settings.work_status_emoji)
        .bind(&settings.break_status_text)
        .bind(&settings.break_status_emoji)
        .bind(&settings.bypass_notification_config)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn oauth_token(
        &self,
        user_id: &str,
        provider: Provider,
        account_label: &str,
    ) -> Result<Option<OAuthToken>, StoreError> {
        let row = sqlx::query_as::<_, OAuthTokenRow>(
            r#"
            SELECT id, user_id, provider, account_label, access_token, refresh_token,
                   scope, expires_at, encrypted_access_token, encrypted_refresh_token,
                   encryption_key_id, external_account_id, token_type, app_config_id
            FROM oauth_tokens
            WHERE user_id = $1 AND provider = $2 AND account_label = $3
            "#,
        )
        .bind(user_id)
        .bind(provider.as_str())
        .bind(account_label)
        .fetch_optional(&self.pool)
        .await?;

        row.map(OAuthToken::try_from).transpose()
    }

    async fn upsert_oauth_token(&self, token: &OAuthToken) -> Result<OAuthToken, StoreError> {
        let row = sqlx::query_as::<_, OAuthTokenRow>(
            r#"
            INSERT INTO oauth_tokens
                (id, user_id, provider, account_label, access_token, refresh_token,
                 scope, expires_at, encrypted_access_token, encrypted_refresh_token,
                 encryption_key_id, external_account_id, token_type, app_config_id, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (user_id, provider, account_label) DO UPDATE SET
                access_token = EXCLUDED.access_token,
                refresh_token = EXCLUDED.refresh_token,
                scope = EXCLUDED.scope,
                expires_at = EXCLUDED.expires_at,
                encrypted_access_token = EXCLUDED.encrypted_access_token,
                encrypted_refresh_token = EXCLUDED.encrypted_refresh_token,
                encryption_key_id = EXCLUDED.encryption_key_id,
                external_account_id = EXCLUDED.external_account_id,
                token_type = EXCLUDED.token_type,
                app_config_id = EXCLUDED.app_config_id,
                updated_at = EXCLUDED.updated_at
            RETURNING id, user_id, provider, account_label, access_token, refresh_token,
                      scope, expires_at, encrypted_access_token, encrypted_refresh_token,
                      encryption_key_id, external_account_id, token_type, app_config_id
            "#,
        )
        .bind(&token.id)
        .bind(&token.user_id)
        .bind(token.provider.as_str())
        .bind(&token.account_label)
        .bind(&token.access_token)
        .bind(&token.refresh_token)
        .bind(&token.scope)
        .bind(token.expires_at)
        .bind(&token.encrypted_access_token)
        .bind(&token.encrypted_refresh_token)
        .bind(&token.encryption_key_id)
        .bind(&token.external_account_id)
        .bind(token.token_type.as_str())
        .bind(&token.app_config_id)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        OAuthToken::try_from(row)
    }

    async fn delete_oauth_token(
        &self,
        user_id: &str,
        provider: Provider,
        account_label: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "DELETE FROM oauth_tokens WHERE user_id = $1 AND provider = $2 AND account_label = $3",
        )
        .bind(user_id)
        .bind(provider.as_str())
        .bind(account_label)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn encryption_key(&self, id: &str) -> Result<Option<EncryptionKey>, StoreError> {
        let row = sqlx::query_as::<_, EncryptionKeyRow>(
            "SELECT id, key_name, encrypted_dek, kek_provider, is_active \
             FROM encryption_keys WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(EncryptionKey::from))
    }

    async fn active_encryption_key(
        &self,
        key_name: &str,
    ) -> Result<Option<EncryptionKey>, StoreError> {
        let row = sqlx::query_as::<_, EncryptionKeyRow>(
            "SELECT id, key_name, encrypted_dek, kek_provider, is_active \
             FROM encryption_keys \
             WHERE key_name = $1 AND is_active \
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(key_name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(EncryptionKey::from))
    }

    async fn insert_encryption_key(&self, key: &EncryptionKey) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO encryption_keys (id, key_name, encrypted_dek, kek_provider, is_active)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&key.id)
        .bind(&key.key_name)
        .bind(&key.encrypted_dek)
        .bind(&key.kek_provider)
        .bind(key.is_active)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn github_app_config(&self, id: &str) -> Result<Option<GithubAppConfig>, StoreError> {
        let row = sqlx::query_as::<_, GithubAppConfigRow>(
            "SELECT id, user_id, label, client_id, encrypted_client_secret, \
                    encryption_key_id, github_app_id \
             FROM github_app_configs WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(GithubAppConfig::from))
    }

    async fn insert_github_app_config(
        &self,
        config: &GithubAppConfig,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO github_app_configs
                (id, user_id, label, client_id, encrypted_client_secret,
                 encryption_key_id, github_app_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&config.id)
        .bind(&config.user_id)
        .bind(&config.label)
        .bind(&config.client_id)
        .bind(&config.encrypted_client_secret)
        .bind(&config.encryption_key_id)
        .bind(&config.github_app_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn webhooks_for_event(
        &self,
        user_id: &str,
        event_type: &str,
    ) -> Result<Vec<WebhookSubscription>, StoreError> {
        let rows = sqlx::query_as::<_, WebhookRow>(
            r#"
            SELECT id, user_id, name, url, enabled, event_types
            FROM webhook_subscriptions
            WHERE user_id = $1 AND enabled AND event_types ? $2
            "#,
        )
        .bind(user_id)
        .bind(event_type)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(WebhookSubscription::from).collect())
    }

    async fn insert_webhook(&self, subscription: &WebhookSubscription) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO webhook_subscriptions (id, user_id, name, url, enabled, event_types)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&subscription.id)
        .bind(&subscription.user_id)
        .bind(&subscription.name)
        .bind(&subscription.url)
        .bind(subscription.enabled)
        .bind(Json(subscription.event_types.clone()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_webhook(&self, user_id: &str, id: &str) -> Result<bool, StoreError> {
        let result =
            sqlx::query("DELETE FROM webhook_subscriptions WHERE id = $1 AND user_id = $2")
                .bind(id)
                .bind(user_id)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn insert_job(&self, job: &DeferredJob) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO deferred_jobs (job_id, fire_at, function_name, argument)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(&job.job_id)
        .bind(job.fire_at)
        .bind(job.function.as_str())
        .bind(&job.argument)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn remove_job(&self, job_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM deferred_jobs WHERE job_id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn claim_due_jobs(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<DeferredJob>, StoreError> {
        // SKIP LOCKED keeps a second poller (e.g. during a rolling restart)
        // from claiming the same rows.
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            DELETE FROM deferred_jobs
            WHERE job_id IN (
                SELECT job_id FROM deferred_jobs
                WHERE fire_at <= $1
                ORDER BY fire_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING job_id, fire_at, function_name, argument
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(DeferredJob::try_from).collect()
    }

    async fn kv_put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO kv_entries (key, value, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(ttl_deadline(ttl))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn kv_get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let value = sqlx::query_scalar::<_, String>(
            "SELECT value FROM kv_entries WHERE key = $1 AND expires_at > $2",
        )
        .bind(key)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;

        Ok(value)
    }

    async fn kv_take(&self, key: &str) -> Result<Option<String>, StoreError> {
        let value = sqlx::query_scalar::<_, String>(
            "DELETE FROM kv_entries WHERE key = $1 AND expires_at > $2 RETURNING value",
        )
        .bind(key)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;

        Ok(value)
    }

    async fn kv_set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM kv_entries WHERE key = $1 AND expires_at <= $2")
            .bind(key)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query(
            r#"
            INSERT INTO kv_entries (key, value, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (key) DO NOTHING
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(ttl_deadline(ttl))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(result.rows_affected() > 0)
    }

    async fn kv_delete(&self, key: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM kv_entries WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn kv_purge_expired(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM kv_entries WHERE expires_at <= $1")
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
