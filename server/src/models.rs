//! Domain models for the focus control plane.
//!
//! The focus state is a tagged sum rather than a flag plus nullable columns:
//! a pomodoro variant cannot exist without its session configuration, so the
//! "work/break minutes are set while in pomodoro" invariant holds by
//! construction. Row-level encodings live in the store implementations.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Chat provider status
// =============================================================================

/// Snapshot of a chat-provider status (`users.profile` subset).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatStatus {
    pub text: String,
    pub emoji: String,
    /// Unix timestamp when the status expires; 0 = never.
    #[serde(default)]
    pub expiration: i64,
}

impl ChatStatus {
    pub fn new(text: impl Into<String>, emoji: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            emoji: emoji.into(),
            expiration: 0,
        }
    }

    /// The empty status used to clear a profile on exit.
    pub fn cleared() -> Self {
        Self::new("", "")
    }
}

// =============================================================================
// Focus state machine
// =============================================================================

/// Per-session pomodoro configuration, carried by the pomodoro variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PomodoroSpec {
    /// 1-indexed count of work phases started this session.
    pub session_count: u32,
    /// Session cap; completing the cap-th work phase ends the session.
    pub total_sessions: Option<u32>,
    pub work_minutes: u32,
    pub break_minutes: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FocusState {
    Off,
    Simple {
        started_at: DateTime<Utc>,
        /// None means the session never auto-expires (DND still caps at 480).
        ends_at: Option<DateTime<Utc>>,
    },
    PomodoroWork {
        started_at: DateTime<Utc>,
        ends_at: DateTime<Utc>,
        pomodoro: PomodoroSpec,
    },
    PomodoroBreak {
        started_at: DateTime<Utc>,
        ends_at: DateTime<Utc>,
        pomodoro: PomodoroSpec,
    },
}

impl FocusState {
    pub fn is_active(&self) -> bool {
        !matches!(self, FocusState::Off)
    }

    pub fn name(&self) -> &'static str {
        match self {
            FocusState::Off => "off",
            FocusState::Simple { .. } => "simple_active",
            FocusState::PomodoroWork { .. } => "pomodoro_work",
            FocusState::PomodoroBreak { .. } => "pomodoro_break",
        }
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        match self {
            FocusState::Off => None,
            FocusState::Simple { started_at, .. }
            | FocusState::PomodoroWork { started_at, .. }
            | FocusState::PomodoroBreak { started_at, .. } => Some(*started_at),
        }
    }

    /// Phase end, not session end: for pomodoro this is when the current
    /// work or break phase is due to transition.
    pub fn ends_at(&self) -> Option<DateTime<Utc>> {
        match self {
            FocusState::Off => None,
            FocusState::Simple { ends_at, .. } => *ends_at,
            FocusState::PomodoroWork { ends_at, .. }
            | FocusState::PomodoroBreak { ends_at, .. } => Some(*ends_at),
        }
    }

    pub fn pomodoro(&self) -> Option<&PomodoroSpec> {
        match self {
            FocusState::PomodoroWork { pomodoro, .. }
            | FocusState::PomodoroBreak { pomodoro, .. } => Some(pomodoro),
            _ => None,
        }
    }

    pub fn phase(&self) -> Option<&'static str> {
        match self {
            FocusState::PomodoroWork { .. } => Some("work"),
            FocusState::PomodoroBreak { .. } => Some("break"),
            _ => None,
        }
    }
}

/// One row per user; created lazily on the first focus operation.
#[derive(Debug, Clone, PartialEq)]
pub struct FocusRecord {
    pub user_id: String,
    pub state: FocusState,
    /// Optional auto-reply text for the active session.
    pub custom_message: Option<String>,
    /// Chat status snapshot taken at entry, restored on exit. None means
    /// "clear on exit".
    pub saved_chat_status: Option<ChatStatus>,
}

impl FocusRecord {
    pub fn off(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            state: FocusState::Off,
            custom_message: None,
            saved_chat_status: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    pub fn time_remaining_seconds(&self, now: DateTime<Utc>) -> Option<i64> {
        self.state
            .ends_at()
            .map(|ends_at| (ends_at - now).num_seconds().max(0))
    }
}

/// Per-user focus defaults and chat status overrides; lazily created.
#[derive(Debug, Clone, PartialEq)]
pub struct FocusSettings {
    pub user_id: String,
    pub default_message: Option<String>,
    pub work_minutes: u32,
    pub break_minutes: u32,
    pub simple_status_text: Option<String>,
    pub simple_status_emoji: Option<String>,
    pub work_status_text: Option<String>,
    pub work_status_emoji: Option<String>,
    pub break_status_text: Option<String>,
    pub break_status_emoji: Option<String>,
    /// Opaque blob governing how bypass notifications reach the user.
    pub bypass_notification_config: Option<serde_json::Value>,
}

impl FocusSettings {
    pub fn defaults_for(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            default_message: None,
            work_minutes: 25,
            break_minutes: 5,
            simple_status_text: None,
            simple_status_emoji: None,
            work_status_text: None,
            work_status_emoji: None,
            break_status_text: None,
            break_status_emoji: None,
            bypass_notification_config: None,
        }
    }

    pub fn simple_status(&self) -> ChatStatus {
        ChatStatus::new(
            self.simple_status_text.as_deref().unwrap_or("In focus mode"),
            self.simple_status_emoji.as_deref().unwrap_or(":no_bell:"),
        )
    }

    pub fn work_status(&self) -> ChatStatus {
        ChatStatus::new(
            self.work_status_text
                .as_deref()
                .unwrap_or("Pomodoro - Focus time"),
            self.work_status_emoji.as_deref().unwrap_or(":tomato:"),
        )
    }

    pub fn break_status(&self) -> ChatStatus {
        ChatStatus::new(
            self.break_status_text
                .as_deref()
                .unwrap_or("Pomodoro - Break time"),
            self.break_status_emoji.as_deref().unwrap_or(":coffee:"),
        )
    }
}

/// API view of a user's focus state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FocusStatus {
    pub is_active: bool,
    pub mode: Option<String>,
    pub phase: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
    pub custom_message: Option<String>,
    pub session_count: Option<u32>,
    pub total_sessions: Option<u32>,
    pub work_minutes: Option<u32>,
    pub break_minutes: Option<u32>,
    pub time_remaining_seconds: Option<i64>,
}

impl FocusStatus {
    pub fn inactive() -> Self {
        Self {
            is_active: false,
            mode: None,
            phase: None,
            started_at: None,
            ends_at: None,
            custom_message: None,
            session_count: None,
            total_sessions: None,
            work_minutes: None,
            break_minutes: None,
            time_remaining_seconds: None,
        }
    }

    pub fn from_record(record: &FocusRecord, now: DateTime<Utc>) -> Self {
        if !record.is_active() {
            return Self::inactive();
        }
        let pomodoro = record.state.pomodoro();
        Self {
            is_active: true,
            mode: Some(match record.state {
                FocusState::Simple { .. } => "simple".to_string(),
                _ => "pomodoro".to_string(),
            }),
            phase: record.state.phase().map(str::to_string),
            started_at: record.state.started_at(),
            ends_at: record.state.ends_at(),
            custom_message: record.custom_message.clone(),
            session_count: pomodoro.map(|p| p.session_count),
            total_sessions: pomodoro.and_then(|p| p.total_sessions),
            work_minutes: pomodoro.map(|p| p.work_minutes),
            break_minutes: pomodoro.map(|p| p.break_minutes),
            time_remaining_seconds: record.time_remaining_seconds(now),
        }
    }
}

// =============================================================================
// OAuth tokens and encryption keys
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Slack,
    Github,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Slack => "slack",
            Provider::Github => "github",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "slack" => Some(Provider::Slack),
            "github" => Some(Provider::Github),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Oauth,
    Pat,
}

impl TokenType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenType::Oauth => "oauth",
            TokenType::Pat => "pat",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "oauth" => Some(TokenType::Oauth),
            "pat" => Some(TokenType::Pat),
            _ => None,
        }
    }
}

/// Stored third-party credential, unique by `(user, provider, account_label)`.
///
/// The `access_token`/`refresh_token` columns are legacy plaintext slots;
/// encrypted rows carry the sentinel `"encrypted"` there and the real
/// ciphertext in the `encrypted_*` fields.
#[derive(Debug, Clone, PartialEq)]
pub struct OAuthToken {
    pub id: String,
    pub user_id: String,
    pub provider: Provider,
    pub account_label: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub scope: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub encrypted_access_token: Option<String>,
    pub encrypted_refresh_token: Option<String>,
    pub encryption_key_id: Option<String>,
    pub external_account_id: Option<String>,
    pub token_type: TokenType,
    /// When set, OAuth refresh uses this per-user app's credentials.
    pub app_config_id: Option<String>,
}

impl OAuthToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(expires_at) if expires_at < now)
    }
}

/// Encrypted DEK record. Create-only: rotation inserts a new row and flips
/// `is_active` off on the old one.
#[derive(Debug, Clone, PartialEq)]
pub struct EncryptionKey {
    pub id: String,
    pub key_name: String,
    pub encrypted_dek: Vec<u8>,
    pub kek_provider: String,
    pub is_active: bool,
}

/// Per-user GitHub App credentials with the client secret under envelope
/// encryption.
#[derive(Debug, Clone, PartialEq)]
pub struct GithubAppConfig {
    pub id: String,
    pub user_id: String,
    pub label: String,
    pub client_id: String,
    pub encrypted_client_secret: String,
    pub encryption_key_id: String,
    pub github_app_id: Option<String>,
}

// =============================================================================
// Webhooks and events
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct WebhookSubscription {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub url: String,
    pub enabled: bool,
    pub event_types: Vec<String>,
}

impl WebhookSubscription {
    pub fn wants(&self, event_type: EventType) -> bool {
        self.enabled && self.event_types.iter().any(|t| t == event_type.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    FocusStarted,
    FocusEnded,
    PomodoroWorkStarted,
    PomodoroBreakStarted,
    PomodoroComplete,
    /// Reserved for the Slack bypass-notification path.
    FocusBypass,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::FocusStarted => "focus_started",
            EventType::FocusEnded => "focus_ended",
            EventType::PomodoroWorkStarted => "pomodoro_work_started",
            EventType::PomodoroBreakStarted => "pomodoro_break_started",
            EventType::PomodoroComplete => "pomodoro_complete",
            EventType::FocusBypass => "focus_bypass",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Deferred jobs
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobFunction {
    ExpireFocusSession,
    TransitionPomodoro,
}

impl JobFunction {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobFunction::ExpireFocusSession => "expire_focus_session",
            JobFunction::TransitionPomodoro => "transition_pomodoro",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "expire_focus_session" => Some(JobFunction::ExpireFocusSession),
            "transition_pomodoro" => Some(JobFunction::TransitionPomodoro),
            _ => None,
        }
    }
}

/// Persistent unit of the deferred-job scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct DeferredJob {
    pub job_id: String,
    pub fire_at: DateTime<Utc>,
    pub function: JobFunction,
    pub argument: String,
}

pub fn minutes(m: u32) -> Duration {
    Duration::minutes(i64::from(m))
}
