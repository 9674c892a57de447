//! Focus mode endpoints.

use axum::{
    extract::State,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::auth::AuthUser;
use crate::error::{Error, Result};
use crate::focus::{
    EnableFocusRequest, FocusOrchestrator, StartPomodoroRequest, MAX_BREAK_MINUTES,
    MAX_WORK_MINUTES,
};
use crate::models::{FocusSettings, FocusStatus};
use crate::store::Store;

pub async fn enable(
    State(orchestrator): State<Arc<FocusOrchestrator>>,
    auth_user: AuthUser,
    Json(request): Json<EnableFocusRequest>,
) -> Result<Json<FocusStatus>> {
    let status = orchestrator.enable(&auth_user.user_id, request).await?;
    Ok(Json(status))
}

pub async fn disable(
    State(orchestrator): State<Arc<FocusOrchestrator>>,
    auth_user: AuthUser,
) -> Result<Json<FocusStatus>> {
    let status = orchestrator.disable(&auth_user.user_id).await?;
    Ok(Json(status))
}

pub async fn status(
    State(orchestrator): State<Arc<FocusOrchestrator>>,
    auth_user: AuthUser,
) -> Result<Json<FocusStatus>> {
    let status = orchestrator.status(&auth_user.user_id).await?;
    Ok(Json(status))
}

pub async fn start_pomodoro(
    State(orchestrator): State<Arc<FocusOrchestrator>>,
    auth_user: AuthUser,
    Json(request): Json<StartPomodoroRequest>,
) -> Result<Json<FocusStatus>> {
    let status = orchestrator
        .start_pomodoro(&auth_user.user_id, request)
        .await?;
    Ok(Json(status))
}

pub async fn skip_phase(
    State(orchestrator): State<Arc<FocusOrchestrator>>,
    auth_user: AuthUser,
) -> Result<Json<FocusStatus>> {
    let status = orchestrator.skip_phase(&auth_user.user_id).await?;
    Ok(Json(status))
}

// =============================================================================
// Settings
// =============================================================================

#[derive(Debug, Serialize)]
pub struct FocusSettingsResponse {
    pub default_message: Option<String>,
    pub work_minutes: u32,
    pub break_minutes: u32,
    pub simple_status_text: Option<String>,
    pub simple_status_emoji: Option<String>,
    pub work_status_text: Option<String>,
    pub work_status_emoji: Option<String>,
    pub break_status_text: Option<String>,
    pub break_status_emoji: Option<String>,
    pub bypass_notification_config: Option<serde_json::Value>,
}

impl From<FocusSettings> for FocusSettingsResponse {
    fn from(settings: FocusSettings) -> Self {
        Self {
            default_message: settings.default_message,
            work_minutes: settings.work_minutes,
            break_minutes: settings.break_minutes,
            simple_status_text: settings.simple_status_text,
            simple_status_emoji: settings.simple_status_emoji,
            work_status_text: settings.work_status_text,
            work_status_emoji: settings.work_status_emoji,
            break_status_text: settings.break_status_text,
            break_status_emoji: settings.break_status_emoji,
            bypass_notification_config: settings.bypass_notification_config,
        }
    }
}

/// Partial update; absent fields are left unchanged.
#[derive(Debug, Default, Deserialize)]
pub struct FocusSettingsUpdate {
    pub default_message: Option<String>,
    pub work_minutes: Option<u32>,
    pub break_minutes: Option<u32>,
    pub simple_status_text: Option<String>,
    pub simple_status_emoji: Option<String>,
    pub work_status_text: Option<String>,
    pub work_status_emoji: Option<String>,
    pub break_status_text: Option<String>,
    pub break_status_emoji: Option<String>,
    pub bypass_notification_config: Option<serde_json::Value>,
}

async fn settings_or_default(store: &Arc<dyn Store>, user_id: &str) -> Result<FocusSettings> {
    Ok(store
        .focus_settings(user_id)
        .await?
        .unwrap_or_else(|| FocusSettings::defaults_for(user_id)))
}

pub async fn get_settings(
    State(store): State<Arc<dyn Store>>,
    auth_user: AuthUser,
) -> Result<Json<FocusSettingsResponse>> {
    let settings = settings_or_default(&store, &auth_user.user_id).await?;
    Ok(Json(settings.into()))
}

pub async fn update_settings(
    State(store): State<Arc<dyn Store>>,
    auth_user: AuthUser,
    Json(update): Json<FocusSettingsUpdate>,
) -> Result<Json<FocusSettingsResponse>> {
    if matches!(update.work_minutes, Some(m) if m < 1 || m > MAX_WORK_MINUTES) {
        return Err(Error::Validation(format!(
            "work_minutes must be between 1 and {}",
            MAX_WORK_MINUTES
        )));
    }
    if matches!(update.break_minutes, Some(m) if m < 1 || m > MAX_BREAK_MINUTES) {
        return Err(Error::Validation(format!(
            "break_minutes must be between 1 and {}",
            MAX_BREAK_MINUTES
        )));
    }

    let mut settings = settings_or_default(&store, &auth_user.user_id).await?;
    if let Some(value) = update.default_message {
        settings.default_message = Some(value);
    }
    if let Some(value) = update.work_minutes {
        settings.work_minutes = value;
    }
    if let Some(value) = update.break_minutes {
        settings.break_minutes = value;
    }
    if let Some(value) = update.simple_status_text {
        settings.simple_status_text = Some(value);
    }
    if let Some(value) = update.simple_status_emoji {
        settings.simple_status_emoji = Some(value);
    }
    if let Some(value) = update.work_status_text {
        settings.work_status_text = Some(value);
    }
    if let Some(value) = update.work_status_emoji {
        settings.work_status_emoji = Some(value);
    }
    if let Some(value) = update.break_status_text {
        settings.break_status_text = Some(value);
    }
    if let Some(value) = update.break_status_emoji {
        settings.break_status_emoji = Some(value);
    }
    if let Some(value) = update.bypass_notification_config {
        settings.bypass_notification_config = Some(value);
    }

    store.put_focus_settings(&settings).await?;
    Ok(Json(settings.into()))
}
