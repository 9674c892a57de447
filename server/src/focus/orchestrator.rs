//! Focus orchestrator: every public operation is one state transition with
//! a fixed effect order.
//!
//! The persistent store is the linearization point: `read → mutate in
//! memory → commit → external effects`. Chat-provider and scheduler failures
//! after the commit are logged and swallowed; persisted state is
//! authoritative and the backup sweep converges missed expirations. Store,
//! cipher, and validation failures abort before anything externally visible
//! happens.

use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::{
    advance_phase, EnableFocusRequest, PhaseAdvance, StartPomodoroRequest, DEFAULT_DND_MINUTES,
};
use crate::chat::ChatProvider;
use crate::error::{Error, Result};
use crate::models::{
    minutes, ChatStatus, EventType, FocusRecord, FocusSettings, FocusState, FocusStatus,
    PomodoroSpec,
};
use crate::notify::Notifier;
use crate::scheduler::Scheduler;
use crate::store::Store;

/// Worker-visible result of a transition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// Not an active pomodoro; nothing happened.
    Noop,
    Transitioned,
    /// Session cap reached; the session ended.
    Complete,
}

pub struct FocusOrchestrator {
    store: Arc<dyn Store>,
    chat: Arc<dyn ChatProvider>,
    notifier: Arc<Notifier>,
    scheduler: Arc<Scheduler>,
}

impl FocusOrchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        chat: Arc<dyn ChatProvider>,
        notifier: Arc<Notifier>,
        scheduler: Arc<Scheduler>,
    ) -> Self {
        Self {
            store,
            chat,
            notifier,
            scheduler,
        }
    }

    // -------------------------------------------------------------------------
    // Public operations
    // -------------------------------------------------------------------------

    /// OFF → SIMPLE (also replaces a running session with the new one).
    pub async fn enable(&self, user_id: &str, request: EnableFocusRequest) -> Result<FocusStatus> {
        request.validate()?;

        let saved_chat_status = self.snapshot_chat_status(user_id).await;
        let settings = self.settings(user_id).await?;
        let custom_message = request
            .custom_message
            .clone()
            .or_else(|| settings.default_message.clone());

        let now = Utc::now();
        let ends_at = request.duration_minutes.map(|m| now + minutes(m));
        let record = FocusRecord {
            user_id: user_id.to_string(),
            state: FocusState::Simple {
                started_at: now,
                ends_at,
            },
            custom_message: custom_message.clone(),
            saved_chat_status,
        };
        self.store.put_focus_record(&record).await?;

        // Committed; everything below is best-effort.
        self.set_chat_status(user_id, &settings.simple_status()).await;
        self.enable_dnd(user_id, request.duration_minutes.unwrap_or(DEFAULT_DND_MINUTES))
            .await;
        self.notifier
            .publish(
                user_id,
                EventType::FocusStarted,
                json!({
                    "mode": "simple",
                    "duration_minutes": request.duration_minutes,
                    "custom_message": custom_message,
                }),
            )
            .await;
        if let Some(ends_at) = ends_at {
            if let Err(e) = self.scheduler.schedule_focus_expiration(user_id, ends_at).await {
                error!(user = user_id, error = %e, "failed to schedule focus expiration");
            }
        }

        info!(user = user_id, duration = ?request.duration_minutes, "focus mode enabled");
        Ok(FocusStatus::from_record(&record, Utc::now()))
    }

    /// Any active → OFF via user request. Idempotent: a second call sees OFF
    /// and produces no further chat effects.
    pub async fn disable(&self, user_id: &str) -> Result<FocusStatus> {
        if let Err(e) = self.scheduler.cancel_focus_expiration(user_id).await {
            warn!(user = user_id, error = %e, "failed to cancel focus expiration");
        }
        if let Err(e) = self.scheduler.cancel_pomodoro_transition(user_id).await {
            warn!(user = user_id, error = %e, "failed to cancel pomodoro transition");
        }

        let Some(record) = self.store.focus_record(user_id).await? else {
            return Ok(FocusStatus::inactive());
        };
        if !record.is_active() {
            return Ok(FocusStatus::from_record(&record, Utc::now()));
        }

        let record = self.end_session(record, EventType::FocusEnded, json!({})).await?;
        info!(user = user_id, "focus mode disabled");
        Ok(FocusStatus::from_record(&record, Utc::now()))
    }

    /// Read-only status, except that a SIMPLE session past its end time is
    /// lazily expired here. Pomodoro phase ends stay advisory until the
    /// worker or a skip fires.
    pub async fn status(&self, user_id: &str) -> Result<FocusStatus> {
        let Some(record) = self.store.focus_record(user_id).await? else {
            return Ok(FocusStatus::inactive());
        };

        if let FocusState::Simple {
            ends_at: Some(ends_at),
            ..
        } = record.state
        {
            if ends_at <= Utc::now() {
                let record = self
                    .end_session(record, EventType::FocusEnded, json!({ "reason": "expired" }))
                    .await?;
                info!(user = user_id, "focus session lazily expired on read");
                return Ok(FocusStatus::from_record(&record, Utc::now()));
            }
        }

        Ok(FocusStatus::from_record(&record, Utc::now()))
    }

    /// OFF → POMO_WORK (session 1).
    pub async fn start_pomodoro(
        &self,
        user_id: &str,
        request: StartPomodoroRequest,
    ) -> Result<FocusStatus> {
        request.validate()?;

        let saved_chat_status = self.snapshot_chat_status(user_id).await;
        let settings = self.settings(user_id).await?;
        let work_minutes = request.work_minutes.unwrap_or(settings.work_minutes);
        let break_minutes = request.break_minutes.unwrap_or(settings.break_minutes);
        let custom_message = request
            .custom_message
            .clone()
            .or_else(|| settings.default_message.clone());

        let now = Utc::now();
        let ends_at = now + minutes(work_minutes);
        let record = FocusRecord {
            user_id: user_id.to_string(),
            state: FocusState::PomodoroWork {
                started_at: now,
                ends_at,
                pomodoro: PomodoroSpec {
                    session_count: 1,
                    total_sessions: request.total_sessions,
                    work_minutes,
                    break_minutes,
                },
            },
            custom_message,
            saved_chat_status,
        };
        self.store.put_focus_record(&record).await?;

        self.set_chat_status(user_id, &settings.work_status()).await;
        self.enable_dnd(user_id, work_minutes).await;
        self.notifier
            .publish(
                user_id,
                EventType::PomodoroWorkStarted,
                json!({ "session_count": 1 }),
            )
            .await;
        if let Err(e) = self
            .scheduler
            .schedule_pomodoro_transition(user_id, ends_at)
            .await
        {
            error!(user = user_id, error = %e, "failed to schedule pomodoro transition");
        }

        info!(
            user = user_id,
            work = work_minutes,
            rest = break_minutes,
            total = ?request.total_sessions,
            "pomodoro started"
        );
        Ok(FocusStatus::from_record(&record, Utc::now()))
    }

    /// Jump to the next phase immediately, re-anchoring the timer at now.
    pub async fn skip_phase(&self, user_id: &str) -> Result<FocusStatus> {
        let record = self.store.focus_record(user_id).await?;
        let Some(record) = record.filter(|r| r.state.pomodoro().is_some()) else {
            return Err(Error::Validation("No pomodoro session active".into()));
        };

        if let Err(e) = self.scheduler.cancel_pomodoro_transition(user_id).await {
            warn!(user = user_id, error = %e, "failed to cancel pomodoro transition");
        }

        let record = self.advance_pomodoro(record).await?.0;
        Ok(FocusStatus::from_record(&record, Utc::now()))
    }

    // -------------------------------------------------------------------------
    // Worker entry points
    // -------------------------------------------------------------------------

    /// Expiration worker: self-cancelling. Runs only when the record is
    /// still active and past due; everything else is a no-op, which makes
    /// stale jobs, double fires, and the backup sweep all harmless.
    pub async fn expire(&self, user_id: &str) -> Result<bool> {
        let Some(record) = self.store.focus_record(user_id).await? else {
            return Ok(false);
        };
        if !record.is_active() {
            info!(user = user_id, "expiration fired but session already inactive");
            return Ok(false);
        }
        match record.state.ends_at() {
            Some(ends_at) if ends_at <= Utc::now() => {}
            _ => {
                info!(user = user_id, "expiration fired but session not yet due");
                return Ok(false);
            }
        }

        self.end_session(record, EventType::FocusEnded, json!({ "reason": "expired" }))
            .await?;
        info!(user = user_id, "focus session expired");
        Ok(true)
    }

    /// Transition worker: advance the pomodoro phase. No-op unless an
    /// active pomodoro exists, so cancelled-then-fired jobs do nothing.
    pub async fn transition(&self, user_id: &str) -> Result<TransitionOutcome> {
        let record = self.store.focus_record(user_id).await?;
        let Some(record) = record.filter(|r| r.state.pomodoro().is_some()) else {
            info!(user = user_id, "transition fired but no active pomodoro");
            return Ok(TransitionOutcome::Noop);
        };

        let (_, outcome) = self.advance_pomodoro(record).await?;
        Ok(outcome)
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    /// Shared advance for skip and the worker: commit the next phase (or
    /// completion), then run the phase's entry effects.
    async fn advance_pomodoro(
        &self,
        record: FocusRecord,
    ) -> Result<(FocusRecord, TransitionOutcome)> {
        let user_id = record.user_id.clone();
        let now = Utc::now();

        match advance_phase(&record.state, now) {
            Some(PhaseAdvance::Complete) => {
                let record = self
                    .end_session(record, EventType::PomodoroComplete, json!({}))
                    .await?;
                info!(user = %user_id, "pomodoro session complete");
                Ok((record, TransitionOutcome::Complete))
            }
            Some(PhaseAdvance::Next(state)) => {
                let record = FocusRecord { state, ..record };
                self.store.put_focus_record(&record).await?;

                let settings = self.settings(&user_id).await?;
                let spec = record
                    .state
                    .pomodoro()
                    .copied()
                    .unwrap_or(PomodoroSpec {
                        session_count: 1,
                        total_sessions: None,
                        work_minutes: settings.work_minutes,
                        break_minutes: settings.break_minutes,
                    });
                let (status, event) = match record.state {
                    FocusState::PomodoroWork { .. } => {
                        (settings.work_status(), EventType::PomodoroWorkStarted)
                    }
                    _ => (settings.break_status(), EventType::PomodoroBreakStarted),
                };

                self.set_chat_status(&user_id, &status).await;
                // DND window re-anchors to the work length at each phase entry.
                self.enable_dnd(&user_id, spec.work_minutes).await;
                self.notifier
                    .publish(
                        &user_id,
                        event,
                        json!({ "session_count": spec.session_count }),
                    )
                    .await;
                if let Some(ends_at) = record.state.ends_at() {
                    if let Err(e) = self
                        .scheduler
                        .schedule_pomodoro_transition(&user_id, ends_at)
                        .await
                    {
                        error!(user = %user_id, error = %e, "failed to schedule pomodoro transition");
                    }
                }

                info!(
                    user = %user_id,
                    phase = record.state.phase().unwrap_or("?"),
                    session = spec.session_count,
                    "pomodoro phase transitioned"
                );
                Ok((record, TransitionOutcome::Transitioned))
            }
            None => Ok((record, TransitionOutcome::Noop)),
        }
    }

    /// Any active → OFF: commit first, then restore the chat snapshot, end
    /// DND, and publish the terminal event.
    async fn end_session(
        &self,
        record: FocusRecord,
        event: EventType,
        payload: serde_json::Value,
    ) -> Result<FocusRecord> {
        let user_id = record.user_id.clone();
        let saved = record.saved_chat_status.clone();

        let record = FocusRecord {
            state: FocusState::Off,
            saved_chat_status: None,
            ..record
        };
        self.store.put_focus_record(&record).await?;

        self.set_chat_status(&user_id, &saved.unwrap_or_else(ChatStatus::cleared))
            .await;
        self.end_dnd(&user_id).await;
        self.notifier.publish(&user_id, event, payload).await;

        Ok(record)
    }

    async fn settings(&self, user_id: &str) -> Result<FocusSettings> {
        if let Some(settings) = self.store.focus_settings(user_id).await? {
            return Ok(settings);
        }
        let settings = FocusSettings::defaults_for(user_id);
        self.store.put_focus_settings(&settings).await?;
        Ok(settings)
    }

    /// Pre-commit snapshot of the user's chat status. Failures degrade to
    /// "clear on exit" rather than blocking the transition.
    async fn snapshot_chat_status(&self, user_id: &str) -> Option<ChatStatus> {
        match self.chat.profile(user_id).await {
            Ok(status) => status,
            Err(e) => {
                warn!(user = user_id, error = %e, "could not snapshot chat status");
                None
            }
        }
    }

    async fn set_chat_status(&self, user_id: &str, status: &ChatStatus) {
        if let Err(e) = self.chat.set_profile(user_id, status).await {
            warn!(user = user_id, error = %e, "failed to set chat status");
        }
    }

    async fn enable_dnd(&self, user_id: &str, duration_minutes: u32) {
        if let Err(e) = self.chat.set_dnd(user_id, duration_minutes).await {
            warn!(user = user_id, error = %e, "failed to enable DND");
        }
    }

    async fn end_dnd(&self, user_id: &str) {
        if let Err(e) = self.chat.end_dnd(user_id).await {
            warn!(user = user_id, error = %e, "failed to end DND");
        }
    }
}
