//! End-to-end focus state machine scenarios over the in-memory store and a
//! recording chat provider.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use valet_server::chat::ChatProvider;
use valet_server::error::{Error, Result};
use valet_server::focus::{
    EnableFocusRequest, FocusOrchestrator, StartPomodoroRequest, TransitionOutcome,
};
use valet_server::models::{ChatStatus, EventType, FocusRecord, FocusState};
use valet_server::notify::{Notifier, OutboundEvent, SseRegistry};
use valet_server::scheduler::{run_job_worker, Scheduler};
use valet_server::store::{MemoryStore, Store};

// =============================================================================
// Test doubles
// =============================================================================

/// Chat provider that records every call and serves a configurable profile.
#[derive(Default)]
struct RecordingChat {
    profile: Mutex<Option<ChatStatus>>,
    set_statuses: Mutex<Vec<ChatStatus>>,
    dnd_windows: Mutex<Vec<u32>>,
    dnd_ends: AtomicUsize,
    fail_profile_ops: AtomicUsize,
}

impl RecordingChat {
    fn with_profile(status: ChatStatus) -> Self {
        Self {
            profile: Mutex::new(Some(status)),
            ..Default::default()
        }
    }

    fn statuses(&self) -> Vec<ChatStatus> {
        self.set_statuses.lock().unwrap().clone()
    }

    fn last_status(&self) -> Option<ChatStatus> {
        self.statuses().last().cloned()
    }

    fn dnd_windows(&self) -> Vec<u32> {
        self.dnd_windows.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatProvider for RecordingChat {
    async fn profile(&self, _user_id: &str) -> Result<Option<ChatStatus>> {
        Ok(self.profile.lock().unwrap().clone())
    }

    async fn set_profile(&self, _user_id: &str, status: &ChatStatus) -> Result<bool> {
        if self.fail_profile_ops.load(Ordering::SeqCst) > 0 {
            self.fail_profile_ops.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::ProviderRejected("users.profile.set: fatal_error".into()));
        }
        self.set_statuses.lock().unwrap().push(status.clone());
        Ok(true)
    }

    async fn set_dnd(&self, _user_id: &str, duration_minutes: u32) -> Result<bool> {
        self.dnd_windows.lock().unwrap().push(duration_minutes);
        Ok(true)
    }

    async fn end_dnd(&self, _user_id: &str) -> Result<bool> {
        self.dnd_ends.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }
}

struct Rig {
    store: Arc<MemoryStore>,
    chat: Arc<RecordingChat>,
    registry: Arc<SseRegistry>,
    scheduler: Arc<Scheduler>,
    orchestrator: Arc<FocusOrchestrator>,
}

fn rig_with_chat(chat: RecordingChat) -> Rig {
    let store = Arc::new(MemoryStore::new());
    let store_dyn: Arc<dyn Store> = store.clone();
    let chat = Arc::new(chat);
    let registry = Arc::new(SseRegistry::new(64));
    let notifier = Arc::new(Notifier::new(registry.clone(), store_dyn.clone()));
    let scheduler = Arc::new(Scheduler::new(store_dyn.clone()));
    let orchestrator = Arc::new(FocusOrchestrator::new(
        store_dyn,
        chat.clone(),
        notifier,
        scheduler.clone(),
    ));
    Rig {
        store,
        chat,
        registry,
        scheduler,
        orchestrator,
    }
}

fn rig() -> Rig {
    rig_with_chat(RecordingChat::default())
}

fn drain_events(rx: &mut mpsc::Receiver<OutboundEvent>) -> Vec<EventType> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event.event_type);
    }
    events
}

fn assert_close(actual: chrono::DateTime<Utc>, expected: chrono::DateTime<Utc>) {
    let drift = (actual - expected).num_seconds().abs();
    assert!(drift <= 2, "timestamp drift {}s: {} vs {}", drift, actual, expected);
}

const USER: &str = "user-1";

// =============================================================================
// Simple sessions
// =============================================================================

#[tokio::test]
async fn enable_sets_status_dnd_event_and_expiry_job() {
    let rig = rig_with_chat(RecordingChat::with_profile(ChatStatus::new(
        "Lunch", ":sandwich:",
    )));
    let (_guard, mut rx) = rig.registry.register(USER);

    let status = rig
        .orchestrator
        .enable(
            USER,
            EnableFocusRequest {
                duration_minutes: Some(30),
                custom_message: Some("heads down".into()),
            },
        )
        .await
        .unwrap();

    assert!(status.is_active);
    assert_eq!(status.mode.as_deref(), Some("simple"));
    assert_eq!(status.custom_message.as_deref(), Some("heads down"));
    assert_close(status.ends_at.unwrap(), Utc::now() + ChronoDuration::minutes(30));

    // Chat provider shows the focus status, DND covers the session length.
    assert_eq!(rig.chat.last_status().unwrap().emoji, ":no_bell:");
    assert_eq!(rig.chat.dnd_windows(), vec![30]);

    // The pre-session status is snapshotted for restore.
    let record = rig.store.focus_record(USER).await.unwrap().unwrap();
    assert_eq!(record.saved_chat_status.as_ref().unwrap().text, "Lunch");

    assert_eq!(drain_events(&mut rx), vec![EventType::FocusStarted]);

    // An expiration job is queued at the session end.
    let jobs = rig
        .store
        .claim_due_jobs(Utc::now() + ChronoDuration::minutes(31), 10)
        .await
        .unwrap();
    assert_eq!(jobs.len(), 1);
    assert!(jobs[0].job_id.starts_with("focus_expire_user-1_"));
    assert_eq!(jobs[0].argument, USER);
}

#[tokio::test]
async fn enable_without_duration_is_open_ended_with_max_dnd() {
    let rig = rig();

    let status = rig
        .orchestrator
        .enable(USER, EnableFocusRequest::default())
        .await
        .unwrap();

    assert!(status.is_active);
    assert_eq!(status.ends_at, None);
    // DND falls back to the provider cap when the session has no end.
    assert_eq!(rig.chat.dnd_windows(), vec![480]);

    // No expiration job without an end time.
    let jobs = rig
        .store
        .claim_due_jobs(Utc::now() + ChronoDuration::hours(24), 10)
        .await
        .unwrap();
    assert!(jobs.is_empty());
}

#[tokio::test]
async fn disable_restores_snapshot_and_is_idempotent() {
    let rig = rig_with_chat(RecordingChat::with_profile(ChatStatus::new(
        "OOO", ":palm_tree:",
    )));
    let (_guard, mut rx) = rig.registry.register(USER);

    rig.orchestrator
        .enable(
            USER,
            EnableFocusRequest {
                duration_minutes: Some(30),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let status = rig.orchestrator.disable(USER).await.unwrap();
    assert!(!status.is_active);

    // Status restored to the snapshot, DND ended.
    assert_eq!(rig.chat.last_status().unwrap().text, "OOO");
    assert_eq!(rig.chat.dnd_ends.load(Ordering::SeqCst), 1);

    // Off-state invariants: no timestamps, no snapshot.
    let record = rig.store.focus_record(USER).await.unwrap().unwrap();
    assert_eq!(record.state, FocusState::Off);
    assert_eq!(record.saved_chat_status, None);

    let events = drain_events(&mut rx);
    assert_eq!(
        events,
        vec![EventType::FocusStarted, EventType::FocusEnded]
    );

    // Second disable: no new chat effects, no new events.
    let chat_calls_before = rig.chat.statuses().len();
    let status = rig.orchestrator.disable(USER).await.unwrap();
    assert!(!status.is_active);
    assert_eq!(rig.chat.statuses().len(), chat_calls_before);
    assert_eq!(rig.chat.dnd_ends.load(Ordering::SeqCst), 1);
    assert!(drain_events(&mut rx).is_empty());
}

#[tokio::test]
async fn disable_without_snapshot_clears_status() {
    let rig = rig(); // profile() returns None: nothing to restore

    rig.orchestrator
        .enable(USER, EnableFocusRequest::default())
        .await
        .unwrap();
    rig.orchestrator.disable(USER).await.unwrap();

    let last = rig.chat.last_status().unwrap();
    assert_eq!(last.text, "");
    assert_eq!(last.emoji, "");
}

#[tokio::test]
async fn status_lazily_expires_simple_sessions_only() {
    let rig = rig();
    let (_guard, mut rx) = rig.registry.register(USER);

    // An active record already past its end, as if the expire job was lost.
    let now = Utc::now();
    rig.store
        .put_focus_record(&FocusRecord {
            user_id: USER.into(),
            state: FocusState::Simple {
                started_at: now - ChronoDuration::minutes(45),
                ends_at: Some(now - ChronoDuration::minutes(15)),
            },
            custom_message: None,
            saved_chat_status: Some(ChatStatus::new("Old", ":zzz:")),
        })
        .await
        .unwrap();

    let status = rig.orchestrator.status(USER).await.unwrap();
    assert!(!status.is_active);
    assert_eq!(rig.chat.last_status().unwrap().text, "Old");
    assert_eq!(drain_events(&mut rx), vec![EventType::FocusEnded]);
}

#[tokio::test]
async fn status_does_not_expire_pomodoro_phases() {
    let rig = rig();

    rig.orchestrator
        .start_pomodoro(USER, StartPomodoroRequest::default())
        .await
        .unwrap();

    // Push the phase end into the past; a read must not transition it.
    let mut record = rig.store.focus_record(USER).await.unwrap().unwrap();
    if let FocusState::PomodoroWork { ends_at, .. } = &mut record.state {
        *ends_at = Utc::now() - ChronoDuration::minutes(1);
    }
    rig.store.put_focus_record(&record).await.unwrap();

    let status = rig.orchestrator.status(USER).await.unwrap();
    assert!(status.is_active);
    assert_eq!(status.phase.as_deref(), Some("work"));
    assert_eq!(status.time_remaining_seconds, Some(0));
}

#[tokio::test]
async fn validation_rejects_before_any_state_change() {
    let rig = rig();

    let result = rig
        .orchestrator
        .enable(
            USER,
            EnableFocusRequest {
                duration_minutes: Some(481),
                ..Default::default()
            },
        )
        .await;
    assert!(matches!(result, Err(Error::Validation(_))));

    // Nothing was persisted and no chat call happened.
    assert!(rig.store.focus_record(USER).await.unwrap().is_none());
    assert!(rig.chat.statuses().is_empty());

    let result = rig
        .orchestrator
        .start_pomodoro(
            USER,
            StartPomodoroRequest {
                total_sessions: Some(0),
                ..Default::default()
            },
        )
        .await;
    assert!(matches!(result, Err(Error::Validation(_))));

    let result = rig.orchestrator.skip_phase(USER).await;
    assert!(matches!(result, Err(Error::Validation(_))));
}

#[tokio::test]
async fn chat_provider_failure_does_not_abort_the_transition() {
    let chat = RecordingChat::default();
    chat.fail_profile_ops.store(1, Ordering::SeqCst);
    let rig = rig_with_chat(chat);

    let status = rig
        .orchestrator
        .enable(
            USER,
            EnableFocusRequest {
                duration_minutes: Some(30),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // The commit happened even though the chat status call failed.
    assert!(status.is_active);
    let record = rig.store.focus_record(USER).await.unwrap().unwrap();
    assert!(record.is_active());
}

// =============================================================================
// Expiration worker
// =============================================================================

#[tokio::test]
async fn expire_worker_self_cancels_until_due() {
    let rig = rig();

    rig.orchestrator
        .enable(
            USER,
            EnableFocusRequest {
                duration_minutes: Some(30),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // Fired early (e.g. after a disable+re-enable rescheduled): no-op.
    assert!(!rig.orchestrator.expire(USER).await.unwrap());
    assert!(rig.store.focus_record(USER).await.unwrap().unwrap().is_active());

    // Past due: expires.
    let mut record = rig.store.focus_record(USER).await.unwrap().unwrap();
    if let FocusState::Simple { ends_at, .. } = &mut record.state {
        *ends_at = Some(Utc::now() - ChronoDuration::seconds(5));
    }
    rig.store.put_focus_record(&record).await.unwrap();
    assert!(rig.orchestrator.expire(USER).await.unwrap());

    // Firing again on an inactive record is a no-op.
    assert!(!rig.orchestrator.expire(USER).await.unwrap());
    assert!(!rig.orchestrator.expire("never-seen").await.unwrap());
}

#[tokio::test]
async fn expired_session_emits_focus_ended_with_reason() {
    let rig = rig();
    let (_guard, mut rx) = rig.registry.register(USER);

    let now = Utc::now();
    rig.store
        .put_focus_record(&FocusRecord {
            user_id: USER.into(),
            state: FocusState::Simple {
                started_at: now - ChronoDuration::minutes(31),
                ends_at: Some(now - ChronoDuration::minutes(1)),
            },
            custom_message: None,
            saved_chat_status: None,
        })
        .await
        .unwrap();

    rig.orchestrator.expire(USER).await.unwrap();

    let event = rx.try_recv().unwrap();
    assert_eq!(event.event_type, EventType::FocusEnded);
    assert_eq!(event.sse_json()["reason"], "expired");
}

#[tokio::test(flavor = "multi_thread")]
async fn worker_loop_fires_scheduled_expiration() {
    let rig = rig();
    let store_dyn: Arc<dyn Store> = rig.store.clone();
    tokio::spawn(run_job_worker(store_dyn, rig.orchestrator.clone()));

    rig.orchestrator
        .enable(
            USER,
            EnableFocusRequest {
                duration_minutes: Some(30),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // Simulate the session end arriving: backdate the record and schedule
    // the expiration for "now".
    let mut record = rig.store.focus_record(USER).await.unwrap().unwrap();
    if let FocusState::Simple { ends_at, .. } = &mut record.state {
        *ends_at = Some(Utc::now() - ChronoDuration::seconds(1));
    }
    rig.store.put_focus_record(&record).await.unwrap();
    rig.scheduler
        .schedule_focus_expiration(USER, Utc::now())
        .await
        .unwrap();

    // The poll loop runs every second; give it two ticks.
    tokio::time::sleep(std::time::Duration::from_millis(2500)).await;

    let record = rig.store.focus_record(USER).await.unwrap().unwrap();
    assert_eq!(record.state, FocusState::Off);
}

// =============================================================================
// Pomodoro
// =============================================================================

#[tokio::test]
async fn pomodoro_runs_to_cap_without_trailing_break() {
    let rig = rig();
    let (_guard, mut rx) = rig.registry.register(USER);

    let status = rig
        .orchestrator
        .start_pomodoro(
            USER,
            StartPomodoroRequest {
                work_minutes: Some(25),
                break_minutes: Some(5),
                total_sessions: Some(2),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(status.phase.as_deref(), Some("work"));
    assert_eq!(status.session_count, Some(1));
    assert_close(status.ends_at.unwrap(), Utc::now() + ChronoDuration::minutes(25));

    // WORK#1 -> BREAK
    assert_eq!(
        rig.orchestrator.transition(USER).await.unwrap(),
        TransitionOutcome::Transitioned
    );
    let record = rig.store.focus_record(USER).await.unwrap().unwrap();
    assert_eq!(record.state.phase(), Some("break"));
    assert_close(
        record.state.ends_at().unwrap(),
        Utc::now() + ChronoDuration::minutes(5),
    );

    // BREAK -> WORK#2
    assert_eq!(
        rig.orchestrator.transition(USER).await.unwrap(),
        TransitionOutcome::Transitioned
    );
    let record = rig.store.focus_record(USER).await.unwrap().unwrap();
    assert_eq!(record.state.phase(), Some("work"));
    assert_eq!(record.state.pomodoro().unwrap().session_count, 2);

    // WORK#2 was the last session: straight to OFF, no break.
    assert_eq!(
        rig.orchestrator.transition(USER).await.unwrap(),
        TransitionOutcome::Complete
    );
    let record = rig.store.focus_record(USER).await.unwrap().unwrap();
    assert_eq!(record.state, FocusState::Off);

    assert_eq!(
        drain_events(&mut rx),
        vec![
            EventType::PomodoroWorkStarted,
            EventType::PomodoroBreakStarted,
            EventType::PomodoroWorkStarted,
            EventType::PomodoroComplete,
        ]
    );

    // A fire after completion is a no-op.
    assert_eq!(
        rig.orchestrator.transition(USER).await.unwrap(),
        TransitionOutcome::Noop
    );
}

#[tokio::test]
async fn skip_reanchors_the_phase_clock_at_now() {
    let rig = rig();
    let (_guard, mut rx) = rig.registry.register(USER);

    rig.orchestrator
        .start_pomodoro(
            USER,
            StartPomodoroRequest {
                work_minutes: Some(25),
                break_minutes: Some(5),
                total_sessions: Some(3),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // Skip ten (virtual) minutes in: the break starts now, not at minute 25.
    let status = rig.orchestrator.skip_phase(USER).await.unwrap();
    assert_eq!(status.phase.as_deref(), Some("break"));
    assert_close(status.ends_at.unwrap(), Utc::now() + ChronoDuration::minutes(5));

    assert_eq!(
        drain_events(&mut rx),
        vec![
            EventType::PomodoroWorkStarted,
            EventType::PomodoroBreakStarted,
        ]
    );

    // The next transition job targets the re-anchored break end.
    let jobs = rig
        .store
        .claim_due_jobs(Utc::now() + ChronoDuration::minutes(6), 10)
        .await
        .unwrap();
    assert_eq!(jobs.len(), 1);
    assert!(jobs[0].job_id.starts_with("pomodoro_transition_"));
    assert_close(jobs[0].fire_at, Utc::now() + ChronoDuration::minutes(5));
}

#[tokio::test]
async fn pomodoro_defaults_come_from_settings() {
    let rig = rig();

    let status = rig
        .orchestrator
        .start_pomodoro(USER, StartPomodoroRequest::default())
        .await
        .unwrap();

    assert_eq!(status.work_minutes, Some(25));
    assert_eq!(status.break_minutes, Some(5));
    assert_eq!(status.total_sessions, None);
    // Work-phase DND window.
    assert_eq!(rig.chat.dnd_windows(), vec![25]);
}

#[tokio::test]
async fn cancelled_transition_job_never_fires() {
    let rig = rig();

    rig.orchestrator
        .start_pomodoro(USER, StartPomodoroRequest::default())
        .await
        .unwrap();
    rig.scheduler.cancel_pomodoro_transition(USER).await.unwrap();

    // Nothing left in the queue even far in the future.
    let jobs = rig
        .store
        .claim_due_jobs(Utc::now() + ChronoDuration::hours(5), 10)
        .await
        .unwrap();
    assert!(jobs.is_empty());
}

#[tokio::test]
async fn disable_ends_a_running_pomodoro() {
    let rig = rig();
    let (_guard, mut rx) = rig.registry.register(USER);

    rig.orchestrator
        .start_pomodoro(USER, StartPomodoroRequest::default())
        .await
        .unwrap();
    let status = rig.orchestrator.disable(USER).await.unwrap();
    assert!(!status.is_active);

    // The pending transition was cancelled with its sidecar.
    let jobs = rig
        .store
        .claim_due_jobs(Utc::now() + ChronoDuration::hours(5), 10)
        .await
        .unwrap();
    assert!(jobs.is_empty());

    assert_eq!(
        drain_events(&mut rx),
        vec![EventType::PomodoroWorkStarted, EventType::FocusEnded]
    );
}

// =============================================================================
// Concurrency
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_enables_leave_one_consistent_record() {
    let rig = rig();
    let (_guard, mut rx) = rig.registry.register(USER);

    let a = {
        let orchestrator = rig.orchestrator.clone();
        tokio::spawn(async move {
            orchestrator
                .enable(
                    USER,
                    EnableFocusRequest {
                        duration_minutes: Some(30),
                        ..Default::default()
                    },
                )
                .await
        })
    };
    let b = {
        let orchestrator = rig.orchestrator.clone();
        tokio::spawn(async move {
            orchestrator
                .enable(
                    USER,
                    EnableFocusRequest {
                        duration_minutes: Some(30),
                        ..Default::default()
                    },
                )
                .await
        })
    };
    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();

    // Exactly one record, internally consistent: whoever committed second
    // owns both timestamps.
    let record = rig.store.focus_record(USER).await.unwrap().unwrap();
    match record.state {
        FocusState::Simple {
            started_at,
            ends_at: Some(ends_at),
        } => {
            assert_eq!((ends_at - started_at).num_minutes(), 30);
        }
        other => panic!("unexpected state: {:?}", other),
    }

    // At-least-once: both enables published.
    let events = drain_events(&mut rx);
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|e| *e == EventType::FocusStarted));
}
