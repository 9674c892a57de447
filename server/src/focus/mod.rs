//! Focus state machine: validation, phase arithmetic, and the orchestrator
//! that sequences persistence, chat effects, notifications, and timers.

pub mod orchestrator;

pub use orchestrator::{FocusOrchestrator, TransitionOutcome};

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::models::{minutes, FocusState, PomodoroSpec};

pub const MAX_DURATION_MINUTES: u32 = 480;
pub const MAX_WORK_MINUTES: u32 = 120;
pub const MAX_BREAK_MINUTES: u32 = 60;
pub const MAX_TOTAL_SESSIONS: u32 = 12;

/// Fallback DND window when a simple session has no end time: the provider
/// cap of eight hours.
pub const DEFAULT_DND_MINUTES: u32 = MAX_DURATION_MINUTES;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnableFocusRequest {
    pub duration_minutes: Option<u32>,
    pub custom_message: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StartPomodoroRequest {
    pub custom_message: Option<String>,
    pub work_minutes: Option<u32>,
    pub break_minutes: Option<u32>,
    pub total_sessions: Option<u32>,
}

fn check_range(value: Option<u32>, max: u32, what: &str) -> Result<()> {
    match value {
        Some(v) if v < 1 || v > max => Err(Error::Validation(format!(
            "{} must be between 1 and {}",
            what, max
        ))),
        _ => Ok(()),
    }
}

impl EnableFocusRequest {
    pub fn validate(&self) -> Result<()> {
        check_range(self.duration_minutes, MAX_DURATION_MINUTES, "duration_minutes")
    }
}

impl StartPomodoroRequest {
    pub fn validate(&self) -> Result<()> {
        check_range(self.work_minutes, MAX_WORK_MINUTES, "work_minutes")?;
        check_range(self.break_minutes, MAX_BREAK_MINUTES, "break_minutes")?;
        check_range(self.total_sessions, MAX_TOTAL_SESSIONS, "total_sessions")
    }
}

/// Result of advancing a pomodoro past its current phase.
#[derive(Debug, Clone, PartialEq)]
pub enum PhaseAdvance {
    /// The session cap was reached; the session ends.
    Complete,
    /// The next phase, fully formed.
    Next(FocusState),
}

/// Phase arithmetic, shared by `skip_phase` and the transition worker.
/// Returns None for non-pomodoro states.
///
/// Leaving the cap-th work phase always completes the session; there is no
/// trailing break. The cap is also honored from a break, so a session capped
/// mid-break cannot start an extra work phase.
pub fn advance_phase(state: &FocusState, now: DateTime<Utc>) -> Option<PhaseAdvance> {
    match state {
        FocusState::PomodoroWork {
            started_at,
            pomodoro,
            ..
        } => {
            if at_session_cap(pomodoro) {
                return Some(PhaseAdvance::Complete);
            }
            Some(PhaseAdvance::Next(FocusState::PomodoroBreak {
                started_at: *started_at,
                ends_at: now + minutes(pomodoro.break_minutes),
                pomodoro: *pomodoro,
            }))
        }
        FocusState::PomodoroBreak {
            started_at,
            pomodoro,
            ..
        } => {
            if at_session_cap(pomodoro) {
                return Some(PhaseAdvance::Complete);
            }
            Some(PhaseAdvance::Next(FocusState::PomodoroWork {
                started_at: *started_at,
                ends_at: now + minutes(pomodoro.work_minutes),
                pomodoro: PomodoroSpec {
                    session_count: pomodoro.session_count + 1,
                    ..*pomodoro
                },
            }))
        }
        _ => None,
    }
}

fn at_session_cap(pomodoro: &PomodoroSpec) -> bool {
    matches!(pomodoro.total_sessions, Some(total) if pomodoro.session_count >= total)
}
