//! Persistent keyed-timer service.
//!
//! Jobs are plain rows; a poll loop claims due ones and runs them against
//! the state machine with a bounded worker pool. Delivery is at-least-once:
//! workers self-check state, so double fires and stale fires are no-ops.
//!
//! Job IDs are unique per schedule (`<purpose>_<user>_<nonce>`), which makes
//! `schedule` a pure insert. Cancellation differs by purpose:
//! - focus expiration self-cancels: the worker re-reads the record and does
//!   nothing unless it is still active and past due;
//! - pomodoro transitions keep a sidecar KV pointer to the current job so
//!   the queue entry can be removed eagerly on skip or disable.

use chrono::{DateTime, Timelike, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::focus::FocusOrchestrator;
use crate::models::{DeferredJob, JobFunction};
use crate::store::Store;

pub const MAX_CONCURRENT_JOBS: usize = 10;
pub const JOB_TIMEOUT: Duration = Duration::from_secs(300);
const POLL_INTERVAL: Duration = Duration::from_secs(1);
const SIDECAR_TTL: Duration = Duration::from_secs(24 * 3600);

fn job_nonce() -> String {
    format!("{:08x}", rand::random::<u32>())
}

fn pomodoro_job_key(user_id: &str) -> String {
    format!("pomodoro_job:{}", user_id)
}

pub struct Scheduler {
    store: Arc<dyn Store>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Insert a deferred job. `fire_at` in the past fires on the next poll.
    pub async fn schedule(&self, job: DeferredJob) -> Result<()> {
        self.store
            .insert_job(&job)
            .await
            .map_err(|e| Error::SchedulerUnavailable(e.to_string()))
    }

    /// Remove a pending job; `false` if it already fired or never existed.
    /// A job mid-fire still runs to completion.
    pub async fn cancel(&self, job_id: &str) -> Result<bool> {
        self.store
            .remove_job(job_id)
            .await
            .map_err(|e| Error::SchedulerUnavailable(e.to_string()))
    }

    pub async fn schedule_focus_expiration(
        &self,
        user_id: &str,
        fire_at: DateTime<Utc>,
    ) -> Result<String> {
        let job_id = format!("focus_expire_{}_{}", user_id, job_nonce());
        self.schedule(DeferredJob {
            job_id: job_id.clone(),
            fire_at,
            function: JobFunction::ExpireFocusSession,
            argument: user_id.to_string(),
        })
        .await?;
        info!(user = user_id, job = %job_id, fire_at = %fire_at, "scheduled focus expiration");
        Ok(job_id)
    }

    /// Expiration jobs self-cancel on fire; there is nothing to remove here.
    pub async fn cancel_focus_expiration(&self, user_id: &str) -> Result<bool> {
        debug!(
            user = user_id,
            "focus expiration will self-cancel when it fires"
        );
        Ok(true)
    }

    /// Schedule the next phase transition, replacing any tracked
    /// predecessor, and point the sidecar at the new job.
    pub async fn schedule_pomodoro_transition(
        &self,
        user_id: &str,
        fire_at: DateTime<Utc>,
    ) -> Result<String> {
        self.cancel_pomodoro_transition(user_id).await?;

        let job_id = format!("pomodoro_transition_{}_{}", user_id, job_nonce());
        self.schedule(DeferredJob {
            job_id: job_id.clone(),
            fire_at,
            function: JobFunction::TransitionPomodoro,
            argument: user_id.to_string(),
        })
        .await?;
        self.store
            .kv_put(&pomodoro_job_key(user_id), &job_id, SIDECAR_TTL)
            .await
            .map_err(|e| Error::SchedulerUnavailable(e.to_string()))?;
        info!(user = user_id, job = %job_id, fire_at = %fire_at, "scheduled pomodoro transition");
        Ok(job_id)
    }

    /// Remove the tracked transition job, if any. Succeeds when there is
    /// nothing to cancel.
    pub async fn cancel_pomodoro_transition(&self, user_id: &str) -> Result<bool> {
        let key = pomodoro_job_key(user_id);
        let job_id = self
            .store
            .kv_get(&key)
            .await
            .map_err(|e| Error::SchedulerUnavailable(e.to_string()))?;
        let Some(job_id) = job_id else {
            debug!(user = user_id, "no pomodoro transition to cancel");
            return Ok(true);
        };

        let removed = self
            .store
            .remove_job(&job_id)
            .await
            .map_err(|e| Error::SchedulerUnavailable(e.to_string()))?;
        self.store
            .kv_delete(&key)
            .await
            .map_err(|e| Error::SchedulerUnavailable(e.to_string()))?;

        if removed {
            info!(user = user_id, job = %job_id, "cancelled pomodoro transition");
        } else {
            debug!(user = user_id, job = %job_id, "pomodoro transition already fired");
        }
        Ok(true)
    }
}

// =============================================================================
// Worker loop
// =============================================================================

async fn dispatch(orchestrator: &FocusOrchestrator, job: &DeferredJob) -> Result<()> {
    match job.function {
        JobFunction::ExpireFocusSession => {
            orchestrator.expire(&job.argument).await.map(|_| ())
        }
        JobFunction::TransitionPomodoro => {
            orchestrator.transition(&job.argument).await.map(|_| ())
        }
    }
}

/// Poll loop claiming due jobs and running them with a bounded pool and a
/// hard per-job deadline. Failures are logged, never retried; the state
/// machine self-heals on the next interaction or sweep.
pub async fn run_job_worker(store: Arc<dyn Store>, orchestrator: Arc<FocusOrchestrator>) {
    let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_JOBS));
    let mut ticker = interval(POLL_INTERVAL);

    info!(
        max_concurrent = MAX_CONCURRENT_JOBS,
        "starting deferred job worker"
    );

    loop {
        ticker.tick().await;

        let available = semaphore.available_permits();
        if available == 0 {
            continue;
        }

        let jobs = match store.claim_due_jobs(Utc::now(), available as i64).await {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(error = %e, "failed to claim due jobs");
                continue;
            }
        };

        for job in jobs {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return, // semaphore closed, worker shutting down
            };
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move {
                let _permit = permit;
                match tokio::time::timeout(JOB_TIMEOUT, dispatch(&orchestrator, &job)).await {
                    Ok(Ok(())) => {
                        metrics::counter!("scheduler_jobs_total", 1, "outcome" => "ok");
                        debug!(job = %job.job_id, "job completed");
                    }
                    Ok(Err(e)) => {
                        metrics::counter!("scheduler_jobs_total", 1, "outcome" => "error");
                        error!(job = %job.job_id, error = %e, "job failed");
                    }
                    Err(_) => {
                        metrics::counter!("scheduler_jobs_total", 1, "outcome" => "timeout");
                        error!(job = %job.job_id, timeout_secs = JOB_TIMEOUT.as_secs(), "job timed out");
                    }
                }
            });
        }
    }
}

/// Seconds until the next quarter-hour boundary (:00, :15, :30, :45).
fn until_next_quarter_hour(now: DateTime<Utc>) -> Duration {
    let seconds_into_slot = u64::from(now.minute() % 15) * 60 + u64::from(now.second());
    Duration::from_secs(15 * 60 - seconds_into_slot)
}

/// Backup sweep: every quarter hour, expire all active focus records whose
/// phase end has passed. Idempotent with the per-job path because the
/// expiration worker self-checks state.
pub async fn run_backup_sweep(store: Arc<dyn Store>, orchestrator: Arc<FocusOrchestrator>) {
    info!("starting focus expiration backup sweep (quarter-hourly)");

    loop {
        tokio::time::sleep(until_next_quarter_hour(Utc::now())).await;

        let expired = match store.active_expired_focus(Utc::now()).await {
            Ok(expired) => expired,
            Err(e) => {
                error!(error = %e, "backup sweep query failed");
                continue;
            }
        };
        if expired.is_empty() {
            debug!("backup sweep found nothing to expire");
            continue;
        }

        info!(count = expired.len(), "backup sweep expiring stale sessions");
        for record in expired {
            if let Err(e) = orchestrator.expire(&record.user_id).await {
                warn!(user = %record.user_id, error = %e, "backup sweep expiration failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::TimeZone;

    fn scheduler() -> (Arc<MemoryStore>, Scheduler) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), Scheduler::new(store))
    }

    #[tokio::test]
    async fn focus_expiration_ids_are_unique_per_schedule() {
        let (_, scheduler) = scheduler();
        let at = Utc::now() + chrono::Duration::minutes(30);

        let a = scheduler.schedule_focus_expiration("u1", at).await.unwrap();
        let b = scheduler.schedule_focus_expiration("u1", at).await.unwrap();

        assert!(a.starts_with("focus_expire_u1_"));
        assert!(b.starts_with("focus_expire_u1_"));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn pomodoro_reschedule_replaces_tracked_job() {
        let (store, scheduler) = scheduler();
        let at = Utc::now() + chrono::Duration::minutes(25);

        let first = scheduler
            .schedule_pomodoro_transition("u1", at)
            .await
            .unwrap();
        let second = scheduler
            .schedule_pomodoro_transition("u1", at)
            .await
            .unwrap();
        assert_ne!(first, second);

        // The first job is out of the queue; only the second remains due.
        let claimed = store
            .claim_due_jobs(at + chrono::Duration::minutes(1), 10)
            .await
            .unwrap();
        let ids: Vec<_> = claimed.iter().map(|j| j.job_id.clone()).collect();
        assert_eq!(ids, vec![second.clone()]);

        // Sidecar points at the second job.
        assert_eq!(
            store.kv_get(&pomodoro_job_key("u1")).await.unwrap(),
            Some(second)
        );
    }

    #[tokio::test]
    async fn cancel_pomodoro_removes_job_and_sidecar() {
        let (store, scheduler) = scheduler();
        let at = Utc::now() + chrono::Duration::minutes(25);

        let job_id = scheduler
            .schedule_pomodoro_transition("u1", at)
            .await
            .unwrap();
        assert!(scheduler.cancel_pomodoro_transition("u1").await.unwrap());

        assert!(!store.remove_job(&job_id).await.unwrap());
        assert_eq!(store.kv_get(&pomodoro_job_key("u1")).await.unwrap(), None);

        // Cancelling again with nothing tracked still succeeds.
        assert!(scheduler.cancel_pomodoro_transition("u1").await.unwrap());
    }

    #[tokio::test]
    async fn cancel_unknown_job_reports_not_removed() {
        let (_, scheduler) = scheduler();
        assert!(!scheduler.cancel("focus_expire_u1_deadbeef").await.unwrap());
    }

    #[test]
    fn quarter_hour_boundary_math() {
        let at_07_30 = Utc.with_ymd_and_hms(2025, 6, 1, 10, 7, 30).unwrap();
        assert_eq!(
            until_next_quarter_hour(at_07_30),
            Duration::from_secs(7 * 60 + 30)
        );

        let at_boundary = Utc.with_ymd_and_hms(2025, 6, 1, 10, 15, 0).unwrap();
        assert_eq!(
            until_next_quarter_hour(at_boundary),
            Duration::from_secs(15 * 60)
        );

        let at_59_59 = Utc.with_ymd_and_hms(2025, 6, 1, 10, 59, 59).unwrap();
        assert_eq!(until_next_quarter_hour(at_59_59), Duration::from_secs(1));
    }
}
