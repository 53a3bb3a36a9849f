//! Durable, lockable units of deferred work.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::clock::add_duration;
use crate::config::EngineConfig;
use crate::types::{ExecRef, ExecutionId, Timestamp, Variables};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobKind {
    Timer,
    AsyncContinuation,
    /// Broadcast of a signal thrown inside a committed command.
    SignalThrow,
    /// A job that failed at least once.
    Retry,
}

/// What running the job does. Kept when the kind flips to `Retry`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobHandler {
    /// Fire the timer event `activity_id` (catch event or boundary).
    TimerFire {
        activity_id: String,
        /// Remaining cycle state for repeating timers.
        cycle: Option<CycleState>,
    },
    /// Resume dispatch by executing `activity_id` on the job's execution.
    AsyncContinuation { activity_id: String },
    /// Deliver `signal` to every subscriber. Runs whether or not the
    /// throwing execution still exists.
    SignalThrow {
        activity_id: String,
        signal: String,
        variables: Variables,
    },
}

impl JobHandler {
    pub fn activity_id(&self) -> &str {
        match self {
            JobHandler::TimerFire { activity_id, .. }
            | JobHandler::AsyncContinuation { activity_id }
            | JobHandler::SignalThrow { activity_id, .. } => activity_id,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleState {
    pub interval_ms: u64,
    /// `None` repeats until the owning execution ends.
    pub remaining: Option<u32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    /// Retries exhausted; waits for an operator.
    Dead,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub execution: ExecutionId,
    pub kind: JobKind,
    pub handler: JobHandler,
    /// `None` runs as soon as possible.
    pub due_at: Option<Timestamp>,
    pub retries_remaining: u32,
    pub lock_owner: Option<String>,
    pub lock_expires_at: Option<Timestamp>,
    pub state: JobState,
    pub last_error: Option<String>,
    pub failure_count: u32,
    /// Optimistic-lock version, bumped by the store on every write.
    pub version: u64,
    pub created_at: Timestamp,
}

impl Job {
    pub fn timer(
        at: ExecRef,
        activity_id: &str,
        due_at: Timestamp,
        cycle: Option<CycleState>,
        retries: u32,
        now: Timestamp,
    ) -> Self {
        Self::new(
            at,
            JobKind::Timer,
            JobHandler::TimerFire {
                activity_id: activity_id.to_string(),
                cycle,
            },
            Some(due_at),
            retries,
            now,
        )
    }

    pub fn async_continuation(at: ExecRef, activity_id: &str, retries: u32, now: Timestamp) -> Self {
        Self::new(
            at,
            JobKind::AsyncContinuation,
            JobHandler::AsyncContinuation {
                activity_id: activity_id.to_string(),
            },
            None,
            retries,
            now,
        )
    }

    pub fn signal_throw(
        at: ExecRef,
        activity_id: &str,
        signal: &str,
        variables: Variables,
        retries: u32,
        now: Timestamp,
    ) -> Self {
        Self::new(
            at,
            JobKind::SignalThrow,
            JobHandler::SignalThrow {
                activity_id: activity_id.to_string(),
                signal: signal.to_string(),
                variables,
            },
            None,
            retries,
            now,
        )
    }

    /// Not bound to the lifetime of its execution.
    pub fn is_detached(&self) -> bool {
        matches!(self.handler, JobHandler::SignalThrow { .. })
    }

    fn new(
        at: ExecRef,
        kind: JobKind,
        handler: JobHandler,
        due_at: Option<Timestamp>,
        retries: u32,
        now: Timestamp,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            instance_id: at.instance_id,
            execution: at.execution,
            kind,
            handler,
            due_at,
            retries_remaining: retries,
            lock_owner: None,
            lock_expires_at: None,
            state: JobState::Pending,
            last_error: None,
            failure_count: 0,
            version: 0,
            created_at: now,
        }
    }

    pub fn exec_ref(&self) -> ExecRef {
        ExecRef::new(self.instance_id, self.execution)
    }

    pub fn is_due(&self, now: Timestamp) -> bool {
        self.due_at.is_none_or(|due| due <= now)
    }

    pub fn is_locked(&self, now: Timestamp) -> bool {
        self.lock_expires_at.is_some_and(|exp| exp > now)
    }

    /// Pending, due and not held by a live lock.
    pub fn is_acquirable(&self, now: Timestamp) -> bool {
        self.state == JobState::Pending && self.is_due(now) && !self.is_locked(now)
    }

    pub fn lock(&mut self, owner: &str, now: Timestamp, duration: Duration) {
        self.lock_owner = Some(owner.to_string());
        self.lock_expires_at = Some(add_duration(now, duration));
    }

    pub fn unlock(&mut self) {
        self.lock_owner = None;
        self.lock_expires_at = None;
    }

    /// Record a handler failure. Returns true when the job is now dead.
    pub fn record_failure(&mut self, error: &str, now: Timestamp, config: &EngineConfig) -> bool {
        self.failure_count += 1;
        self.last_error = Some(error.to_string());
        self.retries_remaining = self.retries_remaining.saturating_sub(1);
        self.kind = JobKind::Retry;
        self.unlock();
        if self.retries_remaining == 0 {
            self.state = JobState::Dead;
            self.due_at = None;
            true
        } else {
            self.due_at = Some(add_duration(now, backoff(self.failure_count, config)));
            false
        }
    }

    /// Operator retry of a dead job.
    pub fn revive(&mut self, retries: u32) {
        self.state = JobState::Pending;
        self.retries_remaining = retries.max(1);
        self.due_at = None;
        self.unlock();
    }
}

/// `base * 2^(failures-1)`, capped at the configured maximum.
pub fn backoff(failures: u32, config: &EngineConfig) -> Duration {
    let exp = failures.saturating_sub(1).min(32);
    let ms = config
        .retry_backoff_base_ms
        .saturating_mul(1u64 << exp)
        .min(config.retry_backoff_max_ms);
    Duration::from_millis(ms)
}

/// A job claimed by one poller.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClaimedJob {
    pub job: Job,
    pub lock_owner: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobOutcome {
    Executed,
    /// Job vanished, was re-locked or its execution is gone.
    Skipped,
    Failed { retries_remaining: u32 },
    Dead,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn job() -> Job {
        Job::async_continuation(
            ExecRef::new(Uuid::now_v7(), ExecutionId(1)),
            "charge",
            2,
            Utc::now(),
        )
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let config = EngineConfig {
            retry_backoff_base_ms: 100,
            retry_backoff_max_ms: 350,
            ..EngineConfig::default()
        };
        assert_eq!(backoff(1, &config), Duration::from_millis(100));
        assert_eq!(backoff(2, &config), Duration::from_millis(200));
        assert_eq!(backoff(3, &config), Duration::from_millis(350));
        assert_eq!(backoff(60, &config), Duration::from_millis(350));
    }

    #[test]
    fn test_failure_path_to_dead() {
        let config = EngineConfig::default();
        let now = Utc::now();
        let mut j = job();
        j.lock("w1", now, Duration::from_secs(30));
        assert!(j.is_locked(now));

        assert!(!j.record_failure("boom", now, &config));
        assert_eq!(j.kind, JobKind::Retry);
        assert_eq!(j.retries_remaining, 1);
        assert!(!j.is_locked(now));
        assert!(!j.is_due(now));

        assert!(j.record_failure("boom again", now, &config));
        assert_eq!(j.state, JobState::Dead);
        assert!(!j.is_acquirable(now));

        j.revive(3);
        assert!(j.is_acquirable(now));
        assert_eq!(j.handler.activity_id(), "charge");
    }

    #[test]
    fn test_expired_lock_is_acquirable() {
        let now = Utc::now();
        let mut j = job();
        j.lock("w1", now, Duration::from_millis(10));
        assert!(!j.is_acquirable(now));
        assert!(j.is_acquirable(now + chrono::Duration::milliseconds(11)));
    }
}
