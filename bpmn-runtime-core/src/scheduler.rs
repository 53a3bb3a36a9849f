//! Job scheduler and the background worker loop.
//!
//! Claiming is a compare-and-set on the job's version: a poller locks a due
//! job by writing it back with its lock owner and expiry against the
//! version it read. Exactly one of several racing pollers wins; a crashed
//! worker's lock simply expires. Execution re-checks that version inside
//! the command, so a job re-claimed by someone else is skipped rather than
//! run twice.

use tokio::sync::watch;

use crate::engine::ProcessEngine;
use crate::error::{EngineError, EngineResult};
use crate::events::EngineEvent;
use crate::job::{ClaimedJob, Job, JobOutcome};

pub struct JobScheduler {
    engine: ProcessEngine,
    worker_id: String,
}

impl JobScheduler {
    pub fn new(engine: ProcessEngine) -> Self {
        let worker_id = engine.config().worker_id.clone();
        Self { engine, worker_id }
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Lock up to `limit` due jobs, earliest due first.
    pub async fn poll(&self, limit: usize) -> EngineResult<Vec<ClaimedJob>> {
        let core = self.engine.core();
        let now = self.engine.now();
        let candidates = core.store.find_acquirable_jobs(now, limit).await?;

        let mut claimed = Vec::with_capacity(candidates.len());
        for mut job in candidates {
            let expected = job.version;
            job.lock(&self.worker_id, now, core.config.lock_duration());
            if core.store.update_job(&job, expected).await? {
                job.version = expected + 1;
                tracing::debug!(job_id = %job.id, worker = %self.worker_id, "job claimed");
                claimed.push(ClaimedJob {
                    job,
                    lock_owner: self.worker_id.clone(),
                });
            } else {
                tracing::debug!(job_id = %job.id, worker = %self.worker_id, "job claimed by another poller");
            }
        }
        Ok(claimed)
    }

    /// Run a claimed job; handler failures go through retry/backoff.
    pub async fn execute(&self, claimed: &ClaimedJob) -> EngineResult<JobOutcome> {
        if claimed.job.lock_owner.as_deref() != Some(claimed.lock_owner.as_str()) {
            return Err(EngineError::IllegalState(format!(
                "job {} is not locked by {}",
                claimed.job.id, claimed.lock_owner
            )));
        }
        self.run(&claimed.job, 0).await
    }

    /// Run a job by its current stored version, without polling for it.
    /// `depth` is non-zero for signal throws run inline after a command.
    pub(crate) async fn execute_unclaimed(&self, job: Job, depth: u32) -> EngineResult<JobOutcome> {
        self.run(&job, depth).await
    }

    async fn run(&self, job: &Job, depth: u32) -> EngineResult<JobOutcome> {
        match self.engine.run_job(job, depth).await {
            Ok(outcome) => {
                tracing::debug!(job_id = %job.id, ?outcome, "job finished");
                Ok(outcome)
            }
            Err(e) => self.on_failure(job, &e).await,
        }
    }

    /// The command rolled back; record the failure on the job itself.
    async fn on_failure(&self, job: &Job, error: &EngineError) -> EngineResult<JobOutcome> {
        let core = self.engine.core();
        let Some(mut current) = core.store.load_job(job.id).await? else {
            return Ok(JobOutcome::Skipped);
        };
        if current.version != job.version {
            tracing::debug!(job_id = %job.id, "job changed while failing; leaving it to its new owner");
            return Ok(JobOutcome::Skipped);
        }

        let message = error.to_string();
        let dead = current.record_failure(&message, self.engine.now(), &core.config);
        if !core.store.update_job(&current, job.version).await? {
            return Ok(JobOutcome::Skipped);
        }

        let (event, outcome) = if dead {
            tracing::error!(
                job_id = %job.id,
                instance_id = %job.instance_id,
                failures = current.failure_count,
                error = %message,
                "job exhausted its retries and is dead"
            );
            (
                EngineEvent::JobDead {
                    job_id: job.id,
                    instance_id: job.instance_id,
                    error: message,
                },
                JobOutcome::Dead,
            )
        } else {
            tracing::warn!(
                job_id = %job.id,
                instance_id = %job.instance_id,
                retries_remaining = current.retries_remaining,
                due_at = ?current.due_at,
                error = %message,
                "job failed; retry scheduled"
            );
            (
                EngineEvent::JobFailed {
                    job_id: job.id,
                    instance_id: job.instance_id,
                    error: message,
                    retries_remaining: current.retries_remaining,
                },
                JobOutcome::Failed {
                    retries_remaining: current.retries_remaining,
                },
            )
        };
        core.store.append_event(job.instance_id, &event).await?;
        self.engine.publish(&[event]);
        Ok(outcome)
    }

    /// One poll-and-execute cycle. Returns the number of jobs claimed.
    pub async fn run_once(&self) -> EngineResult<usize> {
        let claimed = self.poll(self.engine.config().poll_batch_size).await?;
        for job in &claimed {
            if let Err(e) = self.execute(job).await {
                tracing::warn!(job_id = %job.job.id, error = %e, "job execution could not be recorded");
            }
        }
        Ok(claimed.len())
    }
}

/// Background loop around a [`JobScheduler`].
pub struct JobWorker {
    scheduler: JobScheduler,
}

impl JobWorker {
    pub fn new(scheduler: JobScheduler) -> Self {
        Self { scheduler }
    }

    /// Run until the shutdown signal is received.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        let config = self.scheduler.engine.config();
        let interval = config.poll_interval();
        let batch = config.poll_batch_size;
        tracing::info!(worker = %self.scheduler.worker_id, ?interval, "JobWorker started");

        loop {
            if *shutdown_rx.borrow() {
                tracing::info!("JobWorker shutting down");
                break;
            }

            let busy = match self.scheduler.run_once().await {
                Ok(n) => {
                    if n > 0 {
                        tracing::debug!(count = n, "JobWorker: processed jobs");
                    }
                    n >= batch
                }
                Err(e) => {
                    tracing::warn!(error = %e, "JobWorker: poll failed");
                    false
                }
            };
            // A full batch probably left more due work behind.
            if busy {
                tokio::task::yield_now().await;
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown_rx.changed() => {
                    tracing::info!("JobWorker shutting down (during sleep)");
                    break;
                }
            }
        }

        tracing::info!("JobWorker stopped");
    }
}
