use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use crate::events::EngineEvent;
use crate::job::Job;
use crate::state::InstanceState;
use crate::subscription::{EventSubscription, SubscriptionKind};
use crate::types::Timestamp;

#[derive(Clone, Debug)]
pub struct InstanceRecord {
    pub state: InstanceState,
    /// Optimistic-lock version of the whole instance row set.
    pub version: u64,
}

#[derive(Clone, Debug)]
pub struct InstanceWrite {
    pub state: InstanceState,
    /// `None` inserts a new instance.
    pub expected_version: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct JobWrite {
    pub job: Job,
    /// `None` inserts a new job.
    pub expected_version: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct JobDelete {
    pub job_id: Uuid,
    /// `None` deletes whatever is there, if anything.
    pub expected_version: Option<u64>,
}

/// Everything one unit of work changes. Applied all-or-nothing.
#[derive(Clone, Debug, Default)]
pub struct CommitBatch {
    pub instances: Vec<InstanceWrite>,
    pub job_writes: Vec<JobWrite>,
    pub job_deletes: Vec<JobDelete>,
    /// Appended to the per-instance event logs.
    pub events: Vec<EngineEvent>,
}

impl CommitBatch {
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
            && self.job_writes.is_empty()
            && self.job_deletes.is_empty()
            && self.events.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// A version check failed; nothing was written.
    Conflict(String),
}

/// Persistence contract of the runtime.
///
/// The engine reads through this trait and writes only through `commit`,
/// except for job locking (`update_job`) and out-of-band event appends.
#[async_trait]
pub trait RuntimeStore: Send + Sync {
    // ── Instances ──

    async fn load_instance(&self, id: Uuid) -> Result<Option<InstanceRecord>>;
    async fn find_task_instance(&self, task_id: Uuid) -> Result<Option<Uuid>>;
    /// Live subscriptions across all instances, ordered by creation.
    async fn find_subscriptions(
        &self,
        kind: SubscriptionKind,
        key: &str,
    ) -> Result<Vec<EventSubscription>>;

    // ── Unit of work ──

    async fn commit(&self, batch: CommitBatch) -> Result<CommitOutcome>;

    // ── Jobs ──

    async fn load_job(&self, id: Uuid) -> Result<Option<Job>>;
    async fn jobs_for_instance(&self, instance_id: Uuid) -> Result<Vec<Job>>;
    /// Pending, due, unlocked jobs by due time ascending (no due time
    /// first), ties broken by id.
    async fn find_acquirable_jobs(&self, now: Timestamp, limit: usize) -> Result<Vec<Job>>;
    /// Compare-and-swap on the job version. Returns false on mismatch.
    async fn update_job(&self, job: &Job, expected_version: u64) -> Result<bool>;
    async fn dead_jobs(&self) -> Result<Vec<Job>>;

    // ── Event log (append-only) ──

    /// Append an event and return its sequence number.
    async fn append_event(&self, instance_id: Uuid, event: &EngineEvent) -> Result<u64>;
    async fn read_events(&self, instance_id: Uuid, from_seq: u64)
        -> Result<Vec<(u64, EngineEvent)>>;
}
