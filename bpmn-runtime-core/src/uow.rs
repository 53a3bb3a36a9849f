//! In-memory unit of work: every mutation of one command, committed at once.

use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::events::EngineEvent;
use crate::job::Job;
use crate::state::InstanceState;
use crate::store::{CommitBatch, InstanceRecord, InstanceWrite, JobDelete, JobWrite};
use crate::types::{ExecutionId, Timestamp};

#[derive(Debug)]
struct LoadedInstance {
    state: InstanceState,
    /// `None` for instances created by this unit of work.
    version: Option<u64>,
    dirty: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobChange {
    Unchanged,
    Upsert,
    Delete,
}

#[derive(Debug)]
struct JobSlot {
    job: Job,
    /// Version read from the store; `None` for new jobs.
    stored_version: Option<u64>,
    change: JobChange,
}

#[derive(Debug)]
pub(crate) struct UnitOfWork {
    pub now: Timestamp,
    instances: BTreeMap<Uuid, LoadedInstance>,
    jobs: BTreeMap<Uuid, JobSlot>,
    events: Vec<EngineEvent>,
    /// Jobs to run right after commit, in creation order.
    follow_ups: Vec<Uuid>,
}

impl UnitOfWork {
    pub fn new(now: Timestamp) -> Self {
        Self {
            now,
            instances: BTreeMap::new(),
            jobs: BTreeMap::new(),
            events: Vec::new(),
            follow_ups: Vec::new(),
        }
    }

    // ── Instances ──

    pub fn add_loaded(&mut self, record: InstanceRecord) {
        self.instances.insert(
            record.state.instance_id,
            LoadedInstance {
                state: record.state,
                version: Some(record.version),
                dirty: false,
            },
        );
    }

    pub fn insert_new(&mut self, state: InstanceState) {
        self.instances.insert(
            state.instance_id,
            LoadedInstance {
                state,
                version: None,
                dirty: true,
            },
        );
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.instances.contains_key(&id)
    }

    pub fn instance(&self, id: Uuid) -> EngineResult<&InstanceState> {
        self.instances
            .get(&id)
            .map(|l| &l.state)
            .ok_or(EngineError::InstanceNotFound(id))
    }

    /// Mutable access marks the instance for writing.
    pub fn instance_mut(&mut self, id: Uuid) -> EngineResult<&mut InstanceState> {
        let loaded = self
            .instances
            .get_mut(&id)
            .ok_or(EngineError::InstanceNotFound(id))?;
        loaded.dirty = true;
        Ok(&mut loaded.state)
    }

    pub fn instances(&self) -> impl Iterator<Item = &InstanceState> {
        self.instances.values().map(|l| &l.state)
    }

    /// Loaded instance holding `task_id`.
    pub fn task_instance(&self, task_id: Uuid) -> Option<Uuid> {
        self.instances
            .values()
            .find(|l| l.state.tasks.contains_key(&task_id))
            .map(|l| l.state.instance_id)
    }

    // ── Jobs ──

    pub fn add_loaded_job(&mut self, job: Job) {
        let version = job.version;
        self.jobs.insert(
            job.id,
            JobSlot {
                job,
                stored_version: Some(version),
                change: JobChange::Unchanged,
            },
        );
    }

    pub fn add_job(&mut self, job: Job) {
        self.jobs.insert(
            job.id,
            JobSlot {
                job,
                stored_version: None,
                change: JobChange::Upsert,
            },
        );
    }

    pub fn job(&self, id: Uuid) -> Option<&Job> {
        self.jobs
            .get(&id)
            .filter(|s| s.change != JobChange::Delete)
            .map(|s| &s.job)
    }

    pub fn delete_job(&mut self, id: Uuid) -> Option<Job> {
        let slot = self.jobs.get_mut(&id)?;
        if slot.change == JobChange::Delete {
            return None;
        }
        if slot.stored_version.is_none() {
            return self.jobs.remove(&id).map(|s| s.job);
        }
        slot.change = JobChange::Delete;
        Some(slot.job.clone())
    }

    /// Live jobs bound to one execution. Detached jobs outlive it.
    pub fn jobs_of(&self, instance_id: Uuid, execution: ExecutionId) -> Vec<Uuid> {
        self.jobs
            .values()
            .filter(|s| {
                s.change != JobChange::Delete
                    && !s.job.is_detached()
                    && s.job.instance_id == instance_id
                    && s.job.execution == execution
            })
            .map(|s| s.job.id)
            .collect()
    }

    // ── Events / follow-ups ──

    pub fn emit(&mut self, event: EngineEvent) {
        self.events.push(event);
    }

    pub fn events(&self) -> &[EngineEvent] {
        &self.events
    }

    /// A job committed with this unit of work and run as soon as it is.
    pub fn add_follow_up(&mut self, job: Job) {
        self.follow_ups.push(job.id);
        self.add_job(job);
    }

    /// Split into the store batch and the ids of post-commit follow-ups.
    pub fn into_commit(self) -> (CommitBatch, Vec<Uuid>) {
        let mut batch = CommitBatch {
            events: self.events,
            ..CommitBatch::default()
        };
        for loaded in self.instances.into_values().filter(|l| l.dirty) {
            batch.instances.push(InstanceWrite {
                state: loaded.state,
                expected_version: loaded.version,
            });
        }
        for slot in self.jobs.into_values() {
            match slot.change {
                JobChange::Unchanged => {}
                JobChange::Upsert => batch.job_writes.push(JobWrite {
                    job: slot.job,
                    expected_version: slot.stored_version,
                }),
                JobChange::Delete => batch.job_deletes.push(JobDelete {
                    job_id: slot.job.id,
                    expected_version: slot.stored_version,
                }),
            }
        }
        let follow_ups = self
            .follow_ups
            .into_iter()
            .filter(|id| batch.job_writes.iter().any(|w| w.job.id == *id))
            .collect();
        (batch, follow_ups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExecRef, Variables};
    use chrono::Utc;

    #[test]
    fn test_new_job_deleted_in_same_unit_leaves_no_trace() {
        let now = Utc::now();
        let mut uow = UnitOfWork::new(now);
        let job = Job::async_continuation(ExecRef::new(Uuid::now_v7(), ExecutionId(1)), "a", 3, now);
        let id = job.id;
        uow.add_job(job);
        assert!(uow.delete_job(id).is_some());
        let (batch, _) = uow.into_commit();
        assert!(batch.job_writes.is_empty());
        assert!(batch.job_deletes.is_empty());
    }

    #[test]
    fn test_loaded_job_delete_carries_version() {
        let now = Utc::now();
        let mut uow = UnitOfWork::new(now);
        let mut job = Job::async_continuation(ExecRef::new(Uuid::now_v7(), ExecutionId(1)), "a", 3, now);
        job.version = 4;
        let id = job.id;
        uow.add_loaded_job(job);
        uow.delete_job(id);
        assert!(uow.job(id).is_none());
        let (batch, _) = uow.into_commit();
        assert_eq!(batch.job_deletes.len(), 1);
        assert_eq!(batch.job_deletes[0].expected_version, Some(4));
    }

    #[test]
    fn test_only_dirty_instances_are_written() {
        let now = Utc::now();
        let mut uow = UnitOfWork::new(now);
        let a = InstanceState::new(Uuid::now_v7(), "p", "v".into(), None, None, now);
        let b = InstanceState::new(Uuid::now_v7(), "p", "v".into(), None, None, now);
        let a_id = a.instance_id;
        uow.add_loaded(InstanceRecord { state: a, version: 3 });
        uow.add_loaded(InstanceRecord { state: b, version: 1 });
        uow.instance_mut(a_id).unwrap().business_key = Some("k".into());
        let (batch, _) = uow.into_commit();
        assert_eq!(batch.instances.len(), 1);
        assert_eq!(batch.instances[0].expected_version, Some(3));
    }

    #[test]
    fn test_signal_throw_survives_its_execution_ending() {
        let now = Utc::now();
        let mut uow = UnitOfWork::new(now);
        let at = ExecRef::new(Uuid::now_v7(), ExecutionId(2));
        let timer = Job::async_continuation(at, "a", 3, now);
        let throw = Job::signal_throw(at, "announce", "go", Variables::new(), 3, now);
        let (timer_id, throw_id) = (timer.id, throw.id);
        uow.add_job(timer);
        uow.add_follow_up(throw);
        assert_eq!(uow.jobs_of(at.instance_id, at.execution), vec![timer_id]);

        let (batch, follow_ups) = uow.into_commit();
        assert_eq!(follow_ups, vec![throw_id]);
        assert_eq!(batch.job_writes.len(), 2);
    }
}
