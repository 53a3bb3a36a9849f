use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::events::EngineEvent;
use crate::job::{Job, JobState};
use crate::store::*;
use crate::subscription::{EventSubscription, SubscriptionKind};
use crate::types::Timestamp;

#[derive(Default)]
struct Tables {
    instances: HashMap<Uuid, InstanceRecord>,
    task_index: HashMap<Uuid, Uuid>,
    jobs: HashMap<Uuid, Job>,
    events: HashMap<Uuid, Vec<(u64, EngineEvent)>>,
}

impl Tables {
    fn append(&mut self, instance_id: Uuid, event: EngineEvent) -> u64 {
        let log = self.events.entry(instance_id).or_default();
        let seq = log.len() as u64 + 1;
        log.push((seq, event));
        seq
    }

    fn check(&self, batch: &CommitBatch) -> Option<String> {
        for write in &batch.instances {
            let current = self.instances.get(&write.state.instance_id).map(|r| r.version);
            if current != write.expected_version {
                return Some(format!(
                    "instance {} at version {current:?}, expected {:?}",
                    write.state.instance_id, write.expected_version
                ));
            }
        }
        for write in &batch.job_writes {
            let current = self.jobs.get(&write.job.id).map(|j| j.version);
            if current != write.expected_version {
                return Some(format!(
                    "job {} at version {current:?}, expected {:?}",
                    write.job.id, write.expected_version
                ));
            }
        }
        for delete in &batch.job_deletes {
            if let Some(expected) = delete.expected_version {
                let current = self.jobs.get(&delete.job_id).map(|j| j.version);
                if current != Some(expected) {
                    return Some(format!(
                        "job {} at version {current:?}, expected {expected} for delete",
                        delete.job_id
                    ));
                }
            }
        }
        None
    }
}

/// In-memory store. One lock over all tables makes `commit` atomic.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RuntimeStore for MemoryStore {
    async fn load_instance(&self, id: Uuid) -> Result<Option<InstanceRecord>> {
        Ok(self.tables.read().await.instances.get(&id).cloned())
    }

    async fn find_task_instance(&self, task_id: Uuid) -> Result<Option<Uuid>> {
        Ok(self.tables.read().await.task_index.get(&task_id).copied())
    }

    async fn find_subscriptions(
        &self,
        kind: SubscriptionKind,
        key: &str,
    ) -> Result<Vec<EventSubscription>> {
        let tables = self.tables.read().await;
        let mut subs: Vec<EventSubscription> = tables
            .instances
            .values()
            .filter(|r| r.state.is_running())
            .flat_map(|r| r.state.subscriptions_matching(kind, key).cloned())
            .collect();
        subs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(subs)
    }

    async fn commit(&self, batch: CommitBatch) -> Result<CommitOutcome> {
        let mut tables = self.tables.write().await;
        if let Some(conflict) = tables.check(&batch) {
            return Ok(CommitOutcome::Conflict(conflict));
        }

        for write in batch.instances {
            let id = write.state.instance_id;
            for task_id in write.state.tasks.keys() {
                tables.task_index.insert(*task_id, id);
            }
            let version = write.expected_version.map_or(1, |v| v + 1);
            tables.instances.insert(
                id,
                InstanceRecord {
                    state: write.state,
                    version,
                },
            );
        }
        for delete in batch.job_deletes {
            tables.jobs.remove(&delete.job_id);
        }
        for write in batch.job_writes {
            let mut job = write.job;
            job.version = write.expected_version.map_or(0, |v| v + 1);
            tables.jobs.insert(job.id, job);
        }
        for event in batch.events {
            tables.append(event.instance_id(), event);
        }
        Ok(CommitOutcome::Committed)
    }

    async fn load_job(&self, id: Uuid) -> Result<Option<Job>> {
        Ok(self.tables.read().await.jobs.get(&id).cloned())
    }

    async fn jobs_for_instance(&self, instance_id: Uuid) -> Result<Vec<Job>> {
        let tables = self.tables.read().await;
        let mut jobs: Vec<Job> = tables
            .jobs
            .values()
            .filter(|j| j.instance_id == instance_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.id);
        Ok(jobs)
    }

    async fn find_acquirable_jobs(&self, now: Timestamp, limit: usize) -> Result<Vec<Job>> {
        let tables = self.tables.read().await;
        let mut jobs: Vec<Job> = tables
            .jobs
            .values()
            .filter(|j| j.is_acquirable(now))
            .cloned()
            .collect();
        // Option orders None first.
        jobs.sort_by(|a, b| a.due_at.cmp(&b.due_at).then(a.id.cmp(&b.id)));
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn update_job(&self, job: &Job, expected_version: u64) -> Result<bool> {
        let mut tables = self.tables.write().await;
        match tables.jobs.get(&job.id) {
            Some(current) if current.version == expected_version => {
                let mut updated = job.clone();
                updated.version = expected_version + 1;
                tables.jobs.insert(job.id, updated);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn dead_jobs(&self) -> Result<Vec<Job>> {
        let tables = self.tables.read().await;
        let mut jobs: Vec<Job> = tables
            .jobs
            .values()
            .filter(|j| j.state == JobState::Dead)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.id);
        Ok(jobs)
    }

    async fn append_event(&self, instance_id: Uuid, event: &EngineEvent) -> Result<u64> {
        Ok(self.tables.write().await.append(instance_id, event.clone()))
    }

    async fn read_events(
        &self,
        instance_id: Uuid,
        from_seq: u64,
    ) -> Result<Vec<(u64, EngineEvent)>> {
        let tables = self.tables.read().await;
        Ok(tables
            .events
            .get(&instance_id)
            .map(|log| {
                log.iter()
                    .filter(|(seq, _)| *seq >= from_seq)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
