//! Command entry points applied inside one unit of work.

use uuid::Uuid;

use super::{Op, Runtime};
use crate::error::{EngineError, EngineResult};
use crate::events::EngineEvent;
use crate::job::{JobHandler, JobOutcome};
use crate::task::{Task, TaskSnapshot, TaskStatus};
use crate::tree::ExecutionKind;
use crate::types::{Actor, EndReason, ExecRef, ExecutionState, Variables};
use crate::variables::validate_variables;

impl Runtime<'_> {
    fn task(&self, task_id: Uuid) -> EngineResult<&Task> {
        let instance_id = self
            .uow
            .task_instance(task_id)
            .ok_or(EngineError::TaskNotFound(task_id))?;
        self.instance(instance_id)?
            .tasks
            .get(&task_id)
            .ok_or(EngineError::TaskNotFound(task_id))
    }

    fn task_mut(&mut self, task_id: Uuid) -> EngineResult<&mut Task> {
        let instance_id = self
            .uow
            .task_instance(task_id)
            .ok_or(EngineError::TaskNotFound(task_id))?;
        self.instance_mut(instance_id)?
            .tasks
            .get_mut(&task_id)
            .ok_or(EngineError::TaskNotFound(task_id))
    }

    pub(crate) fn claim_task(&mut self, task_id: Uuid, actor: &Actor) -> EngineResult<TaskSnapshot> {
        let now = self.now();
        let task = self.task_mut(task_id)?;
        let before = task.status;
        task.claim(actor, now)?;
        let (at, snapshot) = (task.exec_ref(), task.snapshot());
        if before != TaskStatus::Assigned {
            tracing::debug!(task_id = %task_id, user = %actor.user_id, "task claimed");
            self.emit(EngineEvent::TaskAssigned {
                task_id,
                at,
                assignee: actor.user_id.clone(),
            });
        }
        Ok(snapshot)
    }

    pub(crate) fn release_task(&mut self, task_id: Uuid, actor: &Actor) -> EngineResult<TaskSnapshot> {
        let task = self.task_mut(task_id)?;
        task.release(actor)?;
        let (at, snapshot) = (task.exec_ref(), task.snapshot());
        tracing::debug!(task_id = %task_id, user = %actor.user_id, "task released");
        self.emit(EngineEvent::TaskReleased { task_id, at });
        Ok(snapshot)
    }

    /// Every check runs before the first mutation.
    pub(crate) fn complete_task(
        &mut self,
        task_id: Uuid,
        actor: &Actor,
        variables: &Variables,
    ) -> EngineResult<TaskSnapshot> {
        let task = self.task(task_id)?;
        task.check_completable(actor, variables)?;
        let at = task.exec_ref();
        self.ensure_live(at)?;

        let outputs = if task.output_mappings.is_empty() {
            variables.clone()
        } else {
            let mut merged = task.local_variables.clone();
            merged.extend(variables.iter().map(|(k, v)| (k.clone(), v.clone())));
            let mut outputs = Variables::new();
            for mapping in &task.output_mappings {
                let value = match merged.get(&mapping.source) {
                    Some(v) => v.clone(),
                    None => self.core().expressions.evaluate(&mapping.source, &merged)?,
                };
                outputs.insert(mapping.target.clone(), value);
            }
            outputs
        };
        validate_variables(&outputs)?;

        let now = self.now();
        let task = self.task_mut(task_id)?;
        task.complete(now);
        let snapshot = task.snapshot();
        tracing::debug!(task_id = %task_id, execution = %at, user = %actor.user_id, "task completed");
        self.emit(EngineEvent::TaskCompleted {
            task_id,
            at,
            user_id: actor.user_id.clone(),
        });
        self.set_variables(at, &outputs)?;
        self.push(Op::Complete { at });
        Ok(snapshot)
    }

    pub(crate) fn update_task_variables(
        &mut self,
        task_id: Uuid,
        actor: &Actor,
        variables: &Variables,
    ) -> EngineResult<TaskSnapshot> {
        let task = self.task_mut(task_id)?;
        task.update_variables(actor, variables)?;
        Ok(task.snapshot())
    }

    /// Cancel the task and move its execution on without output mapping.
    pub(crate) fn delete_task(&mut self, task_id: Uuid, reason: &str) -> EngineResult<TaskSnapshot> {
        let task = self.task(task_id)?;
        if task.status.is_terminal() {
            return Err(EngineError::IllegalState(format!(
                "task {task_id} is already {:?}",
                task.status
            )));
        }
        let at = task.exec_ref();
        self.ensure_live(at)?;

        let now = self.now();
        let reason = EndReason::TaskDeleted {
            reason: reason.to_string(),
        };
        let task = self.task_mut(task_id)?;
        task.cancel(reason.to_string(), now);
        let snapshot = task.snapshot();
        self.emit(EngineEvent::TaskCancelled {
            task_id,
            at,
            reason: reason.to_string(),
        });
        tracing::info!(task_id = %task_id, execution = %at, %reason, "task deleted");
        if matches!(self.execution(at)?.kind, ExecutionKind::MultiInstanceItem { .. }) {
            self.item_cancelled(at, reason)?;
        } else {
            self.push(Op::Complete { at });
        }
        Ok(snapshot)
    }

    pub(crate) fn delete_instance(&mut self, instance_id: Uuid, reason: &str) -> EngineResult<()> {
        let inst = self.instance(instance_id)?;
        if inst.state.is_terminal() {
            return Err(EngineError::IllegalState(format!(
                "process instance {instance_id} already ended ({:?})",
                inst.state
            )));
        }
        self.cancel_instance(
            instance_id,
            EndReason::ProcessDeleted {
                reason: reason.to_string(),
            },
        )
    }

    /// Throw a business error from a waiting execution.
    pub(crate) fn throw_error_at(&mut self, at: ExecRef, code: &str) -> EngineResult<()> {
        self.ensure_live(at)?;
        self.throw_error(at, code)
    }

    /// Run a claimed job. A job that vanished, was re-locked elsewhere or
    /// whose execution already ended is skipped, which makes re-delivery
    /// after a lock-expiry race harmless. Signal throws are detached and run
    /// after their thrower moved on.
    pub(crate) fn execute_job(
        &mut self,
        job_id: Uuid,
        expected_version: u64,
    ) -> EngineResult<JobOutcome> {
        let Some(job) = self.uow.job(job_id).cloned() else {
            tracing::debug!(job_id = %job_id, "job already gone; skipping");
            return Ok(JobOutcome::Skipped);
        };
        if job.version != expected_version {
            tracing::debug!(
                job_id = %job_id,
                expected = expected_version,
                found = job.version,
                "job changed since claim; skipping"
            );
            return Ok(JobOutcome::Skipped);
        }
        let at = job.exec_ref();
        if !job.is_detached() && !self.is_live(at) {
            tracing::debug!(job_id = %job_id, execution = %at, "job execution ended; discarding job");
            self.uow.delete_job(job_id);
            return Ok(JobOutcome::Skipped);
        }

        match &job.handler {
            JobHandler::TimerFire { .. } => self.fire_timer(&job)?,
            JobHandler::AsyncContinuation { activity_id } => {
                self.uow.delete_job(job_id);
                self.instance_mut(at.instance_id)?
                    .tree
                    .set_state(at.execution, ExecutionState::Running);
                self.push(Op::Execute {
                    at,
                    activity_id: activity_id.clone(),
                });
            }
            JobHandler::SignalThrow {
                signal, variables, ..
            } => {
                self.uow.delete_job(job_id);
                let delivered = self.broadcast_signal(signal, variables)?;
                tracing::debug!(job_id = %job_id, signal = %signal, delivered, "thrown signal broadcast");
            }
        }
        Ok(JobOutcome::Executed)
    }
}
