//! Ending executions: cascades, scope completion, instance outcomes.

use std::collections::HashSet;
use uuid::Uuid;

use super::{Op, Runtime};
use crate::error::{EngineError, EngineResult};
use crate::events::EngineEvent;
use crate::job::JobHandler;
use crate::model::ElementKind;
use crate::tree::ExecutionKind;
use crate::types::{EndReason, ExecRef, ExecutionId, ProcessState, Variables};

impl Runtime<'_> {
    /// End `at` and all of its descendants, children first. Tasks are
    /// cancelled, jobs deleted, subscriptions removed and called instances
    /// cancelled before the execution leaves the tree.
    pub(crate) fn end_execution(&mut self, at: ExecRef, reason: EndReason) -> EngineResult<()> {
        let inst = self.instance(at.instance_id)?;
        if !inst.tree.contains(at.execution) {
            return Ok(());
        }
        let mut order = inst.tree.descendants_post_order(at.execution);
        order.push(at.execution);

        // A branch parked on its own activity scope reports through that scope.
        let silent: HashSet<ExecutionId> = order
            .iter()
            .copied()
            .filter(|id| {
                inst.tree.get(*id).is_some_and(|e| {
                    e.is_branch()
                        && e.children.iter().any(|c| {
                            inst.tree.get(*c).is_some_and(|child| {
                                child.kind.owner_activity() == e.activity_id.as_deref()
                            })
                        })
                })
            })
            .collect();

        for id in order {
            self.end_one(
                ExecRef::new(at.instance_id, id),
                &reason,
                !silent.contains(&id),
            )?;
        }
        Ok(())
    }

    fn end_one(&mut self, at: ExecRef, reason: &EndReason, report: bool) -> EngineResult<()> {
        let now = self.now();
        let inst = self.instance_mut(at.instance_id)?;
        let Some(exec) = inst.tree.get(at.execution).cloned() else {
            return Ok(());
        };

        let mut cancelled_tasks = Vec::new();
        for task in inst
            .tasks
            .values_mut()
            .filter(|t| t.execution == at.execution)
        {
            if task.cancel(reason.to_string(), now) {
                cancelled_tasks.push(task.id);
            }
        }
        inst.subscriptions.retain(|_, s| s.execution != at.execution);
        let prefix = format!("{}:", at.execution.0);
        inst.joins.retain(|key, _| !key.starts_with(&prefix));
        inst.inclusive_expected.retain(|key, _| !key.starts_with(&prefix));
        if at.execution != inst.root() {
            inst.variables.drop_frame(at.execution);
        }
        inst.tree.remove(at.execution);

        for task_id in cancelled_tasks {
            self.emit(EngineEvent::TaskCancelled {
                task_id,
                at,
                reason: reason.to_string(),
            });
        }
        for job_id in self.uow.jobs_of(at.instance_id, at.execution) {
            if let Some(job) = self.uow.delete_job(job_id) {
                if let JobHandler::TimerFire { activity_id, .. } = job.handler {
                    self.emit(EngineEvent::TimerCancelled {
                        job_id,
                        at,
                        activity_id,
                    });
                }
            }
        }
        if let Some(child) = exec.called_instance {
            self.cancel_instance(child, reason.clone())?;
        }
        if report && reason.is_cancellation() {
            if let Some(activity_id) = exec.activity_id {
                self.emit(EngineEvent::ActivityCancelled {
                    at,
                    activity_id,
                    reason: reason.clone(),
                });
            }
        }
        Ok(())
    }

    /// Remove a token that reached an end. Completes its scope when it was
    /// the last child.
    pub(crate) fn end_token(&mut self, at: ExecRef) -> EngineResult<()> {
        let scope = self.parent_of(at)?;
        self.end_execution(at, EndReason::Completed)?;
        let inst = self.instance_mut(at.instance_id)?;
        inst.tree.refresh_concurrency(scope.execution);
        if inst.tree.children(scope.execution).is_empty() {
            self.push(Op::ScopeCompleted { at: scope });
        }
        Ok(())
    }

    pub(super) fn scope_completed(&mut self, at: ExecRef) -> EngineResult<()> {
        let exec = self.execution(at)?;
        match exec.kind.clone() {
            ExecutionKind::ProcessRoot => self.complete_instance(at.instance_id),
            ExecutionKind::ActivityScope { .. } | ExecutionKind::MultiInstanceItem { .. } => {
                self.push(Op::Complete { at });
                Ok(())
            }
            ExecutionKind::EventSubProcess { activity_id } => {
                let parent = self.parent_of(at)?;
                self.emit(EngineEvent::ActivityCompleted { at, activity_id });
                self.end_execution(at, EndReason::Completed)?;
                if self
                    .instance(at.instance_id)?
                    .tree
                    .children(parent.execution)
                    .is_empty()
                {
                    self.push(Op::ScopeCompleted { at: parent });
                }
                Ok(())
            }
            kind => Err(EngineError::IllegalState(format!(
                "{at} ({kind:?}) does not own a flow scope"
            ))),
        }
    }

    /// Root scope finished: the instance completes, exactly once.
    fn complete_instance(&mut self, instance_id: Uuid) -> EngineResult<()> {
        let inst = self.instance(instance_id)?;
        if !inst.is_running() {
            return Ok(());
        }
        let root = inst.exec_ref(inst.root());
        let super_execution = inst.super_execution;
        self.end_execution(root, EndReason::Completed)?;

        let now = self.now();
        let inst = self.instance_mut(instance_id)?;
        inst.state = ProcessState::Completed { at: now };
        inst.ended_at = Some(now);
        self.emit(EngineEvent::ProcessCompleted { instance_id });
        tracing::info!(instance_id = %instance_id, "process instance completed");

        if let Some(caller) = super_execution {
            self.resume_caller(caller, instance_id)?;
        }
        Ok(())
    }

    /// A called instance finished: map its outputs and complete the caller.
    fn resume_caller(&mut self, caller: ExecRef, child_id: Uuid) -> EngineResult<()> {
        if !self.is_live(caller) {
            tracing::debug!(caller = %caller, child_instance = %child_id, "caller no longer waiting");
            return Ok(());
        }
        let def = self.definition(caller.instance_id)?;
        let activity_id = self.activity_of(caller)?;
        let ElementKind::CallActivity(spec) = &def.element(&activity_id)?.kind else {
            return Err(EngineError::IllegalState(format!(
                "{caller} at {activity_id} is not a call activity"
            )));
        };

        let child = self.instance(child_id)?;
        let child_vars = child
            .variables
            .frame(child.root())
            .cloned()
            .unwrap_or_default();
        let mut outputs = if spec.inherit_variables {
            child_vars.clone()
        } else {
            Variables::new()
        };
        for mapping in &spec.outputs {
            let value = match child_vars.get(&mapping.source) {
                Some(v) => v.clone(),
                None => self
                    .core()
                    .expressions
                    .evaluate(&mapping.source, &child_vars)?,
            };
            outputs.insert(mapping.target.clone(), value);
        }
        self.set_variables(caller, &outputs)?;
        self.push(Op::Complete { at: caller });
        Ok(())
    }

    /// Terminate end event: everything in the enclosing scope ends.
    pub(super) fn terminate(&mut self, at: ExecRef) -> EngineResult<()> {
        let activity_id = self.activity_of(at)?;
        let scope = self.parent_of(at)?;
        self.emit(EngineEvent::ActivityCompleted { at, activity_id });
        self.end_execution(at, EndReason::Completed)?;

        let inst = self.instance(at.instance_id)?;
        if scope.execution != inst.root() {
            let siblings = inst.tree.children(scope.execution).to_vec();
            for sibling in siblings {
                self.end_execution(
                    ExecRef::new(at.instance_id, sibling),
                    EndReason::Terminated,
                )?;
            }
            self.push(Op::ScopeCompleted { at: scope });
            return Ok(());
        }

        let super_execution = inst.super_execution;
        self.end_execution(scope, EndReason::Terminated)?;
        let now = self.now();
        let inst = self.instance_mut(at.instance_id)?;
        inst.state = ProcessState::Terminated { at: now };
        inst.ended_at = Some(now);
        self.emit(EngineEvent::ProcessTerminated {
            instance_id: at.instance_id,
        });
        tracing::info!(instance_id = %at.instance_id, "process instance terminated");

        // A terminated called instance still completes its call activity.
        if let Some(caller) = super_execution {
            self.resume_caller(caller, at.instance_id)?;
        }
        Ok(())
    }

    /// Cancel a whole instance: explicit deletion or an ending caller.
    pub(crate) fn cancel_instance(&mut self, instance_id: Uuid, reason: EndReason) -> EngineResult<()> {
        if !self.uow.contains(instance_id) {
            tracing::warn!(instance_id = %instance_id, "called instance not loaded; cannot cancel");
            return Ok(());
        }
        let inst = self.instance(instance_id)?;
        if !inst.is_running() {
            return Ok(());
        }
        let root = inst.exec_ref(inst.root());
        self.end_execution(root, reason.clone())?;

        let now = self.now();
        let inst = self.instance_mut(instance_id)?;
        inst.state = ProcessState::Cancelled {
            reason: reason.to_string(),
            at: now,
        };
        inst.ended_at = Some(now);
        self.emit(EngineEvent::ProcessCancelled {
            instance_id,
            reason: reason.to_string(),
        });
        tracing::info!(instance_id = %instance_id, %reason, "process instance cancelled");
        Ok(())
    }

    /// A business error nobody caught ends the instance as failed.
    pub(crate) fn fail_instance(&mut self, instance_id: Uuid, error_code: &str) -> EngineResult<()> {
        let inst = self.instance(instance_id)?;
        if !inst.is_running() {
            return Ok(());
        }
        let root = inst.exec_ref(inst.root());
        self.end_execution(
            root,
            EndReason::ErrorPropagated {
                error_code: error_code.to_string(),
            },
        )?;

        let now = self.now();
        let inst = self.instance_mut(instance_id)?;
        inst.state = ProcessState::Failed {
            error_code: error_code.to_string(),
            at: now,
        };
        inst.ended_at = Some(now);
        self.emit(EngineEvent::ProcessFailed {
            instance_id,
            error_code: error_code.to_string(),
        });
        tracing::error!(instance_id = %instance_id, error_code, "unhandled business error failed the process instance");
        Ok(())
    }
}
