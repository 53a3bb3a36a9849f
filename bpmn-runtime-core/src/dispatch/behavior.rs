//! Per-element behaviors, keyed by `ElementKind`.

use std::collections::BTreeSet;
use uuid::Uuid;

use super::{Op, Runtime};
use crate::error::{EngineError, EngineResult};
use crate::events::EngineEvent;
use crate::job::Job;
use crate::model::{
    CallActivitySpec, CatchTrigger, ElementKind, EndKind, FlowElement, ProcessDefinition,
    ServiceTaskSpec, ThrowKind, UserTaskSpec,
};
use crate::service::{ServiceContext, ServiceOutcome};
use crate::subscription::SubscriptionKind;
use crate::task::{Task, TaskStatus};
use crate::tree::ExecutionKind;
use crate::types::{ExecRef, ExecutionState, Variables};
use crate::variables::validate_variables;

/// Activities that run inside their own `ActivityScope` execution.
fn needs_activity_scope(def: &ProcessDefinition, element: &FlowElement) -> bool {
    matches!(
        element.kind,
        ElementKind::SubProcess(_) | ElementKind::CallActivity(_)
    ) || !def.boundaries_of(&element.id).is_empty()
}

impl Runtime<'_> {
    pub(super) fn enter(&mut self, at: ExecRef, activity_id: &str) -> EngineResult<()> {
        let def = self.definition(at.instance_id)?;
        let element = def.element(activity_id)?;
        self.instance_mut(at.instance_id)?
            .tree
            .move_to(at.execution, activity_id);

        if element.async_before {
            let retries = match &element.kind {
                ElementKind::ServiceTask(ServiceTaskSpec {
                    retries: Some(r), ..
                }) => *r,
                _ => self.core().config.default_job_retries,
            };
            let job = Job::async_continuation(at, activity_id, retries, self.now());
            tracing::debug!(
                execution = %at,
                activity = activity_id,
                job_id = %job.id,
                "async continuation scheduled"
            );
            self.uow.add_job(job);
            self.wait(at)?;
            return Ok(());
        }
        self.execute(at, activity_id)
    }

    pub(crate) fn execute(&mut self, at: ExecRef, activity_id: &str) -> EngineResult<()> {
        let def = self.definition(at.instance_id)?;
        let element = def.element(activity_id)?;
        let exec = self.execution(at)?;
        let is_item = matches!(
            &exec.kind,
            ExecutionKind::MultiInstanceItem { activity_id: a, .. } if a == activity_id
        );
        let is_branch = exec.is_branch();

        if let Some(mi) = &element.multi_instance {
            if !is_item {
                return self.start_multi_instance(at, element, mi, &def);
            }
        }

        let target = if is_branch && needs_activity_scope(&def, element) {
            self.create_activity_scope(at, element, &def)?
        } else {
            at
        };
        self.emit(EngineEvent::ActivityStarted {
            at: target,
            activity_id: activity_id.to_string(),
        });
        self.run_behavior(target, element, &def)
    }

    fn create_activity_scope(
        &mut self,
        branch: ExecRef,
        element: &FlowElement,
        def: &ProcessDefinition,
    ) -> EngineResult<ExecRef> {
        let scope = self.create_child(
            branch,
            Some(&element.id),
            ExecutionKind::ActivityScope {
                activity_id: element.id.clone(),
            },
            false,
        )?;
        let inst = self.instance_mut(branch.instance_id)?;
        if matches!(element.kind, ElementKind::SubProcess(_)) {
            inst.variables.create_frame(scope.execution);
        }
        inst.tree.set_state(branch.execution, ExecutionState::Waiting);
        self.attach_boundaries(scope, &element.id, def)?;
        Ok(scope)
    }

    pub(crate) fn wait(&mut self, at: ExecRef) -> EngineResult<()> {
        self.instance_mut(at.instance_id)?
            .tree
            .set_state(at.execution, ExecutionState::Waiting);
        Ok(())
    }

    pub(crate) fn run_behavior(
        &mut self,
        at: ExecRef,
        element: &FlowElement,
        def: &ProcessDefinition,
    ) -> EngineResult<()> {
        match &element.kind {
            ElementKind::StartEvent(_)
            | ElementKind::Task
            | ElementKind::ExclusiveGateway { .. }
            | ElementKind::IntermediateThrow(ThrowKind::None) => {
                self.push(Op::Complete { at });
                Ok(())
            }
            ElementKind::IntermediateThrow(ThrowKind::Signal(name)) => {
                // Subscribers live in other units of work; the broadcast
                // commits with this one and runs right after it.
                let job = Job::signal_throw(
                    at,
                    &element.id,
                    name,
                    Variables::new(),
                    self.core().config.default_job_retries,
                    self.now(),
                );
                tracing::debug!(execution = %at, signal = %name, job_id = %job.id, "signal throw queued");
                self.uow.add_follow_up(job);
                self.push(Op::Complete { at });
                Ok(())
            }
            ElementKind::EndEvent(EndKind::None) => {
                self.emit(EngineEvent::ActivityCompleted {
                    at,
                    activity_id: element.id.clone(),
                });
                self.end_token(at)
            }
            ElementKind::EndEvent(EndKind::Terminate) => self.terminate(at),
            ElementKind::EndEvent(EndKind::Error(code)) => self.throw_error(at, code),
            ElementKind::UserTask(spec) => self.create_user_task(at, element, spec),
            ElementKind::ServiceTask(spec) => self.invoke_service(at, element, spec),
            ElementKind::ReceiveTask(msg)
            | ElementKind::IntermediateCatch(CatchTrigger::Message(msg)) => {
                self.subscribe_message(at, &element.id, msg)?;
                self.wait(at)
            }
            ElementKind::IntermediateCatch(CatchTrigger::Signal(name)) => {
                self.subscribe(at, SubscriptionKind::Signal, name, &element.id, None)?;
                self.wait(at)
            }
            ElementKind::IntermediateCatch(CatchTrigger::Timer(spec)) => {
                self.schedule_timer(at, &element.id, spec)?;
                self.wait(at)
            }
            ElementKind::ParallelGateway | ElementKind::InclusiveGateway { .. } => {
                if def.incoming_count(&element.id) > 1 {
                    self.join(at, &element.id)
                } else {
                    self.push(Op::Complete { at });
                    Ok(())
                }
            }
            ElementKind::SubProcess(_) => self.start_sub_process(at, &element.id, def),
            ElementKind::CallActivity(spec) => self.start_call_activity(at, spec),
            ElementKind::EventSubProcess(_) | ElementKind::BoundaryEvent(_) => {
                Err(EngineError::IllegalState(format!(
                    "{} cannot be entered through a sequence flow",
                    element.id
                )))
            }
        }
    }

    fn create_user_task(
        &mut self,
        at: ExecRef,
        element: &FlowElement,
        spec: &UserTaskSpec,
    ) -> EngineResult<()> {
        let designated_assignee = match &spec.assignee {
            Some(expr) => {
                let vars = self.visible(at)?;
                self.core().expressions.evaluate_string(expr, &vars)?
            }
            None => None,
        };
        let task = Task {
            id: Uuid::now_v7(),
            instance_id: at.instance_id,
            execution: at.execution,
            activity_id: element.id.clone(),
            name: element.display_name().to_string(),
            designated_assignee,
            assignee: None,
            candidate_users: spec.candidate_users.iter().cloned().collect::<BTreeSet<_>>(),
            candidate_groups: spec.candidate_groups.iter().cloned().collect::<BTreeSet<_>>(),
            status: TaskStatus::Created,
            local_variables: Variables::new(),
            output_mappings: spec.output_mappings.clone(),
            created_at: self.now(),
            claimed_at: None,
            ended_at: None,
            cancel_reason: None,
        };
        tracing::debug!(task_id = %task.id, execution = %at, activity = %element.id, "task created");
        self.emit(EngineEvent::TaskCreated {
            task_id: task.id,
            at,
            activity_id: element.id.clone(),
        });
        self.instance_mut(at.instance_id)?.tasks.insert(task.id, task);
        self.wait(at)
    }

    fn invoke_service(
        &mut self,
        at: ExecRef,
        element: &FlowElement,
        spec: &ServiceTaskSpec,
    ) -> EngineResult<()> {
        let handler =
            self.core()
                .services
                .get(&spec.handler)
                .ok_or_else(|| EngineError::Service {
                    handler: spec.handler.clone(),
                    message: "no handler registered under this name".to_string(),
                })?;
        let inst = self.instance(at.instance_id)?;
        let ctx = ServiceContext {
            instance_id: at.instance_id,
            execution: at,
            activity_id: element.id.clone(),
            business_key: inst.business_key.clone(),
            variables: inst.visible_variables(at.execution),
        };

        match handler.execute(&ctx) {
            Ok(ServiceOutcome::Complete(vars)) => {
                validate_variables(&vars)?;
                self.set_variables(at, &vars)?;
                self.push(Op::Complete { at });
                Ok(())
            }
            Ok(ServiceOutcome::BusinessError { code }) => {
                tracing::debug!(execution = %at, activity = %element.id, code = %code, "service raised business error");
                self.throw_error(at, &code)
            }
            Err(e) => Err(EngineError::Service {
                handler: spec.handler.clone(),
                message: format!("{e:#}"),
            }),
        }
    }

    fn start_sub_process(
        &mut self,
        at: ExecRef,
        sub_process_id: &str,
        def: &ProcessDefinition,
    ) -> EngineResult<()> {
        let start = def.none_start(Some(sub_process_id)).ok_or_else(|| {
            EngineError::IllegalState(format!("sub-process {sub_process_id} has no none start"))
        })?;
        self.register_event_sub_processes(at, Some(sub_process_id), def)?;
        let token = self.create_child(at, Some(start), ExecutionKind::Branch, false)?;
        self.wait(at)?;
        self.push(Op::Enter {
            at: token,
            activity_id: start.to_string(),
        });
        Ok(())
    }

    fn start_call_activity(&mut self, at: ExecRef, spec: &CallActivitySpec) -> EngineResult<()> {
        let called = self.core().definitions.get(&spec.called_element)?;
        let start = called.none_start(None).ok_or_else(|| {
            EngineError::IllegalState(format!(
                "called process {} has no none start event",
                called.id()
            ))
        })?;

        let parent_vars = self.visible(at)?;
        let mut input = if spec.inherit_variables {
            parent_vars.clone()
        } else {
            Variables::new()
        };
        for mapping in &spec.inputs {
            let value = self
                .core()
                .expressions
                .evaluate(&mapping.source, &parent_vars)?;
            input.insert(mapping.target.clone(), value);
        }

        let business_key = self.instance(at.instance_id)?.business_key.clone();
        let child = self.start_instance(&called, start, input, business_key, Some(at))?;
        tracing::debug!(
            execution = %at,
            called = called.id(),
            child_instance = %child.instance_id,
            "call activity started child instance"
        );
        let inst = self.instance_mut(at.instance_id)?;
        if let Some(exec) = inst.tree.get_mut(at.execution) {
            exec.called_instance = Some(child.instance_id);
        }
        self.wait(at)
    }
}
