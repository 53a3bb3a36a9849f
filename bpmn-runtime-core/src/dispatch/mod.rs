//! Behavior dispatch.
//!
//! Every command runs as a synchronous agenda of [`Op`]s against one
//! [`UnitOfWork`]. Behaviors never touch the store; they mutate the loaded
//! instance family and queue follow-up ops. An op whose execution has
//! ended (or whose instance is no longer running) is skipped, which makes
//! cancellation cascades safe against already-queued work.

mod behavior;
mod commands;
mod flow;
mod scope;

use std::collections::VecDeque;
use std::sync::Arc;
use uuid::Uuid;

use crate::engine::EngineCore;
use crate::error::{EngineError, EngineResult};
use crate::events::EngineEvent;
use crate::model::ProcessDefinition;
use crate::state::InstanceState;
use crate::tree::{Execution, ExecutionKind};
use crate::types::{ExecRef, Timestamp, Variables};
use crate::uow::UnitOfWork;
use crate::variables::validate_variables;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Op {
    /// Control arrives at `activity_id`.
    Enter { at: ExecRef, activity_id: String },
    /// Run the behavior of `activity_id`; async continuations resume here.
    Execute { at: ExecRef, activity_id: String },
    /// The execution finished its current activity.
    Complete { at: ExecRef },
    /// The last child of a scope execution ended.
    ScopeCompleted { at: ExecRef },
}

impl Op {
    fn at(&self) -> ExecRef {
        match self {
            Op::Enter { at, .. }
            | Op::Execute { at, .. }
            | Op::Complete { at }
            | Op::ScopeCompleted { at } => *at,
        }
    }
}

pub(crate) struct Runtime<'a> {
    core: &'a EngineCore,
    pub(crate) uow: UnitOfWork,
    agenda: VecDeque<Op>,
    steps: usize,
}

impl<'a> Runtime<'a> {
    pub fn new(core: &'a EngineCore, now: Timestamp) -> Self {
        Self {
            core,
            uow: UnitOfWork::new(now),
            agenda: VecDeque::new(),
            steps: 0,
        }
    }

    /// Load `roots` plus every instance linked to them through call
    /// activities, in both directions, with their jobs.
    pub async fn load_family(&mut self, roots: &[Uuid]) -> EngineResult<()> {
        let mut queue: VecDeque<Uuid> = roots.iter().copied().collect();
        while let Some(id) = queue.pop_front() {
            if self.uow.contains(id) {
                continue;
            }
            let record = self
                .core
                .store
                .load_instance(id)
                .await?
                .ok_or(EngineError::InstanceNotFound(id))?;
            if let Some(sup) = record.state.super_execution {
                queue.push_back(sup.instance_id);
            }
            queue.extend(record.state.called_instances());
            for job in self.core.store.jobs_for_instance(id).await? {
                self.uow.add_loaded_job(job);
            }
            self.uow.add_loaded(record);
        }
        Ok(())
    }

    pub fn push(&mut self, op: Op) {
        self.agenda.push_back(op);
    }

    /// Drain the agenda.
    pub fn run(&mut self) -> EngineResult<()> {
        let limit = self.core.config.max_steps_per_command;
        while let Some(op) = self.agenda.pop_front() {
            self.steps += 1;
            if self.steps > limit {
                return Err(EngineError::StepLimitExceeded { limit });
            }
            let at = op.at();
            if !self.is_live(at) {
                tracing::debug!(execution = %at, ?op, "skipping op for ended execution");
                continue;
            }
            tracing::debug!(execution = %at, ?op, "dispatch");
            match op {
                Op::Enter { at, activity_id } => self.enter(at, &activity_id)?,
                Op::Execute { at, activity_id } => self.execute(at, &activity_id)?,
                Op::Complete { at } => self.complete(at)?,
                Op::ScopeCompleted { at } => self.scope_completed(at)?,
            }
        }
        Ok(())
    }

    pub fn into_commit(self) -> (crate::store::CommitBatch, Vec<Uuid>) {
        self.uow.into_commit()
    }

    /// Create an instance inside this unit of work and queue its start.
    pub fn start_instance(
        &mut self,
        def: &ProcessDefinition,
        start_id: &str,
        variables: Variables,
        business_key: Option<String>,
        super_execution: Option<ExecRef>,
    ) -> EngineResult<ExecRef> {
        validate_variables(&variables)?;
        def.element(start_id)?;
        let mut state = InstanceState::new(
            Uuid::now_v7(),
            def.id(),
            def.version_hex(),
            business_key.clone(),
            super_execution,
            self.now(),
        );
        let root = state.exec_ref(state.root());
        state.set_variables(root.execution, &variables);
        self.uow.insert_new(state);
        self.emit(EngineEvent::ProcessStarted {
            instance_id: root.instance_id,
            definition_id: def.id().to_string(),
            business_key,
            super_execution,
        });
        tracing::info!(
            instance_id = %root.instance_id,
            definition = def.id(),
            start = start_id,
            "process instance started"
        );

        self.register_event_sub_processes(root, None, def)?;
        let token = self.create_child(root, Some(start_id), ExecutionKind::Branch, false)?;
        self.push(Op::Enter {
            at: token,
            activity_id: start_id.to_string(),
        });
        Ok(root)
    }

    // ── Shared helpers ──

    pub(crate) fn now(&self) -> Timestamp {
        self.uow.now
    }

    pub(crate) fn core(&self) -> &'a EngineCore {
        self.core
    }

    pub(crate) fn definition(&self, instance_id: Uuid) -> EngineResult<Arc<ProcessDefinition>> {
        let inst = self.uow.instance(instance_id)?;
        self.core.definitions.get(&inst.definition_id)
    }

    pub(crate) fn instance(&self, id: Uuid) -> EngineResult<&InstanceState> {
        self.uow.instance(id)
    }

    pub(crate) fn instance_mut(&mut self, id: Uuid) -> EngineResult<&mut InstanceState> {
        self.uow.instance_mut(id)
    }

    pub(crate) fn execution(&self, at: ExecRef) -> EngineResult<&Execution> {
        self.uow.instance(at.instance_id)?.execution(at.execution)
    }

    /// Execution exists and its instance is still running.
    pub(crate) fn is_live(&self, at: ExecRef) -> bool {
        self.uow
            .instance(at.instance_id)
            .is_ok_and(|i| i.is_running() && i.tree.contains(at.execution))
    }

    pub(crate) fn ensure_live(&self, at: ExecRef) -> EngineResult<()> {
        let inst = self.instance(at.instance_id)?;
        if !inst.is_running() {
            return Err(EngineError::IllegalState(format!(
                "process instance {} is not running",
                at.instance_id
            )));
        }
        inst.execution(at.execution).map(|_| ())
    }

    pub(crate) fn emit(&mut self, event: EngineEvent) {
        self.uow.emit(event);
    }

    pub(crate) fn visible(&self, at: ExecRef) -> EngineResult<Variables> {
        Ok(self
            .uow
            .instance(at.instance_id)?
            .visible_variables(at.execution))
    }

    pub(crate) fn set_variables(&mut self, at: ExecRef, vars: &Variables) -> EngineResult<()> {
        if vars.is_empty() {
            return Ok(());
        }
        self.instance_mut(at.instance_id)?
            .set_variables(at.execution, vars);
        Ok(())
    }

    pub(crate) fn create_child(
        &mut self,
        parent: ExecRef,
        activity_id: Option<&str>,
        kind: ExecutionKind,
        concurrent: bool,
    ) -> EngineResult<ExecRef> {
        let now = self.now();
        let inst = self.instance_mut(parent.instance_id)?;
        let id = inst
            .tree
            .create_child(
                parent.execution,
                activity_id.map(str::to_string),
                kind,
                concurrent,
                now,
            )
            .ok_or_else(|| EngineError::ExecutionNotFound {
                instance_id: parent.instance_id,
                execution: parent.execution.to_string(),
            })?;
        Ok(ExecRef::new(parent.instance_id, id))
    }

    pub(crate) fn parent_of(&self, at: ExecRef) -> EngineResult<ExecRef> {
        self.execution(at)?
            .parent
            .map(|p| ExecRef::new(at.instance_id, p))
            .ok_or_else(|| EngineError::IllegalState(format!("{at} has no parent execution")))
    }

    pub(crate) fn activity_of(&self, at: ExecRef) -> EngineResult<String> {
        self.execution(at)?
            .activity_id
            .clone()
            .ok_or_else(|| EngineError::IllegalState(format!("{at} is not positioned at an activity")))
    }
}
