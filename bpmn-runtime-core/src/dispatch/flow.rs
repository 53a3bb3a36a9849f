//! Leaving activities: flow selection, forks and joins.

use super::{Op, Runtime};
use crate::error::{EngineError, EngineResult};
use crate::events::EngineEvent;
use crate::model::{ElementKind, SequenceFlow};
use crate::state::{join_key, JoinState};
use crate::tree::ExecutionKind;
use crate::types::{EndReason, ExecRef, ExecutionState, Variables};

impl Runtime<'_> {
    /// The execution finished the activity it is positioned at.
    pub(super) fn complete(&mut self, at: ExecRef) -> EngineResult<()> {
        let exec = self.execution(at)?;
        if exec.runs_own_activity() {
            return match &exec.kind {
                ExecutionKind::ActivityScope { activity_id } => {
                    let activity_id = activity_id.clone();
                    let branch = self.parent_of(at)?;
                    self.emit(EngineEvent::ActivityCompleted { at, activity_id });
                    self.end_execution(at, EndReason::Completed)?;
                    self.instance_mut(at.instance_id)?
                        .tree
                        .set_state(branch.execution, ExecutionState::Running);
                    self.take_outgoing(branch)
                }
                _ => self.item_completed(at),
            };
        }
        if !exec.is_branch() {
            return Err(EngineError::IllegalState(format!(
                "{at} ({:?}) cannot complete an activity",
                exec.kind
            )));
        }
        let activity_id = self.activity_of(at)?;
        self.emit(EngineEvent::ActivityCompleted { at, activity_id });
        self.take_outgoing(at)
    }

    fn guard(&self, flow: &SequenceFlow, vars: &Variables) -> EngineResult<bool> {
        match &flow.condition {
            None => Ok(true),
            Some(expr) => self.core().expressions.evaluate_bool(expr, vars),
        }
    }

    /// Select outgoing flows of the branch's current activity and move on.
    pub(crate) fn take_outgoing(&mut self, at: ExecRef) -> EngineResult<()> {
        let def = self.definition(at.instance_id)?;
        let activity_id = self.activity_of(at)?;
        let scope = self.parent_of(at)?;
        let element = def.element(&activity_id)?;
        let flows = def.outgoing(&activity_id);
        let vars = self.visible(at)?;

        let selected: Vec<&SequenceFlow> = match &element.kind {
            ElementKind::ExclusiveGateway { default_flow } => {
                let mut chosen = None;
                for flow in flows.iter().filter(|f| Some(&f.id) != default_flow.as_ref()) {
                    if self.guard(flow, &vars)? {
                        chosen = Some(flow);
                        break;
                    }
                }
                chosen
                    .or_else(|| default_of(flows, default_flow.as_deref()))
                    .into_iter()
                    .collect()
            }
            ElementKind::InclusiveGateway { default_flow, .. } => {
                let mut taken = Vec::new();
                for flow in flows.iter().filter(|f| Some(&f.id) != default_flow.as_ref()) {
                    if self.guard(flow, &vars)? {
                        taken.push(flow);
                    }
                }
                if taken.is_empty() {
                    taken.extend(default_of(flows, default_flow.as_deref()));
                }
                taken
            }
            ElementKind::ParallelGateway => flows.iter().collect(),
            _ => {
                let mut taken = Vec::new();
                for flow in flows {
                    if self.guard(flow, &vars)? {
                        taken.push(flow);
                    }
                }
                taken
            }
        };

        if selected.is_empty() {
            if flows.is_empty() {
                // Implicit end.
                return self.end_token(at);
            }
            return Err(EngineError::NoMatchingFlow { activity_id });
        }

        if let ElementKind::InclusiveGateway {
            join: Some(join), ..
        } = &element.kind
        {
            let count = selected.len();
            self.instance_mut(at.instance_id)?
                .inclusive_expected
                .insert(join_key(scope.execution, join), count);
        }

        let targets: Vec<String> = selected.iter().map(|f| f.target.clone()).collect();
        tracing::debug!(execution = %at, activity = %activity_id, ?targets, "leaving activity");
        self.fork(at, scope, targets)
    }

    /// Continue `at` on the first target; siblings take the rest.
    fn fork(&mut self, at: ExecRef, scope: ExecRef, targets: Vec<String>) -> EngineResult<()> {
        let mut targets = targets.into_iter();
        let Some(first) = targets.next() else {
            return Ok(());
        };
        let mut siblings = Vec::new();
        for target in targets {
            let token = self.create_child(scope, Some(&target), ExecutionKind::Branch, true)?;
            siblings.push((token, target));
        }
        if !siblings.is_empty() {
            self.instance_mut(at.instance_id)?
                .tree
                .refresh_concurrency(scope.execution);
        }
        self.push(Op::Enter {
            at,
            activity_id: first,
        });
        for (token, target) in siblings {
            self.push(Op::Enter {
                at: token,
                activity_id: target,
            });
        }
        Ok(())
    }

    /// Arrival at a converging gateway. The last expected arrival continues;
    /// the others end.
    pub(super) fn join(&mut self, at: ExecRef, gateway_id: &str) -> EngineResult<()> {
        let def = self.definition(at.instance_id)?;
        let scope = self.parent_of(at)?;
        let key = join_key(scope.execution, gateway_id);
        let incoming = def.incoming_count(gateway_id);

        let inst = self.instance_mut(at.instance_id)?;
        let recorded = inst.inclusive_expected.get(&key).copied();
        let join = inst.joins.entry(key.clone()).or_insert_with(|| JoinState {
            expected: recorded.unwrap_or(incoming),
            arrived: Vec::new(),
        });
        join.arrived.push(at.execution);
        let (arrived, expected) = (join.arrived.len(), join.expected);
        inst.tree.set_state(at.execution, ExecutionState::Waiting);

        self.emit(EngineEvent::JoinArrived {
            at,
            gateway_id: gateway_id.to_string(),
            arrived,
            expected,
        });
        tracing::debug!(execution = %at, gateway = gateway_id, arrived, expected, "join arrival");
        if arrived < expected {
            return Ok(());
        }

        let inst = self.instance_mut(at.instance_id)?;
        let released = inst.joins.remove(&key).unwrap_or_default();
        inst.inclusive_expected.remove(&key);
        for other in released.arrived.into_iter().filter(|e| *e != at.execution) {
            self.end_execution(ExecRef::new(at.instance_id, other), EndReason::Completed)?;
        }
        let inst = self.instance_mut(at.instance_id)?;
        inst.tree.refresh_concurrency(scope.execution);
        inst.tree.set_state(at.execution, ExecutionState::Running);
        self.emit(EngineEvent::JoinReleased {
            at,
            gateway_id: gateway_id.to_string(),
        });
        self.push(Op::Complete { at });
        Ok(())
    }
}

fn default_of<'f>(flows: &'f [SequenceFlow], default_flow: Option<&str>) -> Option<&'f SequenceFlow> {
    default_flow.and_then(|id| flows.iter().find(|f| f.id == id))
}
