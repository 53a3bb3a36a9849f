//! Multi-instance coordinator.
//!
//! A multi-instance activity runs under a `MultiInstanceBody` execution
//! (child of the arriving branch, owner of the activity's boundary events)
//! with one `MultiInstanceItem` per instance. Parallel bodies create every
//! item up front; sequential bodies create the next item only after the
//! previous one completed and the completion condition stayed false.
//!
//! Variables: the body frame carries `nrOfInstances`,
//! `nrOfCompletedInstances` and `nrOfActiveInstances`; each item frame
//! carries `loopCounter`, `nrOfInstances` and the element variable.

use serde_json::{json, Value};

use crate::dispatch::{Op, Runtime};
use crate::error::{EngineError, EngineResult};
use crate::events::EngineEvent;
use crate::model::{FlowElement, MultiInstanceSpec, ProcessDefinition};
use crate::tree::{ExecutionKind, MultiInstanceProgress};
use crate::types::{EndReason, ExecRef, Variables};

pub const NR_OF_INSTANCES: &str = "nrOfInstances";
pub const NR_OF_COMPLETED_INSTANCES: &str = "nrOfCompletedInstances";
pub const NR_OF_ACTIVE_INSTANCES: &str = "nrOfActiveInstances";
pub const LOOP_COUNTER: &str = "loopCounter";

impl Runtime<'_> {
    pub(crate) fn start_multi_instance(
        &mut self,
        at: ExecRef,
        element: &FlowElement,
        spec: &MultiInstanceSpec,
        def: &ProcessDefinition,
    ) -> EngineResult<()> {
        let vars = self.visible(at)?;
        let expressions = &self.core().expressions;
        let (total, items) = match (&spec.collection, &spec.cardinality) {
            (Some(collection), _) => {
                let items = expressions.evaluate_collection(collection, &vars)?;
                (items.len(), Some(items))
            }
            (None, Some(cardinality)) => (expressions.evaluate_count(cardinality, &vars)?, None),
            (None, None) => {
                return Err(EngineError::IllegalState(format!(
                    "multi-instance {} has neither cardinality nor collection",
                    element.id
                )))
            }
        };

        self.emit(EngineEvent::ActivityStarted {
            at,
            activity_id: element.id.clone(),
        });
        if total == 0 {
            tracing::debug!(execution = %at, activity = %element.id, "empty multi-instance; leaving");
            if let Some(output) = &spec.output_collection {
                self.set_variables(at, &Variables::from([(output.clone(), json!([]))]))?;
            }
            self.push(Op::Complete { at });
            return Ok(());
        }

        let body = self.create_child(
            at,
            Some(&element.id),
            ExecutionKind::MultiInstanceBody {
                activity_id: element.id.clone(),
                progress: MultiInstanceProgress {
                    total,
                    items,
                    ..MultiInstanceProgress::default()
                },
            },
            false,
        )?;
        let inst = self.instance_mut(at.instance_id)?;
        inst.variables.create_frame(body.execution);
        inst.variables.set_local(body.execution, NR_OF_INSTANCES, json!(total));
        inst.variables.set_local(body.execution, NR_OF_COMPLETED_INSTANCES, json!(0));
        inst.variables.set_local(body.execution, NR_OF_ACTIVE_INSTANCES, json!(0));
        self.wait(at)?;
        self.wait(body)?;
        self.attach_boundaries(body, &element.id, def)?;

        tracing::debug!(
            execution = %at,
            activity = %element.id,
            total,
            sequential = spec.sequential,
            "multi-instance started"
        );
        if spec.sequential {
            self.create_item(body, &element.id, 0, false)
        } else {
            for index in 0..total {
                self.create_item(body, &element.id, index, total > 1)?;
            }
            Ok(())
        }
    }

    fn create_item(
        &mut self,
        body: ExecRef,
        activity_id: &str,
        index: usize,
        concurrent: bool,
    ) -> EngineResult<()> {
        let def = self.definition(body.instance_id)?;
        let element_variable = def
            .element(activity_id)?
            .multi_instance
            .as_ref()
            .and_then(|mi| mi.element_variable.clone());

        let item = self.create_child(
            body,
            Some(activity_id),
            ExecutionKind::MultiInstanceItem {
                activity_id: activity_id.to_string(),
                index,
            },
            concurrent,
        )?;

        let inst = self.instance_mut(body.instance_id)?;
        let (total, element) = match inst.tree.get_mut(body.execution).map(|e| &mut e.kind) {
            Some(ExecutionKind::MultiInstanceBody { progress, .. }) => {
                progress.next_index = index + 1;
                let element = progress
                    .items
                    .as_ref()
                    .and_then(|items| items.get(index))
                    .cloned();
                (progress.total, element)
            }
            _ => return Err(not_a_body(body)),
        };
        let active = inst.tree.children(body.execution).len();

        inst.variables.create_frame(item.execution);
        inst.variables.set_local(item.execution, LOOP_COUNTER, json!(index));
        inst.variables.set_local(item.execution, NR_OF_INSTANCES, json!(total));
        if let Some(name) = element_variable {
            inst.variables
                .set_local(item.execution, &name, element.unwrap_or(Value::Null));
        }
        inst.variables
            .set_local(body.execution, NR_OF_ACTIVE_INSTANCES, json!(active));

        self.push(Op::Execute {
            at: item,
            activity_id: activity_id.to_string(),
        });
        Ok(())
    }

    /// One instance finished its activity.
    pub(crate) fn item_completed(&mut self, item: ExecRef) -> EngineResult<()> {
        self.item_ended(item, None)
    }

    /// One instance was cut short without completing (its task deleted). It
    /// is not counted in `nrOfCompletedInstances` and adds nothing to the
    /// output collection, but the loop still advances.
    pub(crate) fn item_cancelled(&mut self, item: ExecRef, reason: EndReason) -> EngineResult<()> {
        self.item_ended(item, Some(reason))
    }

    fn item_ended(&mut self, item: ExecRef, cancelled: Option<EndReason>) -> EngineResult<()> {
        let def = self.definition(item.instance_id)?;
        let (activity_id, index) = match &self.execution(item)?.kind {
            ExecutionKind::MultiInstanceItem { activity_id, index } => (activity_id.clone(), *index),
            other => {
                return Err(EngineError::IllegalState(format!(
                    "{item} ({other:?}) is not a multi-instance item"
                )))
            }
        };
        let spec = def
            .element(&activity_id)?
            .multi_instance
            .clone()
            .unwrap_or_default();
        let body = self.parent_of(item)?;

        let output = match (&cancelled, spec.output_element.as_deref()) {
            (None, Some(name)) => Some(
                self.instance(item.instance_id)?
                    .get_variable(item.execution, name)
                    .cloned()
                    .unwrap_or(Value::Null),
            ),
            _ => None,
        };

        match &cancelled {
            None => {
                self.emit(EngineEvent::ActivityCompleted {
                    at: item,
                    activity_id: activity_id.clone(),
                });
                self.end_execution(item, EndReason::Completed)?;
            }
            Some(reason) => self.end_execution(item, reason.clone())?,
        }

        let inst = self.instance_mut(item.instance_id)?;
        let (completed, total, next_index) =
            match inst.tree.get_mut(body.execution).map(|e| &mut e.kind) {
                Some(ExecutionKind::MultiInstanceBody { progress, .. }) => {
                    if cancelled.is_none() {
                        progress.completed += 1;
                    }
                    if let Some(value) = output {
                        progress.outputs.insert(index, value);
                    }
                    (progress.completed, progress.total, progress.next_index)
                }
                _ => return Err(not_a_body(body)),
            };
        let active = inst.tree.children(body.execution).len();
        inst.variables
            .set_local(body.execution, NR_OF_COMPLETED_INSTANCES, json!(completed));
        inst.variables
            .set_local(body.execution, NR_OF_ACTIVE_INSTANCES, json!(active));

        let condition_met = match &spec.completion_condition {
            Some(expr) => {
                let vars = self.visible(body)?;
                self.core().expressions.evaluate_bool(expr, &vars)?
            }
            None => false,
        };
        tracing::debug!(
            execution = %item,
            activity = %activity_id,
            index,
            completed,
            total,
            condition_met,
            cancelled = cancelled.is_some(),
            "multi-instance item ended"
        );

        if condition_met {
            let remaining = self.instance(item.instance_id)?.tree.children(body.execution).to_vec();
            for other in remaining {
                self.end_execution(
                    ExecRef::new(item.instance_id, other),
                    EndReason::CompletionConditionMet,
                )?;
            }
            return self.finish_multi_instance(body, &spec);
        }
        if spec.sequential && next_index < total {
            return self.create_item(body, &activity_id, next_index, false);
        }
        if active == 0 {
            return self.finish_multi_instance(body, &spec);
        }
        Ok(())
    }

    /// Write the output collection and leave the activity, once.
    fn finish_multi_instance(&mut self, body: ExecRef, spec: &MultiInstanceSpec) -> EngineResult<()> {
        if !self.is_live(body) {
            return Ok(());
        }
        let branch = self.parent_of(body)?;
        let outputs: Vec<Value> = match &self.execution(body)?.kind {
            ExecutionKind::MultiInstanceBody { progress, .. } => {
                progress.outputs.values().cloned().collect()
            }
            _ => return Err(not_a_body(body)),
        };
        self.end_execution(body, EndReason::Completed)?;
        if let Some(name) = &spec.output_collection {
            self.set_variables(branch, &Variables::from([(name.clone(), Value::Array(outputs))]))?;
        }
        self.push(Op::Complete { at: branch });
        Ok(())
    }
}

fn not_a_body(at: ExecRef) -> EngineError {
    EngineError::IllegalState(format!("{at} is not a multi-instance body"))
}
