//! Persisted state of one process instance.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::subscription::{EventSubscription, SubscriptionKind};
use crate::task::{Task, TaskSnapshot};
use crate::tree::{Execution, ExecutionTree};
use crate::types::{ExecRef, ExecutionId, ProcessState, Timestamp, Variables};
use crate::variables::{VariableRow, VariableScopes};

/// Arrivals at one converging gateway inside one scope execution.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JoinState {
    pub expected: usize,
    pub arrived: Vec<ExecutionId>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstanceState {
    pub instance_id: Uuid,
    pub definition_id: String,
    pub definition_version: String,
    pub business_key: Option<String>,
    pub state: ProcessState,
    pub tree: ExecutionTree,
    pub variables: VariableScopes,
    /// Live and finished tasks; finished ones stay for inspection.
    pub tasks: BTreeMap<Uuid, Task>,
    pub subscriptions: BTreeMap<Uuid, EventSubscription>,
    /// Keyed by [`join_key`].
    pub joins: BTreeMap<String, JoinState>,
    /// Token counts recorded by diverging inclusive gateways for their join.
    pub inclusive_expected: BTreeMap<String, usize>,
    /// Call activity waiting on this instance, if any.
    pub super_execution: Option<ExecRef>,
    pub created_at: Timestamp,
    pub ended_at: Option<Timestamp>,
}

/// Join bookkeeping key: gateway within a scope execution.
pub fn join_key(scope: ExecutionId, gateway_id: &str) -> String {
    format!("{}:{gateway_id}", scope.0)
}

impl InstanceState {
    pub fn new(
        instance_id: Uuid,
        definition_id: &str,
        definition_version: String,
        business_key: Option<String>,
        super_execution: Option<ExecRef>,
        now: Timestamp,
    ) -> Self {
        let tree = ExecutionTree::new(now);
        let mut variables = VariableScopes::default();
        variables.create_frame(tree.root());
        Self {
            instance_id,
            definition_id: definition_id.to_string(),
            definition_version,
            business_key,
            state: ProcessState::Running,
            tree,
            variables,
            tasks: BTreeMap::new(),
            subscriptions: BTreeMap::new(),
            joins: BTreeMap::new(),
            inclusive_expected: BTreeMap::new(),
            super_execution,
            created_at: now,
            ended_at: None,
        }
    }

    pub fn root(&self) -> ExecutionId {
        self.tree.root()
    }

    pub fn exec_ref(&self, execution: ExecutionId) -> ExecRef {
        ExecRef::new(self.instance_id, execution)
    }

    pub fn execution(&self, id: ExecutionId) -> EngineResult<&Execution> {
        self.tree.get(id).ok_or_else(|| EngineError::ExecutionNotFound {
            instance_id: self.instance_id,
            execution: id.to_string(),
        })
    }

    pub fn is_running(&self) -> bool {
        !self.state.is_terminal()
    }

    /// Frames visible from `id`, nearest first.
    pub fn scope_chain(&self, id: ExecutionId) -> Vec<ExecutionId> {
        self.tree
            .lineage(id)
            .into_iter()
            .filter(|e| self.variables.has_frame(*e))
            .collect()
    }

    pub fn visible_variables(&self, id: ExecutionId) -> Variables {
        self.variables.visible(&self.scope_chain(id))
    }

    pub fn get_variable(&self, id: ExecutionId, name: &str) -> Option<&serde_json::Value> {
        self.variables.get(&self.scope_chain(id), name)
    }

    pub fn set_variables(&mut self, id: ExecutionId, vars: &Variables) {
        let chain = self.scope_chain(id);
        self.variables.set_all(&chain, vars);
    }

    pub fn live_tasks_of(&self, execution: ExecutionId) -> impl Iterator<Item = &Task> {
        self.tasks
            .values()
            .filter(move |t| t.execution == execution && !t.status.is_terminal())
    }

    pub fn subscriptions_of(&self, execution: ExecutionId) -> impl Iterator<Item = &EventSubscription> {
        self.subscriptions
            .values()
            .filter(move |s| s.execution == execution)
    }

    pub fn subscriptions_matching<'a>(
        &'a self,
        kind: SubscriptionKind,
        key: &'a str,
    ) -> impl Iterator<Item = &'a EventSubscription> {
        self.subscriptions
            .values()
            .filter(move |s| s.kind == kind && s.key == key)
    }

    /// Child instances started by call activities.
    pub fn called_instances(&self) -> Vec<Uuid> {
        self.tree.iter().filter_map(|e| e.called_instance).collect()
    }

    pub fn snapshot(&self) -> InstanceSnapshot {
        InstanceSnapshot {
            instance_id: self.instance_id,
            definition_id: self.definition_id.clone(),
            business_key: self.business_key.clone(),
            state: self.state.clone(),
            executions: self.tree.iter().cloned().collect(),
            variables: self.variables.rows(),
            root_variables: self
                .variables
                .frame(self.root())
                .cloned()
                .unwrap_or_default(),
            tasks: self.tasks.values().map(Task::snapshot).collect(),
            subscriptions: self.subscriptions.values().cloned().collect(),
            super_execution: self.super_execution,
            created_at: self.created_at,
            ended_at: self.ended_at,
        }
    }
}

/// Read-only view for operators and tests.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub instance_id: Uuid,
    pub definition_id: String,
    pub business_key: Option<String>,
    pub state: ProcessState,
    pub executions: Vec<Execution>,
    pub variables: Vec<VariableRow>,
    pub root_variables: Variables,
    pub tasks: Vec<TaskSnapshot>,
    pub subscriptions: Vec<EventSubscription>,
    pub super_execution: Option<ExecRef>,
    pub created_at: Timestamp,
    pub ended_at: Option<Timestamp>,
}

impl InstanceSnapshot {
    /// Executions positioned at `activity_id`.
    pub fn executions_at(&self, activity_id: &str) -> Vec<&Execution> {
        self.executions
            .iter()
            .filter(|e| e.activity_id.as_deref() == Some(activity_id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::ExecutionKind;
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn test_scope_chain_skips_frameless_executions() {
        let now = Utc::now();
        let mut state = InstanceState::new(Uuid::now_v7(), "p", "v".into(), None, None, now);
        let root = state.root();
        let branch = state
            .tree
            .create_child(root, Some("sub".into()), ExecutionKind::Branch, false, now)
            .unwrap();
        let sub = state
            .tree
            .create_child(
                branch,
                Some("sub".into()),
                ExecutionKind::ActivityScope {
                    activity_id: "sub".into(),
                },
                false,
                now,
            )
            .unwrap();
        state.variables.create_frame(sub);
        let inner = state
            .tree
            .create_child(sub, Some("t".into()), ExecutionKind::Branch, false, now)
            .unwrap();

        assert_eq!(state.scope_chain(inner), vec![sub, root]);
        assert_eq!(state.scope_chain(branch), vec![root]);

        state.set_variables(
            inner,
            &Variables::from([("local".to_string(), json!(1))]),
        );
        assert_eq!(state.get_variable(inner, "local"), Some(&json!(1)));
        assert_eq!(state.get_variable(branch, "local"), None);
    }

    #[test]
    fn test_join_key_format() {
        assert_eq!(join_key(ExecutionId(4), "join"), "4:join");
    }
}
