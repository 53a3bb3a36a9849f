//! Arena-backed execution tree of one process instance.
//!
//! Executions reference each other by `ExecutionId`; the arena owns every
//! node. Control-flow tokens are `Branch` executions. Every other kind is a
//! scope: it owns boundary subscriptions and, for sub-processes and
//! multi-instance executions, a variable frame.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::types::{ExecutionId, ExecutionState, Timestamp};

/// Bookkeeping of a running multi-instance body.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MultiInstanceProgress {
    pub total: usize,
    /// Index of the next item to create (sequential mode).
    pub next_index: usize,
    pub completed: usize,
    /// Input collection, when the loop iterates one.
    pub items: Option<Vec<serde_json::Value>>,
    /// Output element per completed item index.
    pub outputs: BTreeMap<usize, serde_json::Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ExecutionKind {
    ProcessRoot,
    /// Concurrent or sequential control-flow token.
    Branch,
    /// Wraps a single activity that needs its own scope: embedded
    /// sub-process, call activity, or any activity carrying boundary events.
    ActivityScope { activity_id: String },
    MultiInstanceBody {
        activity_id: String,
        progress: MultiInstanceProgress,
    },
    MultiInstanceItem { activity_id: String, index: usize },
    EventSubProcess { activity_id: String },
}

impl ExecutionKind {
    /// Activity this scope was created for.
    pub fn owner_activity(&self) -> Option<&str> {
        match self {
            ExecutionKind::ProcessRoot | ExecutionKind::Branch => None,
            ExecutionKind::ActivityScope { activity_id }
            | ExecutionKind::MultiInstanceBody { activity_id, .. }
            | ExecutionKind::MultiInstanceItem { activity_id, .. }
            | ExecutionKind::EventSubProcess { activity_id } => Some(activity_id),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub parent: Option<ExecutionId>,
    pub children: Vec<ExecutionId>,
    pub activity_id: Option<String>,
    pub is_scope: bool,
    pub is_concurrent: bool,
    /// Eligible to receive a continue.
    pub is_active: bool,
    pub state: ExecutionState,
    pub kind: ExecutionKind,
    /// Child process instance started by a call activity.
    pub called_instance: Option<Uuid>,
    pub created_at: Timestamp,
}

impl Execution {
    pub fn is_branch(&self) -> bool {
        matches!(self.kind, ExecutionKind::Branch)
    }

    /// A scope executing its own activity (wrapper or multi-instance item).
    pub fn runs_own_activity(&self) -> bool {
        matches!(
            self.kind,
            ExecutionKind::ActivityScope { .. } | ExecutionKind::MultiInstanceItem { .. }
        ) && self.kind.owner_activity() == self.activity_id.as_deref()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionTree {
    nodes: BTreeMap<ExecutionId, Execution>,
    root: ExecutionId,
    next_id: u32,
}

impl ExecutionTree {
    pub fn new(created_at: Timestamp) -> Self {
        let root = ExecutionId(0);
        let mut nodes = BTreeMap::new();
        nodes.insert(
            root,
            Execution {
                id: root,
                parent: None,
                children: Vec::new(),
                activity_id: None,
                is_scope: true,
                is_concurrent: false,
                is_active: false,
                state: ExecutionState::Running,
                kind: ExecutionKind::ProcessRoot,
                called_instance: None,
                created_at,
            },
        );
        Self {
            nodes,
            root,
            next_id: 1,
        }
    }

    pub fn root(&self) -> ExecutionId {
        self.root
    }

    pub fn get(&self, id: ExecutionId) -> Option<&Execution> {
        self.nodes.get(&id)
    }

    pub fn get_mut(&mut self, id: ExecutionId) -> Option<&mut Execution> {
        self.nodes.get_mut(&id)
    }

    pub fn contains(&self, id: ExecutionId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Execution> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Create a child under `parent`. Returns `None` if the parent is gone.
    pub fn create_child(
        &mut self,
        parent: ExecutionId,
        activity_id: Option<String>,
        kind: ExecutionKind,
        concurrent: bool,
        created_at: Timestamp,
    ) -> Option<ExecutionId> {
        if !self.nodes.contains_key(&parent) {
            return None;
        }
        let id = ExecutionId(self.next_id);
        self.next_id += 1;
        let is_scope = !matches!(kind, ExecutionKind::Branch);
        self.nodes.insert(
            id,
            Execution {
                id,
                parent: Some(parent),
                children: Vec::new(),
                activity_id,
                is_scope,
                is_concurrent: concurrent,
                is_active: true,
                state: ExecutionState::Running,
                kind,
                called_instance: None,
                created_at,
            },
        );
        if let Some(p) = self.nodes.get_mut(&parent) {
            p.children.push(id);
        }
        Some(id)
    }

    pub fn move_to(&mut self, id: ExecutionId, activity_id: &str) {
        if let Some(e) = self.nodes.get_mut(&id) {
            e.activity_id = Some(activity_id.to_string());
            e.state = ExecutionState::Running;
            e.is_active = true;
        }
    }

    pub fn set_state(&mut self, id: ExecutionId, state: ExecutionState) {
        if let Some(e) = self.nodes.get_mut(&id) {
            e.state = state;
            e.is_active = state == ExecutionState::Running;
        }
    }

    pub fn children(&self, id: ExecutionId) -> &[ExecutionId] {
        self.nodes
            .get(&id)
            .map(|e| e.children.as_slice())
            .unwrap_or(&[])
    }

    pub fn parent(&self, id: ExecutionId) -> Option<ExecutionId> {
        self.nodes.get(&id).and_then(|e| e.parent)
    }

    /// `id` followed by its ancestors up to the root.
    pub fn lineage(&self, id: ExecutionId) -> Vec<ExecutionId> {
        let mut out = Vec::new();
        let mut cursor = self.nodes.get(&id).map(|e| e.id);
        while let Some(current) = cursor {
            out.push(current);
            cursor = self.parent(current);
        }
        out
    }

    /// Nearest scope execution, `id` itself included.
    pub fn nearest_scope(&self, id: ExecutionId) -> Option<ExecutionId> {
        self.lineage(id)
            .into_iter()
            .find(|e| self.nodes.get(e).is_some_and(|n| n.is_scope))
    }

    /// Descendants of `id` (excluding it), children before parents.
    pub fn descendants_post_order(&self, id: ExecutionId) -> Vec<ExecutionId> {
        let mut out = Vec::new();
        for child in self.children(id) {
            self.collect_post_order(*child, &mut out);
        }
        out
    }

    fn collect_post_order(&self, id: ExecutionId, out: &mut Vec<ExecutionId>) {
        for child in self.children(id) {
            self.collect_post_order(*child, out);
        }
        out.push(id);
    }

    /// Detach and drop a node. The root is only marked ended.
    pub fn remove(&mut self, id: ExecutionId) -> Option<Execution> {
        if id == self.root {
            self.set_state(id, ExecutionState::Ended);
            return None;
        }
        let node = self.nodes.remove(&id)?;
        if let Some(parent) = node.parent.and_then(|p| self.nodes.get_mut(&p)) {
            parent.children.retain(|c| *c != id);
        }
        Some(node)
    }

    /// Executions currently positioned at `activity_id`.
    pub fn at_activity<'a>(&'a self, activity_id: &'a str) -> impl Iterator<Item = &'a Execution> {
        self.nodes
            .values()
            .filter(move |e| e.activity_id.as_deref() == Some(activity_id))
    }

    /// Leaves that still hold a live control-flow position.
    pub fn active_leaves(&self) -> usize {
        self.nodes
            .values()
            .filter(|e| e.children.is_empty() && e.state != ExecutionState::Ended && e.id != self.root)
            .count()
    }

    /// Recompute `is_concurrent` for the branch children of `parent`.
    pub fn refresh_concurrency(&mut self, parent: ExecutionId) {
        let branches: Vec<ExecutionId> = self
            .children(parent)
            .iter()
            .copied()
            .filter(|c| self.nodes.get(c).is_some_and(Execution::is_branch))
            .collect();
        let concurrent = branches.len() > 1;
        for b in branches {
            if let Some(e) = self.nodes.get_mut(&b) {
                e.is_concurrent = concurrent;
            }
        }
    }
}
