//! Human-task state machine.
//!
//! ```text
//! CREATED --claim--> ASSIGNED --complete--> COMPLETED
//!    ^                  |
//!    +-----release------+
//! any non-terminal --cancel--> CANCELLED
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::model::VariableMapping;
use crate::types::{Actor, ExecRef, ExecutionId, Timestamp, Variables};
use crate::variables::validate_variables;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Created,
    Assigned,
    Completed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Cancelled)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub execution: ExecutionId,
    pub activity_id: String,
    pub name: String,
    /// Resolved from the assignee expression. Claimable by this user
    /// even when not in the candidate sets.
    pub designated_assignee: Option<String>,
    pub assignee: Option<String>,
    pub candidate_users: BTreeSet<String>,
    pub candidate_groups: BTreeSet<String>,
    pub status: TaskStatus,
    /// Discarded with the task unless output-mapped.
    pub local_variables: Variables,
    pub output_mappings: Vec<VariableMapping>,
    pub created_at: Timestamp,
    pub claimed_at: Option<Timestamp>,
    pub ended_at: Option<Timestamp>,
    pub cancel_reason: Option<String>,
}

impl Task {
    pub fn exec_ref(&self) -> ExecRef {
        ExecRef::new(self.instance_id, self.execution)
    }

    pub fn is_candidate(&self, actor: &Actor) -> bool {
        actor.admin
            || self.designated_assignee.as_deref() == Some(actor.user_id.as_str())
            || self.candidate_users.contains(&actor.user_id)
            || !self.candidate_groups.is_disjoint(&actor.groups)
    }

    fn is_owner(&self, actor: &Actor) -> bool {
        actor.admin || self.assignee.as_deref() == Some(actor.user_id.as_str())
    }

    fn not_candidate(&self, actor: &Actor) -> EngineError {
        EngineError::NotACandidate {
            task_id: self.id,
            actor: actor.user_id.clone(),
        }
    }

    fn illegal(&self, what: &str) -> EngineError {
        EngineError::IllegalState(format!(
            "task {} ({:?}, assignee {:?}): {what}",
            self.id, self.status, self.assignee
        ))
    }

    pub fn claim(&mut self, actor: &Actor, now: Timestamp) -> EngineResult<()> {
        match self.status {
            TaskStatus::Created => {
                if !self.is_candidate(actor) {
                    return Err(self.not_candidate(actor));
                }
                self.assignee = Some(actor.user_id.clone());
                self.status = TaskStatus::Assigned;
                self.claimed_at = Some(now);
                Ok(())
            }
            // Re-claim by the holder is a no-op.
            TaskStatus::Assigned if self.assignee.as_deref() == Some(actor.user_id.as_str()) => {
                Ok(())
            }
            TaskStatus::Assigned => Err(self.illegal("already claimed by another user")),
            TaskStatus::Completed | TaskStatus::Cancelled => {
                Err(self.illegal("cannot claim a finished task"))
            }
        }
    }

    pub fn release(&mut self, actor: &Actor) -> EngineResult<()> {
        if self.status != TaskStatus::Assigned {
            return Err(self.illegal("only assigned tasks can be released"));
        }
        if !self.is_owner(actor) {
            return Err(self.illegal(&format!("{} is not the assignee", actor.user_id)));
        }
        self.assignee = None;
        self.claimed_at = None;
        self.status = TaskStatus::Created;
        Ok(())
    }

    /// Every precondition of `complete`, checked without mutating anything.
    pub fn check_completable(&self, actor: &Actor, vars: &Variables) -> EngineResult<()> {
        if self.status != TaskStatus::Assigned {
            return Err(self.illegal("only assigned tasks can be completed"));
        }
        if !self.is_owner(actor) {
            return Err(self.illegal(&format!("{} is not the assignee", actor.user_id)));
        }
        validate_variables(vars)
    }

    pub fn complete(&mut self, now: Timestamp) {
        self.status = TaskStatus::Completed;
        self.ended_at = Some(now);
    }

    pub fn update_variables(&mut self, actor: &Actor, vars: &Variables) -> EngineResult<()> {
        if self.status.is_terminal() {
            return Err(self.illegal("cannot update a finished task"));
        }
        if !self.is_owner(actor) {
            return Err(self.illegal(&format!("{} is not the assignee", actor.user_id)));
        }
        validate_variables(vars)?;
        self.local_variables
            .extend(vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    /// Idempotent: finished tasks stay as they are.
    pub fn cancel(&mut self, reason: impl Into<String>, now: Timestamp) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = TaskStatus::Cancelled;
        self.cancel_reason = Some(reason.into());
        self.ended_at = Some(now);
        true
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id,
            instance_id: self.instance_id,
            execution: self.execution,
            activity_id: self.activity_id.clone(),
            name: self.name.clone(),
            assignee: self.assignee.clone(),
            candidate_users: self.candidate_users.clone(),
            candidate_groups: self.candidate_groups.clone(),
            status: self.status,
            local_variables: self.local_variables.clone(),
            created_at: self.created_at,
            ended_at: self.ended_at,
            cancel_reason: self.cancel_reason.clone(),
        }
    }
}

/// Caller-facing copy of a task.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub execution: ExecutionId,
    pub activity_id: String,
    pub name: String,
    pub assignee: Option<String>,
    pub candidate_users: BTreeSet<String>,
    pub candidate_groups: BTreeSet<String>,
    pub status: TaskStatus,
    pub local_variables: Variables,
    pub created_at: Timestamp,
    pub ended_at: Option<Timestamp>,
    pub cancel_reason: Option<String>,
}
