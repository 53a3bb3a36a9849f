use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

// ─── Scalar aliases ───────────────────────────────────────────

/// Wall-clock instant (UTC).
pub type Timestamp = DateTime<Utc>;

/// Variable payloads exchanged with callers and stored in scopes.
pub type Variables = BTreeMap<String, serde_json::Value>;

/// Arena index of an execution inside one process instance's tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(pub u32);

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "exec#{}", self.0)
    }
}

/// Fully qualified execution address: instance + arena index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ExecRef {
    pub instance_id: Uuid,
    pub execution: ExecutionId,
}

impl ExecRef {
    pub fn new(instance_id: Uuid, execution: ExecutionId) -> Self {
        Self {
            instance_id,
            execution,
        }
    }
}

impl std::fmt::Display for ExecRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.instance_id, self.execution)
    }
}

// ─── Execution / process state ────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionState {
    Running,
    Waiting,
    Ended,
}

/// Top-level process state.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum ProcessState {
    Running,
    Completed { at: Timestamp },
    Terminated { at: Timestamp },
    Cancelled { reason: String, at: Timestamp },
    /// Ended by a business error nobody caught.
    Failed { error_code: String, at: Timestamp },
}

impl ProcessState {
    /// Returns true if the process is in a terminal state (no further progress possible).
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProcessState::Running)
    }
}

/// Why an execution ended. Everything except `Completed` is a cancellation
/// and is reported to observers as such.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndReason {
    Completed,
    BoundaryInterrupted { boundary_id: String },
    CompletionConditionMet,
    ErrorPropagated { error_code: String },
    EventSubProcessInterrupted { event_sub_process_id: String },
    Terminated,
    ProcessDeleted { reason: String },
    TaskDeleted { reason: String },
}

impl EndReason {
    pub fn is_cancellation(&self) -> bool {
        !matches!(self, EndReason::Completed)
    }
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndReason::Completed => write!(f, "completed"),
            EndReason::BoundaryInterrupted { boundary_id } => {
                write!(f, "interrupted by boundary event {boundary_id}")
            }
            EndReason::CompletionConditionMet => {
                write!(f, "multi-instance completion condition met")
            }
            EndReason::ErrorPropagated { error_code } => {
                write!(f, "error {error_code} propagated")
            }
            EndReason::EventSubProcessInterrupted {
                event_sub_process_id,
            } => write!(f, "interrupted by event sub-process {event_sub_process_id}"),
            EndReason::Terminated => write!(f, "terminated"),
            EndReason::ProcessDeleted { reason } => write!(f, "process deleted: {reason}"),
            EndReason::TaskDeleted { reason } => write!(f, "task deleted: {reason}"),
        }
    }
}

// ─── Actors ───────────────────────────────────────────────────

/// The principal issuing a task command. Authorization policy lives outside
/// the engine; `admin` is the administrative override hook.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: String,
    #[serde(default)]
    pub groups: BTreeSet<String>,
    #[serde(default)]
    pub admin: bool,
}

impl Actor {
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            groups: BTreeSet::new(),
            admin: false,
        }
    }

    pub fn admin(user_id: impl Into<String>) -> Self {
        Self {
            admin: true,
            ..Self::user(user_id)
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.groups.insert(group.into());
        self
    }
}

/// Returned by `start_process_instance`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionHandle {
    pub instance_id: Uuid,
    pub root_execution: ExecutionId,
    pub definition_id: String,
    pub business_key: Option<String>,
    /// State right after the start command committed.
    pub state: ProcessState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_end_reason_cancellation() {
        assert!(!EndReason::Completed.is_cancellation());
        assert!(EndReason::CompletionConditionMet.is_cancellation());
        assert_eq!(
            EndReason::CompletionConditionMet.to_string(),
            "multi-instance completion condition met"
        );
    }

    #[test]
    fn test_process_state_terminal() {
        assert!(!ProcessState::Running.is_terminal());
        assert!(ProcessState::Completed { at: Utc::now() }.is_terminal());
    }
}
