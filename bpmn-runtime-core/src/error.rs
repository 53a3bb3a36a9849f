use uuid::Uuid;

use crate::model::ModelIssue;
use crate::subscription::SubscriptionKind;

/// Errors surfaced by engine commands.
///
/// Model errors and state errors are fatal to the command that raised them:
/// the unit of work is dropped and nothing it mutated becomes visible.
/// Business errors (BPMN error events) never appear here; they are routed
/// through the error-propagation walk instead.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    // ── Model errors ──
    #[error("No outgoing flow of {activity_id} matched and no default flow is defined")]
    NoMatchingFlow { activity_id: String },

    #[error("No subscription matches {kind:?} {name} (correlation key: {correlation_key:?})")]
    NoMatchingSubscription {
        kind: SubscriptionKind,
        name: String,
        correlation_key: Option<serde_json::Value>,
    },

    #[error("Message {name} (correlation key: {correlation_key:?}) matches {matches} targets")]
    AmbiguousCorrelation {
        name: String,
        correlation_key: Option<serde_json::Value>,
        matches: usize,
    },

    #[error("Unknown activity {activity_id} in definition {definition_id}")]
    UnknownActivity {
        definition_id: String,
        activity_id: String,
    },

    #[error("Unknown process definition: {0}")]
    UnknownDefinition(String),

    #[error("Invalid process model: {}", format_issues(.0))]
    InvalidModel(Vec<ModelIssue>),

    #[error("Expression `{expression}` failed: {message}")]
    Expression { expression: String, message: String },

    // ── Authorization / state errors ──
    #[error("{actor} is not a candidate for task {task_id}")]
    NotACandidate { task_id: Uuid, actor: String },

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Invalid variable name: {0:?}")]
    InvalidVariableName(String),

    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("Process instance not found: {0}")]
    InstanceNotFound(Uuid),

    #[error("Execution {execution} not found in instance {instance_id}")]
    ExecutionNotFound { instance_id: Uuid, execution: String },

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    // ── Infrastructure ──
    #[error("Concurrent modification of instance(s) not resolved after {attempts} attempts")]
    ConcurrentModification { attempts: u32 },

    #[error("Command exceeded {limit} dispatch steps")]
    StepLimitExceeded { limit: usize },

    #[error("Service handler {handler} failed: {message}")]
    Service { handler: String, message: String },

    #[error("Store error: {0}")]
    Store(#[from] anyhow::Error),
}

impl EngineError {
    pub(crate) fn expression(expression: &str, message: impl std::fmt::Display) -> Self {
        EngineError::Expression {
            expression: expression.to_string(),
            message: message.to_string(),
        }
    }

    /// True for the caller-facing authorization/state family.
    pub fn is_state_error(&self) -> bool {
        matches!(
            self,
            EngineError::NotACandidate { .. }
                | EngineError::IllegalState(_)
                | EngineError::InvalidVariableName(_)
                | EngineError::TaskNotFound(_)
                | EngineError::InstanceNotFound(_)
                | EngineError::ExecutionNotFound { .. }
                | EngineError::JobNotFound(_)
        )
    }
}

fn format_issues(issues: &[ModelIssue]) -> String {
    issues
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
