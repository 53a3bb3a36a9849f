//! Read-only process model consumed by the engine.
//!
//! Producing a model from a textual definition is somebody else's job; the
//! engine only needs the typed graph below. `ProcessModelBuilder` assembles
//! one in code, `ProcessDefinition` validates and indexes it.

mod builder;
mod definition;
mod validate;

pub use builder::ProcessModelBuilder;
pub use definition::{DefinitionRegistry, ProcessDefinition};
pub use validate::ModelIssue;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A complete process: the top-level flow scope plus its id.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ProcessModel {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub elements: Vec<FlowElement>,
    pub flows: Vec<SequenceFlow>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SequenceFlow {
    pub id: String,
    pub source: String,
    pub target: String,
    /// Guard expression; `None` means unconditional.
    #[serde(default)]
    pub condition: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FlowElement {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub kind: ElementKind,
    /// Enter through an async-continuation job instead of inline.
    #[serde(default)]
    pub async_before: bool,
    #[serde(default)]
    pub multi_instance: Option<MultiInstanceSpec>,
}

impl FlowElement {
    pub fn new(id: impl Into<String>, kind: ElementKind) -> Self {
        Self {
            id: id.into(),
            name: None,
            kind,
            async_before: false,
            multi_instance: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn async_before(mut self) -> Self {
        self.async_before = true;
        self
    }

    pub fn with_multi_instance(mut self, spec: MultiInstanceSpec) -> Self {
        self.multi_instance = Some(spec);
        self
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Elements that can appear as targets of sequence flows.
    pub fn is_flow_node(&self) -> bool {
        !matches!(
            self.kind,
            ElementKind::BoundaryEvent(_) | ElementKind::EventSubProcess(_)
        )
    }

    /// Activities may carry boundary events and loop characteristics.
    pub fn is_activity(&self) -> bool {
        matches!(
            self.kind,
            ElementKind::Task
                | ElementKind::UserTask(_)
                | ElementKind::ServiceTask(_)
                | ElementKind::ReceiveTask(_)
                | ElementKind::SubProcess(_)
                | ElementKind::CallActivity(_)
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum ElementKind {
    StartEvent(StartTrigger),
    EndEvent(EndKind),
    /// Plain task: pass-through.
    Task,
    UserTask(UserTaskSpec),
    ServiceTask(ServiceTaskSpec),
    ReceiveTask(MessageRef),
    IntermediateCatch(CatchTrigger),
    IntermediateThrow(ThrowKind),
    ExclusiveGateway {
        #[serde(default)]
        default_flow: Option<String>,
    },
    ParallelGateway,
    InclusiveGateway {
        #[serde(default)]
        default_flow: Option<String>,
        /// Converging gateway whose expected token count this fork records.
        #[serde(default)]
        join: Option<String>,
    },
    SubProcess(FlowScope),
    EventSubProcess(FlowScope),
    CallActivity(CallActivitySpec),
    BoundaryEvent(BoundarySpec),
}

/// Nested element list of a sub-process.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct FlowScope {
    pub elements: Vec<FlowElement>,
    pub flows: Vec<SequenceFlow>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum StartTrigger {
    None,
    Signal(String),
    Message(String),
    /// Only valid inside an event sub-process. `None` catches any code.
    Error(Option<String>),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum EndKind {
    None,
    Terminate,
    Error(String),
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct UserTaskSpec {
    /// Expression resolving to the initial assignee.
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub candidate_users: Vec<String>,
    #[serde(default)]
    pub candidate_groups: Vec<String>,
    /// Task-local variables copied to the process on completion.
    #[serde(default)]
    pub output_mappings: Vec<VariableMapping>,
}

impl UserTaskSpec {
    pub fn assignee(mut self, expr: impl Into<String>) -> Self {
        self.assignee = Some(expr.into());
        self
    }

    pub fn candidate_user(mut self, user: impl Into<String>) -> Self {
        self.candidate_users.push(user.into());
        self
    }

    pub fn candidate_group(mut self, group: impl Into<String>) -> Self {
        self.candidate_groups.push(group.into());
        self
    }

    pub fn output(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.output_mappings.push(VariableMapping::new(source, target));
        self
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct VariableMapping {
    pub source: String,
    pub target: String,
}

impl VariableMapping {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ServiceTaskSpec {
    /// Name of the registered `ServiceHandler`.
    pub handler: String,
    /// Overrides the configured default when run as a job.
    #[serde(default)]
    pub retries: Option<u32>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MessageRef {
    pub name: String,
    /// Evaluated once at subscription time against the waiting execution.
    #[serde(default)]
    pub correlation_key: Option<String>,
}

impl MessageRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            correlation_key: None,
        }
    }

    pub fn correlated_by(mut self, expr: impl Into<String>) -> Self {
        self.correlation_key = Some(expr.into());
        self
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum CatchTrigger {
    Signal(String),
    Message(MessageRef),
    Timer(TimerSpec),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum ThrowKind {
    None,
    Signal(String),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum TimerSpec {
    Duration(Duration),
    Date(DateTime<Utc>),
    /// Fires every `interval`; `repetitions: None` repeats while the owner lives.
    Cycle {
        interval: Duration,
        repetitions: Option<u32>,
    },
    /// Evaluates to milliseconds from now, or an RFC 3339 date string.
    Expression(String),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CallActivitySpec {
    pub called_element: String,
    #[serde(default)]
    pub inputs: Vec<VariableMapping>,
    #[serde(default)]
    pub outputs: Vec<VariableMapping>,
    /// Copy every visible variable into the called instance.
    #[serde(default)]
    pub inherit_variables: bool,
}

impl CallActivitySpec {
    pub fn new(called_element: impl Into<String>) -> Self {
        Self {
            called_element: called_element.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            inherit_variables: false,
        }
    }

    pub fn input(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.inputs.push(VariableMapping::new(source, target));
        self
    }

    pub fn output(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.outputs.push(VariableMapping::new(source, target));
        self
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BoundarySpec {
    pub attached_to: String,
    pub trigger: BoundaryTrigger,
    #[serde(default = "default_true")]
    pub cancel_activity: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum BoundaryTrigger {
    Timer(TimerSpec),
    Signal(String),
    Message(MessageRef),
    /// `None` catches any error code.
    Error(Option<String>),
}

/// Loop characteristics of a multi-instance activity.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct MultiInstanceSpec {
    pub sequential: bool,
    /// Expression yielding the instance count.
    #[serde(default)]
    pub cardinality: Option<String>,
    /// Expression yielding an array; one instance per element.
    #[serde(default)]
    pub collection: Option<String>,
    /// Per-instance variable bound to the current element.
    #[serde(default)]
    pub element_variable: Option<String>,
    #[serde(default)]
    pub completion_condition: Option<String>,
    /// Parent-scope variable receiving the per-instance outputs.
    #[serde(default)]
    pub output_collection: Option<String>,
    /// Instance variable appended to `output_collection`.
    #[serde(default)]
    pub output_element: Option<String>,
}

impl MultiInstanceSpec {
    pub fn parallel() -> Self {
        Self::default()
    }

    pub fn sequential() -> Self {
        Self {
            sequential: true,
            ..Self::default()
        }
    }

    pub fn cardinality(mut self, expr: impl Into<String>) -> Self {
        self.cardinality = Some(expr.into());
        self
    }

    pub fn collection(mut self, expr: impl Into<String>, element: impl Into<String>) -> Self {
        self.collection = Some(expr.into());
        self.element_variable = Some(element.into());
        self
    }

    pub fn completion_condition(mut self, expr: impl Into<String>) -> Self {
        self.completion_condition = Some(expr.into());
        self
    }

    pub fn output(mut self, element: impl Into<String>, collection: impl Into<String>) -> Self {
        self.output_element = Some(element.into());
        self.output_collection = Some(collection.into());
        self
    }
}
