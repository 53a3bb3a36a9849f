//! BPMN Runtime Core
//!
//! Execution runtime for a validated process model: execution tree, behavior
//! dispatch, multi-instance coordination, event correlation, job scheduling
//! and the human-task lifecycle, all behind one transactional engine facade.
//!
//! # Architecture
//!
//! ```text
//! command (start / complete task / signal / message / job)
//!       │
//!       ▼
//! ┌─────────────────────────────────────────┐
//! │  ProcessEngine::run_command             │
//! │  load instance family → UnitOfWork      │
//! └─────────────────────────────────────────┘
//!       │
//!       ▼
//! ┌─────────────────────────────────────────┐
//! │  Runtime agenda (Enter/Execute/         │
//! │  Complete/ScopeCompleted)               │
//! │  behaviors · MI · correlation · errors  │
//! └─────────────────────────────────────────┘
//!       │
//!       ▼
//! ┌─────────────────────────────────────────┐
//! │  RuntimeStore::commit (optimistic)      │
//! │  conflict → re-run the whole command    │
//! └─────────────────────────────────────────┘
//!       │
//!       ├─── EventSink::publish (after commit)
//!       └─── thrown signals → signal-throw jobs, run as follow-up commands
//! ```

pub mod clock;
pub mod config;
pub mod correlation;
mod dispatch;
pub mod engine;
pub mod error;
pub mod events;
pub mod expression;
pub mod job;
pub mod model;
pub mod multi_instance;
pub mod scheduler;
pub mod service;
pub mod state;
pub mod store;
pub mod store_memory;
pub mod subscription;
pub mod task;
pub mod tree;
pub mod types;
mod uow;
pub mod variables;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use correlation::MessageCorrelation;
pub use engine::{ProcessEngine, ProcessEngineBuilder};
pub use error::{EngineError, EngineResult};
pub use events::{ChannelListener, EngineEvent, EventListener, EventSink, RecordingListener};
pub use job::{ClaimedJob, Job, JobHandler, JobKind, JobOutcome, JobState};
pub use model::{DefinitionRegistry, ProcessDefinition, ProcessModel, ProcessModelBuilder};
pub use scheduler::{JobScheduler, JobWorker};
pub use service::{ServiceContext, ServiceHandler, ServiceOutcome, ServiceRegistry};
pub use state::InstanceSnapshot;
pub use store::RuntimeStore;
pub use store_memory::MemoryStore;
pub use subscription::{EventSubscription, SubscriptionKind};
pub use task::{TaskSnapshot, TaskStatus};
pub use tree::{Execution, ExecutionKind};
pub use types::{
    Actor, EndReason, ExecRef, ExecutionHandle, ExecutionId, ExecutionState, ProcessState,
    Timestamp, Variables,
};
