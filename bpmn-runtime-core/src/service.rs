//! Service-task handlers.
//!
//! A handler receives the visible variables of the calling execution and
//! either returns output variables or raises a business error code, which
//! enters error propagation like an error end event. Any `Err` is a
//! technical failure: inline it aborts the command, as a job it is retried.

use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::types::{ExecRef, Variables};

#[derive(Clone, Debug, PartialEq)]
pub struct ServiceContext {
    pub instance_id: Uuid,
    pub execution: ExecRef,
    pub activity_id: String,
    pub business_key: Option<String>,
    pub variables: Variables,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ServiceOutcome {
    /// Merge these variables into the execution's scope and continue.
    Complete(Variables),
    /// Throw a BPMN error with this code.
    BusinessError { code: String },
}

pub trait ServiceHandler: Send + Sync {
    fn execute(&self, ctx: &ServiceContext) -> anyhow::Result<ServiceOutcome>;
}

impl<F> ServiceHandler for F
where
    F: Fn(&ServiceContext) -> anyhow::Result<ServiceOutcome> + Send + Sync,
{
    fn execute(&self, ctx: &ServiceContext) -> anyhow::Result<ServiceOutcome> {
        self(ctx)
    }
}

/// Handlers by the name service tasks reference.
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    handlers: HashMap<String, Arc<dyn ServiceHandler>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any handler already registered under `name`.
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn ServiceHandler>) {
        let name = name.into();
        if self.handlers.insert(name.clone(), handler).is_some() {
            tracing::warn!(handler = %name, "service handler replaced");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ServiceHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.names().collect();
        names.sort_unstable();
        f.debug_struct("ServiceRegistry")
            .field("handlers", &names)
            .finish()
    }
}
