use super::validate::{scopes, validate_model};
use super::*;
use crate::error::{EngineError, EngineResult};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

#[derive(Debug, Clone)]
struct ElementEntry {
    element: FlowElement,
    /// Containing sub-process, `None` at process level.
    scope: Option<String>,
}

/// A validated process model with the lookups the dispatcher needs.
#[derive(Debug, Clone)]
pub struct ProcessDefinition {
    model: ProcessModel,
    version: [u8; 32],
    elements: HashMap<String, ElementEntry>,
    outgoing: HashMap<String, Vec<SequenceFlow>>,
    incoming: HashMap<String, usize>,
    boundaries: HashMap<String, Vec<String>>,
    none_starts: HashMap<Option<String>, String>,
    event_sub_processes: HashMap<Option<String>, Vec<String>>,
    event_sub_process_starts: HashMap<String, String>,
    signal_starts: BTreeMap<String, String>,
    message_starts: BTreeMap<String, String>,
}

impl ProcessDefinition {
    pub fn new(model: ProcessModel) -> EngineResult<Self> {
        let issues = validate_model(&model);
        if !issues.is_empty() {
            return Err(EngineError::InvalidModel(issues));
        }

        let canonical = serde_json::to_string(&model).map_err(unserializable_model)?;
        let version: [u8; 32] = Sha256::digest(canonical.as_bytes()).into();

        let mut def = ProcessDefinition {
            model: ProcessModel {
                id: model.id.clone(),
                name: model.name.clone(),
                elements: Vec::new(),
                flows: Vec::new(),
            },
            version,
            elements: HashMap::new(),
            outgoing: HashMap::new(),
            incoming: HashMap::new(),
            boundaries: HashMap::new(),
            none_starts: HashMap::new(),
            event_sub_processes: HashMap::new(),
            event_sub_process_starts: HashMap::new(),
            signal_starts: BTreeMap::new(),
            message_starts: BTreeMap::new(),
        };

        for scope in scopes(&model) {
            let scope_key = scope.id.map(str::to_string);
            for el in scope.elements {
                def.elements.insert(
                    el.id.clone(),
                    ElementEntry {
                        element: el.clone(),
                        scope: scope_key.clone(),
                    },
                );
                match &el.kind {
                    ElementKind::StartEvent(StartTrigger::None) => {
                        def.none_starts.insert(scope_key.clone(), el.id.clone());
                    }
                    ElementKind::StartEvent(StartTrigger::Signal(name)) => {
                        def.signal_starts.insert(name.clone(), el.id.clone());
                    }
                    ElementKind::StartEvent(StartTrigger::Message(name)) => {
                        def.message_starts.insert(name.clone(), el.id.clone());
                    }
                    ElementKind::StartEvent(StartTrigger::Error(_)) => {
                        if let Some(esp) = scope.id {
                            def.event_sub_process_starts
                                .insert(esp.to_string(), el.id.clone());
                        }
                    }
                    ElementKind::EventSubProcess(_) => {
                        def.event_sub_processes
                            .entry(scope_key.clone())
                            .or_default()
                            .push(el.id.clone());
                    }
                    ElementKind::BoundaryEvent(spec) => {
                        def.boundaries
                            .entry(spec.attached_to.clone())
                            .or_default()
                            .push(el.id.clone());
                    }
                    _ => {}
                }
            }
            // Declaration order is the evaluation order for guards.
            for flow in scope.flows {
                def.outgoing
                    .entry(flow.source.clone())
                    .or_default()
                    .push(flow.clone());
                *def.incoming.entry(flow.target.clone()).or_default() += 1;
            }
        }

        def.model = model;
        Ok(def)
    }

    pub fn id(&self) -> &str {
        &self.model.id
    }

    pub fn model(&self) -> &ProcessModel {
        &self.model
    }

    pub fn version(&self) -> [u8; 32] {
        self.version
    }

    pub fn version_hex(&self) -> String {
        hex::encode(self.version)
    }

    pub fn element(&self, id: &str) -> EngineResult<&FlowElement> {
        self.elements
            .get(id)
            .map(|e| &e.element)
            .ok_or_else(|| EngineError::UnknownActivity {
                definition_id: self.model.id.clone(),
                activity_id: id.to_string(),
            })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.elements.contains_key(id)
    }

    /// Containing sub-process of an element; `None` at process level.
    pub fn scope_of(&self, id: &str) -> Option<&str> {
        self.elements.get(id).and_then(|e| e.scope.as_deref())
    }

    pub fn outgoing(&self, id: &str) -> &[SequenceFlow] {
        self.outgoing.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn incoming_count(&self, id: &str) -> usize {
        self.incoming.get(id).copied().unwrap_or(0)
    }

    /// Boundary events attached to an activity, in declaration order.
    pub fn boundaries_of(&self, activity_id: &str) -> &[String] {
        self.boundaries
            .get(activity_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn none_start(&self, scope: Option<&str>) -> Option<&str> {
        self.none_starts
            .get(&scope.map(str::to_string))
            .map(String::as_str)
    }

    pub fn event_sub_processes(&self, scope: Option<&str>) -> &[String] {
        self.event_sub_processes
            .get(&scope.map(str::to_string))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn event_sub_process_start(&self, event_sub_process_id: &str) -> Option<&str> {
        self.event_sub_process_starts
            .get(event_sub_process_id)
            .map(String::as_str)
    }

    pub fn signal_start(&self, signal: &str) -> Option<&str> {
        self.signal_starts.get(signal).map(String::as_str)
    }

    pub fn message_start(&self, message: &str) -> Option<&str> {
        self.message_starts.get(message).map(String::as_str)
    }
}

/// Resolved definitions by process id.
#[derive(Debug, Default, Clone)]
pub struct DefinitionRegistry {
    definitions: BTreeMap<String, Arc<ProcessDefinition>>,
}

impl DefinitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and register a model, replacing any definition with the same id.
    pub fn register_model(&mut self, model: ProcessModel) -> EngineResult<Arc<ProcessDefinition>> {
        Ok(self.register(ProcessDefinition::new(model)?))
    }

    pub fn register(&mut self, definition: ProcessDefinition) -> Arc<ProcessDefinition> {
        let definition = Arc::new(definition);
        if let Some(previous) = self
            .definitions
            .insert(definition.id().to_string(), definition.clone())
        {
            tracing::warn!(
                definition_id = %definition.id(),
                previous_version = %previous.version_hex(),
                version = %definition.version_hex(),
                "Replacing registered process definition"
            );
        }
        definition
    }

    pub fn with(mut self, definition: ProcessDefinition) -> Self {
        self.register(definition);
        self
    }

    pub fn get(&self, id: &str) -> EngineResult<Arc<ProcessDefinition>> {
        self.definitions
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownDefinition(id.to_string()))
    }

    /// Definitions with a process-level start event for `signal`, plus that start's id.
    pub fn signal_starts(&self, signal: &str) -> Vec<(Arc<ProcessDefinition>, String)> {
        self.definitions
            .values()
            .filter_map(|d| d.signal_start(signal).map(|s| (d.clone(), s.to_string())))
            .collect()
    }

    pub fn message_starts(&self, message: &str) -> Vec<(Arc<ProcessDefinition>, String)> {
        self.definitions
            .values()
            .filter_map(|d| d.message_start(message).map(|s| (d.clone(), s.to_string())))
            .collect()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.definitions.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

/// A model that cannot be canonicalized cannot be versioned either.
fn unserializable_model(e: serde_json::Error) -> EngineError {
    EngineError::InvalidModel(vec![ModelIssue::global(format!(
        "Model cannot be serialized: {e}"
    ))])
}
