use super::*;
use crate::error::EngineResult;

/// Programmatic model construction.
///
/// Flows added with [`flow`](Self::flow) get the id `source->target`; use
/// [`flow_with_id`](Self::flow_with_id) when a gateway needs to name its
/// default flow differently. Nested scopes are built with a closure that
/// receives a fresh builder.
#[derive(Debug, Clone, Default)]
pub struct ProcessModelBuilder {
    id: String,
    name: Option<String>,
    elements: Vec<FlowElement>,
    flows: Vec<SequenceFlow>,
}

impl ProcessModelBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn element(mut self, element: FlowElement) -> Self {
        self.elements.push(element);
        self
    }

    // ── Events ──

    pub fn start(self, id: &str) -> Self {
        self.element(FlowElement::new(id, ElementKind::StartEvent(StartTrigger::None)))
    }

    pub fn signal_start(self, id: &str, signal: &str) -> Self {
        self.element(FlowElement::new(
            id,
            ElementKind::StartEvent(StartTrigger::Signal(signal.to_string())),
        ))
    }

    pub fn message_start(self, id: &str, message: &str) -> Self {
        self.element(FlowElement::new(
            id,
            ElementKind::StartEvent(StartTrigger::Message(message.to_string())),
        ))
    }

    pub fn error_start(self, id: &str, code: Option<&str>) -> Self {
        self.element(FlowElement::new(
            id,
            ElementKind::StartEvent(StartTrigger::Error(code.map(str::to_string))),
        ))
    }

    pub fn end(self, id: &str) -> Self {
        self.element(FlowElement::new(id, ElementKind::EndEvent(EndKind::None)))
    }

    pub fn terminate_end(self, id: &str) -> Self {
        self.element(FlowElement::new(id, ElementKind::EndEvent(EndKind::Terminate)))
    }

    pub fn error_end(self, id: &str, code: &str) -> Self {
        self.element(FlowElement::new(
            id,
            ElementKind::EndEvent(EndKind::Error(code.to_string())),
        ))
    }

    pub fn catch(self, id: &str, trigger: CatchTrigger) -> Self {
        self.element(FlowElement::new(id, ElementKind::IntermediateCatch(trigger)))
    }

    pub fn timer(self, id: &str, timer: TimerSpec) -> Self {
        self.catch(id, CatchTrigger::Timer(timer))
    }

    pub fn throw_signal(self, id: &str, signal: &str) -> Self {
        self.element(FlowElement::new(
            id,
            ElementKind::IntermediateThrow(ThrowKind::Signal(signal.to_string())),
        ))
    }

    pub fn boundary(
        self,
        id: &str,
        attached_to: &str,
        trigger: BoundaryTrigger,
        cancel_activity: bool,
    ) -> Self {
        self.element(FlowElement::new(
            id,
            ElementKind::BoundaryEvent(BoundarySpec {
                attached_to: attached_to.to_string(),
                trigger,
                cancel_activity,
            }),
        ))
    }

    // ── Activities ──

    pub fn task(self, id: &str) -> Self {
        self.element(FlowElement::new(id, ElementKind::Task))
    }

    pub fn user_task(self, id: &str, spec: UserTaskSpec) -> Self {
        self.element(FlowElement::new(id, ElementKind::UserTask(spec)))
    }

    pub fn service_task(self, id: &str, handler: &str) -> Self {
        self.element(FlowElement::new(
            id,
            ElementKind::ServiceTask(ServiceTaskSpec {
                handler: handler.to_string(),
                retries: None,
            }),
        ))
    }

    pub fn receive_task(self, id: &str, message: MessageRef) -> Self {
        self.element(FlowElement::new(id, ElementKind::ReceiveTask(message)))
    }

    pub fn call_activity(self, id: &str, spec: CallActivitySpec) -> Self {
        self.element(FlowElement::new(id, ElementKind::CallActivity(spec)))
    }

    pub fn sub_process(self, id: &str, body: impl FnOnce(Self) -> Self) -> Self {
        let inner = body(Self::default());
        self.element(FlowElement::new(
            id,
            ElementKind::SubProcess(FlowScope {
                elements: inner.elements,
                flows: inner.flows,
            }),
        ))
    }

    pub fn event_sub_process(self, id: &str, body: impl FnOnce(Self) -> Self) -> Self {
        let inner = body(Self::default());
        self.element(FlowElement::new(
            id,
            ElementKind::EventSubProcess(FlowScope {
                elements: inner.elements,
                flows: inner.flows,
            }),
        ))
    }

    /// Adjust the most recently added element (async flag, loop, name).
    pub fn with_last(mut self, f: impl FnOnce(FlowElement) -> FlowElement) -> Self {
        if let Some(last) = self.elements.pop() {
            self.elements.push(f(last));
        }
        self
    }

    pub fn multi_instance(self, spec: MultiInstanceSpec) -> Self {
        self.with_last(|e| e.with_multi_instance(spec))
    }

    pub fn async_before(self) -> Self {
        self.with_last(FlowElement::async_before)
    }

    // ── Gateways ──

    pub fn exclusive_gateway(self, id: &str, default_flow: Option<&str>) -> Self {
        self.element(FlowElement::new(
            id,
            ElementKind::ExclusiveGateway {
                default_flow: default_flow.map(str::to_string),
            },
        ))
    }

    pub fn parallel_gateway(self, id: &str) -> Self {
        self.element(FlowElement::new(id, ElementKind::ParallelGateway))
    }

    pub fn inclusive_gateway(self, id: &str, default_flow: Option<&str>, join: Option<&str>) -> Self {
        self.element(FlowElement::new(
            id,
            ElementKind::InclusiveGateway {
                default_flow: default_flow.map(str::to_string),
                join: join.map(str::to_string),
            },
        ))
    }

    // ── Flows ──

    pub fn flow(self, source: &str, target: &str) -> Self {
        let id = self.next_flow_id(source, target);
        self.flow_with_id(&id, source, target, None)
    }

    pub fn conditional_flow(self, source: &str, target: &str, condition: &str) -> Self {
        let id = self.next_flow_id(source, target);
        self.flow_with_id(&id, source, target, Some(condition))
    }

    pub fn flow_with_id(
        mut self,
        id: &str,
        source: &str,
        target: &str,
        condition: Option<&str>,
    ) -> Self {
        self.flows.push(SequenceFlow {
            id: id.to_string(),
            source: source.to_string(),
            target: target.to_string(),
            condition: condition.map(str::to_string),
        });
        self
    }

    fn next_flow_id(&self, source: &str, target: &str) -> String {
        let base = format!("{source}->{target}");
        if !self.flows.iter().any(|f| f.id == base) {
            return base;
        }
        (2..)
            .map(|n| format!("{base}#{n}"))
            .find(|candidate| !self.flows.iter().any(|f| &f.id == candidate))
            .unwrap_or(base)
    }

    pub fn build(self) -> ProcessModel {
        ProcessModel {
            id: self.id,
            name: self.name,
            elements: self.elements,
            flows: self.flows,
        }
    }

    /// Build, validate and index in one go.
    pub fn build_definition(self) -> EngineResult<ProcessDefinition> {
        ProcessDefinition::new(self.build())
    }
}
