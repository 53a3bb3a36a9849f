use super::*;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelIssue {
    pub element_id: Option<String>,
    pub message: String,
}

impl ModelIssue {
    fn at(element_id: &str, message: impl Into<String>) -> Self {
        Self {
            element_id: Some(element_id.to_string()),
            message: message.into(),
        }
    }

    pub(crate) fn global(message: impl Into<String>) -> Self {
        Self {
            element_id: None,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ModelIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.element_id {
            Some(id) => write!(f, "{id}: {}", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// One flow scope of a model: the process body, a sub-process or an event
/// sub-process.
#[derive(Debug, Clone, Copy)]
pub(super) struct ScopeView<'a> {
    /// `None` for the process body.
    pub id: Option<&'a str>,
    pub event_sub_process: bool,
    pub elements: &'a [FlowElement],
    pub flows: &'a [SequenceFlow],
}

/// Every scope of the model, outermost first.
pub(super) fn scopes(model: &ProcessModel) -> Vec<ScopeView<'_>> {
    let mut out = vec![ScopeView {
        id: None,
        event_sub_process: false,
        elements: &model.elements,
        flows: &model.flows,
    }];
    let mut i = 0;
    while i < out.len() {
        let current = out[i];
        for el in current.elements {
            match &el.kind {
                ElementKind::SubProcess(inner) => out.push(ScopeView {
                    id: Some(&el.id),
                    event_sub_process: false,
                    elements: &inner.elements,
                    flows: &inner.flows,
                }),
                ElementKind::EventSubProcess(inner) => out.push(ScopeView {
                    id: Some(&el.id),
                    event_sub_process: true,
                    elements: &inner.elements,
                    flows: &inner.flows,
                }),
                _ => {}
            }
        }
        i += 1;
    }
    out
}

/// Structural checks. Returns every issue found; an empty list means the
/// model can be executed.
pub(super) fn validate_model(model: &ProcessModel) -> Vec<ModelIssue> {
    let mut issues = Vec::new();
    let scopes = scopes(model);

    if model.id.trim().is_empty() {
        issues.push(ModelIssue::global("Process id must not be empty"));
    }

    // Ids are global across nested scopes.
    let mut seen: HashSet<&str> = HashSet::new();
    for scope in &scopes {
        for el in scope.elements {
            if !seen.insert(&el.id) {
                issues.push(ModelIssue::at(&el.id, "Duplicate element id"));
            }
        }
    }
    let mut seen_flows: HashSet<&str> = HashSet::new();
    for scope in &scopes {
        for flow in scope.flows {
            if !seen_flows.insert(&flow.id) || seen.contains(flow.id.as_str()) {
                issues.push(ModelIssue::at(&flow.id, "Duplicate sequence flow id"));
            }
        }
    }

    for scope in &scopes {
        check_scope(scope, &mut issues);
    }

    if issues.is_empty() {
        check_reachability(&scopes, &mut issues);
    }
    issues
}

fn check_scope(scope: &ScopeView<'_>, issues: &mut Vec<ModelIssue>) {
    let by_id: HashMap<&str, &FlowElement> =
        scope.elements.iter().map(|e| (e.id.as_str(), e)).collect();
    let scope_name = scope.id.unwrap_or("process");

    // Start events
    let starts: Vec<&FlowElement> = scope
        .elements
        .iter()
        .filter(|e| matches!(e.kind, ElementKind::StartEvent(_)))
        .collect();
    if scope.event_sub_process {
        let error_starts = starts
            .iter()
            .filter(|e| matches!(e.kind, ElementKind::StartEvent(StartTrigger::Error(_))))
            .count();
        if starts.len() != 1 || error_starts != 1 {
            issues.push(ModelIssue::at(
                scope_name,
                "Event sub-process must have exactly one error start event",
            ));
        }
    } else {
        let none_starts = starts
            .iter()
            .filter(|e| matches!(e.kind, ElementKind::StartEvent(StartTrigger::None)))
            .count();
        let event_starts = starts.len() - none_starts;
        let allowed = if scope.id.is_none() {
            none_starts <= 1 && none_starts + event_starts >= 1
        } else {
            none_starts == 1
        };
        if !allowed {
            issues.push(ModelIssue::at(
                scope_name,
                format!("Expected exactly one none start event, found {none_starts}"),
            ));
        }
    }
    for start in &starts {
        match &start.kind {
            ElementKind::StartEvent(StartTrigger::Signal(_) | StartTrigger::Message(_))
                if scope.id.is_some() =>
            {
                issues.push(ModelIssue::at(
                    &start.id,
                    "Signal and message start events are only allowed at process level",
                ));
            }
            ElementKind::StartEvent(StartTrigger::Error(_)) if !scope.event_sub_process => {
                issues.push(ModelIssue::at(
                    &start.id,
                    "Error start events are only allowed in event sub-processes",
                ));
            }
            _ => {}
        }
    }

    // Sequence flows stay inside their scope.
    for flow in scope.flows {
        match by_id.get(flow.source.as_str()) {
            None => issues.push(ModelIssue::at(
                &flow.id,
                format!("Source {} is not an element of {scope_name}", flow.source),
            )),
            Some(src) if matches!(src.kind, ElementKind::EventSubProcess(_)) => {
                issues.push(ModelIssue::at(
                    &flow.id,
                    "Event sub-processes cannot have sequence flows",
                ))
            }
            Some(src) if matches!(src.kind, ElementKind::EndEvent(_)) => issues.push(
                ModelIssue::at(&flow.id, "End events cannot have outgoing flows"),
            ),
            _ => {}
        }
        match by_id.get(flow.target.as_str()) {
            None => issues.push(ModelIssue::at(
                &flow.id,
                format!("Target {} is not an element of {scope_name}", flow.target),
            )),
            Some(tgt) if !tgt.is_flow_node() => issues.push(ModelIssue::at(
                &flow.id,
                format!("{} cannot be the target of a sequence flow", tgt.id),
            )),
            Some(tgt) if matches!(tgt.kind, ElementKind::StartEvent(_)) => issues.push(
                ModelIssue::at(&flow.id, "Start events cannot have incoming flows"),
            ),
            _ => {}
        }
    }

    for el in scope.elements {
        match &el.kind {
            ElementKind::BoundaryEvent(spec) => match by_id.get(spec.attached_to.as_str()) {
                Some(host) if host.is_activity() => {}
                Some(_) => issues.push(ModelIssue::at(
                    &el.id,
                    format!("Boundary host {} is not an activity", spec.attached_to),
                )),
                None => issues.push(ModelIssue::at(
                    &el.id,
                    format!("Boundary host {} not found in {scope_name}", spec.attached_to),
                )),
            },
            ElementKind::ExclusiveGateway {
                default_flow: Some(default),
            }
            | ElementKind::InclusiveGateway {
                default_flow: Some(default),
                ..
            } => {
                let owned = scope
                    .flows
                    .iter()
                    .any(|f| &f.id == default && f.source == el.id);
                if !owned {
                    issues.push(ModelIssue::at(
                        &el.id,
                        format!("Default flow {default} is not an outgoing flow of the gateway"),
                    ));
                }
            }
            ElementKind::ServiceTask(spec) if spec.handler.trim().is_empty() => {
                issues.push(ModelIssue::at(&el.id, "Service task has no handler"));
            }
            ElementKind::CallActivity(spec) if spec.called_element.trim().is_empty() => {
                issues.push(ModelIssue::at(&el.id, "Call activity has no called element"));
            }
            _ => {}
        }

        if let ElementKind::InclusiveGateway {
            join: Some(join), ..
        } = &el.kind
        {
            let ok = by_id
                .get(join.as_str())
                .is_some_and(|j| matches!(j.kind, ElementKind::InclusiveGateway { .. }));
            if !ok {
                issues.push(ModelIssue::at(
                    &el.id,
                    format!("Join {join} is not an inclusive gateway of {scope_name}"),
                ));
            }
        }

        if let Some(TimerSpec::Cycle { interval, .. }) = timer_of(el) {
            if interval.is_zero() {
                issues.push(ModelIssue::at(&el.id, "Timer cycle interval must be > 0"));
            }
        }

        if let Some(mi) = &el.multi_instance {
            if !el.is_activity() {
                issues.push(ModelIssue::at(
                    &el.id,
                    "Only activities can be multi-instance",
                ));
            }
            if mi.cardinality.is_some() == mi.collection.is_some() {
                issues.push(ModelIssue::at(
                    &el.id,
                    "Multi-instance needs exactly one of cardinality or collection",
                ));
            }
            if mi.output_collection.is_some() != mi.output_element.is_some() {
                issues.push(ModelIssue::at(
                    &el.id,
                    "Multi-instance output collection and output element go together",
                ));
            }
        }
    }

    // A converging inclusive gateway only knows how many tokens to wait for
    // when a diverging one names it.
    let named_joins: HashSet<&str> = scope
        .elements
        .iter()
        .filter_map(|el| match &el.kind {
            ElementKind::InclusiveGateway {
                join: Some(join), ..
            } => Some(join.as_str()),
            _ => None,
        })
        .collect();
    for el in scope.elements {
        if !matches!(el.kind, ElementKind::InclusiveGateway { .. }) {
            continue;
        }
        let incoming = scope.flows.iter().filter(|f| f.target == el.id).count();
        if incoming > 1 && !named_joins.contains(el.id.as_str()) {
            issues.push(ModelIssue::at(
                &el.id,
                "Converging inclusive gateway is not the join of any diverging inclusive gateway",
            ));
        }
    }
}

fn timer_of(el: &FlowElement) -> Option<&TimerSpec> {
    match &el.kind {
        ElementKind::IntermediateCatch(CatchTrigger::Timer(t)) => Some(t),
        ElementKind::BoundaryEvent(BoundarySpec {
            trigger: BoundaryTrigger::Timer(t),
            ..
        }) => Some(t),
        _ => None,
    }
}

/// Every element must be reachable from a process-level start event, through
/// sequence flows, boundary attachment or scope nesting.
fn check_reachability(scopes: &[ScopeView<'_>], issues: &mut Vec<ModelIssue>) {
    let mut graph: DiGraph<&str, ()> = DiGraph::new();
    let mut index: HashMap<&str, NodeIndex> = HashMap::new();

    for scope in scopes {
        for el in scope.elements {
            index.insert(&el.id, graph.add_node(&el.id));
        }
    }

    for scope in scopes {
        for flow in scope.flows {
            if let (Some(&a), Some(&b)) = (
                index.get(flow.source.as_str()),
                index.get(flow.target.as_str()),
            ) {
                graph.add_edge(a, b, ());
            }
        }
        for el in scope.elements {
            if let ElementKind::BoundaryEvent(spec) = &el.kind {
                if let (Some(&host), Some(&b)) =
                    (index.get(spec.attached_to.as_str()), index.get(el.id.as_str()))
                {
                    graph.add_edge(host, b, ());
                }
            }
        }
        // Container → its starts and event sub-processes.
        if let Some(container) = scope.id.and_then(|id| index.get(id).copied()) {
            for el in scope.elements {
                if matches!(
                    el.kind,
                    ElementKind::StartEvent(_) | ElementKind::EventSubProcess(_)
                ) {
                    graph.add_edge(container, index[el.id.as_str()], ());
                }
            }
        }
    }

    let roots: Vec<NodeIndex> = scopes[0]
        .elements
        .iter()
        .filter(|e| {
            matches!(
                e.kind,
                ElementKind::StartEvent(_) | ElementKind::EventSubProcess(_)
            )
        })
        .map(|e| index[e.id.as_str()])
        .collect();

    let mut reached: HashSet<NodeIndex> = HashSet::new();
    for root in roots {
        let mut dfs = Dfs::new(&graph, root);
        while let Some(n) = dfs.next(&graph) {
            reached.insert(n);
        }
    }

    for scope in scopes {
        for el in scope.elements {
            if !reached.contains(&index[el.id.as_str()]) {
                issues.push(ModelIssue::at(&el.id, "Element is not reachable from a start event"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ProcessModelBuilder;

    #[test]
    fn test_valid_linear_model() {
        let model = ProcessModelBuilder::new("p")
            .start("s")
            .task("t")
            .end("e")
            .flow("s", "t")
            .flow("t", "e")
            .build();
        assert!(validate_model(&model).is_empty());
    }

    #[test]
    fn test_dangling_flow_and_unreachable() {
        let model = ProcessModelBuilder::new("p")
            .start("s")
            .task("t")
            .end("e")
            .flow("s", "e")
            .flow("t", "missing")
            .build();
        let issues = validate_model(&model);
        assert!(issues
            .iter()
            .any(|i| i.message.contains("missing is not an element")));
    }

    #[test]
    fn test_unreachable_element_reported() {
        let model = ProcessModelBuilder::new("p")
            .start("s")
            .task("orphan")
            .end("e")
            .flow("s", "e")
            .build();
        let issues = validate_model(&model);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].element_id.as_deref(), Some("orphan"));
    }

    #[test]
    fn test_default_flow_must_belong_to_gateway() {
        let model = ProcessModelBuilder::new("p")
            .start("s")
            .exclusive_gateway("gw", Some("s->e"))
            .end("e")
            .flow("s", "gw")
            .flow("gw", "e")
            .flow("s", "e")
            .build();
        let issues = validate_model(&model);
        assert!(issues.iter().any(|i| i.to_string().contains("gw: Default flow")));
    }

    #[test]
    fn test_boundary_must_attach_to_activity() {
        let model = ProcessModelBuilder::new("p")
            .start("s")
            .end("e")
            .boundary("b", "s", BoundaryTrigger::Signal("x".into()), true)
            .flow("s", "e")
            .build();
        let issues = validate_model(&model);
        assert!(issues.iter().any(|i| i.message.contains("not an activity")));
    }

    #[test]
    fn test_sub_process_needs_none_start() {
        let model = ProcessModelBuilder::new("p")
            .start("s")
            .sub_process("sub", |b| b.task("inner").end("inner_end").flow("inner", "inner_end"))
            .end("e")
            .flow("s", "sub")
            .flow("sub", "e")
            .build();
        let issues = validate_model(&model);
        assert!(issues
            .iter()
            .any(|i| i.element_id.as_deref() == Some("sub")));
    }

    #[test]
    fn test_converging_inclusive_gateway_needs_a_split() {
        let unnamed = ProcessModelBuilder::new("p")
            .start("s")
            .parallel_gateway("fork")
            .task("a")
            .task("b")
            .inclusive_gateway("merge", None, None)
            .end("e")
            .flow("s", "fork")
            .flow("fork", "a")
            .flow("fork", "b")
            .flow("a", "merge")
            .flow("b", "merge")
            .flow("merge", "e")
            .build();
        let issues = validate_model(&unnamed);
        assert_eq!(issues.len(), 1, "{issues:?}");
        assert_eq!(issues[0].element_id.as_deref(), Some("merge"));

        let named = ProcessModelBuilder::new("p")
            .start("s")
            .inclusive_gateway("split", None, Some("merge"))
            .task("a")
            .task("b")
            .inclusive_gateway("merge", None, None)
            .end("e")
            .flow("s", "split")
            .flow("split", "a")
            .flow("split", "b")
            .flow("a", "merge")
            .flow("b", "merge")
            .flow("merge", "e")
            .build();
        assert!(validate_model(&named).is_empty());
    }
}
