//! Multi-instance activities: parallel with an early completion condition,
//! sequential over a collection, and the empty case.

mod common;

use bpmn_runtime_core::model::{MultiInstanceSpec, UserTaskSpec};
use bpmn_runtime_core::{
    EndReason, EngineEvent, ExecRef, ProcessDefinition, ProcessModelBuilder, ProcessState,
    TaskStatus,
};
use common::{harness, vars};
use serde_json::json;

fn looped(spec: MultiInstanceSpec) -> ProcessDefinition {
    ProcessModelBuilder::new("looped")
        .start("start")
        .user_task("review", UserTaskSpec::default().candidate_user("alice"))
        .multi_instance(spec)
        .user_task("after", UserTaskSpec::default().candidate_user("alice"))
        .end("end")
        .flow("start", "review")
        .flow("review", "after")
        .flow("after", "end")
        .build_definition()
        .unwrap()
}

// =============================================================================
// PARALLEL
// =============================================================================

/// Five reviewers, two approvals suffice: the other three are cancelled and
/// the activity is left exactly once.
#[tokio::test]
async fn test_parallel_completion_condition_cancels_the_rest() {
    let h = harness(vec![looped(
        MultiInstanceSpec::parallel()
            .cardinality("5")
            .completion_condition("nrOfCompletedInstances >= 2"),
    )]);
    let handle = h
        .engine
        .start_process_instance("looped", vars(json!({})), None)
        .await
        .unwrap();

    let open = h.open_tasks(handle.instance_id).await;
    assert_eq!(open.len(), 5);
    assert!(open.iter().all(|t| t.activity_id == "review"));

    // Every item sees its own loop counter.
    let mut counters = Vec::new();
    for task in &open {
        let at = ExecRef::new(handle.instance_id, task.execution);
        counters.push(h.engine.get_variable(at, "loopCounter").await.unwrap());
    }
    counters.sort_by_key(|v| v.as_ref().and_then(|v| v.as_u64()));
    assert_eq!(
        counters,
        (0..5).map(|i| Some(json!(i))).collect::<Vec<_>>()
    );

    h.finish(open[3].id, vars(json!({}))).await;
    assert_eq!(h.open_tasks(handle.instance_id).await.len(), 4);
    h.finish(open[1].id, vars(json!({}))).await;

    let tasks = h.engine.tasks_for_instance(handle.instance_id).await.unwrap();
    let review: Vec<_> = tasks.iter().filter(|t| t.activity_id == "review").collect();
    assert_eq!(
        review.iter().filter(|t| t.status == TaskStatus::Completed).count(),
        2
    );
    assert_eq!(
        review.iter().filter(|t| t.status == TaskStatus::Cancelled).count(),
        3
    );
    assert_eq!(
        h.count(|e| matches!(
            e,
            EngineEvent::ActivityCancelled { reason: EndReason::CompletionConditionMet, .. }
        )),
        3
    );
    h.open_task_at(handle.instance_id, "after").await;
    assert_eq!(h.started("after"), 1);
}

// =============================================================================
// SEQUENTIAL
// =============================================================================

#[tokio::test]
async fn test_sequential_collection_runs_in_order() {
    let h = harness(vec![looped(
        MultiInstanceSpec::sequential()
            .collection("documents", "document")
            .output("verdict", "verdicts"),
    )]);
    let handle = h
        .engine
        .start_process_instance(
            "looped",
            vars(json!({ "documents": ["passport", "utility-bill", "payslip"] })),
            None,
        )
        .await
        .unwrap();

    for (index, document) in ["passport", "utility-bill", "payslip"].iter().enumerate() {
        let open = h.open_tasks(handle.instance_id).await;
        assert_eq!(open.len(), 1, "one instance at a time");
        let task = &open[0];
        assert_eq!(task.activity_id, "review");
        let at = ExecRef::new(handle.instance_id, task.execution);
        assert_eq!(
            h.engine.get_variable(at, "document").await.unwrap(),
            Some(json!(document))
        );
        assert_eq!(
            h.engine.get_variable(at, "loopCounter").await.unwrap(),
            Some(json!(index))
        );
        assert_eq!(
            h.engine.get_variable(at, "nrOfInstances").await.unwrap(),
            Some(json!(3))
        );
        h.finish(task.id, vars(json!({ "verdict": format!("{document}: ok") })))
            .await;
    }

    let after = h.open_task_at(handle.instance_id, "after").await;
    h.finish(after.id, vars(json!({}))).await;

    let snapshot = h.engine.instance_snapshot(handle.instance_id).await.unwrap();
    assert!(matches!(snapshot.state, ProcessState::Completed { .. }));
    assert_eq!(
        snapshot.root_variables["verdicts"],
        json!(["passport: ok", "utility-bill: ok", "payslip: ok"])
    );
    // Per-instance variables stay in their own scope.
    assert!(!snapshot.root_variables.contains_key("verdict"));
    assert!(!snapshot.root_variables.contains_key("loopCounter"));
}

/// A sequential loop with a completion condition stops before the next item.
#[tokio::test]
async fn test_sequential_completion_condition_stops_early() {
    let h = harness(vec![looped(
        MultiInstanceSpec::sequential()
            .cardinality("count")
            .completion_condition("nrOfCompletedInstances == 2"),
    )]);
    let handle = h
        .engine
        .start_process_instance("looped", vars(json!({ "count": 4 })), None)
        .await
        .unwrap();

    for _ in 0..2 {
        let task = h.open_task_at(handle.instance_id, "review").await;
        h.finish(task.id, vars(json!({}))).await;
    }
    h.open_task_at(handle.instance_id, "after").await;
    assert_eq!(h.started("review"), 3, "body plus two items");
    assert_eq!(
        h.engine
            .tasks_for_instance(handle.instance_id)
            .await
            .unwrap()
            .iter()
            .filter(|t| t.activity_id == "review")
            .count(),
        2
    );
}

/// A deleted instance is neither counted as completed nor collected.
#[tokio::test]
async fn test_deleted_item_is_not_collected() {
    let h = harness(vec![looped(
        MultiInstanceSpec::parallel()
            .cardinality("2")
            .output("verdict", "verdicts"),
    )]);
    let handle = h
        .engine
        .start_process_instance("looped", vars(json!({})), None)
        .await
        .unwrap();
    let open = h.open_tasks(handle.instance_id).await;
    assert_eq!(open.len(), 2);

    h.engine.delete_task(open[0].id, "withdrawn").await.unwrap();
    let survivor = ExecRef::new(handle.instance_id, open[1].execution);
    assert_eq!(
        h.engine
            .get_variable(survivor, "nrOfCompletedInstances")
            .await
            .unwrap(),
        Some(json!(0))
    );
    assert_eq!(
        h.count(|e| matches!(
            e,
            EngineEvent::ActivityCancelled { reason: EndReason::TaskDeleted { .. }, .. }
        )),
        1
    );

    h.finish(open[1].id, vars(json!({ "verdict": "ok" }))).await;
    let root = ExecRef::new(handle.instance_id, handle.root_execution);
    assert_eq!(
        h.engine.get_variable(root, "verdicts").await.unwrap(),
        Some(json!(["ok"]))
    );
    h.open_task_at(handle.instance_id, "after").await;
}

/// Deleting the current task of a sequential loop moves on to the next item.
#[tokio::test]
async fn test_sequential_delete_advances_loop() {
    let h = harness(vec![looped(
        MultiInstanceSpec::sequential()
            .collection("documents", "document")
            .output("verdict", "verdicts"),
    )]);
    let handle = h
        .engine
        .start_process_instance(
            "looped",
            vars(json!({ "documents": ["passport", "payslip"] })),
            None,
        )
        .await
        .unwrap();

    let first = h.open_task_at(handle.instance_id, "review").await;
    h.engine.delete_task(first.id, "duplicate").await.unwrap();

    let second = h.open_task_at(handle.instance_id, "review").await;
    assert_ne!(second.id, first.id);
    let at = ExecRef::new(handle.instance_id, second.execution);
    assert_eq!(
        h.engine.get_variable(at, "document").await.unwrap(),
        Some(json!("payslip"))
    );
    h.finish(second.id, vars(json!({ "verdict": "payslip: ok" }))).await;

    let root = ExecRef::new(handle.instance_id, handle.root_execution);
    assert_eq!(
        h.engine.get_variable(root, "verdicts").await.unwrap(),
        Some(json!(["payslip: ok"]))
    );
    h.open_task_at(handle.instance_id, "after").await;
}

// =============================================================================
// EDGE CASES
// =============================================================================

#[tokio::test]
async fn test_empty_collection_skips_activity() {
    let h = harness(vec![looped(
        MultiInstanceSpec::parallel()
            .collection("documents", "document")
            .output("verdict", "verdicts"),
    )]);
    let handle = h
        .engine
        .start_process_instance("looped", vars(json!({ "documents": [] })), None)
        .await
        .unwrap();

    let open = h.open_tasks(handle.instance_id).await;
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].activity_id, "after");
    let root = ExecRef::new(handle.instance_id, handle.root_execution);
    assert_eq!(
        h.engine.get_variable(root, "verdicts").await.unwrap(),
        Some(json!([]))
    );
}

#[tokio::test]
async fn test_bad_cardinality_fails_command() {
    let h = harness(vec![looped(MultiInstanceSpec::parallel().cardinality("\"many\""))]);
    let err = h
        .engine
        .start_process_instance("looped", vars(json!({})), None)
        .await
        .unwrap_err();
    assert!(matches!(err, bpmn_runtime_core::EngineError::Expression { .. }));
}
