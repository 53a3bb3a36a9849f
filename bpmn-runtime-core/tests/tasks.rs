//! Human task lifecycle: candidates, claim/release, completion checks,
//! staged variables with output mappings, and administrative deletion.

mod common;

use bpmn_runtime_core::model::UserTaskSpec;
use bpmn_runtime_core::{
    Actor, EngineError, EngineEvent, ExecRef, ProcessModelBuilder, ProcessState, TaskStatus,
};
use common::{alice, harness, vars};
use serde_json::json;

fn approval(spec: UserTaskSpec) -> bpmn_runtime_core::ProcessDefinition {
    ProcessModelBuilder::new("approval")
        .start("start")
        .user_task("approve", spec)
        .user_task("archive", UserTaskSpec::default().candidate_group("ops"))
        .end("end")
        .flow("start", "approve")
        .flow("approve", "archive")
        .flow("archive", "end")
        .build_definition()
        .unwrap()
}

// =============================================================================
// CLAIM / RELEASE
// =============================================================================

#[tokio::test]
async fn test_claim_and_release_rules() {
    let h = harness(vec![approval(
        UserTaskSpec::default()
            .candidate_user("alice")
            .candidate_group("legal"),
    )]);
    let handle = h
        .engine
        .start_process_instance("approval", vars(json!({})), Some("case-7".into()))
        .await
        .unwrap();
    let task = h.open_task_at(handle.instance_id, "approve").await;
    assert_eq!(task.status, TaskStatus::Created);
    assert_eq!(h.count(|e| matches!(e, EngineEvent::TaskCreated { .. })), 1);

    let err = h
        .engine
        .claim_task(task.id, &Actor::user("mallory"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotACandidate { .. }));
    assert_eq!(h.engine.task(task.id).await.unwrap().status, TaskStatus::Created);

    let bob = Actor::user("bob").with_group("legal");
    let claimed = h.engine.claim_task(task.id, &bob).await.unwrap();
    assert_eq!(claimed.status, TaskStatus::Assigned);
    assert_eq!(claimed.assignee.as_deref(), Some("bob"));

    // Someone else cannot take it over or give it back.
    assert!(h.engine.claim_task(task.id, &alice()).await.is_err());
    assert!(matches!(
        h.engine.release_task(task.id, &alice()).await,
        Err(EngineError::IllegalState(_))
    ));

    let released = h.engine.release_task(task.id, &bob).await.unwrap();
    assert_eq!(released.status, TaskStatus::Created);
    assert!(released.assignee.is_none());
    assert_eq!(h.count(|e| matches!(e, EngineEvent::TaskReleased { .. })), 1);

    // An administrator may claim without being a candidate.
    let admin = h
        .engine
        .claim_task(task.id, &Actor::admin("root"))
        .await
        .unwrap();
    assert_eq!(admin.assignee.as_deref(), Some("root"));
}

/// Only the assignee completes, and a rejected payload changes nothing.
#[tokio::test]
async fn test_completion_preconditions() {
    let h = harness(vec![approval(UserTaskSpec::default().candidate_user("alice"))]);
    let handle = h
        .engine
        .start_process_instance("approval", vars(json!({})), None)
        .await
        .unwrap();
    let task = h.open_task_at(handle.instance_id, "approve").await;

    let err = h
        .engine
        .complete_task(task.id, &alice(), vars(json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::IllegalState(_)), "unclaimed: {err:?}");

    h.engine.claim_task(task.id, &alice()).await.unwrap();
    let err = h
        .engine
        .complete_task(task.id, &alice(), vars(json!({ "bad!": 1 })))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidVariableName(_)));
    let still = h.engine.task(task.id).await.unwrap();
    assert_eq!(still.status, TaskStatus::Assigned);
    assert_eq!(h.count(|e| matches!(e, EngineEvent::TaskCompleted { .. })), 0);

    let err = h
        .engine
        .complete_task(task.id, &Actor::user("bob"), vars(json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::IllegalState(_)));

    h.finish(task.id, vars(json!({ "approved": true }))).await;
    let root = ExecRef::new(handle.instance_id, handle.root_execution);
    assert_eq!(
        h.engine.get_variable(root, "approved").await.unwrap(),
        Some(json!(true))
    );
    h.open_task_at(handle.instance_id, "archive").await;

    // Finished tasks accept no further commands.
    assert!(h.engine.claim_task(task.id, &alice()).await.is_err());
    assert!(h
        .engine
        .complete_task(task.id, &alice(), vars(json!({})))
        .await
        .is_err());
}

// =============================================================================
// VARIABLES
// =============================================================================

/// With output mappings only the mapped values reach the process; staged
/// task-local variables are visible to the mappings.
#[tokio::test]
async fn test_output_mappings_with_staged_variables() {
    let h = harness(vec![approval(
        UserTaskSpec::default()
            .candidate_user("alice")
            .output("decision", "approval_decision")
            .output("decision == \"yes\" && score > 3", "approved"),
    )]);
    let handle = h
        .engine
        .start_process_instance("approval", vars(json!({})), None)
        .await
        .unwrap();
    let task = h.open_task_at(handle.instance_id, "approve").await;
    h.engine.claim_task(task.id, &alice()).await.unwrap();

    let staged = h
        .engine
        .update_task_variables(task.id, &alice(), vars(json!({ "decision": "yes" })))
        .await
        .unwrap();
    assert_eq!(staged.local_variables["decision"], json!("yes"));
    assert_eq!(staged.status, TaskStatus::Assigned);

    h.engine
        .complete_task(task.id, &alice(), vars(json!({ "score": 5, "comment": "fine" })))
        .await
        .unwrap();

    let root = ExecRef::new(handle.instance_id, handle.root_execution);
    let get = |name: &'static str| {
        let engine = h.engine.clone();
        async move { engine.get_variable(root, name).await.unwrap() }
    };
    assert_eq!(get("approval_decision").await, Some(json!("yes")));
    assert_eq!(get("approved").await, Some(json!(true)));
    assert_eq!(get("comment").await, None);
    assert_eq!(get("decision").await, None);
}

/// Without output mappings the completion payload is written as is; staged
/// variables stay on the task.
#[tokio::test]
async fn test_staged_variables_stay_local_without_mappings() {
    let h = harness(vec![approval(UserTaskSpec::default().candidate_user("alice"))]);
    let handle = h
        .engine
        .start_process_instance("approval", vars(json!({})), None)
        .await
        .unwrap();
    let task = h.open_task_at(handle.instance_id, "approve").await;
    h.engine.claim_task(task.id, &alice()).await.unwrap();
    h.engine
        .update_task_variables(task.id, &alice(), vars(json!({ "draft": "maybe" })))
        .await
        .unwrap();
    h.engine
        .complete_task(task.id, &alice(), vars(json!({ "decision": "yes" })))
        .await
        .unwrap();

    let root = ExecRef::new(handle.instance_id, handle.root_execution);
    assert_eq!(
        h.engine.get_variable(root, "decision").await.unwrap(),
        Some(json!("yes"))
    );
    assert_eq!(h.engine.get_variable(root, "draft").await.unwrap(), None);
}

// =============================================================================
// DELETION
// =============================================================================

/// Deleting a task cancels it and moves the process on without outputs.
#[tokio::test]
async fn test_delete_task_continues_process() {
    let h = harness(vec![approval(
        UserTaskSpec::default()
            .candidate_user("alice")
            .output("decision", "decision"),
    )]);
    let handle = h
        .engine
        .start_process_instance("approval", vars(json!({})), None)
        .await
        .unwrap();
    let task = h.open_task_at(handle.instance_id, "approve").await;
    h.engine.claim_task(task.id, &alice()).await.unwrap();
    h.engine
        .update_task_variables(task.id, &alice(), vars(json!({ "decision": "no" })))
        .await
        .unwrap();

    let deleted = h.engine.delete_task(task.id, "duplicate request").await.unwrap();
    assert_eq!(deleted.status, TaskStatus::Cancelled);
    assert!(deleted
        .cancel_reason
        .as_deref()
        .is_some_and(|r| r.contains("duplicate request")));
    assert_eq!(h.count(|e| matches!(e, EngineEvent::TaskCancelled { .. })), 1);

    let archive = h.open_task_at(handle.instance_id, "archive").await;
    let root = ExecRef::new(handle.instance_id, handle.root_execution);
    assert_eq!(h.engine.get_variable(root, "decision").await.unwrap(), None);

    assert!(matches!(
        h.engine.delete_task(task.id, "again").await,
        Err(EngineError::IllegalState(_))
    ));

    let ops = Actor::user("olga").with_group("ops");
    h.engine.claim_task(archive.id, &ops).await.unwrap();
    h.engine
        .complete_task(archive.id, &ops, vars(json!({})))
        .await
        .unwrap();
    let snapshot = h.engine.instance_snapshot(handle.instance_id).await.unwrap();
    assert!(matches!(snapshot.state, ProcessState::Completed { .. }));
}

#[tokio::test]
async fn test_unknown_task() {
    let h = harness(vec![approval(UserTaskSpec::default())]);
    let missing = uuid::Uuid::now_v7();
    assert!(matches!(
        h.engine.task(missing).await,
        Err(EngineError::TaskNotFound(id)) if id == missing
    ));
    assert!(matches!(
        h.engine.claim_task(missing, &alice()).await,
        Err(EngineError::TaskNotFound(_))
    ));
}
