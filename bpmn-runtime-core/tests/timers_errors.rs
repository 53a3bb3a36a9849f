//! Timers (intermediate and boundary) driven by the job scheduler, and
//! business-error propagation to boundaries and event sub-processes.

mod common;

use std::sync::Arc;
use std::time::Duration;

use bpmn_runtime_core::model::{BoundaryTrigger, TimerSpec, UserTaskSpec};
use bpmn_runtime_core::{
    EndReason, EngineEvent, ExecRef, ExecutionState, JobScheduler, ProcessDefinition,
    ProcessModelBuilder, ProcessState, ServiceContext, ServiceHandler, ServiceOutcome, TaskStatus,
};
use common::{harness, harness_with, vars};
use serde_json::json;

fn task() -> UserTaskSpec {
    UserTaskSpec::default().candidate_user("alice")
}

fn escalation() -> ProcessDefinition {
    ProcessModelBuilder::new("escalation")
        .start("start")
        .user_task("review", task())
        .boundary(
            "too_slow",
            "review",
            BoundaryTrigger::Timer(TimerSpec::Duration(Duration::from_secs(3600))),
            true,
        )
        .user_task("escalated", task())
        .end("done")
        .end("escalated_end")
        .flow("start", "review")
        .flow("review", "done")
        .flow("too_slow", "escalated")
        .flow("escalated", "escalated_end")
        .build_definition()
        .unwrap()
}

// =============================================================================
// TIMERS
// =============================================================================

/// Completing the host removes its timer, even when the timer is already due.
#[tokio::test]
async fn test_boundary_timer_cancelled_by_completion() {
    let h = harness(vec![escalation()]);
    let handle = h
        .engine
        .start_process_instance("escalation", vars(json!({})), None)
        .await
        .unwrap();
    let jobs = h.engine.jobs_for_instance(handle.instance_id).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(h.count(|e| matches!(e, EngineEvent::TimerScheduled { .. })), 1);

    h.clock.advance(Duration::from_secs(7200));
    let review = h.open_task_at(handle.instance_id, "review").await;
    h.finish(review.id, vars(json!({}))).await;

    assert!(h.engine.jobs_for_instance(handle.instance_id).await.unwrap().is_empty());
    assert_eq!(h.count(|e| matches!(e, EngineEvent::TimerCancelled { .. })), 1);
    assert!(h.engine.poll_due_jobs(10).await.unwrap().is_empty());
    assert_eq!(h.count(|e| matches!(e, EngineEvent::TimerFired { .. })), 0);
    let snapshot = h.engine.instance_snapshot(handle.instance_id).await.unwrap();
    assert!(matches!(snapshot.state, ProcessState::Completed { .. }));
}

#[tokio::test]
async fn test_boundary_timer_interrupts_when_due() {
    let h = harness(vec![escalation()]);
    let handle = h
        .engine
        .start_process_instance("escalation", vars(json!({})), None)
        .await
        .unwrap();
    let scheduler = JobScheduler::new(h.engine.clone());

    // Not due yet.
    h.clock.advance(Duration::from_secs(60));
    assert_eq!(scheduler.run_once().await.unwrap(), 0);

    h.clock.advance(Duration::from_secs(3600));
    assert_eq!(scheduler.run_once().await.unwrap(), 1);
    assert_eq!(h.count(|e| matches!(e, EngineEvent::TimerFired { .. })), 1);

    let tasks = h.engine.tasks_for_instance(handle.instance_id).await.unwrap();
    let review = tasks.iter().find(|t| t.activity_id == "review").unwrap();
    assert_eq!(review.status, TaskStatus::Cancelled);
    assert_eq!(
        h.count(|e| matches!(
            e,
            EngineEvent::ActivityCancelled { activity_id, reason: EndReason::BoundaryInterrupted { .. }, .. }
                if activity_id == "review"
        )),
        1
    );
    h.open_task_at(handle.instance_id, "escalated").await;
    assert!(h.engine.jobs_for_instance(handle.instance_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_intermediate_timer_and_expression_due_date() {
    let def = ProcessModelBuilder::new("cooling_off")
        .start("start")
        .timer("wait", TimerSpec::Expression("delay_ms".into()))
        .user_task("confirm", task())
        .end("end")
        .flow("start", "wait")
        .flow("wait", "confirm")
        .flow("confirm", "end")
        .build_definition()
        .unwrap();
    let h = harness(vec![def]);
    let handle = h
        .engine
        .start_process_instance("cooling_off", vars(json!({ "delay_ms": 30_000 })), None)
        .await
        .unwrap();

    let jobs = h.engine.jobs_for_instance(handle.instance_id).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(
        jobs[0].due_at,
        Some(h.engine.now() + chrono::Duration::seconds(30))
    );

    h.clock.advance(Duration::from_secs(31));
    let claimed = h.engine.poll_due_jobs(5).await.unwrap();
    assert_eq!(claimed.len(), 1);
    let scheduler = JobScheduler::new(h.engine.clone());
    scheduler.execute(&claimed[0]).await.unwrap();
    h.open_task_at(handle.instance_id, "confirm").await;
}

/// A non-interrupting cycle fires the configured number of times.
#[tokio::test]
async fn test_non_interrupting_timer_cycle() {
    let def = ProcessModelBuilder::new("reminders")
        .start("start")
        .user_task("review", task())
        .boundary(
            "remind",
            "review",
            BoundaryTrigger::Timer(TimerSpec::Cycle {
                interval: Duration::from_secs(60),
                repetitions: Some(2),
            }),
            false,
        )
        .end("reminded")
        .end("end")
        .flow("start", "review")
        .flow("review", "end")
        .flow("remind", "reminded")
        .build_definition()
        .unwrap();
    let h = harness(vec![def]);
    let handle = h
        .engine
        .start_process_instance("reminders", vars(json!({})), None)
        .await
        .unwrap();
    let scheduler = JobScheduler::new(h.engine.clone());

    for _ in 0..3 {
        h.clock.advance(Duration::from_secs(61));
        scheduler.run_once().await.unwrap();
    }
    assert_eq!(h.count(|e| matches!(e, EngineEvent::TimerFired { .. })), 2);
    assert_eq!(h.started("remind"), 2);
    assert!(h.engine.jobs_for_instance(handle.instance_id).await.unwrap().is_empty());
    h.open_task_at(handle.instance_id, "review").await;
}

// =============================================================================
// ERRORS
// =============================================================================

#[tokio::test]
async fn test_error_end_caught_by_sub_process_boundary() {
    let def = ProcessModelBuilder::new("guarded")
        .start("start")
        .sub_process("checks", |b| {
            b.start("checks_start")
                .error_end("reject", "KYC_FAILED")
                .flow("checks_start", "reject")
        })
        .boundary(
            "on_reject",
            "checks",
            BoundaryTrigger::Error(Some("KYC_FAILED".into())),
            true,
        )
        .user_task("manual_review", task())
        .end("end")
        .end("reviewed")
        .flow("start", "checks")
        .flow("checks", "end")
        .flow("on_reject", "manual_review")
        .flow("manual_review", "reviewed")
        .build_definition()
        .unwrap();
    let h = harness(vec![def]);
    let handle = h
        .engine
        .start_process_instance("guarded", vars(json!({})), None)
        .await
        .unwrap();

    assert_eq!(handle.state, ProcessState::Running);
    h.open_task_at(handle.instance_id, "manual_review").await;
    assert_eq!(
        h.count(|e| matches!(e, EngineEvent::ErrorReceived { error_code, .. } if error_code == "KYC_FAILED")),
        1
    );
    assert_eq!(
        h.count(|e| matches!(e, EngineEvent::ActivityCancelled { activity_id, .. } if activity_id == "checks")),
        1
    );
    assert_eq!(h.count(|e| matches!(e, EngineEvent::ProcessFailed { .. })), 0);
}

#[tokio::test]
async fn test_uncaught_error_fails_instance() {
    let def = ProcessModelBuilder::new("fragile")
        .start("start")
        .error_end("boom", "E_BOOM")
        .flow("start", "boom")
        .build_definition()
        .unwrap();
    let h = harness(vec![def]);
    let handle = h
        .engine
        .start_process_instance("fragile", vars(json!({})), None)
        .await
        .unwrap();

    assert!(matches!(
        &handle.state,
        ProcessState::Failed { error_code, .. } if error_code == "E_BOOM"
    ));
    assert_eq!(h.count(|e| matches!(e, EngineEvent::ProcessFailed { .. })), 1);
    let snapshot = h.engine.instance_snapshot(handle.instance_id).await.unwrap();
    // Only the ended root remains.
    assert_eq!(snapshot.executions.len(), 1);
    assert!(snapshot.executions[0].parent.is_none());
    assert_eq!(snapshot.executions[0].state, ExecutionState::Ended);
}

/// A service task's business error starts the error event sub-process,
/// which interrupts the rest of the scope.
#[tokio::test]
async fn test_event_sub_process_catches_service_error() {
    let def = ProcessModelBuilder::new("screening")
        .start("start")
        .parallel_gateway("fork")
        .user_task("collect_docs", task())
        .service_task("sanctions", "sanctions")
        .end("end_docs")
        .end("end_sanctions")
        .flow("start", "fork")
        .flow("fork", "collect_docs")
        .flow("fork", "sanctions")
        .flow("collect_docs", "end_docs")
        .flow("sanctions", "end_sanctions")
        .event_sub_process("on_hit", |b| {
            b.error_start("hit_start", Some("SANCTIONS_HIT"))
                .user_task("compliance_review", UserTaskSpec::default().candidate_user("alice"))
                .end("hit_end")
                .flow("hit_start", "compliance_review")
                .flow("compliance_review", "hit_end")
        })
        .build_definition()
        .unwrap();

    let handler = |_: &ServiceContext| -> anyhow::Result<ServiceOutcome> {
        Ok(ServiceOutcome::BusinessError {
            code: "SANCTIONS_HIT".into(),
        })
    };
    let h = harness_with(
        vec![def],
        vec![("sanctions", Arc::new(handler) as Arc<dyn ServiceHandler>)],
    );
    let handle = h
        .engine
        .start_process_instance("screening", vars(json!({})), None)
        .await
        .unwrap();

    let tasks = h.engine.tasks_for_instance(handle.instance_id).await.unwrap();
    let docs = tasks.iter().find(|t| t.activity_id == "collect_docs").unwrap();
    assert_eq!(docs.status, TaskStatus::Cancelled);
    assert!(h.count(|e| matches!(
        e,
        EngineEvent::ActivityCancelled { reason: EndReason::EventSubProcessInterrupted { .. }, .. }
    )) >= 1);
    let review = h.open_task_at(handle.instance_id, "compliance_review").await;

    h.finish(review.id, vars(json!({ "cleared": false }))).await;
    let snapshot = h.engine.instance_snapshot(handle.instance_id).await.unwrap();
    assert!(matches!(snapshot.state, ProcessState::Completed { .. }));
}

/// An external worker reports a business error against a waiting execution.
#[tokio::test]
async fn test_throw_error_command_reaches_boundary() {
    let def = ProcessModelBuilder::new("external")
        .start("start")
        .user_task("upload", task())
        .boundary("any_error", "upload", BoundaryTrigger::Error(None), true)
        .end("end")
        .user_task("fix", task())
        .end("fixed")
        .flow("start", "upload")
        .flow("upload", "end")
        .flow("any_error", "fix")
        .flow("fix", "fixed")
        .build_definition()
        .unwrap();
    let h = harness(vec![def]);
    let handle = h
        .engine
        .start_process_instance("external", vars(json!({})), None)
        .await
        .unwrap();
    let upload = h.open_task_at(handle.instance_id, "upload").await;

    h.engine
        .throw_error(ExecRef::new(handle.instance_id, upload.execution), "VIRUS_FOUND")
        .await
        .unwrap();
    assert_eq!(
        h.engine.task(upload.id).await.unwrap().status,
        TaskStatus::Cancelled
    );
    h.open_task_at(handle.instance_id, "fix").await;
}

