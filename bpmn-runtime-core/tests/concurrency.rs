//! Optimistic concurrency: conflicting commits re-run the whole command,
//! give up after the configured attempts, and racing completions of
//! parallel branches release their join exactly once.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bpmn_runtime_core::model::UserTaskSpec;
use bpmn_runtime_core::store::{CommitBatch, CommitOutcome, InstanceRecord};
use bpmn_runtime_core::{
    EngineConfig, EngineError, EngineEvent, EventSubscription, Job, MemoryStore,
    ProcessDefinition, ProcessModelBuilder, RuntimeStore, SubscriptionKind, TaskStatus, Timestamp,
};
use common::{alice, harness_on, test_config, vars, Harness};
use serde_json::json;
use tokio::sync::Barrier;
use uuid::Uuid;

/// A memory store whose commits can be made to conflict, or to wait for a
/// second commit so two commands are guaranteed to race.
struct ContendedStore {
    inner: MemoryStore,
    /// Commits still to reject before touching the inner store.
    injected_conflicts: AtomicUsize,
    /// Commits still to hold at the barrier.
    held_commits: AtomicUsize,
    barrier: Barrier,
    commits: AtomicUsize,
    conflicts: AtomicUsize,
}

impl ContendedStore {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryStore::new(),
            injected_conflicts: AtomicUsize::new(0),
            held_commits: AtomicUsize::new(0),
            barrier: Barrier::new(2),
            commits: AtomicUsize::new(0),
            conflicts: AtomicUsize::new(0),
        })
    }

    fn conflict_next(&self, n: usize) {
        self.injected_conflicts.store(n, Ordering::SeqCst);
    }

    fn pair_next_two_commits(&self) {
        self.held_commits.store(2, Ordering::SeqCst);
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl RuntimeStore for ContendedStore {
    async fn load_instance(&self, id: Uuid) -> anyhow::Result<Option<InstanceRecord>> {
        self.inner.load_instance(id).await
    }

    async fn find_task_instance(&self, task_id: Uuid) -> anyhow::Result<Option<Uuid>> {
        self.inner.find_task_instance(task_id).await
    }

    async fn find_subscriptions(
        &self,
        kind: SubscriptionKind,
        key: &str,
    ) -> anyhow::Result<Vec<EventSubscription>> {
        self.inner.find_subscriptions(kind, key).await
    }

    async fn commit(&self, batch: CommitBatch) -> anyhow::Result<CommitOutcome> {
        if take_one(&self.held_commits) {
            self.barrier.wait().await;
        }
        if take_one(&self.injected_conflicts) {
            self.conflicts.fetch_add(1, Ordering::SeqCst);
            return Ok(CommitOutcome::Conflict("injected".to_string()));
        }
        let outcome = self.inner.commit(batch).await?;
        match outcome {
            CommitOutcome::Committed => self.commits.fetch_add(1, Ordering::SeqCst),
            CommitOutcome::Conflict(_) => self.conflicts.fetch_add(1, Ordering::SeqCst),
        };
        Ok(outcome)
    }

    async fn load_job(&self, id: Uuid) -> anyhow::Result<Option<Job>> {
        self.inner.load_job(id).await
    }

    async fn jobs_for_instance(&self, instance_id: Uuid) -> anyhow::Result<Vec<Job>> {
        self.inner.jobs_for_instance(instance_id).await
    }

    async fn find_acquirable_jobs(&self, now: Timestamp, limit: usize) -> anyhow::Result<Vec<Job>> {
        self.inner.find_acquirable_jobs(now, limit).await
    }

    async fn update_job(&self, job: &Job, expected_version: u64) -> anyhow::Result<bool> {
        self.inner.update_job(job, expected_version).await
    }

    async fn dead_jobs(&self) -> anyhow::Result<Vec<Job>> {
        self.inner.dead_jobs().await
    }

    async fn append_event(&self, instance_id: Uuid, event: &EngineEvent) -> anyhow::Result<u64> {
        self.inner.append_event(instance_id, event).await
    }

    async fn read_events(
        &self,
        instance_id: Uuid,
        from_seq: u64,
    ) -> anyhow::Result<Vec<(u64, EngineEvent)>> {
        self.inner.read_events(instance_id, from_seq).await
    }
}

fn review() -> UserTaskSpec {
    UserTaskSpec::default().candidate_user("alice")
}

fn approval() -> ProcessDefinition {
    ProcessModelBuilder::new("approval")
        .start("start")
        .user_task("review", review())
        .user_task("approve", review())
        .end("end")
        .flow("start", "review")
        .flow("review", "approve")
        .flow("approve", "end")
        .build_definition()
        .unwrap()
}

fn fork_join() -> ProcessDefinition {
    ProcessModelBuilder::new("fork_join")
        .start("start")
        .parallel_gateway("fork")
        .user_task("a", review())
        .user_task("b", review())
        .parallel_gateway("join")
        .user_task("after", review())
        .end("end")
        .flow("start", "fork")
        .flow("fork", "a")
        .flow("fork", "b")
        .flow("a", "join")
        .flow("b", "join")
        .flow("join", "after")
        .flow("after", "end")
        .build_definition()
        .unwrap()
}

fn contended(
    store: &Arc<ContendedStore>,
    config: EngineConfig,
    definitions: Vec<ProcessDefinition>,
) -> Harness {
    harness_on(store.clone(), config, definitions, Vec::new())
}

#[tokio::test]
async fn test_conflicting_commit_reruns_command() {
    let store = ContendedStore::new();
    let h = contended(&store, test_config(), vec![approval()]);
    let handle = h
        .engine
        .start_process_instance("approval", vars(json!({})), None)
        .await
        .unwrap();
    let review = h.open_task_at(handle.instance_id, "review").await;
    h.engine.claim_task(review.id, &alice()).await.unwrap();

    store.conflict_next(1);
    let done = h
        .engine
        .complete_task(review.id, &alice(), vars(json!({ "ok": true })))
        .await
        .unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(store.conflicts.load(Ordering::SeqCst), 1);

    // The rejected attempt left no trace: one completion, one next task.
    assert_eq!(h.count(|e| matches!(e, EngineEvent::TaskCompleted { .. })), 1);
    assert_eq!(h.started("approve"), 1);
    h.open_task_at(handle.instance_id, "approve").await;
    let snapshot = h.engine.instance_snapshot(handle.instance_id).await.unwrap();
    assert_eq!(snapshot.root_variables["ok"], json!(true));
}

#[tokio::test]
async fn test_persistent_conflicts_give_up() {
    let store = ContendedStore::new();
    let config = EngineConfig {
        max_command_retries: 3,
        ..test_config()
    };
    let h = contended(&store, config, vec![approval()]);
    let handle = h
        .engine
        .start_process_instance("approval", vars(json!({})), None)
        .await
        .unwrap();
    let review = h.open_task_at(handle.instance_id, "review").await;
    h.engine.claim_task(review.id, &alice()).await.unwrap();
    let committed = store.commits.load(Ordering::SeqCst);

    store.conflict_next(3);
    let err = h
        .engine
        .complete_task(review.id, &alice(), vars(json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ConcurrentModification { attempts: 3 }), "{err}");
    assert_eq!(store.conflicts.load(Ordering::SeqCst), 3);
    assert_eq!(store.commits.load(Ordering::SeqCst), committed);

    // Nothing of the failed command is visible.
    let task = h.engine.task(review.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Assigned);
    assert_eq!(h.count(|e| matches!(e, EngineEvent::TaskCompleted { .. })), 0);

    // The next attempt goes through normally.
    h.engine
        .complete_task(review.id, &alice(), vars(json!({})))
        .await
        .unwrap();
    h.open_task_at(handle.instance_id, "approve").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_racing_branch_completions_release_join_once() {
    let store = ContendedStore::new();
    let h = contended(&store, test_config(), vec![fork_join()]);
    let handle = h
        .engine
        .start_process_instance("fork_join", vars(json!({})), None)
        .await
        .unwrap();
    let a = h.open_task_at(handle.instance_id, "a").await;
    let b = h.open_task_at(handle.instance_id, "b").await;
    h.engine.claim_task(a.id, &alice()).await.unwrap();
    h.engine.claim_task(b.id, &alice()).await.unwrap();

    // Both commands load the same instance version before either commits.
    store.pair_next_two_commits();
    let spawned: Vec<_> = [a.id, b.id]
        .into_iter()
        .map(|task_id| {
            let engine = h.engine.clone();
            tokio::spawn(async move {
                engine
                    .complete_task(task_id, &alice(), vars(json!({})))
                    .await
            })
        })
        .collect();
    for join in spawned {
        let done = join.await.unwrap().unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
    }

    assert!(store.conflicts.load(Ordering::SeqCst) >= 1, "the loser re-ran");
    assert_eq!(h.count(|e| matches!(e, EngineEvent::TaskCompleted { .. })), 2);
    assert_eq!(h.started("after"), 1);
    h.open_task_at(handle.instance_id, "after").await;
}
