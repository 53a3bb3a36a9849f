//! Engine facade: every public command runs as one unit of work.
//!
//! A command loads the affected instance family from the store, applies
//! itself to an in-memory [`Runtime`], drains the agenda and commits the
//! resulting batch atomically with optimistic version checks. On a
//! version conflict the whole command is re-run against fresh state, up to
//! `max_command_retries` times. Events are published only after commit.
//! Signals thrown during the command are committed with it as jobs and
//! broadcast right afterwards as follow-up commands; a broadcast that fails
//! stays behind as a job with retries, like any other.

use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::correlation::MessageCorrelation;
use crate::dispatch::Runtime;
use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventListener, EventSink};
use crate::expression::ExpressionEngine;
use crate::job::{ClaimedJob, Job, JobHandler, JobOutcome, JobState};
use crate::model::{DefinitionRegistry, ProcessDefinition};
use crate::scheduler::JobScheduler;
use crate::service::{ServiceHandler, ServiceRegistry};
use crate::state::InstanceSnapshot;
use crate::store::{CommitOutcome, InstanceRecord, RuntimeStore};
use crate::subscription::SubscriptionKind;
use crate::task::TaskSnapshot;
use crate::types::{Actor, ExecRef, ExecutionHandle, Variables};

/// Everything a command needs, shared by all clones of the engine.
pub(crate) struct EngineCore {
    pub(crate) store: Arc<dyn RuntimeStore>,
    pub(crate) definitions: DefinitionRegistry,
    pub(crate) expressions: ExpressionEngine,
    pub(crate) services: ServiceRegistry,
    pub(crate) config: EngineConfig,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) events: EventSink,
}

#[derive(Clone)]
pub struct ProcessEngine {
    core: Arc<EngineCore>,
}

impl std::fmt::Debug for ProcessEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessEngine")
            .field("definitions", &self.core.definitions.len())
            .field("services", &self.core.services)
            .field("worker_id", &self.core.config.worker_id)
            .finish()
    }
}

pub struct ProcessEngineBuilder {
    store: Arc<dyn RuntimeStore>,
    definitions: DefinitionRegistry,
    services: ServiceRegistry,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    events: EventSink,
}

impl ProcessEngineBuilder {
    pub fn definition(mut self, definition: ProcessDefinition) -> Self {
        self.definitions.register(definition);
        self
    }

    pub fn definitions(mut self, definitions: DefinitionRegistry) -> Self {
        self.definitions = definitions;
        self
    }

    pub fn service(mut self, name: impl Into<String>, handler: Arc<dyn ServiceHandler>) -> Self {
        self.services.register(name, handler);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn listener(mut self, listener: Arc<dyn EventListener>) -> Self {
        self.events = self.events.with_listener(listener);
        self
    }

    pub fn build(self) -> ProcessEngine {
        ProcessEngine {
            core: Arc::new(EngineCore {
                store: self.store,
                definitions: self.definitions,
                expressions: ExpressionEngine::new(),
                services: self.services,
                config: self.config,
                clock: self.clock,
                events: self.events,
            }),
        }
    }
}

type FollowUp<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

impl ProcessEngine {
    pub fn builder(store: Arc<dyn RuntimeStore>) -> ProcessEngineBuilder {
        ProcessEngineBuilder {
            store,
            definitions: DefinitionRegistry::new(),
            services: ServiceRegistry::new(),
            config: EngineConfig::default(),
            clock: Arc::new(SystemClock),
            events: EventSink::new(),
        }
    }

    pub(crate) fn core(&self) -> &EngineCore {
        &self.core
    }

    pub fn config(&self) -> &EngineConfig {
        &self.core.config
    }

    pub fn definitions(&self) -> &DefinitionRegistry {
        &self.core.definitions
    }

    pub fn now(&self) -> crate::types::Timestamp {
        self.core.clock.now()
    }

    /// Publish events that were persisted outside a command (job
    /// bookkeeping).
    pub(crate) fn publish(&self, events: &[EngineEvent]) {
        self.core.events.publish(events);
    }

    // ── Unit-of-work driver ──

    /// Run one command. `prepare` names the instances to load (resolved
    /// again on every attempt); `apply` mutates the runtime and may drain
    /// the agenda itself; whatever it left queued runs before commit.
    async fn run_command<R, P, Fut, A>(
        &self,
        name: &'static str,
        prepare: P,
        apply: A,
    ) -> EngineResult<(R, Vec<Uuid>)>
    where
        P: Fn() -> Fut,
        Fut: Future<Output = EngineResult<Vec<Uuid>>>,
        A: Fn(&mut Runtime<'_>) -> EngineResult<R>,
    {
        let attempts = self.core.config.max_command_retries.max(1);
        for attempt in 1..=attempts {
            let roots = prepare().await?;
            let mut rt = Runtime::new(&self.core, self.core.clock.now());
            rt.load_family(&roots).await?;
            let result = apply(&mut rt)?;
            rt.run()?;

            let (batch, deferred) = rt.into_commit();
            if batch.is_empty() {
                return Ok((result, deferred));
            }
            let events = batch.events.clone();
            match self.core.store.commit(batch).await? {
                CommitOutcome::Committed => {
                    self.core.events.publish(&events);
                    return Ok((result, deferred));
                }
                CommitOutcome::Conflict(reason) => {
                    tracing::warn!(command = name, attempt, %reason, "optimistic lock conflict; retrying command");
                }
            }
        }
        Err(EngineError::ConcurrentModification { attempts })
    }

    /// Run the signal throws a committed command queued. `depth` counts
    /// nested follow-ups; past the configured limit the jobs are left to the
    /// job worker instead of running inline.
    fn flush_deferred(&self, jobs: Vec<Uuid>, depth: u32) -> FollowUp<'_> {
        Box::pin(async move {
            if jobs.is_empty() {
                return;
            }
            let limit = self.core.config.max_deferred_signal_depth;
            if depth > limit {
                tracing::warn!(depth, limit, count = jobs.len(), "deferred signal depth exceeded; leaving broadcasts to the job worker");
                return;
            }
            let scheduler = JobScheduler::new(self.clone());
            for job_id in jobs {
                let job = match self.core.store.load_job(job_id).await {
                    Ok(Some(job)) => job,
                    Ok(None) => {
                        tracing::debug!(job_id = %job_id, "signal throw already ran");
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!(job_id = %job_id, error = %e, "signal throw not loaded; leaving it to the job worker");
                        continue;
                    }
                };
                match scheduler.execute_unclaimed(job, depth).await {
                    Ok(outcome) => {
                        tracing::debug!(job_id = %job_id, depth, ?outcome, "deferred signal broadcast");
                    }
                    Err(e) => {
                        tracing::warn!(job_id = %job_id, error = %e, "deferred signal broadcast not recorded; leaving it to the job worker");
                    }
                }
            }
        })
    }

    async fn broadcast(&self, name: &str, variables: &Variables, depth: u32) -> EngineResult<usize> {
        crate::variables::validate_variables(variables)?;
        let (delivered, deferred) = self
            .run_command(
                "signal",
                || self.subscriber_roots(SubscriptionKind::Signal, name),
                |rt| rt.broadcast_signal(name, variables),
            )
            .await?;
        self.flush_deferred(deferred, depth + 1).await;
        Ok(delivered)
    }

    async fn subscriber_roots(&self, kind: SubscriptionKind, key: &str) -> EngineResult<Vec<Uuid>> {
        let subs = self.core.store.find_subscriptions(kind, key).await?;
        let ids: BTreeSet<Uuid> = subs.into_iter().map(|s| s.instance_id).collect();
        Ok(ids.into_iter().collect())
    }

    /// The job's own instance, plus every signal subscriber for a throw.
    async fn job_roots(&self, instance_id: Uuid, signal: Option<&str>) -> EngineResult<Vec<Uuid>> {
        let mut roots = vec![instance_id];
        if let Some(name) = signal {
            roots.extend(self.subscriber_roots(SubscriptionKind::Signal, name).await?);
        }
        Ok(roots)
    }

    async fn task_roots(&self, task_id: Uuid) -> EngineResult<Vec<Uuid>> {
        let instance_id = self
            .core
            .store
            .find_task_instance(task_id)
            .await?
            .ok_or(EngineError::TaskNotFound(task_id))?;
        Ok(vec![instance_id])
    }

    async fn load(&self, instance_id: Uuid) -> EngineResult<InstanceRecord> {
        self.core
            .store
            .load_instance(instance_id)
            .await?
            .ok_or(EngineError::InstanceNotFound(instance_id))
    }

    // ── Commands ──

    #[instrument(skip(self, variables))]
    pub async fn start_process_instance(
        &self,
        definition_id: &str,
        variables: Variables,
        business_key: Option<String>,
    ) -> EngineResult<ExecutionHandle> {
        let def = self.core.definitions.get(definition_id)?;
        let start = def
            .none_start(None)
            .ok_or_else(|| {
                EngineError::IllegalState(format!("{definition_id} has no none start event"))
            })?
            .to_string();

        let (handle, deferred) = self
            .run_command(
                "start_process_instance",
                || async { Ok(Vec::new()) },
                |rt| {
                    let root =
                        rt.start_instance(&def, &start, variables.clone(), business_key.clone(), None)?;
                    rt.run()?;
                    let inst = rt.instance(root.instance_id)?;
                    Ok(ExecutionHandle {
                        instance_id: root.instance_id,
                        root_execution: root.execution,
                        definition_id: def.id().to_string(),
                        business_key: inst.business_key.clone(),
                        state: inst.state.clone(),
                    })
                },
            )
            .await?;
        self.flush_deferred(deferred, 1).await;
        Ok(handle)
    }

    /// Deliver to every live subscriber and start every signal-start
    /// definition. Returns how many deliveries and starts happened.
    #[instrument(skip(self, variables))]
    pub async fn signal(&self, name: &str, variables: Variables) -> EngineResult<usize> {
        self.broadcast(name, &variables, 1).await
    }

    /// Correlate a message to exactly one target. Several matching waiters
    /// fail with [`EngineError::AmbiguousCorrelation`]; none at all with
    /// [`EngineError::NoMatchingSubscription`].
    #[instrument(skip(self, variables))]
    pub async fn receive_message(
        &self,
        name: &str,
        correlation_key: Option<serde_json::Value>,
        variables: Variables,
    ) -> EngineResult<MessageCorrelation> {
        crate::variables::validate_variables(&variables)?;
        let (outcome, deferred) = self
            .run_command(
                "receive_message",
                || self.subscriber_roots(SubscriptionKind::Message, name),
                |rt| rt.correlate_message(name, correlation_key.as_ref(), &variables),
            )
            .await?;
        self.flush_deferred(deferred, 1).await;
        Ok(outcome)
    }

    #[instrument(skip(self, actor), fields(user = %actor.user_id))]
    pub async fn claim_task(&self, task_id: Uuid, actor: &Actor) -> EngineResult<TaskSnapshot> {
        let (snapshot, _) = self
            .run_command(
                "claim_task",
                || self.task_roots(task_id),
                |rt| rt.claim_task(task_id, actor),
            )
            .await?;
        Ok(snapshot)
    }

    #[instrument(skip(self, actor), fields(user = %actor.user_id))]
    pub async fn release_task(&self, task_id: Uuid, actor: &Actor) -> EngineResult<TaskSnapshot> {
        let (snapshot, _) = self
            .run_command(
                "release_task",
                || self.task_roots(task_id),
                |rt| rt.release_task(task_id, actor),
            )
            .await?;
        Ok(snapshot)
    }

    #[instrument(skip(self, actor, variables), fields(user = %actor.user_id))]
    pub async fn complete_task(
        &self,
        task_id: Uuid,
        actor: &Actor,
        variables: Variables,
    ) -> EngineResult<TaskSnapshot> {
        let (snapshot, deferred) = self
            .run_command(
                "complete_task",
                || self.task_roots(task_id),
                |rt| rt.complete_task(task_id, actor, &variables),
            )
            .await?;
        self.flush_deferred(deferred, 1).await;
        Ok(snapshot)
    }

    /// Stage task-local variables without completing the task.
    #[instrument(skip(self, actor, variables), fields(user = %actor.user_id))]
    pub async fn update_task_variables(
        &self,
        task_id: Uuid,
        actor: &Actor,
        variables: Variables,
    ) -> EngineResult<TaskSnapshot> {
        let (snapshot, _) = self
            .run_command(
                "update_task_variables",
                || self.task_roots(task_id),
                |rt| rt.update_task_variables(task_id, actor, &variables),
            )
            .await?;
        Ok(snapshot)
    }

    #[instrument(skip(self))]
    pub async fn delete_task(&self, task_id: Uuid, reason: &str) -> EngineResult<TaskSnapshot> {
        let (snapshot, deferred) = self
            .run_command(
                "delete_task",
                || self.task_roots(task_id),
                |rt| rt.delete_task(task_id, reason),
            )
            .await?;
        self.flush_deferred(deferred, 1).await;
        Ok(snapshot)
    }

    /// Throw a business error from a waiting execution, as an external
    /// worker reporting a failed step would.
    #[instrument(skip(self))]
    pub async fn throw_error(&self, at: ExecRef, error_code: &str) -> EngineResult<()> {
        let (_, deferred) = self
            .run_command(
                "throw_error",
                || async { Ok(vec![at.instance_id]) },
                |rt| rt.throw_error_at(at, error_code),
            )
            .await?;
        self.flush_deferred(deferred, 1).await;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn delete_process_instance(&self, instance_id: Uuid, reason: &str) -> EngineResult<()> {
        self.run_command(
            "delete_process_instance",
            || async { Ok(vec![instance_id]) },
            |rt| rt.delete_instance(instance_id, reason),
        )
        .await?;
        Ok(())
    }

    /// Run one job's handler against the version the caller last saw.
    /// `depth` is the follow-up nesting the job runs at (0 when polled).
    pub(crate) async fn run_job(&self, job: &Job, depth: u32) -> EngineResult<JobOutcome> {
        let (job_id, version, instance_id) = (job.id, job.version, job.instance_id);
        let signal = match &job.handler {
            JobHandler::SignalThrow { signal, .. } => Some(signal.as_str()),
            _ => None,
        };
        let (outcome, deferred) = self
            .run_command(
                "execute_job",
                || self.job_roots(instance_id, signal),
                |rt| rt.execute_job(job_id, version),
            )
            .await?;
        self.flush_deferred(deferred, depth + 1).await;
        Ok(outcome)
    }

    /// Claim up to `limit` due jobs for this engine's worker id.
    #[instrument(skip(self))]
    pub async fn poll_due_jobs(&self, limit: usize) -> EngineResult<Vec<ClaimedJob>> {
        JobScheduler::new(self.clone()).poll(limit).await
    }

    /// Execute a job by id, with the scheduler's failure handling.
    #[instrument(skip(self))]
    pub async fn execute_job(&self, job_id: Uuid) -> EngineResult<JobOutcome> {
        let Some(job) = self.core.store.load_job(job_id).await? else {
            return Err(EngineError::JobNotFound(job_id));
        };
        JobScheduler::new(self.clone()).execute_unclaimed(job, 0).await
    }

    // ── Queries and operator actions ──

    pub async fn instance_snapshot(&self, instance_id: Uuid) -> EngineResult<InstanceSnapshot> {
        Ok(self.load(instance_id).await?.state.snapshot())
    }

    pub async fn tasks_for_instance(&self, instance_id: Uuid) -> EngineResult<Vec<TaskSnapshot>> {
        let record = self.load(instance_id).await?;
        let mut tasks: Vec<TaskSnapshot> = record.state.tasks.values().map(|t| t.snapshot()).collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(tasks)
    }

    pub async fn task(&self, task_id: Uuid) -> EngineResult<TaskSnapshot> {
        let instance_id = self
            .core
            .store
            .find_task_instance(task_id)
            .await?
            .ok_or(EngineError::TaskNotFound(task_id))?;
        self.load(instance_id)
            .await?
            .state
            .tasks
            .get(&task_id)
            .map(|t| t.snapshot())
            .ok_or(EngineError::TaskNotFound(task_id))
    }

    pub async fn get_variable(
        &self,
        at: ExecRef,
        name: &str,
    ) -> EngineResult<Option<serde_json::Value>> {
        let record = self.load(at.instance_id).await?;
        record.state.execution(at.execution)?;
        Ok(record.state.get_variable(at.execution, name).cloned())
    }

    pub async fn jobs_for_instance(&self, instance_id: Uuid) -> EngineResult<Vec<Job>> {
        Ok(self.core.store.jobs_for_instance(instance_id).await?)
    }

    pub async fn dead_jobs(&self) -> EngineResult<Vec<Job>> {
        Ok(self.core.store.dead_jobs().await?)
    }

    /// Operator retry: a dead job becomes pending again with `retries`
    /// attempts.
    #[instrument(skip(self))]
    pub async fn retry_dead_job(&self, job_id: Uuid, retries: u32) -> EngineResult<Job> {
        let mut job = self
            .core
            .store
            .load_job(job_id)
            .await?
            .ok_or(EngineError::JobNotFound(job_id))?;
        if job.state != JobState::Dead {
            return Err(EngineError::IllegalState(format!(
                "job {job_id} is {:?}, not dead",
                job.state
            )));
        }
        let expected = job.version;
        job.revive(retries);
        if !self.core.store.update_job(&job, expected).await? {
            return Err(EngineError::ConcurrentModification { attempts: 1 });
        }
        job.version = expected + 1;
        tracing::info!(job_id = %job_id, retries = job.retries_remaining, "dead job revived");
        Ok(job)
    }

    pub async fn read_events(
        &self,
        instance_id: Uuid,
        from_seq: u64,
    ) -> EngineResult<Vec<(u64, EngineEvent)>> {
        Ok(self.core.store.read_events(instance_id, from_seq).await?)
    }
}
