//! Event correlation: subscriptions, timers, boundary events, signal and
//! message delivery, and error propagation.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::clock::add_duration;
use crate::dispatch::{Op, Runtime};
use crate::error::{EngineError, EngineResult};
use crate::events::EngineEvent;
use crate::job::{CycleState, Job, JobHandler};
use crate::model::{
    BoundarySpec, BoundaryTrigger, ElementKind, MessageRef, ProcessDefinition, StartTrigger,
    TimerSpec,
};
use crate::subscription::{EventSubscription, SubscriptionKind, ANY_ERROR};
use crate::tree::ExecutionKind;
use crate::types::{EndReason, ExecRef, Variables};

/// Result of correlating one message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageCorrelation {
    /// Delivered to the waiting execution.
    Delivered { at: ExecRef },
    /// No execution was waiting; a message start event created an instance.
    Started { instance_id: Uuid },
}

impl Runtime<'_> {
    // ── Subscriptions ──

    pub(crate) fn subscribe(
        &mut self,
        owner: ExecRef,
        kind: SubscriptionKind,
        key: &str,
        activity_id: &str,
        correlation_value: Option<serde_json::Value>,
    ) -> EngineResult<()> {
        let sub = EventSubscription {
            id: Uuid::now_v7(),
            instance_id: owner.instance_id,
            execution: owner.execution,
            kind,
            key: key.to_string(),
            activity_id: activity_id.to_string(),
            correlation_value,
            created_at: self.now(),
        };
        tracing::debug!(execution = %owner, %kind, key, activity = activity_id, "subscribed");
        self.instance_mut(owner.instance_id)?
            .subscriptions
            .insert(sub.id, sub);
        Ok(())
    }

    /// The correlation key is resolved here, once, against the owner's scope.
    pub(crate) fn subscribe_message(
        &mut self,
        owner: ExecRef,
        activity_id: &str,
        message: &MessageRef,
    ) -> EngineResult<()> {
        let correlation_value = match &message.correlation_key {
            Some(expr) => {
                let vars = self.visible(owner)?;
                Some(self.core().expressions.evaluate(expr, &vars)?)
            }
            None => None,
        };
        self.subscribe(
            owner,
            SubscriptionKind::Message,
            &message.name,
            activity_id,
            correlation_value,
        )
    }

    pub(crate) fn schedule_timer(
        &mut self,
        owner: ExecRef,
        activity_id: &str,
        spec: &TimerSpec,
    ) -> EngineResult<()> {
        let now = self.now();
        let (due_at, cycle) = match spec {
            TimerSpec::Duration(d) => (add_duration(now, *d), None),
            TimerSpec::Date(at) => (*at, None),
            TimerSpec::Cycle {
                interval,
                repetitions,
            } => (
                add_duration(now, *interval),
                Some(CycleState {
                    interval_ms: u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
                    remaining: repetitions.map(|n| n.saturating_sub(1)),
                }),
            ),
            TimerSpec::Expression(expr) => {
                let vars = self.visible(owner)?;
                (self.core().expressions.evaluate_due(expr, &vars, now)?, None)
            }
        };
        let job = Job::timer(
            owner,
            activity_id,
            due_at,
            cycle,
            self.core().config.default_job_retries,
            now,
        );
        self.add_timer_job(job);
        Ok(())
    }

    fn add_timer_job(&mut self, job: Job) {
        if let (JobHandler::TimerFire { activity_id, .. }, Some(due_at)) = (&job.handler, job.due_at) {
            tracing::debug!(job_id = %job.id, execution = %job.exec_ref(), activity = %activity_id, %due_at, "timer scheduled");
            self.emit(EngineEvent::TimerScheduled {
                job_id: job.id,
                at: job.exec_ref(),
                activity_id: activity_id.clone(),
                due_at,
            });
        }
        self.uow.add_job(job);
    }

    /// Register the boundary events of `activity_id` on its owning scope.
    pub(crate) fn attach_boundaries(
        &mut self,
        owner: ExecRef,
        activity_id: &str,
        def: &ProcessDefinition,
    ) -> EngineResult<()> {
        for boundary_id in def.boundaries_of(activity_id) {
            let ElementKind::BoundaryEvent(spec) = &def.element(boundary_id)?.kind else {
                continue;
            };
            match &spec.trigger {
                BoundaryTrigger::Timer(timer) => self.schedule_timer(owner, boundary_id, timer)?,
                BoundaryTrigger::Signal(name) => {
                    self.subscribe(owner, SubscriptionKind::Signal, name, boundary_id, None)?
                }
                BoundaryTrigger::Message(message) => {
                    self.subscribe_message(owner, boundary_id, message)?
                }
                BoundaryTrigger::Error(code) => self.subscribe(
                    owner,
                    SubscriptionKind::Error,
                    code.as_deref().unwrap_or(ANY_ERROR),
                    boundary_id,
                    None,
                )?,
            }
        }
        Ok(())
    }

    /// Error-start event sub-processes of `container` listen on `scope`.
    pub(crate) fn register_event_sub_processes(
        &mut self,
        scope: ExecRef,
        container: Option<&str>,
        def: &ProcessDefinition,
    ) -> EngineResult<()> {
        for esp in def.event_sub_processes(container) {
            let Some(start) = def.event_sub_process_start(esp) else {
                continue;
            };
            if let ElementKind::StartEvent(StartTrigger::Error(code)) = &def.element(start)?.kind {
                self.subscribe(
                    scope,
                    SubscriptionKind::Error,
                    code.as_deref().unwrap_or(ANY_ERROR),
                    esp,
                    None,
                )?;
            }
        }
        Ok(())
    }

    // ── Boundary events ──

    /// `owner` is the activity scope (or multi-instance body) the boundary
    /// is attached to.
    fn trigger_boundary(
        &mut self,
        owner: ExecRef,
        boundary_id: &str,
        spec: &BoundarySpec,
        payload: &Variables,
    ) -> EngineResult<()> {
        let branch = self.parent_of(owner)?;
        tracing::debug!(
            execution = %owner,
            boundary = boundary_id,
            interrupting = spec.cancel_activity,
            "boundary event triggered"
        );

        let token = if spec.cancel_activity {
            self.end_execution(
                owner,
                EndReason::BoundaryInterrupted {
                    boundary_id: boundary_id.to_string(),
                },
            )?;
            self.instance_mut(owner.instance_id)?
                .tree
                .move_to(branch.execution, boundary_id);
            branch
        } else {
            let scope = self.parent_of(branch)?;
            let token = self.create_child(scope, Some(boundary_id), ExecutionKind::Branch, true)?;
            self.instance_mut(owner.instance_id)?
                .tree
                .refresh_concurrency(scope.execution);
            token
        };
        self.set_variables(token, payload)?;
        self.emit(EngineEvent::ActivityStarted {
            at: token,
            activity_id: boundary_id.to_string(),
        });
        self.push(Op::Complete { at: token });
        Ok(())
    }

    // ── Signals and messages ──

    /// Deliver a signal or message to one subscription.
    fn deliver(&mut self, sub: &EventSubscription, payload: &Variables) -> EngineResult<()> {
        let def = self.definition(sub.instance_id)?;
        let element = def.element(&sub.activity_id)?;
        let at = sub.exec_ref();

        // Non-interrupting boundaries keep listening while the activity runs.
        let keep = matches!(&element.kind, ElementKind::BoundaryEvent(spec) if !spec.cancel_activity);
        if !keep {
            self.instance_mut(sub.instance_id)?
                .subscriptions
                .remove(&sub.id);
        }

        let activity_id = sub.activity_id.clone();
        self.emit(match sub.kind {
            SubscriptionKind::Signal => EngineEvent::SignalReceived {
                at,
                activity_id,
                signal: sub.key.clone(),
            },
            SubscriptionKind::Message => EngineEvent::MessageReceived {
                at,
                activity_id,
                message: sub.key.clone(),
            },
            SubscriptionKind::Error => EngineEvent::ErrorReceived {
                at,
                activity_id,
                error_code: sub.key.clone(),
            },
        });

        if let ElementKind::BoundaryEvent(spec) = &element.kind {
            return self.trigger_boundary(at, &sub.activity_id, spec, payload);
        }
        self.set_variables(at, payload)?;
        self.push(Op::Complete { at });
        Ok(())
    }

    /// Deliver to every live subscriber of the loaded instances, snapshotted
    /// before the first delivery, then run signal start events. Returns the
    /// number of deliveries plus started instances.
    pub(crate) fn broadcast_signal(&mut self, name: &str, payload: &Variables) -> EngineResult<usize> {
        let mut subscribers: Vec<EventSubscription> = self
            .uow
            .instances()
            .filter(|i| i.is_running())
            .flat_map(|i| i.subscriptions_matching(SubscriptionKind::Signal, name).cloned())
            .collect();
        subscribers.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        let mut delivered = 0;
        for sub in subscribers {
            let still_live = self
                .instance(sub.instance_id)
                .is_ok_and(|i| i.is_running() && i.subscriptions.contains_key(&sub.id));
            if !still_live {
                tracing::debug!(subscription = %sub.id, "subscriber ended by an earlier delivery");
                continue;
            }
            self.deliver(&sub, payload)?;
            self.run()?;
            delivered += 1;
        }

        for (def, start) in self.core().definitions.signal_starts(name) {
            self.start_instance(&def, &start, payload.clone(), None, None)?;
            delivered += 1;
        }
        Ok(delivered)
    }

    /// Resolve exactly one target for a message: a waiting subscription, or
    /// failing that a message start event.
    ///
    /// No target at all is `NoMatchingSubscription`. More than one waiting
    /// subscription (or, with none waiting, more than one message start) is
    /// rejected as `AmbiguousCorrelation` rather than `NoMatchingSubscription`,
    /// so callers can tell a missing key from a too-broad one; nothing is
    /// delivered in either case.
    pub(crate) fn correlate_message(
        &mut self,
        name: &str,
        correlation_key: Option<&serde_json::Value>,
        payload: &Variables,
    ) -> EngineResult<MessageCorrelation> {
        let matches: Vec<EventSubscription> = self
            .uow
            .instances()
            .filter(|i| i.is_running())
            .flat_map(|i| {
                i.subscriptions
                    .values()
                    .filter(|s| s.matches_message(name, correlation_key))
                    .cloned()
            })
            .collect();

        match matches.as_slice() {
            [sub] => {
                self.deliver(sub, payload)?;
                Ok(MessageCorrelation::Delivered { at: sub.exec_ref() })
            }
            [] => {
                let starts = self.core().definitions.message_starts(name);
                match starts.as_slice() {
                    [(def, start)] => {
                        let root = self.start_instance(def, start, payload.clone(), None, None)?;
                        Ok(MessageCorrelation::Started {
                            instance_id: root.instance_id,
                        })
                    }
                    [] => Err(EngineError::NoMatchingSubscription {
                        kind: SubscriptionKind::Message,
                        name: name.to_string(),
                        correlation_key: correlation_key.cloned(),
                    }),
                    many => Err(EngineError::AmbiguousCorrelation {
                        name: name.to_string(),
                        correlation_key: correlation_key.cloned(),
                        matches: many.len(),
                    }),
                }
            }
            many => Err(EngineError::AmbiguousCorrelation {
                name: name.to_string(),
                correlation_key: correlation_key.cloned(),
                matches: many.len(),
            }),
        }
    }

    // ── Timers ──

    /// Fire a due timer job. The job is deleted against its loaded version.
    pub(crate) fn fire_timer(&mut self, job: &Job) -> EngineResult<()> {
        let JobHandler::TimerFire { activity_id, cycle } = &job.handler else {
            return Err(EngineError::IllegalState(format!("job {} is not a timer", job.id)));
        };
        let at = job.exec_ref();
        self.uow.delete_job(job.id);
        self.emit(EngineEvent::TimerFired {
            job_id: job.id,
            at,
            activity_id: activity_id.clone(),
        });

        let def = self.definition(at.instance_id)?;
        match &def.element(activity_id)?.kind {
            ElementKind::BoundaryEvent(spec) => {
                if let Some(next) = cycle.as_ref().filter(|_| !spec.cancel_activity) {
                    if next.remaining != Some(0) {
                        let now = self.now();
                        let due_at = add_duration(now, Duration::from_millis(next.interval_ms));
                        let again = Job::timer(
                            at,
                            activity_id,
                            due_at,
                            Some(CycleState {
                                interval_ms: next.interval_ms,
                                remaining: next.remaining.map(|r| r - 1),
                            }),
                            self.core().config.default_job_retries,
                            now,
                        );
                        self.add_timer_job(again);
                    }
                }
                self.trigger_boundary(at, activity_id, spec, &Variables::new())
            }
            _ => {
                self.push(Op::Complete { at });
                Ok(())
            }
        }
    }

    // ── Errors ──

    /// Walk from `from` up the scope lineage (and on into calling
    /// instances) to the first catch for `code`. Within one execution,
    /// event sub-processes win over boundary events and an exact code wins
    /// over a catch-all.
    pub(crate) fn throw_error(&mut self, from: ExecRef, code: &str) -> EngineResult<()> {
        tracing::debug!(execution = %from, code, "error thrown");
        let mut cursor = from;
        loop {
            if let Some(sub) = self.find_error_catch(cursor, code)? {
                return self.catch_error(&sub, code);
            }
            match self.instance(cursor.instance_id)?.super_execution {
                Some(caller) if self.is_live(caller) => {
                    tracing::debug!(
                        instance_id = %cursor.instance_id,
                        caller = %caller,
                        code,
                        "error escapes called instance"
                    );
                    cursor = caller;
                }
                _ => return self.fail_instance(cursor.instance_id, code),
            }
        }
    }

    fn find_error_catch(&self, from: ExecRef, code: &str) -> EngineResult<Option<EventSubscription>> {
        let def = self.definition(from.instance_id)?;
        let inst = self.instance(from.instance_id)?;
        for exec in inst.tree.lineage(from.execution) {
            let (event_sub_processes, boundaries): (Vec<&EventSubscription>, Vec<&EventSubscription>) =
                inst.subscriptions_of(exec)
                    .filter(|s| s.kind == SubscriptionKind::Error)
                    .partition(|s| {
                        def.element(&s.activity_id)
                            .is_ok_and(|e| matches!(e.kind, ElementKind::EventSubProcess(_)))
                    });
            for group in [event_sub_processes, boundaries] {
                let catch = group
                    .iter()
                    .find(|s| s.key == code)
                    .or_else(|| group.iter().find(|s| s.key == ANY_ERROR));
                if let Some(sub) = catch {
                    return Ok(Some((*sub).clone()));
                }
            }
        }
        Ok(None)
    }

    fn catch_error(&mut self, sub: &EventSubscription, code: &str) -> EngineResult<()> {
        let owner = sub.exec_ref();
        self.emit(EngineEvent::ErrorReceived {
            at: owner,
            activity_id: sub.activity_id.clone(),
            error_code: code.to_string(),
        });
        let def = self.definition(owner.instance_id)?;
        match &def.element(&sub.activity_id)?.kind {
            ElementKind::EventSubProcess(_) => {
                self.start_event_sub_process(owner, &sub.activity_id, &def)
            }
            ElementKind::BoundaryEvent(spec) => {
                // Error boundaries always interrupt.
                let spec = BoundarySpec {
                    cancel_activity: true,
                    ..spec.clone()
                };
                self.trigger_boundary(owner, &sub.activity_id, &spec, &Variables::new())
            }
            _ => Err(EngineError::IllegalState(format!(
                "{} cannot catch errors",
                sub.activity_id
            ))),
        }
    }

    /// Interrupt `scope`'s content and run the event sub-process inside it.
    fn start_event_sub_process(
        &mut self,
        scope: ExecRef,
        esp_id: &str,
        def: &ProcessDefinition,
    ) -> EngineResult<()> {
        let start = def.event_sub_process_start(esp_id).ok_or_else(|| {
            EngineError::IllegalState(format!("event sub-process {esp_id} has no start event"))
        })?;

        let inst = self.instance_mut(scope.instance_id)?;
        inst.subscriptions.retain(|_, s| {
            s.execution != scope.execution
                || !def
                    .element(&s.activity_id)
                    .is_ok_and(|e| matches!(e.kind, ElementKind::EventSubProcess(_)))
        });
        let content = inst.tree.children(scope.execution).to_vec();
        for child in content {
            self.end_execution(
                ExecRef::new(scope.instance_id, child),
                EndReason::EventSubProcessInterrupted {
                    event_sub_process_id: esp_id.to_string(),
                },
            )?;
        }

        let esp = self.create_child(
            scope,
            Some(esp_id),
            ExecutionKind::EventSubProcess {
                activity_id: esp_id.to_string(),
            },
            false,
        )?;
        self.instance_mut(scope.instance_id)?
            .variables
            .create_frame(esp.execution);
        self.wait(esp)?;
        self.emit(EngineEvent::ActivityStarted {
            at: esp,
            activity_id: esp_id.to_string(),
        });
        let token = self.create_child(esp, Some(start), ExecutionKind::Branch, false)?;
        self.push(Op::Enter {
            at: token,
            activity_id: start.to_string(),
        });
        Ok(())
    }
}
