use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::types::{EndReason, ExecRef, Timestamp};

/// Lifecycle notifications, emitted in mutation order within a unit of work
/// and published only after that unit of work committed. Cancellations are
/// distinct variants so observers can tell "finished" from "cut short".
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EngineEvent {
    ProcessStarted {
        instance_id: Uuid,
        definition_id: String,
        business_key: Option<String>,
        super_execution: Option<ExecRef>,
    },
    ProcessCompleted {
        instance_id: Uuid,
    },
    ProcessTerminated {
        instance_id: Uuid,
    },
    ProcessCancelled {
        instance_id: Uuid,
        reason: String,
    },
    /// An error event nobody caught.
    ProcessFailed {
        instance_id: Uuid,
        error_code: String,
    },

    ActivityStarted {
        at: ExecRef,
        activity_id: String,
    },
    ActivityCompleted {
        at: ExecRef,
        activity_id: String,
    },
    ActivityCancelled {
        at: ExecRef,
        activity_id: String,
        reason: EndReason,
    },

    TaskCreated {
        task_id: Uuid,
        at: ExecRef,
        activity_id: String,
    },
    TaskAssigned {
        task_id: Uuid,
        at: ExecRef,
        assignee: String,
    },
    TaskReleased {
        task_id: Uuid,
        at: ExecRef,
    },
    TaskCompleted {
        task_id: Uuid,
        at: ExecRef,
        user_id: String,
    },
    TaskCancelled {
        task_id: Uuid,
        at: ExecRef,
        reason: String,
    },

    TimerScheduled {
        job_id: Uuid,
        at: ExecRef,
        activity_id: String,
        due_at: Timestamp,
    },
    TimerFired {
        job_id: Uuid,
        at: ExecRef,
        activity_id: String,
    },
    TimerCancelled {
        job_id: Uuid,
        at: ExecRef,
        activity_id: String,
    },

    SignalReceived {
        at: ExecRef,
        activity_id: String,
        signal: String,
    },
    MessageReceived {
        at: ExecRef,
        activity_id: String,
        message: String,
    },
    ErrorReceived {
        at: ExecRef,
        activity_id: String,
        error_code: String,
    },

    JoinArrived {
        at: ExecRef,
        gateway_id: String,
        arrived: usize,
        expected: usize,
    },
    JoinReleased {
        at: ExecRef,
        gateway_id: String,
    },

    JobFailed {
        job_id: Uuid,
        instance_id: Uuid,
        error: String,
        retries_remaining: u32,
    },
    JobDead {
        job_id: Uuid,
        instance_id: Uuid,
        error: String,
    },
}

impl EngineEvent {
    pub fn instance_id(&self) -> Uuid {
        match self {
            EngineEvent::ProcessStarted { instance_id, .. }
            | EngineEvent::ProcessCompleted { instance_id }
            | EngineEvent::ProcessTerminated { instance_id }
            | EngineEvent::ProcessCancelled { instance_id, .. }
            | EngineEvent::ProcessFailed { instance_id, .. }
            | EngineEvent::JobFailed { instance_id, .. }
            | EngineEvent::JobDead { instance_id, .. } => *instance_id,
            EngineEvent::ActivityStarted { at, .. }
            | EngineEvent::ActivityCompleted { at, .. }
            | EngineEvent::ActivityCancelled { at, .. }
            | EngineEvent::TaskCreated { at, .. }
            | EngineEvent::TaskAssigned { at, .. }
            | EngineEvent::TaskReleased { at, .. }
            | EngineEvent::TaskCompleted { at, .. }
            | EngineEvent::TaskCancelled { at, .. }
            | EngineEvent::TimerScheduled { at, .. }
            | EngineEvent::TimerFired { at, .. }
            | EngineEvent::TimerCancelled { at, .. }
            | EngineEvent::SignalReceived { at, .. }
            | EngineEvent::MessageReceived { at, .. }
            | EngineEvent::ErrorReceived { at, .. }
            | EngineEvent::JoinArrived { at, .. }
            | EngineEvent::JoinReleased { at, .. } => at.instance_id,
        }
    }

    /// Activity id for activity-scoped events.
    pub fn activity_id(&self) -> Option<&str> {
        match self {
            EngineEvent::ActivityStarted { activity_id, .. }
            | EngineEvent::ActivityCompleted { activity_id, .. }
            | EngineEvent::ActivityCancelled { activity_id, .. }
            | EngineEvent::TaskCreated { activity_id, .. }
            | EngineEvent::TimerScheduled { activity_id, .. }
            | EngineEvent::TimerFired { activity_id, .. }
            | EngineEvent::TimerCancelled { activity_id, .. }
            | EngineEvent::SignalReceived { activity_id, .. }
            | EngineEvent::MessageReceived { activity_id, .. }
            | EngineEvent::ErrorReceived { activity_id, .. } => Some(activity_id),
            EngineEvent::JoinArrived { gateway_id, .. }
            | EngineEvent::JoinReleased { gateway_id, .. } => Some(gateway_id),
            _ => None,
        }
    }
}

/// Receives every published event, synchronously, in order.
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &EngineEvent);
}

/// Explicit fan-out to registered listeners.
#[derive(Clone, Default)]
pub struct EventSink {
    listeners: Vec<Arc<dyn EventListener>>,
}

impl EventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_listener(mut self, listener: Arc<dyn EventListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn publish(&self, events: &[EngineEvent]) {
        for event in events {
            for listener in &self.listeners {
                listener.on_event(event);
            }
        }
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

/// Keeps everything it hears. Intended for tests and diagnostics.
#[derive(Debug, Default)]
pub struct RecordingListener {
    events: Mutex<Vec<EngineEvent>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }

    pub fn count(&self, predicate: impl Fn(&EngineEvent) -> bool) -> usize {
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|e| predicate(e))
            .count()
    }
}

impl EventListener for RecordingListener {
    fn on_event(&self, event: &EngineEvent) {
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(event.clone());
    }
}

/// Forwards events into a tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl ChannelListener {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl EventListener for ChannelListener {
    fn on_event(&self, event: &EngineEvent) {
        if self.tx.send(event.clone()).is_err() {
            tracing::trace!("event channel closed; dropping event");
        }
    }
}
