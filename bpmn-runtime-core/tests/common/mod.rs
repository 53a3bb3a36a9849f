#![allow(dead_code)]

use std::sync::Arc;

use bpmn_runtime_core::{
    Actor, EngineConfig, EngineEvent, ManualClock, MemoryStore, ProcessDefinition, ProcessEngine,
    RecordingListener, RuntimeStore, ServiceHandler, TaskSnapshot, TaskStatus, Variables,
};
use chrono::{TimeZone, Utc};
use uuid::Uuid;

pub struct Harness {
    pub engine: ProcessEngine,
    pub clock: Arc<ManualClock>,
    pub events: Arc<RecordingListener>,
}

pub fn harness(definitions: Vec<ProcessDefinition>) -> Harness {
    harness_with(definitions, Vec::new())
}

pub fn harness_with(
    definitions: Vec<ProcessDefinition>,
    services: Vec<(&str, Arc<dyn ServiceHandler>)>,
) -> Harness {
    harness_on(Arc::new(MemoryStore::new()), test_config(), definitions, services)
}

/// Short backoff so retry tests only advance the clock by seconds.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        retry_backoff_base_ms: 1_000,
        retry_backoff_max_ms: 10_000,
        ..EngineConfig::default()
    }
}

pub fn harness_on(
    store: Arc<dyn RuntimeStore>,
    config: EngineConfig,
    definitions: Vec<ProcessDefinition>,
    services: Vec<(&str, Arc<dyn ServiceHandler>)>,
) -> Harness {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2025, 1, 1, 9, 0, 0).unwrap(),
    ));
    let events = RecordingListener::new();
    let mut builder = ProcessEngine::builder(store)
        .clock(clock.clone())
        .listener(events.clone())
        .config(config);
    for definition in definitions {
        builder = builder.definition(definition);
    }
    for (name, handler) in services {
        builder = builder.service(name, handler);
    }
    Harness {
        engine: builder.build(),
        clock,
        events,
    }
}

pub fn vars(value: serde_json::Value) -> Variables {
    match value {
        serde_json::Value::Object(map) => map.into_iter().collect(),
        other => panic!("expected an object, got {other}"),
    }
}

pub fn alice() -> Actor {
    Actor::user("alice")
}

impl Harness {
    pub async fn open_tasks(&self, instance_id: Uuid) -> Vec<TaskSnapshot> {
        self.engine
            .tasks_for_instance(instance_id)
            .await
            .unwrap()
            .into_iter()
            .filter(|t| !t.status.is_terminal())
            .collect()
    }

    pub async fn open_task_at(&self, instance_id: Uuid, activity_id: &str) -> TaskSnapshot {
        let tasks: Vec<TaskSnapshot> = self
            .open_tasks(instance_id)
            .await
            .into_iter()
            .filter(|t| t.activity_id == activity_id)
            .collect();
        assert_eq!(tasks.len(), 1, "expected one open task at {activity_id}: {tasks:?}");
        tasks.into_iter().next().unwrap()
    }

    /// Claim as alice and complete.
    pub async fn finish(&self, task_id: Uuid, variables: Variables) -> TaskSnapshot {
        self.engine.claim_task(task_id, &alice()).await.unwrap();
        let done = self
            .engine
            .complete_task(task_id, &alice(), variables)
            .await
            .unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        done
    }

    pub fn count(&self, predicate: impl Fn(&EngineEvent) -> bool) -> usize {
        self.events.count(predicate)
    }

    pub fn started(&self, activity: &str) -> usize {
        self.count(|e| matches!(e, EngineEvent::ActivityStarted { activity_id, .. } if activity_id == activity))
    }
}
