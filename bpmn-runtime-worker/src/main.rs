//! BPMN runtime worker
//!
//! Loads a worker configuration, registers the process definitions it
//! names, optionally starts instances, and drives due jobs (timers, async
//! continuations, retries) until ctrl-c.
//!
//! ## Usage
//!
//! ```bash
//! RUST_LOG=info,bpmn_runtime_core=debug \
//!   cargo run -p bpmn-runtime-worker -- worker.yaml
//! ```
//!
//! ```yaml
//! engine:
//!   worker_id: node-a
//!   poll_interval_ms: 250
//! definition_files:
//!   - definitions/order.yaml
//! starts:
//!   - definition: order
//!     business_key: order-1
//!     variables: { amount: 120 }
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use bpmn_runtime_core::model::ProcessModel;
use bpmn_runtime_core::{
    DefinitionRegistry, EngineConfig, JobScheduler, JobWorker, MemoryStore, ProcessEngine,
    ServiceContext, ServiceOutcome, Variables,
};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WorkerConfig {
    engine: EngineConfig,
    definition_files: Vec<PathBuf>,
    starts: Vec<StartRequest>,
}

#[derive(Debug, Deserialize)]
struct StartRequest {
    definition: String,
    #[serde(default)]
    business_key: Option<String>,
    #[serde(default)]
    variables: Variables,
}

impl WorkerConfig {
    fn load(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
        let mut config: WorkerConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Parsing {}", path.display()))?;
        config.engine.apply_env_overrides()?;
        config.engine.validate()?;
        Ok(config)
    }

    fn from_env() -> Result<Self> {
        Ok(WorkerConfig {
            engine: EngineConfig::from_env()?,
            ..WorkerConfig::default()
        })
    }
}

fn load_definitions(files: &[PathBuf], base: &Path) -> Result<DefinitionRegistry> {
    let mut registry = DefinitionRegistry::new();
    for file in files {
        let path = base.join(file);
        let content =
            std::fs::read_to_string(&path).with_context(|| format!("Reading {}", path.display()))?;
        let model: ProcessModel = serde_yaml::from_str(&content)
            .with_context(|| format!("Parsing process model {}", path.display()))?;
        let definition = registry
            .register_model(model)
            .with_context(|| format!("Validating process model {}", path.display()))?;
        tracing::info!(
            definition_id = %definition.id(),
            version = %definition.version_hex(),
            file = %path.display(),
            "process definition registered"
        );
    }
    Ok(registry)
}

/// Completes with no output; stands in for handlers wired by an embedding
/// application.
fn noop_handler(ctx: &ServiceContext) -> Result<ServiceOutcome> {
    tracing::info!(
        instance_id = %ctx.instance_id,
        activity = %ctx.activity_id,
        "noop service task"
    );
    Ok(ServiceOutcome::Complete(Variables::new()))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,bpmn_runtime_core=debug")),
        )
        .init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let (config, base) = match &config_path {
        Some(path) => (
            WorkerConfig::load(path)?,
            path.parent().map(Path::to_path_buf).unwrap_or_default(),
        ),
        None => (WorkerConfig::from_env()?, PathBuf::new()),
    };
    let definitions = load_definitions(&config.definition_files, &base)?;

    let engine = ProcessEngine::builder(Arc::new(MemoryStore::new()))
        .definitions(definitions)
        .config(config.engine.clone())
        .service("noop", Arc::new(noop_handler))
        .build();

    for start in config.starts {
        let handle = engine
            .start_process_instance(&start.definition, start.variables, start.business_key)
            .await
            .with_context(|| format!("Starting {}", start.definition))?;
        tracing::info!(
            instance_id = %handle.instance_id,
            definition = %handle.definition_id,
            state = ?handle.state,
            "process instance started from configuration"
        );
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = JobWorker::new(JobScheduler::new(engine.clone()));
    let handle = tokio::spawn(async move { worker.run(shutdown_rx).await });

    tokio::signal::ctrl_c()
        .await
        .context("Waiting for ctrl-c")?;
    tracing::info!("ctrl-c received; stopping worker");
    shutdown_tx.send(true).ok();
    handle.await.context("Joining worker task")?;
    Ok(())
}
