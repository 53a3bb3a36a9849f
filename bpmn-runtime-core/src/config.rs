//! Engine configuration: YAML file plus `BPMN_RUNTIME_*` environment overrides.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Lock owner recorded on claimed jobs.
    pub worker_id: String,
    /// How long a claimed job stays locked before another worker may take it.
    pub lock_duration_ms: u64,
    /// Retries granted to newly created jobs.
    pub default_job_retries: u32,
    pub retry_backoff_base_ms: u64,
    pub retry_backoff_max_ms: u64,
    pub poll_interval_ms: u64,
    pub poll_batch_size: usize,
    /// Optimistic-lock conflicts tolerated per command before giving up.
    pub max_command_retries: u32,
    /// Agenda guard against runaway loops inside one command.
    pub max_steps_per_command: usize,
    /// Nesting limit for signals thrown by signals.
    pub max_deferred_signal_depth: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_id: "bpmn-runtime-worker".to_string(),
            lock_duration_ms: 30_000,
            default_job_retries: 3,
            retry_backoff_base_ms: 1_000,
            retry_backoff_max_ms: 300_000,
            poll_interval_ms: 500,
            poll_batch_size: 16,
            max_command_retries: 5,
            max_steps_per_command: 10_000,
            max_deferred_signal_depth: 8,
        }
    }
}

impl EngineConfig {
    /// Load from a YAML file, apply environment overrides, validate.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
        let mut config: EngineConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Parsing {}", path.display()))?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("BPMN_RUNTIME_WORKER_ID") {
            self.worker_id = v;
        }
        if let Some(v) = lookup("BPMN_RUNTIME_LOCK_DURATION_MS") {
            self.lock_duration_ms = v
                .parse()
                .with_context(|| format!("BPMN_RUNTIME_LOCK_DURATION_MS={v}"))?;
        }
        if let Some(v) = lookup("BPMN_RUNTIME_POLL_INTERVAL_MS") {
            self.poll_interval_ms = v
                .parse()
                .with_context(|| format!("BPMN_RUNTIME_POLL_INTERVAL_MS={v}"))?;
        }
        if let Some(v) = lookup("BPMN_RUNTIME_DEFAULT_RETRIES") {
            self.default_job_retries = v
                .parse()
                .with_context(|| format!("BPMN_RUNTIME_DEFAULT_RETRIES={v}"))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_id.trim().is_empty() {
            bail!("worker_id must not be empty");
        }
        if self.lock_duration_ms == 0 {
            bail!("lock_duration_ms must be > 0");
        }
        if self.poll_batch_size == 0 {
            bail!("poll_batch_size must be > 0");
        }
        if self.retry_backoff_max_ms < self.retry_backoff_base_ms {
            bail!(
                "retry_backoff_max_ms ({}) is below retry_backoff_base_ms ({})",
                self.retry_backoff_max_ms,
                self.retry_backoff_base_ms
            );
        }
        if self.max_steps_per_command == 0 {
            bail!("max_steps_per_command must be > 0");
        }
        Ok(())
    }

    pub fn lock_duration(&self) -> Duration {
        Duration::from_millis(self.lock_duration_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config: EngineConfig =
            serde_yaml::from_str("worker_id: node-a\nlock_duration_ms: 5000\n").unwrap();
        assert_eq!(config.worker_id, "node-a");
        assert_eq!(config.lock_duration_ms, 5000);
        assert_eq!(config.default_job_retries, 3);
        config.validate().unwrap();
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("BPMN_RUNTIME_WORKER_ID", "node-b"),
            ("BPMN_RUNTIME_DEFAULT_RETRIES", "7"),
        ]);
        let mut config = EngineConfig::default();
        config
            .apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.worker_id, "node-b");
        assert_eq!(config.default_job_retries, 7);
    }

    #[test]
    fn test_bad_override_is_reported() {
        let mut config = EngineConfig::default();
        let err = config
            .apply_overrides(|k| (k == "BPMN_RUNTIME_POLL_INTERVAL_MS").then(|| "soon".into()))
            .unwrap_err();
        assert!(err.to_string().contains("BPMN_RUNTIME_POLL_INTERVAL_MS"));
    }

    #[test]
    fn test_validate_rejects_inverted_backoff() {
        let config = EngineConfig {
            retry_backoff_base_ms: 10_000,
            retry_backoff_max_ms: 10,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
