//! shipyard.toml configuration parser.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShipyardConfig {
    pub engine: EngineConfig,
    pub worker: WorkerSection,
    pub queue: QueueSection,
    pub changelog: ChangelogSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub workspace_id: String,
    /// Orchestrator tick period.
    pub tick_interval_ms: u64,
    /// Parallel evaluations per index recompute; 0 means one per CPU.
    pub index_concurrency: usize,
    /// Capacity of the policy memoization caches.
    pub memo_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workspace_id: "default".to_string(),
            tick_interval_ms: 500,
            index_concurrency: 0,
            memo_capacity: 10_000,
        }
    }
}

impl EngineConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
    pub worker_id: String,
    pub batch_size: usize,
    pub poll_interval_ms: u64,
    pub lease_duration_ms: u64,
    pub lease_heartbeat_ms: u64,
    pub max_concurrency: usize,
    pub max_retry_backoff_ms: u64,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            worker_id: "shipyardd-0".to_string(),
            batch_size: 16,
            poll_interval_ms: 250,
            lease_duration_ms: 30_000,
            lease_heartbeat_ms: 10_000,
            max_concurrency: 8,
            max_retry_backoff_ms: 300_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Redb,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    pub backend: StorageBackend,
    pub path: PathBuf,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            path: PathBuf::from("data/queue.redb"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChangelogSection {
    pub backend: StorageBackend,
    pub partitions: u32,
    pub path: PathBuf,
}

impl Default for ChangelogSection {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            partitions: 16,
            path: PathBuf::from("data/changelog.redb"),
        }
    }
}

impl ShipyardConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ShipyardConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> CoreResult<()> {
        let w = &self.worker;
        let fail = |msg: &str| Err(CoreError::Validation(msg.to_string()));
        if w.worker_id.trim().is_empty() {
            return fail("worker.worker_id must not be empty");
        }
        if w.batch_size == 0 || w.max_concurrency == 0 {
            return fail("worker.batch_size and worker.max_concurrency must be positive");
        }
        if w.poll_interval_ms == 0
            || w.lease_duration_ms == 0
            || w.lease_heartbeat_ms == 0
            || w.max_retry_backoff_ms == 0
        {
            return fail("worker durations must be positive");
        }
        if w.lease_heartbeat_ms >= w.lease_duration_ms {
            return fail("worker.lease_heartbeat_ms must be less than worker.lease_duration_ms");
        }
        if self.engine.tick_interval_ms == 0 {
            return fail("engine.tick_interval_ms must be positive");
        }
        if self.changelog.partitions == 0 {
            return fail("changelog.partitions must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ShipyardConfig::default();
        config.validate().unwrap();
        let toml_str = config.to_toml_string().unwrap();
        assert!(toml_str.contains("[worker]"));
        assert!(toml_str.contains("shipyardd-0"));
    }

    #[test]
    fn test_parse_partial() {
        let toml_str = r#"
[engine]
workspace_id = "acme"

[queue]
backend = "redb"
path = "/var/lib/shipyard/queue.redb"
"#;
        let config: ShipyardConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.engine.workspace_id, "acme");
        assert_eq!(config.queue.backend, StorageBackend::Redb);
        assert_eq!(config.worker.batch_size, 16);
        assert_eq!(config.changelog.partitions, 16);
    }

    #[test]
    fn test_heartbeat_must_be_below_lease() {
        let mut config = ShipyardConfig::default();
        config.worker.lease_heartbeat_ms = config.worker.lease_duration_ms;
        assert!(config.validate().is_err());
    }
}
