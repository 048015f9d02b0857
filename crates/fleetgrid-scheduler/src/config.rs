//! fleet.toml configuration.
//!
//! Every field has a default, so an empty file is a valid configuration:
//!
//! ```toml
//! [scheduler]
//! num_workers = 4
//! update_policy = "task_change"
//!
//! [scoring]
//! spread = 2.0
//!
//! [preemption]
//! service_enabled = true
//!
//! [store]
//! in_memory = true
//! ```

use std::path::{Path, PathBuf};

use fleetgrid_placement::ScoringWeights;
use fleetgrid_state::{JobType, StateStore};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::SchedulerResult;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub scheduler: SchedulerConfig,
    pub scoring: ScoringWeights,
    pub preemption: PreemptionConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Concurrent scheduler workers.
    pub num_workers: usize,
    pub max_plan_attempts_service: u32,
    pub max_plan_attempts_batch: u32,
    /// Deliveries before a failing evaluation is marked failed.
    pub eval_delivery_limit: u32,
    /// Plans buffered ahead of the applier.
    pub plan_queue_depth: usize,
    /// `spec_change` or `task_change`.
    pub update_policy: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_workers: 2,
            max_plan_attempts_service: 5,
            max_plan_attempts_batch: 2,
            eval_delivery_limit: 3,
            plan_queue_depth: 64,
            update_policy: "spec_change".to_string(),
        }
    }
}

impl SchedulerConfig {
    pub fn max_plan_attempts(&self, job_type: JobType) -> u32 {
        match job_type {
            JobType::Service => self.max_plan_attempts_service,
            JobType::Batch => self.max_plan_attempts_batch,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreemptionConfig {
    pub service_enabled: bool,
    pub batch_enabled: bool,
}

impl PreemptionConfig {
    pub fn enabled_for(&self, job_type: JobType) -> bool {
        match job_type {
            JobType::Service => self.service_enabled,
            JobType::Batch => self.batch_enabled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub data_dir: PathBuf,
    pub in_memory: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/fleetgrid"),
            in_memory: false,
        }
    }
}

impl StoreConfig {
    /// Open the configured store, creating the data directory if needed.
    pub fn open(&self) -> SchedulerResult<StateStore> {
        if self.in_memory {
            return Ok(StateStore::open_in_memory()?);
        }
        std::fs::create_dir_all(&self.data_dir)?;
        let path = self.data_dir.join("fleetgrid.redb");
        debug!(path = ?path, "opening state store");
        Ok(StateStore::open(&path)?)
    }
}

impl FleetConfig {
    pub fn from_file(path: &Path) -> SchedulerResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> SchedulerResult<Self> {
        Ok(toml::from_str(content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = FleetConfig::from_toml_str("").unwrap();
        assert_eq!(config, FleetConfig::default());
        assert_eq!(config.scheduler.max_plan_attempts(JobType::Service), 5);
        assert_eq!(config.scheduler.max_plan_attempts(JobType::Batch), 2);
        assert!(!config.preemption.enabled_for(JobType::Service));
        assert_eq!(config.scoring.bin_pack, 1.0);
    }

    #[test]
    fn partial_sections_merge_with_defaults() {
        let config = FleetConfig::from_toml_str(
            r#"
[scheduler]
num_workers = 8
update_policy = "task_change"

[scoring]
spread = 2.5

[preemption]
batch_enabled = true

[store]
in_memory = true
"#,
        )
        .unwrap();
        assert_eq!(config.scheduler.num_workers, 8);
        assert_eq!(config.scheduler.eval_delivery_limit, 3);
        assert_eq!(config.scheduler.update_policy, "task_change");
        assert_eq!(config.scoring.spread, 2.5);
        assert_eq!(config.scoring.affinity, 1.0);
        assert!(config.preemption.enabled_for(JobType::Batch));
        assert!(config.store.in_memory);
        assert!(config.store.open().is_ok());
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let err = FleetConfig::from_toml_str("[scheduler]\nnum_workers = \"many\"").unwrap_err();
        assert!(matches!(err, crate::error::SchedulerError::Config(_)));
    }

    #[test]
    fn on_disk_store_lands_in_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = StoreConfig {
            data_dir: dir.path().join("nested"),
            in_memory: false,
        };
        store.open().unwrap();
        assert!(dir.path().join("nested/fleetgrid.redb").exists());
    }
}
