//! Update policies: in-place versus destructive updates.
//!
//! When a job version changes, each live allocation of the old version is
//! either updated in place (same allocation, new version) or replaced
//! (stop plus a new placement). The rule is pluggable.

use std::fmt;

use fleetgrid_state::{Job, TaskGroup};
use serde::{Deserialize, Serialize};

use crate::error::{ReconcileError, ReconcileResult};

/// How an allocation moves to a new job version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    InPlace,
    Destructive,
}

/// Classifies the update of one task group between two job versions.
pub trait UpdatePolicy: Send + Sync {
    fn name(&self) -> &'static str;

    fn classify(
        &self,
        old_job: &Job,
        old: &TaskGroup,
        new_job: &Job,
        new: &TaskGroup,
    ) -> UpdateKind;
}

impl fmt::Debug for dyn UpdatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Replace allocations whenever anything but `count` changed, including
/// job-level placement rules.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpecChangePolicy;

impl UpdatePolicy for SpecChangePolicy {
    fn name(&self) -> &'static str {
        "spec_change"
    }

    fn classify(
        &self,
        old_job: &Job,
        old: &TaskGroup,
        new_job: &Job,
        new: &TaskGroup,
    ) -> UpdateKind {
        let placement_changed = old_job.datacenters != new_job.datacenters
            || old_job.constraints != new_job.constraints
            || old_job.affinities != new_job.affinities
            || old_job.spreads != new_job.spreads;
        let old = TaskGroup {
            count: new.count,
            ..old.clone()
        };
        if placement_changed || old != *new {
            UpdateKind::Destructive
        } else {
            UpdateKind::InPlace
        }
    }
}

/// Replace allocations only when what runs on the node changes: task
/// drivers, config, environment, resources, lifecycle, network, or disk.
/// Constraint, affinity, policy, and metadata changes are applied in place.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskChangePolicy;

impl UpdatePolicy for TaskChangePolicy {
    fn name(&self) -> &'static str {
        "task_change"
    }

    fn classify(
        &self,
        _old_job: &Job,
        old: &TaskGroup,
        _new_job: &Job,
        new: &TaskGroup,
    ) -> UpdateKind {
        if old.network != new.network
            || old.ephemeral_disk_mb != new.ephemeral_disk_mb
            || old.tasks.len() != new.tasks.len()
        {
            return UpdateKind::Destructive;
        }
        for new_task in &new.tasks {
            let Some(old_task) = old.tasks.iter().find(|t| t.name == new_task.name) else {
                return UpdateKind::Destructive;
            };
            if old_task.driver != new_task.driver
                || old_task.config != new_task.config
                || old_task.env != new_task.env
                || old_task.resources != new_task.resources
                || old_task.lifecycle != new_task.lifecycle
            {
                return UpdateKind::Destructive;
            }
        }
        UpdateKind::InPlace
    }
}

/// Look up a policy by its configured name.
pub fn policy_by_name(name: &str) -> ReconcileResult<Box<dyn UpdatePolicy>> {
    match name {
        "spec_change" => Ok(Box::new(SpecChangePolicy)),
        "task_change" => Ok(Box::new(TaskChangePolicy)),
        other => Err(ReconcileError::UnknownPolicy(other.to_string())),
    }
}
