//! Job-level reconciliation: every group of a job plus its deployment.

use std::collections::BTreeMap;

use fleetgrid_state::{
    Allocation, Deployment, DeploymentStatusUpdate, DesiredUpdates, Job, JobType, State,
};
use tracing::debug;

use crate::deployment::{self, DESC_JOB_STOPPED, DESC_NEWER_JOB};
use crate::diff::{
    GroupDiff, GroupInput, STOP_GROUP_REMOVED, STOP_JOB_STOPPED, diff_group, stop_all,
    tainted_nodes,
};
use crate::update::UpdatePolicy;

pub struct ReconcileInput<'a> {
    pub state: &'a dyn State,
    pub namespace: &'a str,
    pub job_id: &'a str,
    /// `None` once the job is purged.
    pub job: Option<&'a Job>,
    pub policy: &'a dyn UpdatePolicy,
    /// ID to give a deployment created by this pass.
    pub deployment_id: &'a str,
    /// Unix time (seconds).
    pub now: u64,
}

/// The outcome of reconciling one job.
#[derive(Debug, Clone, Default)]
pub struct Reconciliation {
    pub groups: BTreeMap<String, GroupDiff>,
    /// Active deployment placements belong to, new or existing.
    pub deployment: Option<Deployment>,
    /// `deployment` was created by this pass and must be committed.
    pub deployment_created: bool,
    pub deployment_updates: Vec<DeploymentStatusUpdate>,
}

impl Reconciliation {
    pub fn is_empty(&self) -> bool {
        !self.deployment_created
            && self.deployment_updates.is_empty()
            && self.groups.values().all(GroupDiff::is_empty)
    }

    pub fn desired_updates(&self) -> BTreeMap<String, DesiredUpdates> {
        self.groups
            .iter()
            .map(|(name, diff)| (name.clone(), diff.desired_updates()))
            .collect()
    }
}

pub fn reconcile(input: &ReconcileInput<'_>) -> Reconciliation {
    let allocs = input.state.allocs_by_job(input.namespace, input.job_id);
    let tainted = tainted_nodes(input.state, allocs.iter().copied());
    let mut by_group: BTreeMap<&str, Vec<&Allocation>> = BTreeMap::new();
    for &alloc in &allocs {
        by_group.entry(alloc.task_group.as_str()).or_default().push(alloc);
    }
    let latest = input
        .state
        .latest_deployment_by_job(input.namespace, input.job_id);

    let mut result = Reconciliation::default();

    let Some(job) = input.job.filter(|j| !j.stop) else {
        for (name, allocs) in by_group {
            result
                .groups
                .insert(name.to_string(), stop_all(&allocs, STOP_JOB_STOPPED));
        }
        if let Some(d) = latest.filter(|d| d.is_active()) {
            result
                .deployment_updates
                .push(deployment::cancel(d, DESC_JOB_STOPPED));
        }
        return result;
    };

    let mut current = None;
    if let Some(d) = latest {
        if d.job_version == job.version {
            current = Some(d);
        } else if d.is_active() {
            result.deployment_updates.push(deployment::cancel(d, DESC_NEWER_JOB));
        }
    }

    for group in &job.task_groups {
        let allocs = by_group.remove(group.name.as_str()).unwrap_or_default();
        let diff = diff_group(&GroupInput {
            job,
            group,
            allocs,
            tainted: &tainted,
            deployment: current,
            policy: input.policy,
            state: input.state,
            now: input.now,
        });
        result.groups.insert(group.name.clone(), diff);
    }
    for (name, allocs) in by_group {
        result
            .groups
            .insert(name.to_string(), stop_all(&allocs, STOP_GROUP_REMOVED));
    }

    let wants_deployment = job.job_type == JobType::Service
        && job.task_groups.iter().any(|g| g.update_strategy().is_some())
        && result.groups.values().any(GroupDiff::places_new_version);
    match current {
        None if wants_deployment => {
            result.deployment = Some(deployment::new_deployment(
                input.deployment_id,
                job,
                &result.groups,
            ));
            result.deployment_created = true;
        }
        Some(d) if d.is_active() => result.deployment = Some(d.clone()),
        _ => {}
    }

    debug!(
        job = %job.id,
        version = job.version,
        groups = result.groups.len(),
        deployment = ?result.deployment.as_ref().map(|d| d.id.as_str()),
        "job reconciled"
    );
    result
}
