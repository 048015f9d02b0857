//! Deployment lifecycle: creation, health assessment, promotion.
//!
//! ```text
//!   ┌─────────┐  all healthy   ┌────────────┐
//!   │ Running │───────────────▶│ Successful │
//!   └────┬────┘                └────────────┘
//!        │ unhealthy alloc
//!        ▼
//!   ┌─────────┐   newer version / job stopped   ┌──────────┐
//!   │ Failed  │        (from Running)  ────────▶│ Canceled │
//!   └─────────┘                                 └──────────┘
//! ```
//!
//! Canary groups additionally wait in `Running` until promoted, by an
//! operator or automatically when every canary is healthy.

use std::collections::BTreeMap;

use fleetgrid_state::{
    AllocClientStatus, Allocation, Deployment, DeploymentState, DeploymentStatus,
    DeploymentStatusUpdate, Job,
};
use tracing::{debug, info, warn};

use crate::diff::GroupDiff;
use crate::error::{ReconcileError, ReconcileResult};

pub const DESC_RUNNING: &str = "Deployment is running";
pub const DESC_AWAITING_PROMOTION: &str = "Deployment is running but requires manual promotion";
pub const DESC_SUCCESSFUL: &str = "Deployment completed successfully";
pub const DESC_UNHEALTHY: &str = "Failed due to unhealthy allocations";
pub const DESC_NEWER_JOB: &str = "Cancelled due to newer version of job";
pub const DESC_JOB_STOPPED: &str = "Cancelled because job is stopped";

/// Start a deployment of `job` covering every group with an update strategy.
pub fn new_deployment(id: &str, job: &Job, diffs: &BTreeMap<String, GroupDiff>) -> Deployment {
    let task_groups = job
        .task_groups
        .iter()
        .filter_map(|tg| {
            let update = tg.update_strategy()?;
            let canaries = diffs.get(&tg.name).is_some_and(|d| !d.canaries.is_empty());
            Some((
                tg.name.clone(),
                DeploymentState {
                    desired_total: tg.count,
                    desired_canaries: if canaries { update.canary } else { 0 },
                    auto_promote: update.auto_promote,
                    auto_revert: update.auto_revert,
                    ..Default::default()
                },
            ))
        })
        .collect();
    info!(deployment = %id, job = %job.id, version = job.version, "deployment created");
    Deployment {
        id: id.to_string(),
        namespace: job.namespace.clone(),
        job_id: job.id.clone(),
        job_version: job.version,
        task_groups,
        status: DeploymentStatus::Running,
        status_description: DESC_RUNNING.to_string(),
        create_index: 0,
        modify_index: 0,
    }
}

pub fn cancel(deployment: &Deployment, description: &str) -> DeploymentStatusUpdate {
    debug!(deployment = %deployment.id, reason = description, "cancelling deployment");
    DeploymentStatusUpdate {
        deployment_id: deployment.id.clone(),
        status: DeploymentStatus::Canceled,
        status_description: description.to_string(),
    }
}

fn owned_by<'a>(
    deployment: &'a Deployment,
    group: &'a str,
    allocs: &'a [&'a Allocation],
) -> impl Iterator<Item = &'a Allocation> + 'a {
    allocs.iter().copied().filter(move |a| {
        a.task_group == group && a.deployment_id.as_deref() == Some(deployment.id.as_str())
    })
}

fn failed(alloc: &Allocation) -> bool {
    alloc.is_unhealthy()
        || matches!(
            alloc.client_status,
            AllocClientStatus::Failed | AllocClientStatus::Lost
        )
}

/// Recount the deployment's allocations and derive its next status.
///
/// Returns the deployment unchanged when it is no longer active.
pub fn assess(deployment: &Deployment, allocs: &[&Allocation]) -> Deployment {
    let mut next = deployment.clone();
    if !deployment.is_active() {
        return next;
    }

    for (group, state) in next.task_groups.iter_mut() {
        let owned: Vec<&Allocation> = owned_by(deployment, group, allocs).collect();
        state.placed_allocs = owned.len() as u32;
        state.healthy_allocs = owned
            .iter()
            .filter(|a| a.is_healthy() && !a.server_terminal())
            .count() as u32;
        state.unhealthy_allocs = owned.iter().filter(|a| failed(a)).count() as u32;
        state.placed_canaries = owned
            .iter()
            .filter(|a| a.is_canary())
            .map(|a| a.id.clone())
            .collect();

        if state.awaiting_promotion() && state.auto_promote {
            let healthy = owned
                .iter()
                .filter(|a| a.is_canary() && a.is_healthy() && !a.server_terminal())
                .count() as u32;
            if healthy >= state.desired_canaries {
                info!(deployment = %deployment.id, group = %group, "auto-promoting canaries");
                state.promoted = true;
            }
        }
    }

    if deployment.status == DeploymentStatus::Paused {
        return next;
    }
    if next.task_groups.values().any(|s| s.unhealthy_allocs > 0) {
        warn!(deployment = %deployment.id, "deployment failed: unhealthy allocations");
        next.status = DeploymentStatus::Failed;
        next.status_description = DESC_UNHEALTHY.to_string();
    } else if next
        .task_groups
        .values()
        .all(|s| !s.awaiting_promotion() && s.healthy_allocs >= s.desired_total)
    {
        info!(deployment = %deployment.id, "deployment successful");
        next.status = DeploymentStatus::Successful;
        next.status_description = DESC_SUCCESSFUL.to_string();
    } else if next.requires_promotion() {
        next.status_description = DESC_AWAITING_PROMOTION.to_string();
    } else {
        next.status_description = DESC_RUNNING.to_string();
    }
    next
}

/// Promote canaries of `groups`, or of every group awaiting promotion when
/// `groups` is empty. Every placed canary must be healthy.
pub fn promote(
    deployment: &Deployment,
    groups: &[String],
    allocs: &[&Allocation],
) -> ReconcileResult<Deployment> {
    if !deployment.is_active() {
        return Err(ReconcileError::DeploymentNotActive(deployment.id.clone()));
    }

    let targets: Vec<String> = if groups.is_empty() {
        deployment
            .task_groups
            .iter()
            .filter(|(_, s)| s.awaiting_promotion())
            .map(|(g, _)| g.clone())
            .collect()
    } else {
        groups.to_vec()
    };
    if targets.is_empty() {
        return Err(ReconcileError::NothingToPromote {
            id: deployment.id.clone(),
            group: "*".to_string(),
        });
    }

    let mut next = deployment.clone();
    for group in &targets {
        let Some(state) = next.task_groups.get_mut(group) else {
            return Err(ReconcileError::UnknownGroup {
                id: deployment.id.clone(),
                group: group.clone(),
            });
        };
        if !state.awaiting_promotion() {
            return Err(ReconcileError::NothingToPromote {
                id: deployment.id.clone(),
                group: group.clone(),
            });
        }
        let healthy = owned_by(deployment, group, allocs)
            .filter(|a| a.is_canary() && a.is_healthy() && !a.server_terminal())
            .count() as u32;
        if healthy < state.desired_canaries {
            return Err(ReconcileError::UnhealthyCanaries {
                id: deployment.id.clone(),
                group: group.clone(),
                healthy,
                desired: state.desired_canaries,
            });
        }
        state.promoted = true;
    }
    info!(deployment = %deployment.id, groups = ?targets, "canaries promoted");
    next.status_description = DESC_RUNNING.to_string();
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::PlaceRequest;
    use fleetgrid_state::{AllocDeploymentStatus, UpdateStrategy, mock};

    fn canary_job() -> Job {
        let mut job = mock::job("api");
        job.version = 1;
        job.task_groups[0].count = 3;
        job.task_groups[0].update = Some(UpdateStrategy {
            max_parallel: 1,
            canary: 1,
            ..Default::default()
        });
        job
    }

    fn owned(
        d: &Deployment,
        job: &Job,
        index: u32,
        healthy: Option<bool>,
        canary: bool,
    ) -> Allocation {
        let mut alloc = mock::alloc(job, index, "n1");
        alloc.deployment_id = Some(d.id.clone());
        alloc.client_status = AllocClientStatus::Running;
        alloc.deployment_status = Some(AllocDeploymentStatus { healthy, canary });
        alloc
    }

    #[test]
    fn new_deployment_covers_groups_with_strategies() {
        let mut job = canary_job();
        let mut diffs = BTreeMap::new();
        let d = new_deployment("d1", &job, &diffs);
        assert_eq!(d.task_groups["web"].desired_canaries, 0);
        assert_eq!(d.task_groups["web"].desired_total, 3);

        let mut diff = GroupDiff::default();
        diff.canaries.push(PlaceRequest {
            task_group: "web".to_string(),
            index: 3,
            name: "api.web[3]".to_string(),
            canary: true,
            previous: None,
            reschedule: false,
        });
        diffs.insert("web".to_string(), diff);
        let d = new_deployment("d1", &job, &diffs);
        assert!(d.requires_promotion());

        job.task_groups[0].update = None;
        assert!(new_deployment("d2", &job, &diffs).task_groups.is_empty());
    }

    #[test]
    fn assess_succeeds_once_all_allocs_are_healthy() {
        let job = canary_job();
        let mut d = mock::deployment(&job);
        d.task_groups.get_mut("web").unwrap().desired_canaries = 0;
        let a: Vec<Allocation> = (0..3).map(|i| owned(&d, &job, i, Some(true), false)).collect();
        let partial: Vec<&Allocation> = a.iter().take(2).collect();
        assert_eq!(assess(&d, &partial).status, DeploymentStatus::Running);
        let all: Vec<&Allocation> = a.iter().collect();
        let next = assess(&d, &all);
        assert_eq!(next.status, DeploymentStatus::Successful);
        assert_eq!(next.task_groups["web"].healthy_allocs, 3);
    }

    #[test]
    fn assess_fails_on_unhealthy_alloc() {
        let job = canary_job();
        let d = mock::deployment(&job);
        let bad = owned(&d, &job, 0, Some(false), true);
        let next = assess(&d, &[&bad]);
        assert_eq!(next.status, DeploymentStatus::Failed);
        assert_eq!(next.status_description, DESC_UNHEALTHY);
        // Terminal deployments stay put.
        assert_eq!(assess(&next, &[&bad]), next);
    }

    #[test]
    fn assess_auto_promotes_healthy_canaries() {
        let mut job = canary_job();
        if let Some(u) = job.task_groups[0].update.as_mut() {
            u.auto_promote = true;
        }
        let d = mock::deployment(&job);
        let canary = owned(&d, &job, 3, None, true);
        let next = assess(&d, &[&canary]);
        assert!(!next.task_groups["web"].promoted);
        assert_eq!(next.task_groups["web"].placed_canaries, vec![canary.id.clone()]);

        let canary = owned(&d, &job, 3, Some(true), true);
        let next = assess(&d, &[&canary]);
        assert!(next.task_groups["web"].promoted);
        assert_eq!(next.status, DeploymentStatus::Running);
    }

    #[test]
    fn promote_requires_healthy_canaries() {
        let job = canary_job();
        let d = mock::deployment(&job);
        let pending = owned(&d, &job, 3, None, true);
        assert!(matches!(
            promote(&d, &[], &[&pending]),
            Err(ReconcileError::UnhealthyCanaries { healthy: 0, desired: 1, .. })
        ));

        let healthy = owned(&d, &job, 3, Some(true), true);
        let next = promote(&d, &[], &[&healthy]).unwrap();
        assert!(next.task_groups["web"].promoted);
        assert!(matches!(
            promote(&next, &[], &[&healthy]),
            Err(ReconcileError::NothingToPromote { .. })
        ));
        assert!(matches!(
            promote(&d, &["db".to_string()], &[&healthy]),
            Err(ReconcileError::UnknownGroup { .. })
        ));
    }

    #[test]
    fn inactive_deployments_cannot_be_promoted() {
        let job = canary_job();
        let mut d = mock::deployment(&job);
        d.status = DeploymentStatus::Canceled;
        assert!(matches!(
            promote(&d, &[], &[]),
            Err(ReconcileError::DeploymentNotActive(_))
        ));
        assert_eq!(cancel(&d, DESC_NEWER_JOB).status, DeploymentStatus::Canceled);
    }
}
