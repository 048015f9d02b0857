//! Generic scheduler: turns one evaluation into a committed plan.
//!
//! A pass snapshots state, reconciles the job, places every requested
//! allocation, and submits the plan. A plan the gate only partly accepts is
//! recomputed against a fresh snapshot, up to the job type's attempt limit.

use std::collections::{BTreeMap, BTreeSet};

use fleetgrid_placement::Placer;
use fleetgrid_reconcile::{PlaceRequest, ReconcileInput, StopRequest, UpdatePolicy, reconcile};
use fleetgrid_state::{
    AllocDeploymentStatus, AllocMetric, Allocation, Deployment, EvalStatus, EvalTrigger, Evaluation,
    Job, Plan, RescheduleEvent, State, StateSnapshot, StateStore, TaskGroup,
};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::FleetConfig;
use crate::error::{SchedulerError, SchedulerResult};
use crate::ids::{derive_id, new_eval_id, now_secs};
use crate::planner::Planner;

pub const DESC_BLOCKED: &str = "created due to placement conflicts";
pub const DESC_CANCELED: &str = "canceled by a newer evaluation of the job";
pub const DESC_JOB_MISSING: &str = "job not found";

/// How a pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalOutcome {
    Complete,
    Blocked,
    Failed,
    Canceled,
}

impl EvalOutcome {
    pub fn status(self) -> EvalStatus {
        match self {
            Self::Complete => EvalStatus::Complete,
            Self::Blocked => EvalStatus::Blocked,
            Self::Failed => EvalStatus::Failed,
            Self::Canceled => EvalStatus::Canceled,
        }
    }
}

/// One computed, not yet submitted, pass.
#[derive(Debug)]
struct Computed {
    plan: Plan,
    failed_tg_allocs: BTreeMap<String, AllocMetric>,
    queued: BTreeMap<String, u32>,
    class_eligibility: BTreeMap<String, bool>,
    escaped: bool,
}

/// Scheduler for service and batch jobs.
pub struct GenericScheduler<'a, P: Planner> {
    store: &'a StateStore,
    planner: &'a P,
    config: &'a FleetConfig,
    policy: &'a dyn UpdatePolicy,
}

impl<'a, P: Planner> GenericScheduler<'a, P> {
    pub fn new(
        store: &'a StateStore,
        planner: &'a P,
        config: &'a FleetConfig,
        policy: &'a dyn UpdatePolicy,
    ) -> Self {
        Self {
            store,
            planner,
            config,
            policy,
        }
    }

    /// Process `eval` to a final status. `cancel` flips when a newer
    /// evaluation of the same job supersedes this one.
    pub async fn process(
        &self,
        eval: &mut Evaluation,
        cancel: &watch::Receiver<bool>,
    ) -> SchedulerResult<EvalOutcome> {
        info!(
            eval = %eval.id,
            job = %eval.job_id,
            trigger = ?eval.triggered_by,
            "processing evaluation"
        );
        let limit = self.config.scheduler.max_plan_attempts(eval.job_type).max(1);
        let mut snapshot = self.store.snapshot()?;
        let mut attempts = 0;

        loop {
            if *cancel.borrow() {
                return self.finish(eval, EvalOutcome::Canceled, DESC_CANCELED).await;
            }
            if attempts == limit {
                warn!(eval = %eval.id, attempts, "plan attempts exhausted");
                let follow_up = eval.follow_up(&new_eval_id(), EvalTrigger::MaxPlanAttempts);
                self.planner.create_eval(&follow_up).await?;
                let description = format!("maximum attempts reached ({limit})");
                return self.finish(eval, EvalOutcome::Complete, &description).await;
            }
            attempts += 1;

            let job = snapshot.job_by_id(&eval.namespace, &eval.job_id);
            if job.is_none() && eval.triggered_by != EvalTrigger::JobDeregister {
                error!(eval = %eval.id, job = %eval.job_id, "evaluation references a missing job");
                return self.finish(eval, EvalOutcome::Failed, DESC_JOB_MISSING).await;
            }

            let computed = self.compute(eval, &snapshot, job);
            eval.snapshot_index = snapshot.index();
            if let Some(d) = &computed.plan.deployment {
                eval.deployment_id = Some(d.id.clone());
            }

            if !computed.plan.is_no_op() {
                if *cancel.borrow() {
                    return self.finish(eval, EvalOutcome::Canceled, DESC_CANCELED).await;
                }
                debug!(
                    eval = %eval.id,
                    attempt = attempts,
                    placements = computed.plan.placement_count(),
                    "submitting plan"
                );
                let result = self.planner.submit_plan(computed.plan.clone()).await?;
                if !result.is_full_commit(&computed.plan) {
                    debug!(
                        eval = %eval.id,
                        refresh_index = result.refresh_index,
                        rejected = result.rejected_nodes.len(),
                        "plan partially committed, refreshing"
                    );
                    snapshot = self.store.snapshot()?;
                    continue;
                }
            }

            return self.conclude(eval, computed).await;
        }
    }

    async fn conclude(
        &self,
        eval: &mut Evaluation,
        computed: Computed,
    ) -> SchedulerResult<EvalOutcome> {
        eval.queued_allocations = computed.queued;
        if computed.failed_tg_allocs.is_empty() {
            eval.failed_tg_allocs.clear();
            return self.finish(eval, EvalOutcome::Complete, "").await;
        }

        eval.failed_tg_allocs = computed.failed_tg_allocs;
        eval.class_eligibility = computed.class_eligibility;
        eval.escaped_computed_class = computed.escaped;
        transition(eval, EvalStatus::Blocked, DESC_BLOCKED)?;
        warn!(
            eval = %eval.id,
            groups = ?eval.failed_tg_allocs.keys().collect::<Vec<_>>(),
            "placements failed, evaluation blocked"
        );
        self.planner.reblock_eval(eval).await?;
        Ok(EvalOutcome::Blocked)
    }

    async fn finish(
        &self,
        eval: &mut Evaluation,
        outcome: EvalOutcome,
        description: &str,
    ) -> SchedulerResult<EvalOutcome> {
        transition(eval, outcome.status(), description)?;
        self.planner.update_eval(eval).await?;
        info!(eval = %eval.id, status = ?eval.status, "evaluation finished");
        Ok(outcome)
    }

    // ── Plan computation ───────────────────────────────────────────

    fn compute(&self, eval: &Evaluation, snapshot: &StateSnapshot, job: Option<&Job>) -> Computed {
        let snapshot_index = snapshot.index().to_string();
        let deployment_id = derive_id(&[&eval.id, "deployment", &snapshot_index]);
        let now = now_secs();

        let rec = reconcile(&ReconcileInput {
            state: snapshot,
            namespace: &eval.namespace,
            job_id: &eval.job_id,
            job,
            policy: self.policy,
            deployment_id: &deployment_id,
            now,
        });

        let mut plan = Plan::new(eval, job.cloned(), snapshot.index());
        plan.annotations = rec.desired_updates();
        plan.deployment_updates = rec.deployment_updates.clone();
        let mut deployment = rec.deployment.clone();
        let mut deployment_changed = rec.deployment_created;

        let mut computed = Computed {
            plan,
            failed_tg_allocs: BTreeMap::new(),
            queued: BTreeMap::new(),
            class_eligibility: BTreeMap::new(),
            escaped: false,
        };

        // Stops paired with a placement are appended next to it, so a
        // failed placement can leave its predecessor running.
        let replaced: BTreeSet<&str> = rec
            .groups
            .values()
            .flat_map(|diff| diff.placements())
            .filter_map(|p| p.previous.as_ref().map(|a| a.id.as_str()))
            .collect();
        let mut paired: BTreeMap<&str, &StopRequest> = BTreeMap::new();
        for stop in rec.groups.values().flat_map(|diff| diff.stops()) {
            if replaced.contains(stop.alloc.id.as_str()) {
                paired.insert(stop.alloc.id.as_str(), stop);
            } else {
                append_stop(&mut computed.plan, stop);
            }
        }

        let Some(job) = job.filter(|j| !j.stop) else {
            return computed;
        };

        for diff in rec.groups.values() {
            for alloc in &diff.inplace_update {
                let mut updated = alloc.clone();
                updated.eval_id = eval.id.clone();
                if let Some(d) = deployment
                    .as_ref()
                    .filter(|d| d.task_groups.contains_key(&alloc.task_group))
                {
                    updated.deployment_id = Some(d.id.clone());
                }
                computed.plan.append_alloc(updated);
            }
        }

        let mut placer = Placer::new(
            snapshot,
            job,
            self.config.scoring.clone(),
            self.config.preemption.enabled_for(job.job_type),
        );

        for (name, diff) in &rec.groups {
            let Some(group) = job.lookup_task_group(name) else {
                continue;
            };
            let mut failed: Option<AllocMetric> = None;
            let mut queued = 0;

            for place in diff.placements() {
                let stop = place
                    .previous
                    .as_ref()
                    .and_then(|prev| paired.get(prev.id.as_str()).copied());

                if let Some(metric) = failed.as_mut() {
                    metric.coalesced_failures += 1;
                    queued += 1;
                    if let Some(stop) = stop.filter(|s| must_stop(s)) {
                        append_stop(&mut computed.plan, stop);
                    }
                    continue;
                }

                if let Some(stop) = stop {
                    append_stop(&mut computed.plan, stop);
                }
                let mut ask = build_ask(eval, job, group, place, &snapshot_index, now);
                if let Some(d) = deployment
                    .as_ref()
                    .filter(|d| d.task_groups.contains_key(&group.name))
                {
                    ask.deployment_id = Some(d.id.clone());
                    ask.deployment_status = Some(AllocDeploymentStatus {
                        healthy: None,
                        canary: place.canary,
                    });
                }
                let penalty: BTreeSet<String> = place
                    .previous
                    .iter()
                    .filter(|_| place.reschedule)
                    .map(|prev| prev.node_id.clone())
                    .collect();

                let mut metric = AllocMetric::default();
                match placer.select(&computed.plan, group, &ask, &penalty, &mut metric) {
                    Some(selection) => {
                        ask.node_id = selection.node_id;
                        for victim in &selection.preempted {
                            computed.plan.append_preempted(victim, &ask.id);
                        }
                        if place.canary {
                            deployment_changed |=
                                record_canary(deployment.as_mut(), &group.name, &ask.id);
                        }
                        computed.plan.append_alloc(ask);
                    }
                    None => {
                        if let Some(stop) = stop.filter(|s| !must_stop(s)) {
                            unstop(&mut computed.plan, &stop.alloc);
                        }
                        queued += 1;
                        failed = Some(metric);
                    }
                }
            }

            computed.queued.insert(name.clone(), queued);
            if let Some(metric) = failed {
                debug!(
                    eval = %eval.id,
                    group = %name,
                    queued,
                    exhausted = metric.nodes_exhausted,
                    filtered = metric.nodes_filtered,
                    "group placement failed"
                );
                computed.failed_tg_allocs.insert(name.clone(), metric);
            }
        }

        computed.class_eligibility = placer.class_eligibility().clone();
        computed.escaped = placer.escaped_computed_class();
        if deployment_changed {
            computed.plan.deployment = deployment;
        }
        computed
    }
}

fn transition(eval: &mut Evaluation, status: EvalStatus, description: &str) -> SchedulerResult<()> {
    if !eval.status.can_transition_to(status) {
        return Err(SchedulerError::InvalidTransition {
            eval: eval.id.clone(),
            from: eval.status,
            to: status,
        });
    }
    eval.status = status;
    eval.status_description = description.to_string();
    Ok(())
}

fn append_stop(plan: &mut Plan, stop: &StopRequest) {
    plan.append_stopped_alloc(&stop.alloc, &stop.description, stop.client_status);
}

/// Stops that stand even when the replacement cannot be placed.
fn must_stop(stop: &StopRequest) -> bool {
    stop.client_status.is_some() || stop.alloc.client_terminal()
}

fn unstop(plan: &mut Plan, alloc: &Allocation) {
    if let Some(stops) = plan.node_update.get_mut(&alloc.node_id) {
        stops.retain(|s| s.id != alloc.id);
        if stops.is_empty() {
            plan.node_update.remove(&alloc.node_id);
        }
    }
}

fn build_ask(
    eval: &Evaluation,
    job: &Job,
    group: &TaskGroup,
    place: &PlaceRequest,
    snapshot_index: &str,
    now: u64,
) -> Allocation {
    let kind = if place.canary { "canary" } else { "" };
    let id = derive_id(&[&eval.id, snapshot_index, &place.name, kind]);
    let mut ask = Allocation::new(&id, &job.id, &group.name, place.index, "");
    ask.namespace = job.namespace.clone();
    ask.eval_id = eval.id.clone();
    ask.name = place.name.clone();
    ask.job_version = job.version;
    ask.job_priority = job.priority;
    ask.allocated = group.allocated_resources();
    if let Some(prev) = &place.previous {
        ask.previous_allocation = Some(prev.id.clone());
        if place.reschedule {
            ask.reschedule_events = prev.reschedule_events.clone();
            ask.reschedule_events.push(RescheduleEvent {
                prev_alloc_id: prev.id.clone(),
                prev_node_id: prev.node_id.clone(),
                time: now,
            });
        }
    }
    ask
}

fn record_canary(deployment: Option<&mut Deployment>, group: &str, alloc_id: &str) -> bool {
    let Some(state) = deployment.and_then(|d| d.task_groups.get_mut(group)) else {
        return false;
    };
    state.placed_canaries.push(alloc_id.to_string());
    true
}
