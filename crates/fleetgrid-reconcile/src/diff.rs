//! Allocation diff for one task group.
//!
//! Compares the group's desired shape against its existing allocations and
//! decides, per allocation slot, whether to place, stop, migrate, update in
//! place, replace, or leave it alone. The diff is pure: it reads a
//! [`State`] and returns decisions; the scheduler turns them into a plan.
//!
//! Running the diff again after its decisions are committed yields nothing
//! to do.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};

use fleetgrid_state::{
    AllocClientStatus, Allocation, Deployment, DeploymentStatus, DesiredUpdates, Job, JobType, Node,
    NodeId, NodeStatus, State, TaskGroup, alloc_name,
};
use tracing::trace;

use crate::update::{UpdateKind, UpdatePolicy};

pub const STOP_NOT_NEEDED: &str = "alloc not needed due to job update";
pub const STOP_JOB_STOPPED: &str = "alloc not needed since job was stopped";
pub const STOP_GROUP_REMOVED: &str = "alloc not needed since task group was removed";
pub const STOP_MIGRATING: &str = "alloc is being migrated";
pub const STOP_NODE_LOST: &str = "alloc is lost since its node is down";
pub const STOP_RESCHEDULED: &str = "alloc was rescheduled because it failed";
pub const STOP_LOST_REPLACED: &str = "alloc was replaced because it was lost";
pub const STOP_UPDATING: &str = "alloc is being updated due to job update";

/// Nodes whose allocations must move. `None` marks a node missing from state.
pub type TaintedNodes = BTreeMap<NodeId, Option<Node>>;

/// Collect the tainted nodes that host live allocations.
pub fn tainted_nodes<'a>(
    state: &dyn State,
    allocs: impl IntoIterator<Item = &'a Allocation>,
) -> TaintedNodes {
    let mut tainted = TaintedNodes::new();
    for alloc in allocs {
        if alloc.terminal_status() || tainted.contains_key(&alloc.node_id) {
            continue;
        }
        match state.node_by_id(&alloc.node_id) {
            None => {
                tainted.insert(alloc.node_id.clone(), None);
            }
            Some(node) if node.is_tainted() => {
                tainted.insert(alloc.node_id.clone(), Some(node.clone()));
            }
            Some(_) => {}
        }
    }
    tainted
}

// ── Decisions ─────────────────────────────────────────────────────

/// A new allocation the scheduler must find a node for.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaceRequest {
    pub task_group: String,
    pub index: u32,
    pub name: String,
    pub canary: bool,
    /// Allocation this one replaces.
    pub previous: Option<Allocation>,
    /// The previous allocation failed: avoid its node and record the event.
    pub reschedule: bool,
}

impl PlaceRequest {
    fn fresh(job: &Job, group: &str, index: u32, canary: bool) -> Self {
        Self {
            task_group: group.to_string(),
            index,
            name: alloc_name(&job.id, group, index),
            canary,
            previous: None,
            reschedule: false,
        }
    }

    fn replacing(job: &Job, previous: &Allocation, reschedule: bool) -> Self {
        Self {
            previous: Some(previous.clone()),
            reschedule,
            ..Self::fresh(job, &previous.task_group, previous.index, false)
        }
    }
}

/// An allocation the scheduler must mark for stopping.
#[derive(Debug, Clone, PartialEq)]
pub struct StopRequest {
    pub alloc: Allocation,
    pub description: String,
    pub client_status: Option<AllocClientStatus>,
}

impl StopRequest {
    fn new(alloc: &Allocation, description: &str) -> Self {
        Self {
            alloc: alloc.clone(),
            description: description.to_string(),
            client_status: None,
        }
    }

    fn lost(alloc: &Allocation, description: &str) -> Self {
        Self {
            client_status: Some(AllocClientStatus::Lost),
            ..Self::new(alloc, description)
        }
    }
}

/// Move a live allocation off a tainted node.
#[derive(Debug, Clone, PartialEq)]
pub struct Migration {
    pub stop: StopRequest,
    pub place: PlaceRequest,
    /// The node is down or gone; the old allocation is marked lost.
    pub lost: bool,
}

/// Replace an allocation with one at the new job version.
#[derive(Debug, Clone, PartialEq)]
pub struct DestructiveUpdate {
    pub stop: StopRequest,
    pub place: PlaceRequest,
}

/// Everything the diff decided for one task group.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupDiff {
    /// New placements: missing slots, reschedules, lost replacements.
    pub place: Vec<PlaceRequest>,
    pub stop: Vec<StopRequest>,
    /// Existing allocations rewritten to the new job version.
    pub inplace_update: Vec<Allocation>,
    pub destructive_update: Vec<DestructiveUpdate>,
    pub migrate: Vec<Migration>,
    pub ignore: Vec<Allocation>,
    pub canaries: Vec<PlaceRequest>,
}

impl GroupDiff {
    /// Nothing to commit.
    pub fn is_empty(&self) -> bool {
        self.place.is_empty()
            && self.stop.is_empty()
            && self.inplace_update.is_empty()
            && self.destructive_update.is_empty()
            && self.migrate.is_empty()
            && self.canaries.is_empty()
    }

    /// Whether the diff starts new allocations at the job version.
    pub fn places_new_version(&self) -> bool {
        !self.place.is_empty() || !self.destructive_update.is_empty() || !self.canaries.is_empty()
    }

    /// Every placement the diff asks for, in a stable order.
    pub fn placements(&self) -> impl Iterator<Item = &PlaceRequest> {
        self.canaries
            .iter()
            .chain(self.destructive_update.iter().map(|u| &u.place))
            .chain(self.migrate.iter().map(|m| &m.place))
            .chain(self.place.iter())
    }

    /// Every stop the diff asks for, in a stable order.
    pub fn stops(&self) -> impl Iterator<Item = &StopRequest> {
        self.stop
            .iter()
            .chain(self.destructive_update.iter().map(|u| &u.stop))
            .chain(self.migrate.iter().map(|m| &m.stop))
    }

    pub fn desired_updates(&self) -> DesiredUpdates {
        let n = |len: usize| len as u32;
        DesiredUpdates {
            place: n(self.place.len()),
            stop: n(self.stop.len()),
            migrate: n(self.migrate.len()),
            inplace_update: n(self.inplace_update.len()),
            destructive_update: n(self.destructive_update.len()),
            ignore: n(self.ignore.len()),
            canary: n(self.canaries.len()),
        }
    }
}

// ── Diff ──────────────────────────────────────────────────────────

/// Inputs for diffing one task group that exists in the job.
pub struct GroupInput<'a> {
    pub job: &'a Job,
    pub group: &'a TaskGroup,
    /// Every allocation of the group, terminal ones included.
    pub allocs: Vec<&'a Allocation>,
    pub tainted: &'a TaintedNodes,
    /// Deployment of the current job version, if any.
    pub deployment: Option<&'a Deployment>,
    pub policy: &'a dyn UpdatePolicy,
    /// Source of older job versions for update classification.
    pub state: &'a dyn State,
    /// Unix time (seconds), for reschedule windows.
    pub now: u64,
}

/// Stop every allocation still desired to run.
pub fn stop_all(allocs: &[&Allocation], description: &str) -> GroupDiff {
    let mut diff = GroupDiff::default();
    for alloc in allocs {
        if alloc.terminal_status() {
            continue;
        }
        diff.stop.push(StopRequest::new(alloc, description));
    }
    diff
}

pub fn diff_group(input: &GroupInput<'_>) -> GroupDiff {
    let job = input.job;
    let group = input.group;
    let version = job.version;
    let deployment = input.deployment.filter(|d| d.job_version == version);
    let promoted = deployment
        .and_then(|d| d.task_groups.get(&group.name))
        .is_some_and(|s| s.promoted);
    let deployment_failed = deployment.is_some_and(|d| d.status == DeploymentStatus::Failed);

    let mut diff = GroupDiff::default();

    // Terminal allocations that still hold their slot.
    let mut kept: Vec<&Allocation> = Vec::new();
    // Failed or lost allocations replaced in their slot.
    let mut replacements: Vec<(StopRequest, PlaceRequest)> = Vec::new();
    let mut migrations: Vec<Migration> = Vec::new();
    let mut live: Vec<&Allocation> = Vec::new();

    for &alloc in &input.allocs {
        if alloc.server_terminal() {
            continue;
        }
        match alloc.client_status {
            AllocClientStatus::Complete => {
                if job.job_type == JobType::Batch {
                    kept.push(alloc);
                }
                continue;
            }
            AllocClientStatus::Failed => {
                if reschedulable(alloc, group, input.now) {
                    replacements.push((
                        StopRequest::new(alloc, STOP_RESCHEDULED),
                        PlaceRequest::replacing(job, alloc, true),
                    ));
                } else {
                    kept.push(alloc);
                }
                continue;
            }
            AllocClientStatus::Lost => {
                replacements.push((
                    StopRequest::new(alloc, STOP_LOST_REPLACED),
                    PlaceRequest::replacing(job, alloc, false),
                ));
                continue;
            }
            AllocClientStatus::Pending | AllocClientStatus::Running => {}
        }

        if let Some(node) = input.tainted.get(&alloc.node_id) {
            let lost = node.as_ref().is_none_or(|n| n.status == NodeStatus::Down);
            let stop = if lost {
                StopRequest::lost(alloc, STOP_NODE_LOST)
            } else {
                StopRequest::new(alloc, STOP_MIGRATING)
            };
            migrations.push(Migration {
                stop,
                place: PlaceRequest::replacing(job, alloc, false),
                lost,
            });
            continue;
        }
        live.push(alloc);
    }

    // Split live allocations by version.
    let mut current: Vec<&Allocation> = Vec::new();
    let mut canaries: Vec<&Allocation> = Vec::new();
    let mut inplace: Vec<&Allocation> = Vec::new();
    let mut destructive: Vec<&Allocation> = Vec::new();
    for alloc in live {
        if alloc.job_version == version {
            let ours = deployment
                .is_some_and(|d| alloc.deployment_id.as_deref() == Some(d.id.as_str()));
            if alloc.is_canary() && ours && !promoted {
                canaries.push(alloc);
            } else {
                current.push(alloc);
            }
            continue;
        }
        match classify(input, alloc) {
            UpdateKind::InPlace => inplace.push(alloc),
            UpdateKind::Destructive => destructive.push(alloc),
        }
    }

    // Surplus: give up replacements first, then the least desirable.
    let desired = group.count as usize;
    let existing = current.len()
        + inplace.len()
        + destructive.len()
        + migrations.len()
        + replacements.len()
        + kept.len();
    let mut surplus = existing.saturating_sub(desired);

    migrations.sort_by_key(|m| m.place.index);
    while surplus > 0 {
        let Some(m) = migrations.pop() else { break };
        diff.stop.push(m.stop);
        surplus -= 1;
    }
    replacements.sort_by_key(|(_, p)| p.index);
    while surplus > 0 {
        let Some((stop, _)) = replacements.pop() else { break };
        diff.stop.push(stop);
        surplus -= 1;
    }
    if surplus > 0 {
        let failed = kept
            .iter()
            .filter(|a| a.client_status == AllocClientStatus::Failed);
        let mut candidates: Vec<&Allocation> = current
            .iter()
            .chain(&inplace)
            .chain(&destructive)
            .chain(failed)
            .copied()
            .collect();
        candidates.sort_by_key(|a| (desirability(a, version), Reverse(a.index), a.id.clone()));
        let doomed: BTreeSet<&str> = candidates
            .iter()
            .take(surplus)
            .map(|a| a.id.as_str())
            .collect();
        for alloc in &candidates[..doomed.len()] {
            diff.stop.push(StopRequest::new(alloc, STOP_NOT_NEEDED));
        }
        let keep = |a: &&Allocation| !doomed.contains(a.id.as_str());
        current.retain(keep);
        inplace.retain(keep);
        destructive.retain(keep);
        kept.retain(keep);
    }

    let mut used: BTreeSet<u32> = current
        .iter()
        .chain(&inplace)
        .chain(&destructive)
        .chain(&kept)
        .chain(&canaries)
        .map(|a| a.index)
        .collect();
    used.extend(migrations.iter().map(|m| m.place.index));
    used.extend(replacements.iter().map(|(_, p)| p.index));
    let occupied = current.len()
        + inplace.len()
        + destructive.len()
        + migrations.len()
        + replacements.len()
        + kept.len();

    // In-place updates.
    for alloc in inplace {
        let mut updated = alloc.clone();
        updated.job_version = version;
        updated.job_priority = job.priority;
        updated.allocated = group.allocated_resources();
        diff.inplace_update.push(updated);
    }

    // Destructive updates, gated by canaries and max_parallel.
    let strategy = group.update_strategy();
    let canary_count = strategy.map_or(0, |u| u.canary) as usize;
    let needs_canaries = canary_count > 0 && !destructive.is_empty() && !promoted;
    destructive.sort_by_key(|a| a.index);
    if needs_canaries || deployment_failed {
        if needs_canaries && !deployment_failed {
            let missing = canary_count.saturating_sub(canaries.len());
            for index in free_indices(&mut used, desired as u32, missing) {
                diff.canaries.push(PlaceRequest::fresh(job, &group.name, index, true));
            }
        }
        diff.ignore.extend(destructive.into_iter().cloned());
    } else {
        let budget = match strategy {
            None => usize::MAX,
            Some(update) => {
                let unhealthy = current.iter().filter(|a| !a.is_healthy()).count();
                (update.max_parallel as usize).saturating_sub(unhealthy)
            }
        };
        for (n, alloc) in destructive.into_iter().enumerate() {
            if n < budget {
                diff.destructive_update.push(DestructiveUpdate {
                    stop: StopRequest::new(alloc, STOP_UPDATING),
                    place: PlaceRequest::replacing(job, alloc, false),
                });
            } else {
                diff.ignore.push(alloc.clone());
            }
        }
    }

    for (stop, place) in replacements {
        diff.stop.push(stop);
        diff.place.push(place);
    }
    diff.migrate = migrations;

    // Deficit: fill the lowest free slots.
    let missing = desired.saturating_sub(occupied);
    for index in free_indices(&mut used, 0, missing) {
        diff.place.push(PlaceRequest::fresh(job, &group.name, index, false));
    }

    diff.ignore.extend(current.into_iter().cloned());
    diff.ignore.extend(canaries.into_iter().cloned());
    diff.ignore.extend(kept.into_iter().cloned());

    trace!(
        job = %job.id,
        group = %group.name,
        place = diff.place.len(),
        stop = diff.stop.len(),
        migrate = diff.migrate.len(),
        inplace = diff.inplace_update.len(),
        destructive = diff.destructive_update.len(),
        canaries = diff.canaries.len(),
        ignore = diff.ignore.len(),
        "group diffed"
    );
    diff
}

/// Whether a failed allocation may be replaced under the group's policy.
fn reschedulable(alloc: &Allocation, group: &TaskGroup, now: u64) -> bool {
    let policy = &group.reschedule_policy;
    if policy.unlimited {
        return true;
    }
    alloc.reschedules_within(now, policy.interval_secs) < policy.attempts as usize
}

fn classify(input: &GroupInput<'_>, alloc: &Allocation) -> UpdateKind {
    let old_job = input
        .state
        .job_by_id_and_version(&input.job.namespace, &input.job.id, alloc.job_version);
    let old_group = old_job.and_then(|j| j.lookup_task_group(&input.group.name).map(|g| (j, g)));
    match old_group {
        Some((old_job, old)) => input.policy.classify(old_job, old, input.job, input.group),
        None => UpdateKind::Destructive,
    }
}

/// Lower stops first: failed, old versions, then unhealthy, pending, running.
fn desirability(alloc: &Allocation, version: u64) -> u8 {
    if alloc.client_status == AllocClientStatus::Failed {
        0
    } else if alloc.job_version != version {
        1
    } else if alloc.is_unhealthy() {
        2
    } else if alloc.client_status == AllocClientStatus::Pending {
        3
    } else {
        4
    }
}

/// Claim `count` unused slot indices at or above `from`.
fn free_indices(used: &mut BTreeSet<u32>, from: u32, count: usize) -> Vec<u32> {
    let mut claimed = Vec::with_capacity(count);
    let mut index = from;
    while claimed.len() < count {
        if used.insert(index) {
            claimed.push(index);
        }
        index += 1;
    }
    claimed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::update::{SpecChangePolicy, TaskChangePolicy};
    use fleetgrid_state::{
        AllocDeploymentStatus, AllocDesiredStatus, RescheduleEvent, Resources,
        SchedulingEligibility, StateSnapshot, UpdateStrategy, mock,
    };

    struct Fixture {
        snap: StateSnapshot,
        job: Job,
        deployment: Option<Deployment>,
    }

    impl Fixture {
        fn new(job: Job) -> Self {
            let mut snap = StateSnapshot::new(1);
            for i in 0..10 {
                snap.upsert_node(mock::node(&format!("n{i}")));
            }
            snap.upsert_job(job.clone());
            Self {
                snap,
                job,
                deployment: None,
            }
        }

        /// One running allocation per slot, slot `i` on node `n{i}`.
        fn running(mut self, count: u32) -> Self {
            for i in 0..count {
                let node = format!("n{i}");
                let mut alloc = mock::alloc(&self.job, i, &node);
                alloc.client_status = AllocClientStatus::Running;
                self.snap.upsert_alloc(alloc);
            }
            self
        }

        fn bump(&mut self, f: impl FnOnce(&mut Job)) {
            let mut next = self.job.clone();
            next.version += 1;
            f(&mut next);
            self.snap.upsert_job(next.clone());
            self.job = next;
        }

        fn allocs(&self) -> Vec<&Allocation> {
            self.snap.allocs_by_job(&self.job.namespace, &self.job.id)
        }

        fn diff_with(&self, policy: &dyn UpdatePolicy, now: u64) -> GroupDiff {
            let allocs = self.allocs();
            let tainted = tainted_nodes(&self.snap, allocs.iter().copied());
            diff_group(&GroupInput {
                job: &self.job,
                group: &self.job.task_groups[0],
                allocs,
                tainted: &tainted,
                deployment: self.deployment.as_ref(),
                policy,
                state: &self.snap,
                now,
            })
        }

        fn diff(&self) -> GroupDiff {
            self.diff_with(&SpecChangePolicy, 1_000)
        }

        /// Commit a diff the way the plan gate would, placing on `n0`.
        fn apply(&mut self, diff: &GroupDiff) {
            for stop in diff.stops() {
                let mut alloc = stop.alloc.clone();
                alloc.desired_status = AllocDesiredStatus::Stop;
                if let Some(status) = stop.client_status {
                    alloc.client_status = status;
                }
                self.snap.upsert_alloc(alloc);
            }
            for alloc in &diff.inplace_update {
                self.snap.upsert_alloc(alloc.clone());
            }
            for place in diff.placements() {
                let mut alloc = mock::alloc(&self.job, place.index, "n0");
                alloc.id = format!("{}-v{}", alloc.id, self.job.version);
                if place.canary {
                    alloc.id.push_str("-canary");
                    alloc.deployment_id = self.deployment.as_ref().map(|d| d.id.clone());
                    alloc.deployment_status = Some(AllocDeploymentStatus {
                        healthy: None,
                        canary: true,
                    });
                }
                alloc.previous_allocation = place.previous.as_ref().map(|p| p.id.clone());
                self.snap.upsert_alloc(alloc);
            }
        }

        fn set_health(&mut self, healthy: bool, pred: impl Fn(&Allocation) -> bool) {
            let targets: Vec<Allocation> = self
                .allocs()
                .into_iter()
                .filter(|a| pred(a))
                .cloned()
                .collect();
            for mut alloc in targets {
                let canary = alloc.is_canary();
                alloc.deployment_status = Some(AllocDeploymentStatus {
                    healthy: Some(healthy),
                    canary,
                });
                self.snap.upsert_alloc(alloc);
            }
        }
    }

    fn indices(reqs: &[PlaceRequest]) -> Vec<u32> {
        reqs.iter().map(|p| p.index).collect()
    }

    #[test]
    fn fresh_group_places_every_slot() {
        let fx = Fixture::new(mock::job("api"));
        let diff = fx.diff();
        assert_eq!(indices(&diff.place), (0..10).collect::<Vec<_>>());
        assert_eq!(diff.place[3].name, "api.web[3]");
        assert!(diff.stop.is_empty());
        assert!(diff.ignore.is_empty());
    }

    #[test]
    fn matching_group_is_ignored() {
        let fx = Fixture::new(mock::job("api")).running(10);
        let diff = fx.diff();
        assert!(diff.is_empty());
        assert_eq!(diff.ignore.len(), 10);
    }

    #[test]
    fn partial_group_fills_lowest_free_slots() {
        let mut fx = Fixture::new(mock::job("api")).running(10);
        // Free slots 2 and 5 by stopping them.
        for id in ["api-web-2-n2", "api-web-5-n5"] {
            let mut alloc = fx.snap.alloc_by_id(id).cloned().unwrap();
            alloc.desired_status = AllocDesiredStatus::Stop;
            fx.snap.upsert_alloc(alloc);
        }
        let diff = fx.diff();
        assert_eq!(indices(&diff.place), vec![2, 5]);
        assert_eq!(diff.ignore.len(), 8);
    }

    #[test]
    fn ineligible_nodes_migrate_without_extra_stops() {
        let mut fx = Fixture::new(mock::job("api")).running(10);
        for id in ["n3", "n7"] {
            let mut node = mock::node(id);
            node.eligibility = SchedulingEligibility::Ineligible;
            fx.snap.upsert_node(node);
        }
        let diff = fx.diff();
        assert_eq!(diff.migrate.len(), 2);
        assert_eq!(diff.ignore.len(), 8);
        assert!(diff.stop.is_empty());
        assert!(diff.place.is_empty());
        let migrated: Vec<u32> = diff.migrate.iter().map(|m| m.place.index).collect();
        assert_eq!(migrated, vec![3, 7]);
        assert!(diff.migrate.iter().all(|m| !m.lost && m.stop.client_status.is_none()));
    }

    #[test]
    fn down_and_missing_nodes_mark_allocs_lost() {
        let mut fx = Fixture::new(mock::job("api")).running(3);
        let mut down = mock::node("n1");
        down.status = NodeStatus::Down;
        fx.snap.upsert_node(down);
        let mut orphan = mock::alloc(&fx.job, 5, "gone");
        orphan.client_status = AllocClientStatus::Running;
        fx.snap.upsert_alloc(orphan);

        let diff = fx.diff();
        assert_eq!(diff.migrate.len(), 2);
        assert!(diff.migrate.iter().all(|m| m.lost));
        assert!(
            diff.migrate
                .iter()
                .all(|m| m.stop.client_status == Some(AllocClientStatus::Lost))
        );
        // 3 + 1 existing, 6 slots missing.
        assert_eq!(diff.place.len(), 6);
    }

    #[test]
    fn scale_down_stops_highest_slots_least_desirable_first() {
        let mut fx = Fixture::new(mock::job("api")).running(10);
        let mut pending = fx.snap.alloc_by_id("api-web-1-n1").cloned().unwrap();
        pending.client_status = AllocClientStatus::Pending;
        fx.snap.upsert_alloc(pending);
        fx.bump(|j| j.task_groups[0].count = 7);

        let diff = fx.diff();
        // Count-only change is in place for the survivors.
        assert_eq!(diff.inplace_update.len(), 7);
        assert!(diff.inplace_update.iter().all(|a| a.job_version == 1));
        let stopped: Vec<u32> = diff.stop.iter().map(|s| s.alloc.index).collect();
        assert_eq!(stopped, vec![9, 8, 7]);
    }

    #[test]
    fn scale_down_prefers_unhealthy_then_pending() {
        let mut fx = Fixture::new(mock::job("api")).running(5);
        let mut pending = fx.snap.alloc_by_id("api-web-0-n0").cloned().unwrap();
        pending.client_status = AllocClientStatus::Pending;
        fx.snap.upsert_alloc(pending);
        fx.set_health(false, |a| a.index == 1);
        fx.job.task_groups[0].count = 3;
        fx.snap.upsert_job(fx.job.clone());

        let diff = fx.diff();
        let stopped: Vec<u32> = diff.stop.iter().map(|s| s.alloc.index).collect();
        assert_eq!(stopped, vec![1, 0]);
    }

    #[test]
    fn scale_down_stops_exhausted_failed_alloc_before_healthy_ones() {
        let mut fx = Fixture::new(mock::job("api")).running(10);
        let mut failed = fx.snap.alloc_by_id("api-web-4-n4").cloned().unwrap();
        failed.client_status = AllocClientStatus::Failed;
        failed.reschedule_events = (0..2)
            .map(|i| RescheduleEvent {
                prev_alloc_id: format!("old-{i}"),
                prev_node_id: "n9".to_string(),
                time: 900,
            })
            .collect();
        fx.snap.upsert_alloc(failed);
        fx.job.task_groups[0].count = 9;
        fx.snap.upsert_job(fx.job.clone());

        let diff = fx.diff();
        let stopped: Vec<(u32, AllocClientStatus)> = diff
            .stop
            .iter()
            .map(|s| (s.alloc.index, s.alloc.client_status))
            .collect();
        assert_eq!(stopped, vec![(4, AllocClientStatus::Failed)]);
        assert_eq!(diff.stop[0].description, STOP_NOT_NEEDED);
        assert!(diff.place.is_empty());
        let running = diff
            .ignore
            .iter()
            .filter(|a| a.client_status == AllocClientStatus::Running)
            .count();
        assert_eq!(running, 9);
    }

    #[test]
    fn failed_alloc_is_rescheduled_within_attempts() {
        let mut fx = Fixture::new(mock::job("api")).running(10);
        let mut failed = fx.snap.alloc_by_id("api-web-4-n4").cloned().unwrap();
        failed.client_status = AllocClientStatus::Failed;
        fx.snap.upsert_alloc(failed);

        let diff = fx.diff();
        assert_eq!(diff.place.len(), 1);
        let place = &diff.place[0];
        assert!(place.reschedule);
        assert_eq!(place.index, 4);
        assert_eq!(place.previous.as_ref().unwrap().id, "api-web-4-n4");
        assert_eq!(diff.stop.len(), 1);
        assert_eq!(diff.stop[0].description, STOP_RESCHEDULED);
    }

    #[test]
    fn failed_alloc_past_attempts_keeps_its_slot() {
        let mut fx = Fixture::new(mock::job("api")).running(10);
        let mut failed = fx.snap.alloc_by_id("api-web-4-n4").cloned().unwrap();
        failed.client_status = AllocClientStatus::Failed;
        failed.reschedule_events = (0..2)
            .map(|i| RescheduleEvent {
                prev_alloc_id: format!("old-{i}"),
                prev_node_id: "n9".to_string(),
                time: 900,
            })
            .collect();
        fx.snap.upsert_alloc(failed);

        let diff = fx.diff();
        assert!(diff.is_empty());
        assert_eq!(diff.ignore.len(), 10);
        // Outside the window the attempts reset.
        let later = fx.diff_with(&SpecChangePolicy, 900 + 3_600 + 1);
        assert_eq!(later.place.len(), 1);
    }

    #[test]
    fn completed_batch_allocs_hold_slots_but_service_ones_do_not() {
        let mut batch = Fixture::new(mock::batch_job("etl")).running(3);
        batch.job.task_groups[0].count = 3;
        batch.snap.upsert_job(batch.job.clone());
        let mut done = batch.snap.alloc_by_id("etl-worker-0-n0").cloned().unwrap();
        done.client_status = AllocClientStatus::Complete;
        batch.snap.upsert_alloc(done);
        assert!(batch.diff().is_empty());

        let mut service = Fixture::new(mock::job("api")).running(10);
        let mut done = service.snap.alloc_by_id("api-web-0-n0").cloned().unwrap();
        done.client_status = AllocClientStatus::Complete;
        service.snap.upsert_alloc(done);
        assert_eq!(indices(&service.diff().place), vec![0]);
    }

    #[test]
    fn destructive_update_without_strategy_replaces_everything() {
        let mut fx = Fixture::new(mock::job("api")).running(10);
        fx.bump(|j| j.task_groups[0].tasks[0].resources = Resources::new(600, 256, 0, 0));
        let diff = fx.diff();
        assert_eq!(diff.destructive_update.len(), 10);
        assert!(diff.ignore.is_empty());
        let u = &diff.destructive_update[0];
        assert_eq!(u.stop.alloc.index, u.place.index);
        assert_eq!(u.stop.description, STOP_UPDATING);
    }

    #[test]
    fn destructive_updates_respect_max_parallel() {
        let mut fx = Fixture::new(mock::job("api")).running(10);
        fx.bump(|j| {
            j.task_groups[0].tasks[0].env.insert("V".into(), "2".into());
            j.task_groups[0].update = Some(UpdateStrategy {
                max_parallel: 3,
                ..Default::default()
            });
        });
        let diff = fx.diff();
        assert_eq!(diff.destructive_update.len(), 3);
        assert_eq!(diff.ignore.len(), 7);

        // New-version allocations that are not yet healthy consume the budget.
        fx.apply(&diff);
        let diff = fx.diff();
        assert!(diff.is_empty());

        fx.set_health(true, |a| a.job_version == 1 && !a.server_terminal());
        let diff = fx.diff();
        assert_eq!(diff.destructive_update.len(), 3);
    }

    #[test]
    fn zero_max_parallel_rolls_out_like_no_strategy() {
        let mut fx = Fixture::new(mock::job("api")).running(10);
        fx.bump(|j| {
            j.task_groups[0].tasks[0].env.insert("V".into(), "2".into());
            j.task_groups[0].update = Some(UpdateStrategy {
                max_parallel: 0,
                ..Default::default()
            });
        });
        let diff = fx.diff();
        assert_eq!(diff.destructive_update.len(), 10);
        assert!(diff.ignore.is_empty());
        assert!(diff.canaries.is_empty());
    }

    #[test]
    fn task_change_policy_updates_constraint_changes_in_place() {
        let mut fx = Fixture::new(mock::job("api")).running(10);
        fx.bump(|j| {
            j.task_groups[0].meta.insert("team".into(), "core".into());
        });
        assert_eq!(fx.diff_with(&TaskChangePolicy, 0).inplace_update.len(), 10);
        assert_eq!(fx.diff_with(&SpecChangePolicy, 0).destructive_update.len(), 10);
    }

    #[test]
    fn canaries_hold_destructive_updates_until_promotion() {
        let mut fx = Fixture::new(mock::job("api")).running(4);
        fx.job.task_groups[0].count = 4;
        fx.snap.upsert_job(fx.job.clone());
        fx.bump(|j| {
            j.task_groups[0].tasks[0].env.insert("V".into(), "2".into());
            j.task_groups[0].update = Some(UpdateStrategy {
                max_parallel: 2,
                canary: 1,
                ..Default::default()
            });
        });
        fx.deployment = Some(mock::deployment(&fx.job));

        let diff = fx.diff();
        assert_eq!(indices(&diff.canaries), vec![4]);
        assert!(diff.canaries[0].canary);
        assert!(diff.destructive_update.is_empty());
        assert_eq!(diff.ignore.len(), 4);

        fx.apply(&diff);
        let diff = fx.diff();
        assert!(diff.is_empty(), "canary already placed: {diff:?}");

        // Promote: the canary takes over an old slot, the rest roll.
        fx.set_health(true, |a| a.is_canary());
        if let Some(d) = fx.deployment.as_mut() {
            d.task_groups.get_mut("web").unwrap().promoted = true;
        }
        let diff = fx.diff();
        assert!(diff.canaries.is_empty());
        assert_eq!(diff.stop.len(), 1);
        assert_eq!(diff.stop[0].alloc.index, 3);
        assert_eq!(diff.destructive_update.len(), 2);
        let rolled: Vec<u32> = diff.destructive_update.iter().map(|u| u.place.index).collect();
        assert_eq!(rolled, vec![0, 1]);
    }

    #[test]
    fn failed_deployment_halts_the_rollout() {
        let mut fx = Fixture::new(mock::job("api")).running(4);
        fx.bump(|j| {
            j.task_groups[0].tasks[0].env.insert("V".into(), "2".into());
            j.task_groups[0].update = Some(UpdateStrategy::default());
        });
        let mut deployment = mock::deployment(&fx.job);
        deployment.status = DeploymentStatus::Failed;
        fx.deployment = Some(deployment);
        let diff = fx.diff();
        assert!(diff.destructive_update.is_empty());
        assert!(diff.canaries.is_empty());
    }

    #[test]
    fn diff_is_idempotent_once_applied() {
        let mut fx = Fixture::new(mock::job("api")).running(8);
        fx.snap.upsert_node(mock::drain_node("n2"));
        let mut failed = fx.snap.alloc_by_id("api-web-5-n5").cloned().unwrap();
        failed.client_status = AllocClientStatus::Failed;
        fx.snap.upsert_alloc(failed);
        fx.bump(|j| {
            j.task_groups[0].tasks[0].env.insert("V".into(), "2".into());
        });

        let diff = fx.diff();
        assert!(!diff.is_empty());
        fx.apply(&diff);
        let again = fx.diff();
        assert!(again.is_empty(), "second pass not empty: {again:?}");
        assert_eq!(again.ignore.len(), 10);
    }

    #[test]
    fn stop_all_skips_terminal_allocs() {
        let job = mock::job("api");
        let live = mock::alloc(&job, 0, "n0");
        let mut done = mock::alloc(&job, 1, "n1");
        done.client_status = AllocClientStatus::Complete;
        let diff = stop_all(&[&live, &done], STOP_JOB_STOPPED);
        assert_eq!(diff.stop.len(), 1);
        assert_eq!(diff.stop[0].alloc.id, live.id);
        assert_eq!(diff.desired_updates().stop, 1);
    }
}
