//! Plans and plan results.
//!
//! A [`Plan`] is everything one evaluation wants to change, grouped per node.
//! The store commits or rejects each node's slice independently (see
//! [`evaluate_node_plan`]) unless the job asks for all-at-once semantics.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::resources::{Dimension, allocs_fit};
use crate::types::*;

/// Per-group counts of what the reconciler decided, kept for operators.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredUpdates {
    pub place: u32,
    pub stop: u32,
    pub migrate: u32,
    pub inplace_update: u32,
    pub destructive_update: u32,
    pub ignore: u32,
    pub canary: u32,
}

/// Allocation changes one evaluation wants committed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub eval_id: EvalId,
    pub priority: u8,
    /// Job the placements were computed for; `None` when the job is gone.
    pub job: Option<Job>,
    pub all_at_once: bool,
    /// New and in-place updated allocations per node.
    pub node_allocation: BTreeMap<NodeId, Vec<Allocation>>,
    /// Allocations to stop per node.
    pub node_update: BTreeMap<NodeId, Vec<Allocation>>,
    /// Lower-priority allocations evicted to make room.
    pub node_preemptions: BTreeMap<NodeId, Vec<Allocation>>,
    /// Deployment created or updated by this plan.
    pub deployment: Option<Deployment>,
    pub deployment_updates: Vec<DeploymentStatusUpdate>,
    /// Store index of the snapshot the plan was computed against.
    pub snapshot_index: u64,
    pub annotations: BTreeMap<String, DesiredUpdates>,
}

impl Plan {
    pub fn new(eval: &Evaluation, job: Option<Job>, snapshot_index: u64) -> Self {
        Self {
            eval_id: eval.id.clone(),
            priority: eval.priority,
            all_at_once: job.as_ref().is_some_and(|j| j.all_at_once),
            job,
            snapshot_index,
            ..Default::default()
        }
    }

    /// Mark an existing allocation to be stopped. `client_status` overrides
    /// the client-reported status, e.g. `lost` for allocations on down nodes.
    pub fn append_stopped_alloc(
        &mut self,
        alloc: &Allocation,
        description: &str,
        client_status: Option<AllocClientStatus>,
    ) {
        let mut stopped = alloc.clone();
        stopped.desired_status = AllocDesiredStatus::Stop;
        stopped.desired_description = description.to_string();
        if let Some(status) = client_status {
            stopped.client_status = status;
        }
        self.node_update
            .entry(alloc.node_id.clone())
            .or_default()
            .push(stopped);
    }

    /// Place a new allocation or an in-place update of an existing one.
    pub fn append_alloc(&mut self, alloc: Allocation) {
        self.node_allocation
            .entry(alloc.node_id.clone())
            .or_default()
            .push(alloc);
    }

    /// Evict a lower-priority allocation in favour of `preempted_by`.
    pub fn append_preempted(&mut self, alloc: &Allocation, preempted_by: &str) {
        let mut evicted = alloc.clone();
        evicted.desired_status = AllocDesiredStatus::Evict;
        evicted.desired_description = format!("preempted by allocation {preempted_by}");
        self.node_preemptions
            .entry(alloc.node_id.clone())
            .or_default()
            .push(evicted);
    }

    pub fn is_no_op(&self) -> bool {
        self.node_allocation.is_empty()
            && self.node_update.is_empty()
            && self.node_preemptions.is_empty()
            && self.deployment.is_none()
            && self.deployment_updates.is_empty()
    }

    /// Every node the plan touches, in order.
    pub fn node_ids(&self) -> BTreeSet<&str> {
        self.node_allocation
            .keys()
            .chain(self.node_update.keys())
            .chain(self.node_preemptions.keys())
            .map(String::as_str)
            .collect()
    }

    /// Allocation IDs removed from `node_id` by stops and preemptions.
    pub fn removed_on(&self, node_id: &str) -> BTreeSet<&str> {
        self.node_update
            .get(node_id)
            .into_iter()
            .chain(self.node_preemptions.get(node_id))
            .flatten()
            .map(|a| a.id.as_str())
            .collect()
    }

    /// Number of placements (new or updated) in the plan.
    pub fn placement_count(&self) -> usize {
        self.node_allocation.values().map(Vec::len).sum()
    }
}

/// Committed subset of a plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanResult {
    pub node_allocation: BTreeMap<NodeId, Vec<Allocation>>,
    pub node_update: BTreeMap<NodeId, Vec<Allocation>>,
    pub node_preemptions: BTreeMap<NodeId, Vec<Allocation>>,
    pub deployment: Option<Deployment>,
    pub deployment_updates: Vec<DeploymentStatusUpdate>,
    /// Nodes whose slice was rejected, with the reason.
    pub rejected_nodes: BTreeMap<NodeId, String>,
    /// Non-zero when the scheduler must refresh to at least this index and
    /// retry the rejected part.
    pub refresh_index: u64,
    /// Store index the commit was written at.
    pub alloc_index: u64,
}

/// Classification of a plan submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanOutcome {
    Accepted,
    PartiallyAccepted,
    Rejected,
}

impl PlanResult {
    pub fn outcome(&self, plan: &Plan) -> PlanOutcome {
        if self.rejected_nodes.is_empty() {
            return PlanOutcome::Accepted;
        }
        let committed = self.node_allocation.values().map(Vec::len).sum::<usize>()
            + self.node_update.values().map(Vec::len).sum::<usize>()
            + self.node_preemptions.values().map(Vec::len).sum::<usize>();
        if committed == 0 && !plan.is_no_op() {
            PlanOutcome::Rejected
        } else {
            PlanOutcome::PartiallyAccepted
        }
    }

    /// Whether the whole plan made it in.
    pub fn is_full_commit(&self, plan: &Plan) -> bool {
        self.outcome(plan) == PlanOutcome::Accepted
    }
}

/// Why the store refused a node's slice of a plan.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeRejection {
    #[error("node does not exist")]
    Missing,

    #[error("node is not ready for placements")]
    NotReady,

    #[error("node is not eligible for placements")]
    Ineligible,

    #[error("resources exhausted: {0}")]
    Exhausted(Dimension),
}

/// Check one node's slice of a plan against the node's current state.
///
/// `existing` holds the node's current non-terminal allocations. Slices
/// that only stop or evict are always accepted; placements require a ready,
/// eligible node on which the resulting allocation set fits.
pub fn evaluate_node_plan(
    plan: &Plan,
    node_id: &str,
    node: Option<&Node>,
    existing: &[Allocation],
) -> Result<(), NodeRejection> {
    let Some(placements) = plan.node_allocation.get(node_id) else {
        return Ok(());
    };
    if placements.is_empty() {
        return Ok(());
    }

    let node = node.ok_or(NodeRejection::Missing)?;
    if !node.is_ready() {
        return Err(NodeRejection::NotReady);
    }
    if !node.is_eligible() {
        // In-place updates may stay on an ineligible node; new work may not.
        let known: BTreeSet<&str> = existing.iter().map(|a| a.id.as_str()).collect();
        if placements.iter().any(|a| !known.contains(a.id.as_str())) {
            return Err(NodeRejection::Ineligible);
        }
    }

    let mut removed = plan.removed_on(node_id);
    removed.extend(placements.iter().map(|a| a.id.as_str()));

    let proposed = existing
        .iter()
        .filter(|a| !removed.contains(a.id.as_str()) && !a.terminal_status())
        .chain(placements.iter());
    let fit = allocs_fit(node, proposed);
    match fit.dimension {
        None => Ok(()),
        Some(dimension) => Err(NodeRejection::Exhausted(dimension)),
    }
}
