//! Placement engine: picks a node for one allocation at a time.
//!
//! The placer works against a snapshot plus the plan being built, so every
//! decision already accounts for the stops, evictions, and placements made
//! earlier in the same evaluation:
//! 1. Filter nodes by feasibility and distinct constraints
//! 2. Check resource fit against the node's proposed allocations
//! 3. Score the survivors and take the best (ties by node ID)
//! 4. If nothing fits and preemption is enabled, retry exhausted nodes with
//!    lower-priority allocations evicted

use std::collections::{BTreeMap, BTreeSet};

use fleetgrid_state::{AllocMetric, Allocation, Job, Node, Plan, State, TaskGroup, allocs_fit};
use tracing::{debug, trace};

use crate::feasible::{FeasibilityChecker, check_distinct};
use crate::preempt::select_victims;
use crate::scorer::{NodeScore, ScoreRequest, ScoringWeights, SpreadCounts, rank_nodes, score_node};

/// Top scores kept in the metric for operators.
const MAX_RECORDED_SCORES: usize = 5;

/// A chosen node for one placement.
#[derive(Debug, Clone)]
pub struct Selection {
    pub node_id: String,
    pub score: NodeScore,
    /// Allocations that must be evicted for the placement to fit.
    pub preempted: Vec<Allocation>,
}

/// Stateful node selector for one job within one evaluation.
pub struct Placer<'a, S: State + ?Sized> {
    state: &'a S,
    job: &'a Job,
    nodes: Vec<&'a Node>,
    feasibility: FeasibilityChecker<'a>,
    weights: ScoringWeights,
    preemption: bool,
    nodes_available: BTreeMap<String, u32>,
}

impl<'a, S: State + ?Sized> Placer<'a, S> {
    pub fn new(state: &'a S, job: &'a Job, weights: ScoringWeights, preemption: bool) -> Self {
        let nodes = state.nodes();
        let mut nodes_available = BTreeMap::new();
        for node in &nodes {
            let targeted = job.datacenters.is_empty()
                || job
                    .datacenters
                    .iter()
                    .any(|dc| dc == "*" || *dc == node.datacenter);
            if node.is_ready() && targeted {
                *nodes_available.entry(node.datacenter.clone()).or_insert(0) += 1;
            }
        }
        Self {
            state,
            job,
            nodes,
            feasibility: FeasibilityChecker::new(job),
            weights,
            preemption,
            nodes_available,
        }
    }

    /// Computed classes seen so far and whether the job could run there.
    pub fn class_eligibility(&self) -> &BTreeMap<String, bool> {
        self.feasibility.class_eligibility()
    }

    pub fn escaped_computed_class(&self) -> bool {
        self.feasibility.escaped()
    }

    /// Choose a node for `ask`, an allocation of `group` not yet bound to a
    /// node. Diagnostics accumulate into `metric` whether or not a node is
    /// found.
    pub fn select(
        &mut self,
        plan: &Plan,
        group: &TaskGroup,
        ask: &Allocation,
        penalty_nodes: &BTreeSet<String>,
        metric: &mut AllocMetric,
    ) -> Option<Selection> {
        metric.nodes_available = self.nodes_available.clone();

        let job_allocs = self.job_proposed(plan);
        let spread_counts = self.spread_counts(group, &job_allocs);

        let mut scored: Vec<(NodeScore, Vec<Allocation>)> = Vec::new();
        let mut exhausted: Vec<&'a Node> = Vec::new();

        for &node in &self.nodes {
            metric.evaluate_node();
            if let Err(reason) = self.feasibility.check(node, group) {
                trace!(node = %node.id, %reason, "node filtered");
                metric.filter_node(node, &reason.to_string());
                continue;
            }
            if let Err(reason) = check_distinct(node, self.job, group, &job_allocs) {
                metric.filter_node(node, &reason.to_string());
                continue;
            }

            let current = self.proposed_on(plan, &node.id);
            let fit = allocs_fit(node, current.iter().copied().chain([ask]));
            if let Some(dimension) = fit.dimension {
                metric.exhausted_node(node, dimension);
                exhausted.push(node);
                continue;
            }

            let collisions = current
                .iter()
                .filter(|a| a.job_id == self.job.id && a.task_group == group.name)
                .count() as u32;
            let request = ScoreRequest {
                job: self.job,
                group,
                collisions,
                spread_counts: &spread_counts,
                penalty_nodes,
            };
            let score = score_node(
                node,
                &fit.used,
                &request,
                &self.weights,
                self.feasibility.constraint_checker(),
            );
            scored.push((score, Vec::new()));
        }

        if scored.is_empty() && self.preemption {
            for node in exhausted {
                let current = self.proposed_on(plan, &node.id);
                let Some(victims) = select_victims(node, &current, ask, self.job.priority) else {
                    continue;
                };
                let evicted: BTreeSet<&str> = victims.iter().map(|v| v.id.as_str()).collect();
                let remaining = current
                    .iter()
                    .copied()
                    .filter(|a| !evicted.contains(a.id.as_str()));
                let fit = allocs_fit(node, remaining.chain([ask]));
                let request = ScoreRequest {
                    job: self.job,
                    group,
                    collisions: 0,
                    spread_counts: &spread_counts,
                    penalty_nodes,
                };
                let score = score_node(
                    node,
                    &fit.used,
                    &request,
                    &self.weights,
                    self.feasibility.constraint_checker(),
                );
                scored.push((score, victims));
            }
        }

        if scored.is_empty() {
            debug!(job = %self.job.id, group = %group.name, "no node fits placement");
            return None;
        }

        let mut scores: Vec<NodeScore> = scored.iter().map(|(s, _)| s.clone()).collect();
        rank_nodes(&mut scores);
        metric.scores = scores
            .iter()
            .take(MAX_RECORDED_SCORES)
            .map(|s| (s.node_id.clone(), s.score))
            .collect();

        let best = scores.into_iter().next()?;
        let preempted = scored
            .into_iter()
            .find(|(s, _)| s.node_id == best.node_id)
            .map(|(_, victims)| victims)
            .unwrap_or_default();

        debug!(
            job = %self.job.id,
            group = %group.name,
            node = %best.node_id,
            score = best.score,
            preempted = preempted.len(),
            "placement selected"
        );
        Some(Selection {
            node_id: best.node_id.clone(),
            score: best,
            preempted,
        })
    }

    /// Non-terminal allocations on `node_id` once the plan is applied.
    fn proposed_on<'p>(&self, plan: &'p Plan, node_id: &str) -> Vec<&'p Allocation>
    where
        'a: 'p,
    {
        let removed = plan.removed_on(node_id);
        let planned = plan.node_allocation.get(node_id);
        let planned_ids: BTreeSet<&str> = planned
            .into_iter()
            .flatten()
            .map(|a| a.id.as_str())
            .collect();

        let mut proposed: Vec<&'p Allocation> = self
            .state
            .allocs_by_node(node_id)
            .into_iter()
            .filter(|a| {
                !a.terminal_status()
                    && !removed.contains(a.id.as_str())
                    && !planned_ids.contains(a.id.as_str())
            })
            .collect();
        proposed.extend(planned.into_iter().flatten());
        proposed
    }

    /// Every allocation of the job that will be live once the plan is
    /// applied, paired with its node.
    fn job_proposed<'p>(&self, plan: &'p Plan) -> Vec<(&'p Node, &'p Allocation)>
    where
        'a: 'p,
    {
        let removed: BTreeSet<&str> = plan
            .node_update
            .values()
            .chain(plan.node_preemptions.values())
            .flatten()
            .map(|a| a.id.as_str())
            .collect();
        let planned: Vec<&'p Allocation> = plan
            .node_allocation
            .values()
            .flatten()
            .filter(|a| a.job_id == self.job.id && a.namespace == self.job.namespace)
            .collect();
        let planned_ids: BTreeSet<&str> = planned.iter().map(|a| a.id.as_str()).collect();

        let state: &'a S = self.state;
        state
            .allocs_by_job(&self.job.namespace, &self.job.id)
            .into_iter()
            .filter(|a| {
                !a.terminal_status()
                    && !removed.contains(a.id.as_str())
                    && !planned_ids.contains(a.id.as_str())
            })
            .chain(planned)
            .filter_map(|a| state.node_by_id(&a.node_id).map(|n| (n, a)))
            .collect()
    }

    fn spread_counts(
        &self,
        group: &TaskGroup,
        job_allocs: &[(&Node, &Allocation)],
    ) -> SpreadCounts {
        self.job
            .spreads
            .iter()
            .chain(&group.spreads)
            .map(|spread| {
                let mut counts = BTreeMap::new();
                for (node, alloc) in job_allocs {
                    if alloc.task_group != group.name {
                        continue;
                    }
                    if let Some(value) = spread.attribute.resolve(node) {
                        *counts.entry(value.to_string()).or_insert(0) += 1;
                    }
                }
                counts
            })
            .collect()
    }
}
