//! Node scoring for placement decisions.
//!
//! Evaluates feasible nodes using a weighted combination of:
//! - **Bin-packing** (best-fit): prefer nodes that will be most full after placement
//! - **Affinity**: signed preference for nodes matching the job's affinities
//! - **Spread**: push allocations toward under-used attribute values
//! - **Anti-affinity**: avoid stacking the same group on one node
//! - **Reschedule penalty**: avoid the node a replacement's predecessor failed on
//!
//! Only nodes that passed feasibility and resource fit are ever scored.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use fleetgrid_state::{Affinity, Job, Node, Resources, Spread, TaskGroup, score_fit};
use serde::{Deserialize, Serialize};

use crate::feasible::ConstraintChecker;

/// Weights for the scoring components.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    pub bin_pack: f64,
    pub affinity: f64,
    pub spread: f64,
    pub anti_affinity: f64,
    pub reschedule_penalty: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            bin_pack: 1.0,
            affinity: 1.0,
            spread: 1.0,
            anti_affinity: 1.0,
            reschedule_penalty: 1.0,
        }
    }
}

/// Individual score components for diagnostics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScoreBreakdown {
    /// Best-fit score after placement, 0..=1.
    pub bin_pack: f64,
    /// Matched affinity weight over total weight, -1..=1.
    pub affinity: f64,
    /// Spread boost or penalty, -1..=1.
    pub spread: f64,
    /// Co-location penalty, <= 0.
    pub anti_affinity: f64,
    /// -1 on a penalized node.
    pub reschedule: f64,
}

/// Scored placement result for a single node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeScore {
    pub node_id: String,
    /// Weighted sum of the breakdown (higher = better).
    pub score: f64,
    pub breakdown: ScoreBreakdown,
}

/// Attribute value → allocations of the group already using it, per spread.
pub type SpreadCounts = Vec<BTreeMap<String, u32>>;

/// Everything about the placement that is not the node itself.
pub struct ScoreRequest<'a> {
    pub job: &'a Job,
    pub group: &'a TaskGroup,
    /// Allocations of the same group already on (or planned for) the node.
    pub collisions: u32,
    /// One map per entry of [`ScoreRequest::spreads`].
    pub spread_counts: &'a SpreadCounts,
    /// Nodes a rescheduled allocation should avoid.
    pub penalty_nodes: &'a BTreeSet<String>,
}

impl ScoreRequest<'_> {
    /// Job-level then group-level spreads, in the order `spread_counts` uses.
    pub fn spreads(&self) -> impl Iterator<Item = &Spread> {
        self.job.spreads.iter().chain(&self.group.spreads)
    }

    fn affinities(&self) -> impl Iterator<Item = &Affinity> {
        self.job
            .affinities
            .iter()
            .chain(&self.group.affinities)
            .chain(self.group.tasks.iter().flat_map(|t| &t.affinities))
    }
}

/// Score a single node given its projected usage with the placement applied.
pub fn score_node(
    node: &Node,
    proposed_usage: &Resources,
    request: &ScoreRequest<'_>,
    weights: &ScoringWeights,
    checker: &mut ConstraintChecker,
) -> NodeScore {
    let bin_pack = score_fit(node, proposed_usage);
    let affinity = affinity_score(node, request, checker);
    let spread = spread_score(node, request);

    let anti_affinity = if request.collisions > 0 && request.group.count > 0 {
        -f64::from(request.collisions + 1) / f64::from(request.group.count)
    } else {
        0.0
    };

    let reschedule = if request.penalty_nodes.contains(&node.id) {
        -1.0
    } else {
        0.0
    };

    let score = weights.bin_pack * bin_pack
        + weights.affinity * affinity
        + weights.spread * spread
        + weights.anti_affinity * anti_affinity
        + weights.reschedule_penalty * reschedule;

    NodeScore {
        node_id: node.id.clone(),
        score,
        breakdown: ScoreBreakdown {
            bin_pack,
            affinity,
            spread,
            anti_affinity,
            reschedule,
        },
    }
}

fn affinity_score(node: &Node, request: &ScoreRequest<'_>, checker: &mut ConstraintChecker) -> f64 {
    let mut total = 0.0;
    let mut matched = 0.0;
    for affinity in request.affinities() {
        let weight = f64::from(affinity.weight);
        total += weight.abs();
        if checker.check(node, &affinity.as_constraint()) {
            matched += weight;
        }
    }
    if total == 0.0 { 0.0 } else { matched / total }
}

fn spread_score(node: &Node, request: &ScoreRequest<'_>) -> f64 {
    let mut total_weight = 0.0;
    let mut sum = 0.0;
    for (i, spread) in request.spreads().enumerate() {
        let weight = f64::from(spread.weight);
        if weight == 0.0 {
            continue;
        }
        total_weight += weight;
        let empty = BTreeMap::new();
        let counts = request.spread_counts.get(i).unwrap_or(&empty);
        let boost = match spread.attribute.resolve(node) {
            None => -1.0,
            Some(value) if spread.targets.is_empty() => even_spread_boost(value, counts),
            Some(value) => target_spread_boost(value, spread, counts, request.group.count),
        };
        sum += weight * boost;
    }
    if total_weight == 0.0 {
        0.0
    } else {
        sum / total_weight
    }
}

/// Favour values that are behind the busiest value; penalize the busiest.
fn even_spread_boost(value: &str, counts: &BTreeMap<String, u32>) -> f64 {
    let current = counts.get(value).copied().unwrap_or(0);
    let max = counts.values().copied().max().unwrap_or(0).max(current);
    if max == 0 {
        return 0.0;
    }
    let min = counts.values().copied().min().unwrap_or(0).min(current);
    let min = if counts.contains_key(value) { min } else { 0 };
    let raw = (f64::from(max) - f64::from(current)) - (f64::from(current) - f64::from(min));
    (raw / f64::from(max)).clamp(-1.0, 1.0)
}

/// Compare the value's share with its explicit target percentage. Values
/// without a target share the remainder.
fn target_spread_boost(
    value: &str,
    spread: &Spread,
    counts: &BTreeMap<String, u32>,
    count: u32,
) -> f64 {
    let explicit: u32 = spread.targets.iter().map(|t| u32::from(t.percent)).sum();
    let percent = match spread.targets.iter().find(|t| t.value == value) {
        Some(target) => u32::from(target.percent),
        None => 100u32.saturating_sub(explicit),
    };
    let desired = f64::from(percent) / 100.0 * f64::from(count);
    if desired <= 0.0 {
        return -1.0;
    }
    let used = f64::from(counts.get(value).copied().unwrap_or(0));
    ((desired - used) / desired).clamp(-1.0, 1.0)
}

/// Order scores best first; equal scores fall back to ascending node ID.
pub fn rank_nodes(scores: &mut [NodeScore]) {
    scores.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.node_id.cmp(&b.node_id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetgrid_state::{Operand, SpreadTarget, Target, mock};

    fn request<'a>(
        job: &'a Job,
        counts: &'a SpreadCounts,
        penalty: &'a BTreeSet<String>,
        collisions: u32,
    ) -> ScoreRequest<'a> {
        ScoreRequest {
            job,
            group: &job.task_groups[0],
            collisions,
            spread_counts: counts,
            penalty_nodes: penalty,
        }
    }

    fn only(component: &str) -> ScoringWeights {
        let mut w = ScoringWeights {
            bin_pack: 0.0,
            affinity: 0.0,
            spread: 0.0,
            anti_affinity: 0.0,
            reschedule_penalty: 0.0,
        };
        match component {
            "bin_pack" => w.bin_pack = 1.0,
            "affinity" => w.affinity = 1.0,
            "spread" => w.spread = 1.0,
            "anti_affinity" => w.anti_affinity = 1.0,
            _ => w.reschedule_penalty = 1.0,
        }
        w
    }

    #[test]
    fn bin_packing_prefers_fuller_node() {
        let job = mock::job("api");
        let counts = SpreadCounts::new();
        let penalty = BTreeSet::new();
        let req = request(&job, &counts, &penalty, 0);
        let node = mock::node("n1");
        let mut checker = ConstraintChecker::new();

        let weights = only("bin_pack");
        let busy = Resources::new(3000, 6000, 0, 0);
        let idle = Resources::new(500, 256, 0, 0);
        let full = score_node(&node, &busy, &req, &weights, &mut checker);
        let empty = score_node(&node, &idle, &req, &weights, &mut checker);
        assert!(full.score > empty.score, "{} <= {}", full.score, empty.score);
    }

    #[test]
    fn affinity_is_signed_and_normalized() {
        let mut job = mock::job("api");
        job.affinities.push(Affinity::new(
            Target::meta("rack"),
            Operand::Equal,
            Target::literal("r1"),
            50,
        ));
        job.affinities.push(Affinity::new(
            Target::attr("cpu.arch"),
            Operand::Equal,
            Target::literal("arm64"),
            -50,
        ));
        let counts = SpreadCounts::new();
        let penalty = BTreeSet::new();
        let req = request(&job, &counts, &penalty, 0);
        let mut checker = ConstraintChecker::new();

        let r1 = mock::node("n1");
        let mut arm_r2 = mock::node("n2");
        arm_r2.meta.insert("rack".into(), "r2".into());
        arm_r2.attributes.insert("cpu.arch".into(), "arm64".into());

        let usage = Resources::default();
        let good = score_node(&r1, &usage, &req, &only("affinity"), &mut checker);
        let bad = score_node(&arm_r2, &usage, &req, &only("affinity"), &mut checker);
        assert!((good.breakdown.affinity - 0.5).abs() < 1e-9);
        assert!((bad.breakdown.affinity + 0.5).abs() < 1e-9);
    }

    #[test]
    fn even_spread_favours_empty_values() {
        let mut job = mock::job("api");
        job.spreads.push(Spread {
            attribute: Target::meta("rack"),
            weight: 100,
            targets: vec![],
        });
        let counts: SpreadCounts = vec![BTreeMap::from([("r1".to_string(), 3)])];
        let penalty = BTreeSet::new();
        let req = request(&job, &counts, &penalty, 0);
        let mut checker = ConstraintChecker::new();

        let busy = mock::node("n1");
        let mut fresh = mock::node("n2");
        fresh.meta.insert("rack".into(), "r2".into());

        let usage = Resources::default();
        let busy_score = score_node(&busy, &usage, &req, &only("spread"), &mut checker);
        let fresh_score = score_node(&fresh, &usage, &req, &only("spread"), &mut checker);
        assert!(fresh_score.score > 0.0);
        assert!(busy_score.score <= 0.0);
    }

    #[test]
    fn targeted_spread_tracks_percentages() {
        let mut job = mock::job("api");
        job.spreads.push(Spread {
            attribute: Target::meta("rack"),
            weight: 100,
            targets: vec![
                SpreadTarget { value: "r1".into(), percent: 70 },
                SpreadTarget { value: "r2".into(), percent: 30 },
            ],
        });
        // 10 desired: r1 wants 7 and has 7, r2 wants 3 and has 0.
        let counts: SpreadCounts = vec![BTreeMap::from([("r1".to_string(), 7)])];
        let penalty = BTreeSet::new();
        let req = request(&job, &counts, &penalty, 0);
        let mut checker = ConstraintChecker::new();

        let r1 = mock::node("n1");
        let mut r2 = mock::node("n2");
        r2.meta.insert("rack".into(), "r2".into());
        let mut r3 = mock::node("n3");
        r3.meta.insert("rack".into(), "r3".into());

        let usage = Resources::default();
        assert_eq!(score_node(&r1, &usage, &req, &only("spread"), &mut checker).score, 0.0);
        assert_eq!(score_node(&r2, &usage, &req, &only("spread"), &mut checker).score, 1.0);
        assert_eq!(score_node(&r3, &usage, &req, &only("spread"), &mut checker).score, -1.0);
    }

    #[test]
    fn anti_affinity_and_reschedule_penalty() {
        let job = mock::job("api");
        let counts = SpreadCounts::new();
        let penalty = BTreeSet::from(["n1".to_string()]);
        let node = mock::node("n1");
        let mut checker = ConstraintChecker::new();
        let usage = Resources::default();

        let stacked = request(&job, &counts, &penalty, 1);
        let s = score_node(&node, &usage, &stacked, &ScoringWeights::default(), &mut checker);
        // count is 10: -(1 + 1) / 10.
        assert!((s.breakdown.anti_affinity + 0.2).abs() < 1e-9);
        assert_eq!(s.breakdown.reschedule, -1.0);
    }

    #[test]
    fn rank_breaks_ties_by_node_id() {
        let mk = |id: &str, score: f64| NodeScore {
            node_id: id.to_string(),
            score,
            breakdown: ScoreBreakdown::default(),
        };
        let mut scores = vec![mk("n3", 0.5), mk("n1", 0.5), mk("n2", 0.9)];
        rank_nodes(&mut scores);
        let ids: Vec<_> = scores.iter().map(|s| s.node_id.as_str()).collect();
        assert_eq!(ids, vec!["n2", "n1", "n3"]);
    }
}
