//! FleetGrid placement: feasibility, bin-packing, affinity, preemption.
//!
//! This crate decides where a single allocation should run. It does NOT
//! decide how many allocations a job needs (that's `fleetgrid-reconcile`)
//! or commit anything (that's the plan gate in `fleetgrid-state`).
//!
//! # Components
//!
//! - **`feasible`**: Hard constraints, operand evaluation, class caching
//! - **`scorer`**: Node scoring (bin-packing, affinity, spread, anti-affinity)
//! - **`placer`**: Node selection against a snapshot and an in-progress plan
//! - **`preempt`**: Victim selection among lower-priority allocations

pub mod feasible;
pub mod placer;
pub mod preempt;
pub mod scorer;

pub use feasible::{
    ConstraintChecker, FeasibilityChecker, FilterReason, check_constraints, check_distinct,
};
pub use placer::{Placer, Selection};
pub use preempt::{PREEMPTION_PRIORITY_DELTA, select_victims};
pub use scorer::{
    NodeScore, ScoreBreakdown, ScoreRequest, ScoringWeights, SpreadCounts, rank_nodes, score_node,
};
