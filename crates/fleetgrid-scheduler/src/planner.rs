//! The scheduler's write interface.
//!
//! A scheduler never writes state itself: plans go to the plan gate and
//! evaluation changes go through a [`Planner`]. The service implements it
//! over the plan queue, broker, and blocked tracker; tests implement it
//! directly over a store.

use std::future::Future;

use fleetgrid_state::{Evaluation, Plan, PlanResult};

use crate::error::SchedulerResult;

pub trait Planner: Send + Sync {
    /// Submit a plan and wait for the committed subset.
    fn submit_plan(&self, plan: Plan) -> impl Future<Output = SchedulerResult<PlanResult>> + Send;

    /// Persist a status change of the evaluation being processed.
    fn update_eval(&self, eval: &Evaluation) -> impl Future<Output = SchedulerResult<()>> + Send;

    /// Persist and enqueue a follow-up evaluation.
    fn create_eval(&self, eval: &Evaluation) -> impl Future<Output = SchedulerResult<()>> + Send;

    /// Persist a blocked evaluation and hand it to the blocked tracker.
    fn reblock_eval(&self, eval: &Evaluation) -> impl Future<Output = SchedulerResult<()>> + Send;
}
