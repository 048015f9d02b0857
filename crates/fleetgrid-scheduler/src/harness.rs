//! In-process [`Planner`] for scheduler tests: applies plans straight to a
//! store and records everything the scheduler asked for.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use fleetgrid_state::{Evaluation, Plan, PlanResult, StateStore};

use crate::config::FleetConfig;
use crate::error::SchedulerResult;
use crate::planner::Planner;

pub(crate) struct Harness {
    pub store: StateStore,
    pub config: FleetConfig,
    plans: Mutex<Vec<Plan>>,
    updated: Mutex<Vec<Evaluation>>,
    created: Mutex<Vec<Evaluation>>,
    reblocked: Mutex<Vec<Evaluation>>,
    /// Submissions still to be refused outright.
    reject: AtomicUsize,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            store: StateStore::open_in_memory().unwrap(),
            config: FleetConfig::default(),
            plans: Mutex::new(Vec::new()),
            updated: Mutex::new(Vec::new()),
            created: Mutex::new(Vec::new()),
            reblocked: Mutex::new(Vec::new()),
            reject: AtomicUsize::new(0),
        }
    }

    pub fn reject_next(&self, n: usize) {
        self.reject.store(n, Ordering::SeqCst);
    }

    pub fn plans(&self) -> Vec<Plan> {
        self.plans.lock().unwrap().clone()
    }

    pub fn updated(&self) -> Vec<Evaluation> {
        self.updated.lock().unwrap().clone()
    }

    pub fn created(&self) -> Vec<Evaluation> {
        self.created.lock().unwrap().clone()
    }

    pub fn reblocked(&self) -> Vec<Evaluation> {
        self.reblocked.lock().unwrap().clone()
    }
}

impl Planner for Harness {
    async fn submit_plan(&self, plan: Plan) -> SchedulerResult<PlanResult> {
        self.plans.lock().unwrap().push(plan.clone());
        let rejecting = self
            .reject
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejecting {
            let index = self.store.index()?;
            return Ok(PlanResult {
                rejected_nodes: plan
                    .node_ids()
                    .into_iter()
                    .map(|id| (id.to_string(), "rejected by harness".to_string()))
                    .collect(),
                refresh_index: index,
                ..Default::default()
            });
        }
        Ok(self.store.apply_plan(&plan)?)
    }

    async fn update_eval(&self, eval: &Evaluation) -> SchedulerResult<()> {
        self.store.upsert_eval(eval)?;
        self.updated.lock().unwrap().push(eval.clone());
        Ok(())
    }

    async fn create_eval(&self, eval: &Evaluation) -> SchedulerResult<()> {
        self.store.upsert_eval(eval)?;
        self.created.lock().unwrap().push(eval.clone());
        Ok(())
    }

    async fn reblock_eval(&self, eval: &Evaluation) -> SchedulerResult<()> {
        self.store.upsert_eval(eval)?;
        self.reblocked.lock().unwrap().push(eval.clone());
        Ok(())
    }
}
