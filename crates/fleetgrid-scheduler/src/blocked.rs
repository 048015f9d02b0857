//! Blocked evaluation tracker.
//!
//! Holds at most one blocked evaluation per job and releases it when a
//! node of a class it could use gains capacity. Evaluations that escaped
//! class reasoning are released by any capacity change.

use std::collections::BTreeMap;

use fleetgrid_state::Evaluation;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;

/// Result of handing an evaluation to the tracker.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockOutcome {
    /// Tracked; an older blocked evaluation of the job may have been dropped.
    Tracked { superseded: Option<Evaluation> },
    /// Capacity already changed after the evaluation's snapshot: run it
    /// again instead of waiting.
    Release(Evaluation),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BlockedStats {
    pub total: usize,
    pub escaped: usize,
}

#[derive(Default)]
struct BlockedState {
    /// job key → blocked evaluation.
    by_job: BTreeMap<String, Evaluation>,
    /// computed class → highest store index at which it gained capacity.
    unblock_indexes: BTreeMap<String, u64>,
}

fn may_use(eval: &Evaluation, class: &str) -> bool {
    eval.escaped_computed_class || eval.class_eligibility.get(class) != Some(&false)
}

#[derive(Default)]
pub struct BlockedEvals {
    state: Mutex<BlockedState>,
}

impl BlockedEvals {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn block(&self, eval: Evaluation) -> BlockOutcome {
        let mut state = self.state.lock().await;
        let missed = state
            .unblock_indexes
            .iter()
            .any(|(class, index)| *index > eval.snapshot_index && may_use(&eval, class));
        if missed {
            debug!(
                eval = %eval.id,
                snapshot = eval.snapshot_index,
                "capacity changed since snapshot, releasing"
            );
            return BlockOutcome::Release(eval);
        }

        debug!(
            eval = %eval.id,
            job = %eval.job_id,
            escaped = eval.escaped_computed_class,
            "evaluation blocked"
        );
        let superseded = state.by_job.insert(eval.job_key(), eval);
        BlockOutcome::Tracked { superseded }
    }

    /// Capacity changed on a node of `class` at store `index`. Returns the
    /// evaluations to re-enqueue.
    pub async fn unblock(&self, class: &str, index: u64) -> Vec<Evaluation> {
        let mut state = self.state.lock().await;
        let entry = state.unblock_indexes.entry(class.to_string()).or_insert(0);
        *entry = (*entry).max(index);

        let released: Vec<String> = state
            .by_job
            .iter()
            .filter(|(_, eval)| may_use(eval, class))
            .map(|(key, _)| key.clone())
            .collect();
        let evals: Vec<Evaluation> = released
            .iter()
            .filter_map(|key| state.by_job.remove(key))
            .collect();
        if !evals.is_empty() {
            debug!(class, index, released = evals.len(), "blocked evaluations released");
        }
        evals
    }

    /// Stop tracking the job's blocked evaluation, e.g. because the job
    /// changed and a fresh evaluation was created.
    pub async fn untrack(&self, job_key: &str) -> Option<Evaluation> {
        self.state.lock().await.by_job.remove(job_key)
    }

    pub async fn stats(&self) -> BlockedStats {
        let state = self.state.lock().await;
        BlockedStats {
            total: state.by_job.len(),
            escaped: state
                .by_job
                .values()
                .filter(|e| e.escaped_computed_class)
                .count(),
        }
    }
}
