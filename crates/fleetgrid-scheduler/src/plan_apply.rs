//! Plan queue and applier.
//!
//! Workers compute plans concurrently, but plans are committed one at a
//! time: the queue serializes submissions into a single applier task that
//! runs the store's plan gate and answers each submitter with the committed
//! subset.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use fleetgrid_state::{Plan, PlanResult, StateStore};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info};

use crate::error::{SchedulerError, SchedulerResult};

/// Notified after a commit that stopped or evicted allocations.
pub trait CapacityListener: Send + Sync {
    fn capacity_freed(&self, node_ids: Vec<String>, index: u64) -> impl Future<Output = ()> + Send;
}

pub struct PendingPlan {
    plan: Plan,
    reply: oneshot::Sender<SchedulerResult<PlanResult>>,
}

/// Submission side of the plan queue.
#[derive(Clone)]
pub struct PlanQueue {
    tx: mpsc::Sender<PendingPlan>,
}

impl PlanQueue {
    /// Create a queue holding up to `depth` plans ahead of the applier.
    pub fn new(depth: usize) -> (Self, mpsc::Receiver<PendingPlan>) {
        let (tx, rx) = mpsc::channel(depth.max(1));
        (Self { tx }, rx)
    }

    /// Submit a plan and wait until it is applied.
    pub async fn submit(&self, plan: Plan) -> SchedulerResult<PlanResult> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PendingPlan { plan, reply })
            .await
            .map_err(|_| SchedulerError::PlanQueueClosed)?;
        rx.await.map_err(|_| SchedulerError::PlanQueueClosed)?
    }
}

/// Single consumer of the plan queue.
pub struct PlanApplier {
    store: StateStore,
    rx: mpsc::Receiver<PendingPlan>,
}

impl PlanApplier {
    pub fn new(store: StateStore, rx: mpsc::Receiver<PendingPlan>) -> Self {
        Self { store, rx }
    }

    /// Apply plans until shutdown or until every queue handle is dropped.
    pub async fn run<L: CapacityListener>(
        mut self,
        listener: Arc<L>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("plan applier started");
        loop {
            tokio::select! {
                next = self.rx.recv() => {
                    let Some(pending) = next else { break };
                    self.apply(pending, listener.as_ref()).await;
                }
                _ = shutdown.changed() => {
                    debug!("plan applier shutting down");
                    break;
                }
            }
        }
        info!("plan applier stopped");
    }

    async fn apply<L: CapacityListener>(&self, pending: PendingPlan, listener: &L) {
        let PendingPlan { plan, reply } = pending;
        let result = self.store.apply_plan(&plan);
        let freed = match &result {
            Ok(committed) => {
                let nodes: BTreeSet<String> = committed
                    .node_update
                    .keys()
                    .chain(committed.node_preemptions.keys())
                    .cloned()
                    .collect();
                Some((nodes, committed.alloc_index))
            }
            Err(e) => {
                error!(eval = %plan.eval_id, error = %e, "failed to apply plan");
                None
            }
        };
        if let Some((nodes, index)) = freed.filter(|(nodes, _)| !nodes.is_empty()) {
            listener.capacity_freed(nodes.into_iter().collect(), index).await;
        }
        if reply.send(result.map_err(SchedulerError::from)).is_err() {
            debug!(eval = %plan.eval_id, "plan submitter went away");
        }
    }
}
