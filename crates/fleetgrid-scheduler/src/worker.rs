//! Scheduler worker: dequeues evaluations and runs them to completion.

use std::sync::Arc;

use fleetgrid_state::EvalStatus;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::broker::{Delivery, NackOutcome};
use crate::scheduler::GenericScheduler;
use crate::service::{DESC_SUPERSEDED, Shared};

pub struct Worker {
    id: usize,
    shared: Arc<Shared>,
}

impl Worker {
    pub(crate) fn new(id: usize, shared: Arc<Shared>) -> Self {
        Self { id, shared }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(worker = self.id, "scheduler worker started");
        while let Some(delivery) = self.shared.broker.dequeue(&mut shutdown).await {
            self.handle(delivery).await;
            self.shared.eval_updates.notify_waiters();
        }
        info!(worker = self.id, "scheduler worker stopped");
    }

    async fn handle(&self, delivery: Delivery) {
        let Delivery { mut eval, cancel } = delivery;
        let shared = self.shared.as_ref();
        let scheduler =
            GenericScheduler::new(&shared.store, shared, &shared.config, shared.policy.as_ref());

        let err = match scheduler.process(&mut eval, &cancel).await {
            Ok(outcome) => {
                debug!(worker = self.id, eval = %eval.id, ?outcome, "evaluation processed");
                if let Err(e) = shared.broker.ack(&eval.id).await {
                    warn!(worker = self.id, eval = %eval.id, error = %e, "ack failed");
                }
                return;
            }
            Err(e) => e,
        };

        error!(worker = self.id, eval = %eval.id, error = %err, "evaluation processing failed");
        let outcome = match shared.broker.nack(&eval.id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(worker = self.id, eval = %eval.id, error = %e, "nack failed");
                return;
            }
        };
        let settled = match outcome {
            NackOutcome::Requeued => Ok(()),
            NackOutcome::Superseded(old) => {
                shared.settle(old, EvalStatus::Canceled, DESC_SUPERSEDED)
            }
            NackOutcome::Failed(failed) => {
                let description = format!("evaluation reached delivery limit: {err}");
                shared.settle(failed, EvalStatus::Failed, &description)
            }
        };
        if let Err(e) = settled {
            error!(
                worker = self.id,
                eval = %eval.id,
                error = %e,
                "failed to persist evaluation status"
            );
        }
    }
}
