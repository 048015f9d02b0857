//! Evaluation broker.
//!
//! Ready evaluations are handed to workers highest priority first, FIFO
//! within a priority. At most one evaluation per job is ready or in flight:
//! a newer evaluation replaces a ready one outright, and waits behind an
//! in-flight one while that one is told to cancel.

use std::cmp::Reverse;
use std::collections::BTreeMap;

use fleetgrid_state::{EvalId, Evaluation};
use serde::Serialize;
use tokio::sync::{Mutex, Notify, watch};
use tracing::{debug, warn};

use crate::error::{SchedulerError, SchedulerResult};

/// An evaluation handed to a worker.
#[derive(Debug)]
pub struct Delivery {
    pub eval: Evaluation,
    /// Flips to `true` when a newer evaluation of the job arrives.
    pub cancel: watch::Receiver<bool>,
}

/// What a negative acknowledgement did with the evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum NackOutcome {
    /// Back in the ready queue.
    Requeued,
    /// A newer evaluation of the job took over.
    Superseded(Evaluation),
    /// Delivery limit reached.
    Failed(Evaluation),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BrokerStats {
    pub ready: usize,
    pub pending: usize,
    pub inflight: usize,
}

impl BrokerStats {
    pub fn is_idle(&self) -> bool {
        self.ready == 0 && self.pending == 0 && self.inflight == 0
    }
}

type ReadyKey = (Reverse<u8>, u64);

struct Inflight {
    eval: Evaluation,
    cancel: watch::Sender<bool>,
}

#[derive(Default)]
struct BrokerState {
    seq: u64,
    ready: BTreeMap<ReadyKey, Evaluation>,
    /// job key → position in `ready`.
    ready_jobs: BTreeMap<String, ReadyKey>,
    /// job key → newest evaluation waiting for the in-flight one.
    pending: BTreeMap<String, Evaluation>,
    inflight: BTreeMap<EvalId, Inflight>,
    /// job key → in-flight evaluation ID.
    inflight_jobs: BTreeMap<String, EvalId>,
    deliveries: BTreeMap<EvalId, u32>,
}

impl BrokerState {
    fn push_ready(&mut self, eval: Evaluation) {
        self.seq += 1;
        let key = (Reverse(eval.priority), self.seq);
        self.ready_jobs.insert(eval.job_key(), key);
        self.ready.insert(key, eval);
    }

    /// Move the job's waiting evaluation, if any, to the ready queue.
    fn promote_pending(&mut self, job_key: &str) -> bool {
        match self.pending.remove(job_key) {
            Some(eval) => {
                self.push_ready(eval);
                true
            }
            None => false,
        }
    }

    fn stats(&self) -> BrokerStats {
        BrokerStats {
            ready: self.ready.len(),
            pending: self.pending.len(),
            inflight: self.inflight.len(),
        }
    }
}

pub struct EvalBroker {
    state: Mutex<BrokerState>,
    ready_signal: Notify,
    delivery_limit: u32,
}

impl EvalBroker {
    pub fn new(delivery_limit: u32) -> Self {
        Self {
            state: Mutex::new(BrokerState::default()),
            ready_signal: Notify::new(),
            delivery_limit: delivery_limit.max(1),
        }
    }

    /// Queue an evaluation. Returns evaluations it superseded, which the
    /// caller should mark canceled.
    pub async fn enqueue(&self, eval: Evaluation) -> Vec<Evaluation> {
        let mut state = self.state.lock().await;
        let job_key = eval.job_key();
        let mut superseded = Vec::new();

        if let Some(key) = state.ready_jobs.remove(&job_key) {
            if let Some(old) = state.ready.remove(&key) {
                debug!(
                    old = %old.id,
                    new = %eval.id,
                    job = %job_key,
                    "ready evaluation superseded"
                );
                superseded.push(old);
            }
            state.push_ready(eval);
        } else if let Some(inflight_id) = state.inflight_jobs.get(&job_key).cloned() {
            if let Some(inflight) = state.inflight.get(&inflight_id) {
                inflight.cancel.send_replace(true);
            }
            debug!(
                inflight = %inflight_id,
                new = %eval.id,
                job = %job_key,
                "evaluation waiting on in-flight job"
            );
            if let Some(old) = state.pending.insert(job_key, eval) {
                superseded.push(old);
            }
            return superseded;
        } else {
            state.push_ready(eval);
        }

        drop(state);
        self.ready_signal.notify_one();
        superseded
    }

    /// Take the next ready evaluation without waiting.
    pub async fn try_dequeue(&self) -> Option<Delivery> {
        let mut state = self.state.lock().await;
        let (_, eval) = state.ready.pop_first()?;
        let job_key = eval.job_key();
        state.ready_jobs.remove(&job_key);

        let (cancel_tx, cancel_rx) = watch::channel(false);
        *state.deliveries.entry(eval.id.clone()).or_insert(0) += 1;
        state.inflight_jobs.insert(job_key, eval.id.clone());
        state.inflight.insert(
            eval.id.clone(),
            Inflight {
                eval: eval.clone(),
                cancel: cancel_tx,
            },
        );
        let more = !state.ready.is_empty();
        drop(state);

        // Another worker may be parked while work remains.
        if more {
            self.ready_signal.notify_one();
        }
        Some(Delivery {
            eval,
            cancel: cancel_rx,
        })
    }

    /// Wait for the next ready evaluation. Returns `None` on shutdown.
    pub async fn dequeue(&self, shutdown: &mut watch::Receiver<bool>) -> Option<Delivery> {
        loop {
            if *shutdown.borrow() {
                return None;
            }
            if let Some(delivery) = self.try_dequeue().await {
                return Some(delivery);
            }
            tokio::select! {
                _ = self.ready_signal.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    /// The worker finished the evaluation.
    pub async fn ack(&self, eval_id: &str) -> SchedulerResult<()> {
        let mut state = self.state.lock().await;
        let inflight = state
            .inflight
            .remove(eval_id)
            .ok_or_else(|| SchedulerError::NotInflight(eval_id.to_string()))?;
        state.deliveries.remove(eval_id);
        let job_key = inflight.eval.job_key();
        state.inflight_jobs.remove(&job_key);
        let promoted = state.promote_pending(&job_key);
        drop(state);

        if promoted {
            self.ready_signal.notify_one();
        }
        Ok(())
    }

    /// The worker could not finish the evaluation.
    pub async fn nack(&self, eval_id: &str) -> SchedulerResult<NackOutcome> {
        let mut state = self.state.lock().await;
        let inflight = state
            .inflight
            .remove(eval_id)
            .ok_or_else(|| SchedulerError::NotInflight(eval_id.to_string()))?;
        let eval = inflight.eval;
        let job_key = eval.job_key();
        state.inflight_jobs.remove(&job_key);

        let deliveries = state.deliveries.get(eval_id).copied().unwrap_or(0);
        let outcome = if deliveries >= self.delivery_limit {
            warn!(eval = %eval.id, deliveries, "evaluation reached delivery limit");
            state.deliveries.remove(eval_id);
            state.promote_pending(&job_key);
            NackOutcome::Failed(eval)
        } else if state.promote_pending(&job_key) {
            state.deliveries.remove(eval_id);
            NackOutcome::Superseded(eval)
        } else {
            debug!(eval = %eval.id, deliveries, "evaluation requeued");
            state.push_ready(eval);
            NackOutcome::Requeued
        };
        let ready = !state.ready.is_empty();
        drop(state);

        if ready {
            self.ready_signal.notify_one();
        }
        Ok(outcome)
    }

    pub async fn stats(&self) -> BrokerStats {
        self.state.lock().await.stats()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use fleetgrid_state::mock;

    use super::*;

    fn eval(job: &str, id: &str, priority: u8) -> Evaluation {
        let mut eval = mock::eval(&mock::job(job));
        eval.id = id.to_string();
        eval.priority = priority;
        eval
    }

    #[tokio::test]
    async fn dequeues_by_priority_then_arrival() {
        let broker = EvalBroker::new(3);
        broker.enqueue(eval("a", "e1", 50)).await;
        broker.enqueue(eval("b", "e2", 70)).await;
        broker.enqueue(eval("c", "e3", 50)).await;

        let order: Vec<String> = [
            broker.try_dequeue().await.unwrap().eval.id,
            broker.try_dequeue().await.unwrap().eval.id,
            broker.try_dequeue().await.unwrap().eval.id,
        ]
        .into();
        assert_eq!(order, ["e2", "e1", "e3"]);
        assert!(broker.try_dequeue().await.is_none());
    }

    #[tokio::test]
    async fn newer_evaluation_replaces_ready_one() {
        let broker = EvalBroker::new(3);
        assert!(broker.enqueue(eval("a", "old", 50)).await.is_empty());
        let superseded = broker.enqueue(eval("a", "new", 50)).await;
        assert_eq!(superseded.len(), 1);
        assert_eq!(superseded[0].id, "old");

        assert_eq!(broker.try_dequeue().await.unwrap().eval.id, "new");
        assert!(broker.try_dequeue().await.is_none());
    }

    #[tokio::test]
    async fn in_flight_job_is_canceled_and_follow_up_waits() {
        let broker = EvalBroker::new(3);
        broker.enqueue(eval("a", "first", 50)).await;
        let delivery = broker.try_dequeue().await.unwrap();
        assert!(!*delivery.cancel.borrow());

        broker.enqueue(eval("a", "second", 50)).await;
        assert!(*delivery.cancel.borrow());
        assert!(broker.try_dequeue().await.is_none());
        assert_eq!(
            broker.stats().await,
            BrokerStats {
                ready: 0,
                pending: 1,
                inflight: 1
            }
        );

        broker.ack("first").await.unwrap();
        assert_eq!(broker.try_dequeue().await.unwrap().eval.id, "second");
    }

    #[tokio::test]
    async fn nack_requeues_until_delivery_limit() {
        let broker = EvalBroker::new(2);
        broker.enqueue(eval("a", "e1", 50)).await;

        broker.try_dequeue().await.unwrap();
        assert_eq!(broker.nack("e1").await.unwrap(), NackOutcome::Requeued);

        broker.try_dequeue().await.unwrap();
        match broker.nack("e1").await.unwrap() {
            NackOutcome::Failed(eval) => assert_eq!(eval.id, "e1"),
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(broker.stats().await.is_idle());
    }

    #[tokio::test]
    async fn nack_yields_to_waiting_evaluation() {
        let broker = EvalBroker::new(3);
        broker.enqueue(eval("a", "e1", 50)).await;
        broker.try_dequeue().await.unwrap();
        broker.enqueue(eval("a", "e2", 50)).await;

        let outcome = broker.nack("e1").await.unwrap();
        assert!(matches!(outcome, NackOutcome::Superseded(e) if e.id == "e1"));
        assert_eq!(broker.try_dequeue().await.unwrap().eval.id, "e2");
    }

    #[tokio::test]
    async fn ack_of_unknown_evaluation_is_an_error() {
        let broker = EvalBroker::new(3);
        assert!(matches!(broker.ack("nope").await, Err(SchedulerError::NotInflight(_))));
    }

    #[tokio::test]
    async fn dequeue_waits_for_work() {
        let broker = Arc::new(EvalBroker::new(3));
        let (_tx, mut shutdown) = watch::channel(false);
        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.dequeue(&mut shutdown).await.map(|d| d.eval.id) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.enqueue(eval("a", "late", 50)).await;

        let got = tokio::time::timeout(Duration::from_secs(2), waiter).await.unwrap().unwrap();
        assert_eq!(got.as_deref(), Some("late"));
    }

    #[tokio::test]
    async fn dequeue_returns_none_on_shutdown() {
        let broker = EvalBroker::new(3);
        let (tx, mut shutdown) = watch::channel(false);
        tx.send(true).unwrap();
        assert!(broker.dequeue(&mut shutdown).await.is_none());
    }
}
