//! Scheduler service: the broker, blocked tracker, plan applier, and worker
//! pool wired around one state store, plus the operator entry points that
//! create evaluations.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use fleetgrid_reconcile::{UpdatePolicy, deployment, policy_by_name};
use fleetgrid_state::{
    AllocClientStatus, AllocMetric, Allocation, Deployment, DeploymentStatus, EvalId, EvalStatus,
    EvalTrigger, Evaluation, Job, Node, NodeStatus, Plan, PlanResult, SchedulingEligibility,
    StateStore, job_key,
};
use serde::Serialize;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::blocked::{BlockOutcome, BlockedEvals, BlockedStats};
use crate::broker::{BrokerStats, EvalBroker};
use crate::config::FleetConfig;
use crate::error::{SchedulerError, SchedulerResult};
use crate::ids::{new_eval_id, now_secs};
use crate::plan_apply::{CapacityListener, PlanApplier, PlanQueue};
use crate::planner::Planner;
use crate::worker::Worker;

pub const DESC_SUPERSEDED: &str = "superseded by a newer evaluation of the job";
pub const DESC_JOB_CHANGED: &str = "job changed while evaluation was blocked";
pub const DESC_UNBLOCKED: &str = "capacity became available";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ServiceStats {
    pub broker: BrokerStats,
    pub blocked: BlockedStats,
}

/// State shared by the workers, the applier, and the service handle.
pub(crate) struct Shared {
    pub store: StateStore,
    pub config: FleetConfig,
    pub policy: Box<dyn UpdatePolicy>,
    pub broker: EvalBroker,
    pub blocked: BlockedEvals,
    pub plans: PlanQueue,
    /// Fires whenever an evaluation is persisted or acknowledged.
    pub eval_updates: Notify,
}

impl Shared {
    fn save_eval(&self, eval: &Evaluation) -> SchedulerResult<Evaluation> {
        let stored = self.store.upsert_eval(eval)?;
        self.eval_updates.notify_waiters();
        Ok(stored)
    }

    /// Move an evaluation to a final status outside a scheduler pass.
    pub fn settle(
        &self,
        mut eval: Evaluation,
        status: EvalStatus,
        description: &str,
    ) -> SchedulerResult<()> {
        if !eval.status.can_transition_to(status) {
            return Err(SchedulerError::InvalidTransition {
                eval: eval.id.clone(),
                from: eval.status,
                to: status,
            });
        }
        debug!(eval = %eval.id, ?status, reason = description, "evaluation settled");
        eval.status = status;
        eval.status_description = description.to_string();
        self.save_eval(&eval)?;
        Ok(())
    }

    /// Persist a pending evaluation and hand it to the broker.
    async fn enqueue(&self, eval: Evaluation) -> SchedulerResult<()> {
        let eval = self.save_eval(&eval)?;
        for old in self.broker.enqueue(eval).await {
            self.settle(old, EvalStatus::Canceled, DESC_SUPERSEDED)?;
        }
        Ok(())
    }

    async fn block(&self, eval: Evaluation) -> SchedulerResult<()> {
        match self.blocked.block(eval).await {
            BlockOutcome::Tracked { superseded: Some(old) } => {
                self.settle(old, EvalStatus::Canceled, DESC_SUPERSEDED)
            }
            BlockOutcome::Tracked { superseded: None } => Ok(()),
            BlockOutcome::Release(eval) => self.requeue(eval).await,
        }
    }

    async fn requeue(&self, mut eval: Evaluation) -> SchedulerResult<()> {
        eval.status = EvalStatus::Pending;
        eval.status_description = DESC_UNBLOCKED.to_string();
        self.enqueue(eval).await
    }

    /// Capacity appeared on a node of `class` at store `index`.
    async fn unblock(&self, class: &str, index: u64) -> SchedulerResult<()> {
        for eval in self.blocked.unblock(class, index).await {
            info!(eval = %eval.id, job = %eval.job_id, class, "evaluation unblocked");
            self.requeue(eval).await?;
        }
        Ok(())
    }

    async fn create_job_eval(&self, job: &Job, trigger: EvalTrigger) -> SchedulerResult<EvalId> {
        let eval = Evaluation::new(&new_eval_id(), job, trigger);
        let id = eval.id.clone();
        self.enqueue(eval).await?;
        Ok(id)
    }

    /// Resume evaluations left pending or blocked by a previous run.
    async fn restore(&self) -> SchedulerResult<()> {
        let (mut pending, mut blocked) = (0, 0);
        for eval in self.store.list_evals()? {
            match eval.status {
                EvalStatus::Pending => {
                    pending += 1;
                    self.enqueue(eval).await?;
                }
                EvalStatus::Blocked => {
                    blocked += 1;
                    self.block(eval).await?;
                }
                _ => {}
            }
        }
        if pending + blocked > 0 {
            info!(pending, blocked, "restored evaluations");
        }
        Ok(())
    }
}

impl Planner for Shared {
    async fn submit_plan(&self, plan: Plan) -> SchedulerResult<PlanResult> {
        self.plans.submit(plan).await
    }

    async fn update_eval(&self, eval: &Evaluation) -> SchedulerResult<()> {
        self.save_eval(eval)?;
        Ok(())
    }

    async fn create_eval(&self, eval: &Evaluation) -> SchedulerResult<()> {
        self.enqueue(eval.clone()).await
    }

    async fn reblock_eval(&self, eval: &Evaluation) -> SchedulerResult<()> {
        let stored = self.save_eval(eval)?;
        self.block(stored).await
    }
}

impl CapacityListener for Shared {
    async fn capacity_freed(&self, node_ids: Vec<String>, index: u64) {
        let mut classes = BTreeSet::new();
        for id in &node_ids {
            match self.store.node(id) {
                Ok(Some(node)) => {
                    classes.insert(node.computed_class);
                }
                Ok(None) => {}
                Err(e) => warn!(node = %id, error = %e, "failed to look up node"),
            }
        }
        for class in classes {
            if let Err(e) = self.unblock(&class, index).await {
                warn!(%class, error = %e, "failed to unblock evaluations");
            }
        }
    }
}

/// Handle to a running scheduler service.
pub struct Service {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Service {
    /// Spawn the plan applier and the worker pool, then resume evaluations
    /// persisted in `store`.
    pub async fn start(store: StateStore, config: FleetConfig) -> SchedulerResult<Self> {
        let policy = policy_by_name(&config.scheduler.update_policy)?;
        let (plans, plan_rx) = PlanQueue::new(config.scheduler.plan_queue_depth);
        let workers = config.scheduler.num_workers.max(1);
        let shared = Arc::new(Shared {
            store: store.clone(),
            broker: EvalBroker::new(config.scheduler.eval_delivery_limit),
            blocked: BlockedEvals::new(),
            plans,
            policy,
            config,
            eval_updates: Notify::new(),
        });

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::with_capacity(workers + 1);
        let applier = PlanApplier::new(store, plan_rx);
        tasks.push(tokio::spawn(applier.run(shared.clone(), shutdown_rx.clone())));
        for id in 0..workers {
            let worker = Worker::new(id, shared.clone());
            tasks.push(tokio::spawn(worker.run(shutdown_rx.clone())));
        }

        shared.restore().await?;
        info!(workers, policy = shared.policy.name(), "scheduler service started");
        Ok(Self {
            shared,
            shutdown,
            tasks,
        })
    }

    pub fn store(&self) -> &StateStore {
        &self.shared.store
    }

    pub fn config(&self) -> &FleetConfig {
        &self.shared.config
    }

    // ── Jobs ───────────────────────────────────────────────────────

    /// Register a job version and evaluate it. A blocked evaluation of the
    /// previous version is dropped.
    pub async fn register_job(&self, job: &Job) -> SchedulerResult<(Job, EvalId)> {
        let job = self.shared.store.upsert_job(job)?;
        if let Some(old) = self.shared.blocked.untrack(&job.table_key()).await {
            self.shared.settle(old, EvalStatus::Canceled, DESC_JOB_CHANGED)?;
        }
        let eval_id = self.shared.create_job_eval(&job, EvalTrigger::JobRegister).await?;
        info!(job = %job.id, version = job.version, eval = %eval_id, "job submitted");
        Ok((job, eval_id))
    }

    /// Stop a job: every allocation is stopped and its deployment canceled.
    pub async fn deregister_job(&self, namespace: &str, job_id: &str) -> SchedulerResult<EvalId> {
        let mut job = self
            .shared
            .store
            .job(namespace, job_id)?
            .ok_or_else(|| SchedulerError::JobNotFound(job_key(namespace, job_id)))?;
        job.stop = true;
        let job = self.shared.store.upsert_job(&job)?;
        if let Some(old) = self.shared.blocked.untrack(&job.table_key()).await {
            self.shared.settle(old, EvalStatus::Canceled, DESC_JOB_CHANGED)?;
        }
        let eval_id = self.shared.create_job_eval(&job, EvalTrigger::JobDeregister).await?;
        info!(job = %job.id, eval = %eval_id, "job deregistered");
        Ok(eval_id)
    }

    // ── Nodes ──────────────────────────────────────────────────────

    /// Register or replace a node.
    pub async fn upsert_node(&self, node: &Node) -> SchedulerResult<(Node, Vec<EvalId>)> {
        let stored = self.shared.store.upsert_node(node)?;
        let evals = self.node_changed(&stored).await?;
        Ok((stored, evals))
    }

    pub async fn update_node_status(
        &self,
        node_id: &str,
        status: NodeStatus,
    ) -> SchedulerResult<(Node, Vec<EvalId>)> {
        let node = self.shared.store.update_node_status(node_id, status)?;
        info!(node = %node_id, ?status, "node status updated");
        let evals = self.node_changed(&node).await?;
        Ok((node, evals))
    }

    pub async fn update_node_eligibility(
        &self,
        node_id: &str,
        eligibility: SchedulingEligibility,
    ) -> SchedulerResult<(Node, Vec<EvalId>)> {
        let node = self.shared.store.update_node_eligibility(node_id, eligibility)?;
        info!(node = %node_id, ?eligibility, "node eligibility updated");
        let evals = self.node_changed(&node).await?;
        Ok((node, evals))
    }

    /// Mark a node draining; its allocations migrate elsewhere.
    pub async fn drain_node(&self, node_id: &str) -> SchedulerResult<Vec<EvalId>> {
        let (_, evals) = self
            .update_node_eligibility(node_id, SchedulingEligibility::Draining)
            .await?;
        Ok(evals)
    }

    /// Unblock evaluations a usable node may help, and evaluate every job
    /// with live allocations on a node that can no longer keep them.
    async fn node_changed(&self, node: &Node) -> SchedulerResult<Vec<EvalId>> {
        if !node.is_tainted() {
            self.shared.unblock(&node.computed_class, node.modify_index).await?;
            return Ok(Vec::new());
        }

        let trigger = if node.eligibility == SchedulingEligibility::Draining {
            EvalTrigger::NodeDrain
        } else {
            EvalTrigger::NodeUpdate
        };
        let jobs: BTreeSet<(String, String)> = self
            .shared
            .store
            .allocs_by_node(&node.id)?
            .into_iter()
            .filter(|a| !a.terminal_status())
            .map(|a| (a.namespace, a.job_id))
            .collect();

        let mut evals = Vec::with_capacity(jobs.len());
        for (namespace, job_id) in jobs {
            let Some(job) = self.shared.store.job(&namespace, &job_id)? else {
                continue;
            };
            let mut eval = Evaluation::new(&new_eval_id(), &job, trigger);
            eval.node_id = Some(node.id.clone());
            evals.push(eval.id.clone());
            self.shared.enqueue(eval).await?;
        }
        debug!(node = %node.id, ?trigger, evals = evals.len(), "node evaluations created");
        Ok(evals)
    }

    // ── Allocations ────────────────────────────────────────────────

    /// Record a status reported by the client running the allocation.
    pub async fn update_alloc_client_status(
        &self,
        alloc_id: &str,
        status: AllocClientStatus,
        description: &str,
    ) -> SchedulerResult<Allocation> {
        let store = &self.shared.store;
        let alloc = store.update_alloc_client_status(alloc_id, status, description, now_secs())?;
        debug!(alloc = %alloc_id, ?status, "allocation client status updated");

        if status.is_terminal() {
            if let Some(node) = store.node(&alloc.node_id)? {
                self.shared.unblock(&node.computed_class, alloc.modify_index).await?;
            }
        }
        let failed = matches!(status, AllocClientStatus::Failed | AllocClientStatus::Lost);
        if failed && !alloc.server_terminal() {
            if let Some(job) = store.job(&alloc.namespace, &alloc.job_id)? {
                self.shared.create_job_eval(&job, EvalTrigger::AllocFailure).await?;
            }
        }
        if let Some(id) = &alloc.deployment_id {
            self.assess_deployment(id).await?;
        }
        Ok(alloc)
    }

    /// Record the deployment health of an allocation.
    pub async fn set_alloc_health(
        &self,
        alloc_id: &str,
        healthy: bool,
    ) -> SchedulerResult<Allocation> {
        let alloc = self.shared.store.set_alloc_health(alloc_id, healthy)?;
        debug!(alloc = %alloc_id, healthy, "allocation health updated");
        if let Some(id) = &alloc.deployment_id {
            self.assess_deployment(id).await?;
        }
        Ok(alloc)
    }

    // ── Deployments ────────────────────────────────────────────────

    /// Promote canaries of `groups`, or of every group awaiting promotion.
    pub async fn promote_deployment(
        &self,
        deployment_id: &str,
        groups: &[String],
    ) -> SchedulerResult<Deployment> {
        let store = &self.shared.store;
        let current = store
            .deployment(deployment_id)?
            .ok_or_else(|| SchedulerError::DeploymentNotFound(deployment_id.to_string()))?;
        let allocs = store.allocs_by_job(&current.namespace, &current.job_id)?;
        let refs: Vec<&Allocation> = allocs.iter().collect();
        let promoted = store.upsert_deployment(&deployment::promote(&current, groups, &refs)?)?;
        info!(deployment = %deployment_id, "deployment promoted");
        self.deployment_eval(&promoted).await?;
        Ok(promoted)
    }

    /// Recount a deployment after an allocation changed and react to its
    /// new status.
    async fn assess_deployment(&self, deployment_id: &str) -> SchedulerResult<()> {
        let store = &self.shared.store;
        let Some(current) = store.deployment(deployment_id)? else {
            return Ok(());
        };
        let allocs = store.allocs_by_job(&current.namespace, &current.job_id)?;
        let refs: Vec<&Allocation> = allocs.iter().collect();
        let next = deployment::assess(&current, &refs);
        if next == current {
            return Ok(());
        }
        let next = store.upsert_deployment(&next)?;
        if next.status != current.status {
            info!(
                deployment = %next.id,
                job = %next.job_id,
                status = ?next.status,
                description = %next.status_description,
                "deployment status changed"
            );
        }

        let reverts = next.status == DeploymentStatus::Failed
            && next.task_groups.values().any(|s| s.auto_revert);
        if reverts {
            if let Some(stable) = self.stable_version(&next)? {
                info!(
                    job = %next.job_id,
                    version = stable.version,
                    "reverting to last stable job version"
                );
                self.register_job(&stable).await?;
                return Ok(());
            }
            warn!(job = %next.job_id, "no stable version to revert to");
        }
        self.deployment_eval(&next).await
    }

    async fn deployment_eval(&self, deployment: &Deployment) -> SchedulerResult<()> {
        let Some(job) = self.shared.store.job(&deployment.namespace, &deployment.job_id)? else {
            return Ok(());
        };
        let mut eval = Evaluation::new(&new_eval_id(), &job, EvalTrigger::DeploymentWatcher);
        eval.deployment_id = Some(deployment.id.clone());
        self.shared.enqueue(eval).await
    }

    /// Latest job version older than `deployment`'s whose own deployment
    /// succeeded.
    fn stable_version(&self, deployment: &Deployment) -> SchedulerResult<Option<Job>> {
        let store = &self.shared.store;
        let version = store
            .list_deployments()?
            .into_iter()
            .filter(|d| {
                d.namespace == deployment.namespace
                    && d.job_id == deployment.job_id
                    && d.status == DeploymentStatus::Successful
                    && d.job_version < deployment.job_version
            })
            .map(|d| d.job_version)
            .max();
        match version {
            Some(v) => Ok(store.job_version(&deployment.namespace, &deployment.job_id, v)?),
            None => Ok(None),
        }
    }

    // ── Queries ────────────────────────────────────────────────────

    pub fn eval(&self, eval_id: &str) -> SchedulerResult<Evaluation> {
        self.shared
            .store
            .eval(eval_id)?
            .ok_or_else(|| SchedulerError::EvalNotFound(eval_id.to_string()))
    }

    /// Per-group placement failures of an evaluation.
    pub fn diagnostics(&self, eval_id: &str) -> SchedulerResult<BTreeMap<String, AllocMetric>> {
        Ok(self.eval(eval_id)?.failed_tg_allocs)
    }

    pub async fn stats(&self) -> ServiceStats {
        ServiceStats {
            broker: self.shared.broker.stats().await,
            blocked: self.shared.blocked.stats().await,
        }
    }

    /// Wait until the evaluation is blocked or finished.
    pub async fn wait_for_eval(
        &self,
        eval_id: &str,
        timeout: Duration,
    ) -> SchedulerResult<Evaluation> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.shared.eval_updates.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let eval = self.eval(eval_id)?;
            if eval.terminal_status() || eval.status == EvalStatus::Blocked {
                return Ok(eval);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(SchedulerError::Timeout(format!("evaluation {eval_id}")));
            }
        }
    }

    /// Wait until no evaluation is queued or in flight. Blocked
    /// evaluations do not count.
    pub async fn wait_idle(&self, timeout: Duration) -> SchedulerResult<ServiceStats> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.shared.eval_updates.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let stats = self.stats().await;
            if stats.broker.is_idle() {
                return Ok(stats);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(SchedulerError::Timeout("scheduler to go idle".to_string()));
            }
        }
    }

    /// Stop the workers and the applier and wait for them to exit.
    pub async fn shutdown(self) {
        info!("scheduler service shutting down");
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "scheduler task ended abnormally");
            }
        }
        info!("scheduler service stopped");
    }
}
