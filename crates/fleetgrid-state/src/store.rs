//! StateStore: redb-backed fleet state for FleetGrid.
//!
//! Provides typed CRUD over jobs (every version), nodes, allocations,
//! evaluations, and deployments, point-in-time snapshots for schedulers,
//! and the transactional plan commit. All values are JSON-serialized into
//! redb's `&[u8]` value columns. Every write transaction bumps the store
//! index, which stamps `create_index`/`modify_index` on the records it
//! touches.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, Table, TableDefinition, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::error::{StateError, StateResult};
use crate::plan::{Plan, PlanResult, evaluate_node_plan};
use crate::snapshot::StateSnapshot;
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type RecordTable = TableDefinition<'static, &'static str, &'static [u8]>;

fn encode<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Serialize))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

fn get_record<T, R>(table: &R, key: &str) -> StateResult<Option<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => Ok(Some(decode(guard.value())?)),
        None => Ok(None),
    }
}

fn list_records<T, R>(table: &R) -> StateResult<Vec<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    let mut results = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (_, value) = entry.map_err(map_err!(Read))?;
        results.push(decode(value.value())?);
    }
    Ok(results)
}

fn put_record<T: Serialize>(
    table: &mut Table<'_, &'static str, &'static [u8]>,
    key: &str,
    value: &T,
) -> StateResult<()> {
    let bytes = encode(value)?;
    table
        .insert(key, bytes.as_slice())
        .map_err(map_err!(Write))?;
    Ok(())
}

/// Advance the store index inside `txn` and return the new value.
fn bump_index(txn: &WriteTransaction) -> StateResult<u64> {
    let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
    let current = meta
        .get(INDEX_KEY)
        .map_err(map_err!(Read))?
        .map(|guard| guard.value())
        .unwrap_or(0);
    let next = current + 1;
    meta.insert(INDEX_KEY, next).map_err(map_err!(Write))?;
    Ok(next)
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store.
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        for table in [JOBS, JOB_VERSIONS, NODES, ALLOCS, EVALS, DEPLOYMENTS] {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.open_table(META).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Current store index.
    pub fn index(&self) -> StateResult<u64> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let meta = txn.open_table(META).map_err(map_err!(Table))?;
        let index = meta
            .get(INDEX_KEY)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value())
            .unwrap_or(0);
        Ok(index)
    }

    fn get<T: DeserializeOwned>(&self, def: RecordTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        get_record(&table, key)
    }

    fn list<T: DeserializeOwned>(&self, def: RecordTable) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        list_records(&table)
    }

    /// Read-modify-write one record under a fresh index. The closure receives
    /// the current value and the index the write will carry.
    fn update<T, F>(&self, def: RecordTable, key: &str, f: F) -> StateResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(Option<T>, u64) -> StateResult<T>,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let index = bump_index(&txn)?;
        let updated = {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            let current: Option<T> = get_record(&table, key)?;
            let updated = f(current, index)?;
            put_record(&mut table, key, &updated)?;
            updated
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(updated)
    }

    // ── Jobs ───────────────────────────────────────────────────────

    /// Register a job, assigning its version.
    ///
    /// The version is bumped only when the spec differs from the stored
    /// latest version; an identical re-registration returns the stored job
    /// without writing. Every version stays readable through
    /// [`StateStore::job_version`].
    pub fn upsert_job(&self, job: &Job) -> StateResult<Job> {
        job.validate().map_err(|reason| StateError::Invalid {
            kind: "job",
            reason,
        })?;

        let key = job.table_key();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existing: Option<Job> = {
            let table = txn.open_table(JOBS).map_err(map_err!(Table))?;
            get_record(&table, &key)?
        };

        if let Some(current) = &existing {
            if current.spec_equal(job) {
                txn.abort().map_err(map_err!(Transaction))?;
                debug!(%key, version = current.version, "job unchanged");
                return Ok(current.clone());
            }
        }

        let index = bump_index(&txn)?;
        let mut stored = job.clone();
        match &existing {
            Some(current) => {
                stored.version = current.version + 1;
                stored.create_index = current.create_index;
            }
            None => {
                stored.version = 0;
                stored.create_index = index;
            }
        }
        stored.modify_index = index;

        {
            let mut jobs = txn.open_table(JOBS).map_err(map_err!(Table))?;
            put_record(&mut jobs, &key, &stored)?;
            let mut versions = txn.open_table(JOB_VERSIONS).map_err(map_err!(Table))?;
            put_record(&mut versions, &stored.version_key(), &stored)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        info!(job = %key, version = stored.version, index, "job registered");
        Ok(stored)
    }

    /// Latest version of a job.
    pub fn job(&self, namespace: &str, id: &str) -> StateResult<Option<Job>> {
        self.get(JOBS, &job_key(namespace, id))
    }

    /// A specific job version.
    pub fn job_version(&self, namespace: &str, id: &str, version: u64) -> StateResult<Option<Job>> {
        self.get(JOB_VERSIONS, &job_version_key(namespace, id, version))
    }

    /// Every stored version of a job, oldest first.
    pub fn job_versions(&self, namespace: &str, id: &str) -> StateResult<Vec<Job>> {
        let prefix = format!("{}@", job_key(namespace, id));
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(JOB_VERSIONS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.range(prefix.as_str()..).map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if !key.value().starts_with(&prefix) {
                break;
            }
            results.push(decode(value.value())?);
        }
        Ok(results)
    }

    pub fn list_jobs(&self) -> StateResult<Vec<Job>> {
        self.list(JOBS)
    }

    // ── Nodes ──────────────────────────────────────────────────────

    /// Insert or replace a node, recomputing its class.
    pub fn upsert_node(&self, node: &Node) -> StateResult<Node> {
        let mut node = node.clone();
        node.compute_class();
        let stored = self.update(NODES, &node.id.clone(), |current: Option<Node>, index| {
            node.create_index = current.map(|c| c.create_index).unwrap_or(index);
            node.modify_index = index;
            Ok(node)
        })?;
        debug!(node = %stored.id, class = %stored.computed_class, "node stored");
        Ok(stored)
    }

    pub fn node(&self, id: &str) -> StateResult<Option<Node>> {
        self.get(NODES, id)
    }

    pub fn list_nodes(&self) -> StateResult<Vec<Node>> {
        self.list(NODES)
    }

    pub fn update_node_status(&self, id: &str, status: NodeStatus) -> StateResult<Node> {
        self.update(NODES, id, |current: Option<Node>, index| {
            let mut node = current.ok_or_else(|| StateError::NotFound {
                kind: "node",
                id: id.to_string(),
            })?;
            node.status = status;
            node.modify_index = index;
            Ok(node)
        })
    }

    pub fn update_node_eligibility(
        &self,
        id: &str,
        eligibility: SchedulingEligibility,
    ) -> StateResult<Node> {
        self.update(NODES, id, |current: Option<Node>, index| {
            let mut node = current.ok_or_else(|| StateError::NotFound {
                kind: "node",
                id: id.to_string(),
            })?;
            node.eligibility = eligibility;
            node.modify_index = index;
            Ok(node)
        })
    }

    // ── Allocations ────────────────────────────────────────────────

    /// Insert or replace allocations directly, outside of a plan.
    pub fn upsert_allocs(&self, allocs: &[Allocation]) -> StateResult<u64> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let index = bump_index(&txn)?;
        {
            let mut table = txn.open_table(ALLOCS).map_err(map_err!(Table))?;
            for alloc in allocs {
                let existing: Option<Allocation> = get_record(&table, &alloc.id)?;
                let mut stored = alloc.clone();
                stored.create_index = existing.map(|e| e.create_index).unwrap_or(index);
                stored.modify_index = index;
                put_record(&mut table, &stored.id, &stored)?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(index)
    }

    pub fn alloc(&self, id: &str) -> StateResult<Option<Allocation>> {
        self.get(ALLOCS, id)
    }

    pub fn list_allocs(&self) -> StateResult<Vec<Allocation>> {
        self.list(ALLOCS)
    }

    pub fn allocs_by_job(&self, namespace: &str, job_id: &str) -> StateResult<Vec<Allocation>> {
        Ok(self
            .list_allocs()?
            .into_iter()
            .filter(|a: &Allocation| a.namespace == namespace && a.job_id == job_id)
            .collect())
    }

    pub fn allocs_by_node(&self, node_id: &str) -> StateResult<Vec<Allocation>> {
        Ok(self
            .list_allocs()?
            .into_iter()
            .filter(|a: &Allocation| a.node_id == node_id)
            .collect())
    }

    /// Record a client-reported status change.
    pub fn update_alloc_client_status(
        &self,
        id: &str,
        status: AllocClientStatus,
        description: &str,
        now: u64,
    ) -> StateResult<Allocation> {
        self.update(ALLOCS, id, |current: Option<Allocation>, index| {
            let mut alloc = current.ok_or_else(|| StateError::NotFound {
                kind: "allocation",
                id: id.to_string(),
            })?;
            alloc.client_status = status;
            alloc.client_description = description.to_string();
            alloc.modify_index = index;
            alloc.modify_time = now;
            Ok(alloc)
        })
    }

    /// Record the deployment health of an allocation.
    pub fn set_alloc_health(&self, id: &str, healthy: bool) -> StateResult<Allocation> {
        self.update(ALLOCS, id, |current: Option<Allocation>, index| {
            let mut alloc = current.ok_or_else(|| StateError::NotFound {
                kind: "allocation",
                id: id.to_string(),
            })?;
            let status = alloc.deployment_status.get_or_insert_with(Default::default);
            status.healthy = Some(healthy);
            alloc.modify_index = index;
            Ok(alloc)
        })
    }

    // ── Evaluations ────────────────────────────────────────────────

    /// Insert or update an evaluation, stamping its indexes.
    pub fn upsert_eval(&self, eval: &Evaluation) -> StateResult<Evaluation> {
        let mut eval = eval.clone();
        self.update(EVALS, &eval.id.clone(), |current: Option<Evaluation>, index| {
            eval.create_index = current.map(|c| c.create_index).unwrap_or(index);
            eval.modify_index = index;
            Ok(eval)
        })
    }

    pub fn eval(&self, id: &str) -> StateResult<Option<Evaluation>> {
        self.get(EVALS, id)
    }

    pub fn list_evals(&self) -> StateResult<Vec<Evaluation>> {
        self.list(EVALS)
    }

    pub fn evals_by_job(&self, namespace: &str, job_id: &str) -> StateResult<Vec<Evaluation>> {
        Ok(self
            .list_evals()?
            .into_iter()
            .filter(|e: &Evaluation| e.namespace == namespace && e.job_id == job_id)
            .collect())
    }

    // ── Deployments ────────────────────────────────────────────────

    pub fn upsert_deployment(&self, deployment: &Deployment) -> StateResult<Deployment> {
        let mut deployment = deployment.clone();
        self.update(
            DEPLOYMENTS,
            &deployment.id.clone(),
            |current: Option<Deployment>, index| {
                deployment.create_index = current.map(|c| c.create_index).unwrap_or(index);
                deployment.modify_index = index;
                Ok(deployment)
            },
        )
    }

    pub fn deployment(&self, id: &str) -> StateResult<Option<Deployment>> {
        self.get(DEPLOYMENTS, id)
    }

    pub fn list_deployments(&self) -> StateResult<Vec<Deployment>> {
        self.list(DEPLOYMENTS)
    }

    pub fn latest_deployment_by_job(
        &self,
        namespace: &str,
        job_id: &str,
    ) -> StateResult<Option<Deployment>> {
        Ok(self
            .list_deployments()?
            .into_iter()
            .filter(|d: &Deployment| d.namespace == namespace && d.job_id == job_id)
            .max_by_key(|d| d.create_index))
    }

    // ── Snapshots ──────────────────────────────────────────────────

    /// Materialize the whole fleet from a single read transaction.
    pub fn snapshot(&self) -> StateResult<StateSnapshot> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let meta = txn.open_table(META).map_err(map_err!(Table))?;
        let index = meta
            .get(INDEX_KEY)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value())
            .unwrap_or(0);

        let mut snap = StateSnapshot::new(index);
        let nodes = txn.open_table(NODES).map_err(map_err!(Table))?;
        for node in list_records::<Node, _>(&nodes)? {
            snap.upsert_node(node);
        }
        let versions = txn.open_table(JOB_VERSIONS).map_err(map_err!(Table))?;
        for job in list_records::<Job, _>(&versions)? {
            snap.upsert_job(job);
        }
        let allocs = txn.open_table(ALLOCS).map_err(map_err!(Table))?;
        for alloc in list_records::<Allocation, _>(&allocs)? {
            snap.upsert_alloc(alloc);
        }
        let deployments = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        for deployment in list_records::<Deployment, _>(&deployments)? {
            snap.upsert_deployment(deployment);
        }
        Ok(snap)
    }

    // ── Plans ──────────────────────────────────────────────────────

    /// Check and commit a plan in one write transaction.
    ///
    /// Each node's slice is accepted outright when neither the node nor any
    /// of its allocations changed after `plan.snapshot_index`; otherwise it is
    /// re-checked against current state with [`evaluate_node_plan`]. Rejected
    /// slices are dropped (all of them, for all-at-once plans) and
    /// `refresh_index` tells the caller which index to refresh to.
    pub fn apply_plan(&self, plan: &Plan) -> StateResult<PlanResult> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let index = bump_index(&txn)?;

        let mut result = PlanResult {
            alloc_index: index,
            ..Default::default()
        };

        let nodes_table = txn.open_table(NODES).map_err(map_err!(Table))?;
        let mut allocs_table = txn.open_table(ALLOCS).map_err(map_err!(Table))?;

        let mut live_by_node: BTreeMap<NodeId, Vec<Allocation>> = BTreeMap::new();
        let mut changed_nodes = BTreeSet::new();
        for alloc in list_records::<Allocation, _>(&allocs_table)? {
            if alloc.modify_index > plan.snapshot_index {
                changed_nodes.insert(alloc.node_id.clone());
            }
            if !alloc.terminal_status() {
                live_by_node.entry(alloc.node_id.clone()).or_default().push(alloc);
            }
        }

        let mut accepted = Vec::new();
        for node_id in plan.node_ids() {
            let node: Option<Node> = get_record(&nodes_table, node_id)?;
            let unchanged = node
                .as_ref()
                .is_some_and(|n| n.modify_index <= plan.snapshot_index)
                && !changed_nodes.contains(node_id);
            if unchanged {
                accepted.push(node_id);
                continue;
            }
            let existing = live_by_node.get(node_id).map(Vec::as_slice).unwrap_or(&[]);
            match evaluate_node_plan(plan, node_id, node.as_ref(), existing) {
                Ok(()) => accepted.push(node_id),
                Err(reason) => {
                    debug!(node = %node_id, %reason, eval = %plan.eval_id, "node plan rejected");
                    result.rejected_nodes.insert(node_id.to_string(), reason.to_string());
                }
            }
        }

        if plan.all_at_once && !result.rejected_nodes.is_empty() {
            for node_id in &accepted {
                result
                    .rejected_nodes
                    .entry(node_id.to_string())
                    .or_insert_with(|| "all-at-once plan rejected".to_string());
            }
            accepted.clear();
        }

        for node_id in accepted {
            if let Some(stops) = plan.node_update.get(node_id) {
                for stop in stops {
                    let Some(mut current): Option<Allocation> =
                        get_record(&allocs_table, &stop.id)?
                    else {
                        continue;
                    };
                    current.desired_status = stop.desired_status;
                    current.desired_description = stop.desired_description.clone();
                    if stop.client_status != current.client_status
                        && stop.client_status.is_terminal()
                    {
                        current.client_status = stop.client_status;
                    }
                    current.modify_index = index;
                    put_record(&mut allocs_table, &current.id, &current)?;
                }
                result.node_update.insert(node_id.to_string(), stops.clone());
            }
            if let Some(evicted) = plan.node_preemptions.get(node_id) {
                for evict in evicted {
                    let Some(mut current): Option<Allocation> =
                        get_record(&allocs_table, &evict.id)?
                    else {
                        continue;
                    };
                    current.desired_status = AllocDesiredStatus::Evict;
                    current.desired_description = evict.desired_description.clone();
                    current.modify_index = index;
                    put_record(&mut allocs_table, &current.id, &current)?;
                }
                result
                    .node_preemptions
                    .insert(node_id.to_string(), evicted.clone());
            }
            if let Some(placements) = plan.node_allocation.get(node_id) {
                let mut committed = Vec::with_capacity(placements.len());
                for placement in placements {
                    let existing: Option<Allocation> = get_record(&allocs_table, &placement.id)?;
                    let mut stored = placement.clone();
                    match existing {
                        Some(current) => {
                            stored.create_index = current.create_index;
                            stored.client_status = current.client_status;
                            stored.client_description = current.client_description;
                            stored.modify_time = current.modify_time;
                        }
                        None => stored.create_index = index,
                    }
                    stored.modify_index = index;
                    put_record(&mut allocs_table, &stored.id, &stored)?;
                    committed.push(stored);
                }
                result.node_allocation.insert(node_id.to_string(), committed);
            }
        }

        // Deployment changes ride along with whatever part of the plan landed.
        let landed = !result.node_allocation.is_empty()
            || !result.node_update.is_empty()
            || plan.placement_count() == 0;
        if landed {
            let mut deployments = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            if let Some(deployment) = &plan.deployment {
                let existing: Option<Deployment> = get_record(&deployments, &deployment.id)?;
                let mut stored = deployment.clone();
                stored.create_index = existing.map(|d| d.create_index).unwrap_or(index);
                stored.modify_index = index;
                put_record(&mut deployments, &stored.id, &stored)?;
                result.deployment = Some(stored);
            }
            for update in &plan.deployment_updates {
                let Some(mut current): Option<Deployment> =
                    get_record(&deployments, &update.deployment_id)?
                else {
                    warn!(
                        deployment = %update.deployment_id,
                        "status update for unknown deployment"
                    );
                    continue;
                };
                current.status = update.status;
                current.status_description = update.status_description.clone();
                current.modify_index = index;
                put_record(&mut deployments, &current.id, &current)?;
            }
            result.deployment_updates = plan.deployment_updates.clone();
        }

        if !result.rejected_nodes.is_empty() {
            result.refresh_index = index;
        }

        drop(nodes_table);
        drop(allocs_table);
        txn.commit().map_err(map_err!(Transaction))?;

        info!(
            eval = %plan.eval_id,
            index,
            placed = result.node_allocation.values().map(Vec::len).sum::<usize>(),
            stopped = result.node_update.values().map(Vec::len).sum::<usize>(),
            rejected = result.rejected_nodes.len(),
            "plan applied"
        );
        Ok(result)
    }
}
