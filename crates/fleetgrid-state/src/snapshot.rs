//! Point-in-time, in-memory view of the fleet.
//!
//! Schedulers never read the store directly: they work on a [`StateSnapshot`]
//! materialized from one read transaction, so nothing they observe can change
//! mid-evaluation.

use std::collections::{BTreeMap, BTreeSet};

use crate::types::*;

/// Read-only fleet queries a scheduler needs.
pub trait State {
    /// Store index the view reflects.
    fn index(&self) -> u64;

    /// All nodes ordered by ID.
    fn nodes(&self) -> Vec<&Node>;

    fn node_by_id(&self, id: &str) -> Option<&Node>;

    /// Latest version of a job.
    fn job_by_id(&self, namespace: &str, id: &str) -> Option<&Job>;

    fn job_by_id_and_version(&self, namespace: &str, id: &str, version: u64) -> Option<&Job>;

    /// Every allocation of a job, terminal ones included, ordered by ID.
    fn allocs_by_job(&self, namespace: &str, job_id: &str) -> Vec<&Allocation>;

    /// Every allocation on a node, terminal ones included, ordered by ID.
    fn allocs_by_node(&self, node_id: &str) -> Vec<&Allocation>;

    fn deployment_by_id(&self, id: &str) -> Option<&Deployment>;

    /// Most recently created deployment of a job.
    fn latest_deployment_by_job(&self, namespace: &str, job_id: &str) -> Option<&Deployment>;
}

/// Materialized [`State`] with secondary indexes by job and by node.
#[derive(Debug, Clone, Default)]
pub struct StateSnapshot {
    index: u64,
    nodes: BTreeMap<NodeId, Node>,
    jobs: BTreeMap<String, Job>,
    job_versions: BTreeMap<String, Job>,
    allocs: BTreeMap<AllocId, Allocation>,
    allocs_by_job: BTreeMap<String, BTreeSet<AllocId>>,
    allocs_by_node: BTreeMap<NodeId, BTreeSet<AllocId>>,
    deployments: BTreeMap<DeploymentId, Deployment>,
}

impl StateSnapshot {
    pub fn new(index: u64) -> Self {
        Self {
            index,
            ..Default::default()
        }
    }

    pub fn upsert_node(&mut self, node: Node) {
        self.nodes.insert(node.id.clone(), node);
    }

    /// Insert a job version; the latest version wins the `job_by_id` slot.
    pub fn upsert_job(&mut self, job: Job) {
        let key = job.table_key();
        let newer = self
            .jobs
            .get(&key)
            .is_none_or(|current| current.version <= job.version);
        self.job_versions.insert(job.version_key(), job.clone());
        if newer {
            self.jobs.insert(key, job);
        }
    }

    pub fn upsert_alloc(&mut self, alloc: Allocation) {
        if let Some(previous) = self.allocs.get(&alloc.id) {
            if previous.node_id != alloc.node_id {
                if let Some(ids) = self.allocs_by_node.get_mut(&previous.node_id) {
                    ids.remove(&alloc.id);
                }
            }
        }
        self.allocs_by_job
            .entry(job_key(&alloc.namespace, &alloc.job_id))
            .or_default()
            .insert(alloc.id.clone());
        self.allocs_by_node
            .entry(alloc.node_id.clone())
            .or_default()
            .insert(alloc.id.clone());
        self.allocs.insert(alloc.id.clone(), alloc);
    }

    pub fn upsert_deployment(&mut self, deployment: Deployment) {
        self.deployments.insert(deployment.id.clone(), deployment);
    }

    pub fn alloc_by_id(&self, id: &str) -> Option<&Allocation> {
        self.allocs.get(id)
    }

    fn resolve<'a>(&'a self, ids: Option<&'a BTreeSet<AllocId>>) -> Vec<&'a Allocation> {
        ids.into_iter()
            .flatten()
            .filter_map(|id| self.allocs.get(id))
            .collect()
    }
}

impl State for StateSnapshot {
    fn index(&self) -> u64 {
        self.index
    }

    fn nodes(&self) -> Vec<&Node> {
        self.nodes.values().collect()
    }

    fn node_by_id(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    fn job_by_id(&self, namespace: &str, id: &str) -> Option<&Job> {
        self.jobs.get(&job_key(namespace, id))
    }

    fn job_by_id_and_version(&self, namespace: &str, id: &str, version: u64) -> Option<&Job> {
        self.job_versions.get(&job_version_key(namespace, id, version))
    }

    fn allocs_by_job(&self, namespace: &str, job_id: &str) -> Vec<&Allocation> {
        self.resolve(self.allocs_by_job.get(&job_key(namespace, job_id)))
    }

    fn allocs_by_node(&self, node_id: &str) -> Vec<&Allocation> {
        self.resolve(self.allocs_by_node.get(node_id))
    }

    fn deployment_by_id(&self, id: &str) -> Option<&Deployment> {
        self.deployments.get(id)
    }

    fn latest_deployment_by_job(&self, namespace: &str, job_id: &str) -> Option<&Deployment> {
        self.deployments
            .values()
            .filter(|d| d.namespace == namespace && d.job_id == job_id)
            .max_by(|a, b| {
                a.create_index
                    .cmp(&b.create_index)
                    .then_with(|| a.job_version.cmp(&b.job_version))
            })
    }
}
