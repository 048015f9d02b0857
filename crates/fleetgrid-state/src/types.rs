//! Domain types for the FleetGrid state store.
//!
//! These types represent the persisted state of jobs, nodes, allocations,
//! evaluations, and deployments. All types serialize to/from JSON for storage
//! in redb tables; every map is ordered so serialized plans are byte-stable.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::constraint::{Affinity, Constraint, Spread};
use crate::resources::{AllocatedResources, Dimension, Resources};

/// Job identifier (namespace-scoped).
pub type JobId = String;

/// Node identifier.
pub type NodeId = String;

/// Allocation identifier.
pub type AllocId = String;

/// Evaluation identifier.
pub type EvalId = String;

/// Deployment identifier.
pub type DeploymentId = String;

pub const DEFAULT_NAMESPACE: &str = "default";

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_priority() -> u8 {
    50
}

fn default_count() -> u32 {
    1
}

/// Composite key of the latest job version.
pub fn job_key(namespace: &str, job_id: &str) -> String {
    format!("{namespace}/{job_id}")
}

/// Composite key of one job version; zero-padded so keys sort by version.
pub fn job_version_key(namespace: &str, job_id: &str, version: u64) -> String {
    format!("{namespace}/{job_id}@{version:020}")
}

/// Allocation name for a slot: `{job}.{group}[{index}]`.
pub fn alloc_name(job_id: &str, group: &str, index: u32) -> String {
    format!("{job_id}.{group}[{index}]")
}

// ── Job ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Long-running; failed or lost allocations are replaced.
    #[default]
    Service,
    /// Run-to-completion; successfully completed allocations keep their slot.
    Batch,
}

/// Versioned specification of a workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub id: JobId,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "type")]
    pub job_type: JobType,
    #[serde(default = "default_priority")]
    pub priority: u8,
    /// Reject the whole plan if any node plan conflicts.
    #[serde(default)]
    pub all_at_once: bool,
    #[serde(default)]
    pub datacenters: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    #[serde(default)]
    pub affinities: Vec<Affinity>,
    #[serde(default)]
    pub spreads: Vec<Spread>,
    pub task_groups: Vec<TaskGroup>,
    /// Set on deregistration; the scheduler stops every allocation.
    #[serde(default)]
    pub stop: bool,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
}

impl Job {
    /// Build the composite key for the jobs table.
    pub fn table_key(&self) -> String {
        job_key(&self.namespace, &self.id)
    }

    /// Build the composite key for the job versions table.
    pub fn version_key(&self) -> String {
        job_version_key(&self.namespace, &self.id, self.version)
    }

    pub fn lookup_task_group(&self, name: &str) -> Option<&TaskGroup> {
        self.task_groups.iter().find(|tg| tg.name == name)
    }

    /// Whether the specification (ignoring version and store indexes) is
    /// the same as `other`.
    pub fn spec_equal(&self, other: &Job) -> bool {
        let strip = |job: &Job| Job {
            version: 0,
            create_index: 0,
            modify_index: 0,
            ..job.clone()
        };
        strip(self) == strip(other)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.is_empty() {
            return Err("job id is empty".to_string());
        }
        if !(1..=100).contains(&self.priority) {
            return Err(format!("priority {} outside 1..=100", self.priority));
        }
        if self.task_groups.is_empty() {
            return Err("job has no task groups".to_string());
        }
        let mut names = BTreeSet::new();
        for tg in &self.task_groups {
            if !names.insert(tg.name.as_str()) {
                return Err(format!("duplicate task group {:?}", tg.name));
            }
            tg.validate()?;
        }
        Ok(())
    }
}

/// A set of co-located tasks sharing a network namespace and disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskGroup {
    pub name: String,
    #[serde(default = "default_count")]
    pub count: u32,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    #[serde(default)]
    pub affinities: Vec<Affinity>,
    #[serde(default)]
    pub spreads: Vec<Spread>,
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub ephemeral_disk_mb: u64,
    #[serde(default)]
    pub network: Option<NetworkRequest>,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    #[serde(default)]
    pub reschedule_policy: ReschedulePolicy,
    #[serde(default)]
    pub update: Option<UpdateStrategy>,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

impl TaskGroup {
    /// Validate that task names are unique and the group is runnable.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("task group name is empty".to_string());
        }
        if self.tasks.is_empty() {
            return Err(format!("task group {:?} has no tasks", self.name));
        }
        let mut names = BTreeSet::new();
        for task in &self.tasks {
            if !names.insert(task.name.as_str()) {
                return Err(format!(
                    "task group {:?} has duplicate task {:?}",
                    self.name, task.name
                ));
            }
        }
        if self.tasks.iter().all(|t| t.lifecycle.is_some()) {
            return Err(format!(
                "task group {:?} has no main task (every task has a lifecycle hook)",
                self.name
            ));
        }
        Ok(())
    }

    /// The rolling update strategy in effect. `max_parallel = 0` disables it.
    pub fn update_strategy(&self) -> Option<&UpdateStrategy> {
        self.update.as_ref().filter(|u| u.max_parallel > 0)
    }

    /// Resources a single allocation of this group asks for.
    pub fn allocated_resources(&self) -> AllocatedResources {
        let mut res = AllocatedResources {
            shared_disk_mb: self.ephemeral_disk_mb,
            ..Default::default()
        };
        for task in &self.tasks {
            res.tasks.insert(
                task.name.clone(),
                Resources::new(task.resources.cpu, task.resources.memory_mb, 0, 0),
            );
        }
        if let Some(net) = &self.network {
            res.shared_mbits = net.mbits;
            res.ports = net.static_ports.iter().copied().collect();
        }
        res
    }

    /// Drivers every task of the group needs on the node.
    pub fn drivers(&self) -> BTreeSet<&str> {
        self.tasks.iter().map(|t| t.driver.as_str()).collect()
    }

    /// Group tasks by the order in which the client starts them.
    pub fn lifecycle_stages(&self) -> LifecycleStages<'_> {
        let mut stages = LifecycleStages::default();
        for task in &self.tasks {
            match &task.lifecycle {
                None => stages.main.push(task),
                Some(Lifecycle {
                    hook: LifecycleHook::Prestart,
                    sidecar: false,
                }) => stages.prestart.push(task),
                Some(Lifecycle {
                    hook: LifecycleHook::Prestart,
                    sidecar: true,
                }) => stages.main.push(task),
                Some(Lifecycle {
                    hook: LifecycleHook::Poststart,
                    ..
                }) => stages.poststart.push(task),
                Some(Lifecycle {
                    hook: LifecycleHook::Poststop,
                    ..
                }) => stages.poststop.push(task),
            }
        }
        stages
    }
}

/// Tasks of a group partitioned by lifecycle phase.
#[derive(Debug, Default)]
pub struct LifecycleStages<'a> {
    /// Prestart init tasks, which run to completion before anything else.
    pub prestart: Vec<&'a Task>,
    /// Main tasks plus prestart sidecars, started together.
    pub main: Vec<&'a Task>,
    /// Started once the main tasks are running.
    pub poststart: Vec<&'a Task>,
    /// Run after every other task has exited.
    pub poststop: Vec<&'a Task>,
}

/// Group-level network ask.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkRequest {
    #[serde(default)]
    pub mbits: u64,
    #[serde(default)]
    pub static_ports: Vec<u16>,
}

/// A unit of execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub name: String,
    pub driver: String,
    #[serde(default)]
    pub config: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub resources: Resources,
    #[serde(default)]
    pub lifecycle: Option<Lifecycle>,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    #[serde(default)]
    pub affinities: Vec<Affinity>,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lifecycle {
    pub hook: LifecycleHook,
    #[serde(default)]
    pub sidecar: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleHook {
    Prestart,
    Poststart,
    Poststop,
}

/// Client-side restart behaviour; carried for the client, not used by
/// placement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartPolicy {
    pub attempts: u32,
    pub interval_secs: u64,
    pub delay_secs: u64,
    pub mode: RestartMode,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            attempts: 2,
            interval_secs: 1800,
            delay_secs: 15,
            mode: RestartMode::Fail,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartMode {
    Delay,
    Fail,
}

/// How many times a failed allocation is replaced on another node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReschedulePolicy {
    pub attempts: u32,
    pub interval_secs: u64,
    #[serde(default)]
    pub unlimited: bool,
}

impl Default for ReschedulePolicy {
    fn default() -> Self {
        Self {
            attempts: 2,
            interval_secs: 3600,
            unlimited: false,
        }
    }
}

/// Rolling update and canary settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateStrategy {
    /// Destructive updates in flight at once.
    #[serde(default = "default_count")]
    pub max_parallel: u32,
    /// New-version allocations placed before old ones are replaced.
    #[serde(default)]
    pub canary: u32,
    #[serde(default)]
    pub auto_promote: bool,
    #[serde(default)]
    pub auto_revert: bool,
}

impl Default for UpdateStrategy {
    fn default() -> Self {
        Self {
            max_parallel: 1,
            canary: 0,
            auto_promote: false,
            auto_revert: false,
        }
    }
}

// ── Node ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    #[default]
    Initializing,
    Ready,
    Down,
    Disconnected,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingEligibility {
    #[default]
    Eligible,
    Ineligible,
    Draining,
}

/// Fingerprinted task driver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverInfo {
    pub detected: bool,
    pub healthy: bool,
}

/// A fleet member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    #[serde(default)]
    pub name: String,
    pub datacenter: String,
    #[serde(default)]
    pub node_class: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
    #[serde(default)]
    pub drivers: BTreeMap<String, DriverInfo>,
    /// Total capacity.
    pub resources: Resources,
    /// Capacity held back for the operating system and agent.
    #[serde(default)]
    pub reserved: Resources,
    #[serde(default)]
    pub reserved_ports: BTreeSet<u16>,
    #[serde(default)]
    pub status: NodeStatus,
    #[serde(default)]
    pub eligibility: SchedulingEligibility,
    /// Fingerprint of the scheduling-relevant fields; see [`Node::compute_class`].
    #[serde(default)]
    pub computed_class: String,
    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
}

impl Node {
    /// A ready, eligible node with no capacity; callers fill in the rest.
    pub fn new(id: &str, datacenter: &str) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            datacenter: datacenter.to_string(),
            node_class: String::new(),
            attributes: BTreeMap::new(),
            meta: BTreeMap::new(),
            drivers: BTreeMap::new(),
            resources: Resources::default(),
            reserved: Resources::default(),
            reserved_ports: BTreeSet::new(),
            status: NodeStatus::Ready,
            eligibility: SchedulingEligibility::Eligible,
            computed_class: String::new(),
            create_index: 0,
            modify_index: 0,
        }
    }

    /// Capacity left for allocations after the reservation.
    pub fn available(&self) -> Resources {
        self.resources.saturating_sub(&self.reserved)
    }

    pub fn is_ready(&self) -> bool {
        self.status == NodeStatus::Ready
    }

    pub fn is_eligible(&self) -> bool {
        self.eligibility == SchedulingEligibility::Eligible
    }

    /// Whether allocations running here must move elsewhere.
    pub fn is_tainted(&self) -> bool {
        !self.is_ready() || !self.is_eligible()
    }

    pub fn driver_healthy(&self, driver: &str) -> bool {
        self.drivers
            .get(driver)
            .is_some_and(|d| d.detected && d.healthy)
    }

    /// Recompute [`Node::computed_class`].
    ///
    /// Nodes with equal classes are interchangeable for every constraint that
    /// does not reference a `unique.*` value, so feasibility can be cached per
    /// class and blocked evaluations can be woken per class.
    pub fn compute_class(&mut self) {
        let mut hasher = Sha256::new();
        hasher.update(self.datacenter.as_bytes());
        hasher.update([0]);
        hasher.update(self.node_class.as_bytes());
        hasher.update([0]);
        for (section, map) in [("attr", &self.attributes), ("meta", &self.meta)] {
            for (k, v) in map.iter().filter(|(k, _)| !k.starts_with("unique.")) {
                hasher.update(section.as_bytes());
                hasher.update(k.as_bytes());
                hasher.update([b'=']);
                hasher.update(v.as_bytes());
                hasher.update([0]);
            }
        }
        for (name, info) in &self.drivers {
            hasher.update(b"driver");
            hasher.update(name.as_bytes());
            hasher.update([u8::from(info.detected), u8::from(info.healthy)]);
        }
        let digest = hasher.finalize();
        self.computed_class = format!("v1:{}", hex::encode(&digest[..8]));
    }
}

// ── Allocation ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocDesiredStatus {
    #[default]
    Run,
    Stop,
    Evict,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocClientStatus {
    #[default]
    Pending,
    Running,
    Complete,
    Failed,
    Lost,
}

impl AllocClientStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Lost)
    }
}

/// Deployment health of an allocation, set by the client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocDeploymentStatus {
    /// `None` until the health check deadline resolves.
    #[serde(default)]
    pub healthy: Option<bool>,
    #[serde(default)]
    pub canary: bool,
}

/// One prior reschedule of the slot an allocation occupies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RescheduleEvent {
    pub prev_alloc_id: AllocId,
    pub prev_node_id: NodeId,
    /// Unix timestamp (seconds).
    pub time: u64,
}

/// Binding of one task group instance to one node at one job version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: AllocId,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub eval_id: EvalId,
    pub name: String,
    pub node_id: NodeId,
    pub job_id: JobId,
    #[serde(default)]
    pub job_version: u64,
    /// Priority of the owning job; drives preemption.
    #[serde(default = "default_priority")]
    pub job_priority: u8,
    pub task_group: String,
    /// Slot within the group, `0..count`.
    pub index: u32,
    #[serde(default)]
    pub allocated: AllocatedResources,
    #[serde(default)]
    pub desired_status: AllocDesiredStatus,
    #[serde(default)]
    pub desired_description: String,
    #[serde(default)]
    pub client_status: AllocClientStatus,
    #[serde(default)]
    pub client_description: String,
    #[serde(default)]
    pub deployment_id: Option<DeploymentId>,
    #[serde(default)]
    pub deployment_status: Option<AllocDeploymentStatus>,
    #[serde(default)]
    pub previous_allocation: Option<AllocId>,
    #[serde(default)]
    pub reschedule_events: Vec<RescheduleEvent>,
    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
    /// Unix timestamp (seconds) of the last client status change.
    #[serde(default)]
    pub modify_time: u64,
}

impl Allocation {
    /// A pending, desired-running allocation with no resources.
    pub fn new(id: &str, job_id: &str, task_group: &str, index: u32, node_id: &str) -> Self {
        Self {
            id: id.to_string(),
            namespace: default_namespace(),
            eval_id: String::new(),
            name: alloc_name(job_id, task_group, index),
            node_id: node_id.to_string(),
            job_id: job_id.to_string(),
            job_version: 0,
            job_priority: default_priority(),
            task_group: task_group.to_string(),
            index,
            allocated: AllocatedResources::default(),
            desired_status: AllocDesiredStatus::Run,
            desired_description: String::new(),
            client_status: AllocClientStatus::Pending,
            client_description: String::new(),
            deployment_id: None,
            deployment_status: None,
            previous_allocation: None,
            reschedule_events: Vec::new(),
            create_index: 0,
            modify_index: 0,
            modify_time: 0,
        }
    }

    /// Whether the server has asked the allocation to stop.
    pub fn server_terminal(&self) -> bool {
        matches!(
            self.desired_status,
            AllocDesiredStatus::Stop | AllocDesiredStatus::Evict
        )
    }

    /// Whether the client reports the allocation finished.
    pub fn client_terminal(&self) -> bool {
        self.client_status.is_terminal()
    }

    /// Terminal allocations no longer consume node resources.
    pub fn terminal_status(&self) -> bool {
        self.server_terminal() || self.client_terminal()
    }

    pub fn is_canary(&self) -> bool {
        self.deployment_status.is_some_and(|d| d.canary)
    }

    pub fn is_healthy(&self) -> bool {
        self.deployment_status.and_then(|d| d.healthy) == Some(true)
    }

    pub fn is_unhealthy(&self) -> bool {
        self.deployment_status.and_then(|d| d.healthy) == Some(false)
    }

    /// Reschedule events within the trailing `interval_secs` window.
    pub fn reschedules_within(&self, now: u64, interval_secs: u64) -> usize {
        let floor = now.saturating_sub(interval_secs);
        self.reschedule_events
            .iter()
            .filter(|e| e.time >= floor)
            .count()
    }
}

// ── Evaluation ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalStatus {
    #[default]
    Pending,
    Blocked,
    Complete,
    Failed,
    Canceled,
}

impl EvalStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Canceled)
    }

    /// Legal transitions of the evaluation state machine.
    pub fn can_transition_to(&self, next: EvalStatus) -> bool {
        use EvalStatus::*;
        match (self, next) {
            (Pending, Complete | Failed | Blocked | Canceled) => true,
            // Unblocked evaluations go back to the queue; a re-run that
            // still cannot place stays blocked.
            (Blocked, Pending | Blocked | Canceled | Complete) => true,
            _ => false,
        }
    }
}

/// What caused an evaluation to be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EvalTrigger {
    JobRegister,
    JobDeregister,
    NodeUpdate,
    NodeDrain,
    AllocFailure,
    DeploymentWatcher,
    QueuedAllocs,
    MaxPlanAttempts,
}

/// Placement diagnostics for one task group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AllocMetric {
    pub nodes_evaluated: u32,
    pub nodes_filtered: u32,
    /// Ready nodes per datacenter considered for the job.
    pub nodes_available: BTreeMap<String, u32>,
    /// Filtered nodes keyed by computed class.
    pub class_filtered: BTreeMap<String, u32>,
    /// Filtered nodes keyed by the failing constraint or reason.
    pub constraint_filtered: BTreeMap<String, u32>,
    pub nodes_exhausted: u32,
    pub class_exhausted: BTreeMap<String, u32>,
    pub dimension_exhausted: BTreeMap<String, u32>,
    /// Further placements of the same group that failed identically.
    pub coalesced_failures: u32,
    /// Best final scores, node id → score, for operator visibility.
    pub scores: BTreeMap<NodeId, f64>,
}

impl AllocMetric {
    pub fn evaluate_node(&mut self) {
        self.nodes_evaluated += 1;
    }

    pub fn filter_node(&mut self, node: &Node, reason: &str) {
        self.nodes_filtered += 1;
        if !node.computed_class.is_empty() {
            *self.class_filtered.entry(node.computed_class.clone()).or_default() += 1;
        }
        *self.constraint_filtered.entry(reason.to_string()).or_default() += 1;
    }

    pub fn exhausted_node(&mut self, node: &Node, dimension: Dimension) {
        self.nodes_exhausted += 1;
        if !node.computed_class.is_empty() {
            *self.class_exhausted.entry(node.computed_class.clone()).or_default() += 1;
        }
        *self
            .dimension_exhausted
            .entry(dimension.as_str().to_string())
            .or_default() += 1;
    }
}

/// A unit of scheduling work for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub id: EvalId,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default)]
    pub job_type: JobType,
    pub triggered_by: EvalTrigger,
    pub job_id: JobId,
    #[serde(default)]
    pub job_modify_index: u64,
    #[serde(default)]
    pub node_id: Option<NodeId>,
    #[serde(default)]
    pub deployment_id: Option<DeploymentId>,
    #[serde(default)]
    pub status: EvalStatus,
    #[serde(default)]
    pub status_description: String,
    /// Per-group placement failures; non-empty blocks the evaluation.
    #[serde(default)]
    pub failed_tg_allocs: BTreeMap<String, AllocMetric>,
    /// Computed class → whether the job could run there.
    #[serde(default)]
    pub class_eligibility: BTreeMap<String, bool>,
    /// Constraints referenced unique node values; any class may help.
    #[serde(default)]
    pub escaped_computed_class: bool,
    /// Group → allocations still waiting for capacity.
    #[serde(default)]
    pub queued_allocations: BTreeMap<String, u32>,
    /// Store index of the snapshot the last run planned against.
    #[serde(default)]
    pub snapshot_index: u64,
    #[serde(default)]
    pub previous_eval: Option<EvalId>,
    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
}

impl Evaluation {
    /// A pending evaluation for the given job.
    pub fn new(id: &str, job: &Job, triggered_by: EvalTrigger) -> Self {
        Self {
            id: id.to_string(),
            namespace: job.namespace.clone(),
            priority: job.priority,
            job_type: job.job_type,
            triggered_by,
            job_id: job.id.clone(),
            job_modify_index: job.modify_index,
            node_id: None,
            deployment_id: None,
            status: EvalStatus::Pending,
            status_description: String::new(),
            failed_tg_allocs: BTreeMap::new(),
            class_eligibility: BTreeMap::new(),
            escaped_computed_class: false,
            queued_allocations: BTreeMap::new(),
            snapshot_index: 0,
            previous_eval: None,
            create_index: 0,
            modify_index: 0,
        }
    }

    /// Build the composite key of the job this evaluation targets.
    pub fn job_key(&self) -> String {
        job_key(&self.namespace, &self.job_id)
    }

    pub fn terminal_status(&self) -> bool {
        self.status.is_terminal()
    }

    /// A pending evaluation for the same job chained to this one.
    pub fn follow_up(&self, id: &str, triggered_by: EvalTrigger) -> Evaluation {
        Evaluation {
            id: id.to_string(),
            namespace: self.namespace.clone(),
            priority: self.priority,
            job_type: self.job_type,
            triggered_by,
            job_id: self.job_id.clone(),
            job_modify_index: self.job_modify_index,
            node_id: None,
            deployment_id: self.deployment_id.clone(),
            status: EvalStatus::Pending,
            status_description: String::new(),
            failed_tg_allocs: BTreeMap::new(),
            class_eligibility: BTreeMap::new(),
            escaped_computed_class: false,
            queued_allocations: BTreeMap::new(),
            snapshot_index: 0,
            previous_eval: Some(self.id.clone()),
            create_index: 0,
            modify_index: 0,
        }
    }
}

// ── Deployment ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    #[default]
    Running,
    Successful,
    Failed,
    Paused,
    Canceled,
}

impl DeploymentStatus {
    /// Running and paused deployments still own their job version.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }
}

/// Rollout progress of one task group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentState {
    pub desired_total: u32,
    #[serde(default)]
    pub desired_canaries: u32,
    #[serde(default)]
    pub placed_canaries: Vec<AllocId>,
    #[serde(default)]
    pub placed_allocs: u32,
    #[serde(default)]
    pub healthy_allocs: u32,
    #[serde(default)]
    pub unhealthy_allocs: u32,
    #[serde(default)]
    pub promoted: bool,
    #[serde(default)]
    pub auto_promote: bool,
    #[serde(default)]
    pub auto_revert: bool,
}

impl DeploymentState {
    /// Canaries are placed but the group has not been promoted yet.
    pub fn awaiting_promotion(&self) -> bool {
        self.desired_canaries > 0 && !self.promoted
    }
}

/// Rolling update of a job to one version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: DeploymentId,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub job_id: JobId,
    pub job_version: u64,
    #[serde(default)]
    pub task_groups: BTreeMap<String, DeploymentState>,
    #[serde(default)]
    pub status: DeploymentStatus,
    #[serde(default)]
    pub status_description: String,
    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
}

impl Deployment {
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn requires_promotion(&self) -> bool {
        self.task_groups.values().any(DeploymentState::awaiting_promotion)
    }
}

/// Status change of an existing deployment, carried in a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentStatusUpdate {
    pub deployment_id: DeploymentId,
    pub status: DeploymentStatus,
    pub status_description: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(tasks: Vec<Task>) -> TaskGroup {
        TaskGroup {
            name: "web".to_string(),
            count: 1,
            constraints: vec![],
            affinities: vec![],
            spreads: vec![],
            tasks,
            ephemeral_disk_mb: 150,
            network: None,
            restart_policy: RestartPolicy::default(),
            reschedule_policy: ReschedulePolicy::default(),
            update: None,
            meta: BTreeMap::new(),
        }
    }

    fn task(name: &str, lifecycle: Option<Lifecycle>) -> Task {
        Task {
            name: name.to_string(),
            driver: "exec".to_string(),
            config: BTreeMap::new(),
            env: BTreeMap::new(),
            resources: Resources::new(100, 64, 0, 0),
            lifecycle,
            constraints: vec![],
            affinities: vec![],
            meta: BTreeMap::new(),
        }
    }

    #[test]
    fn duplicate_task_names_are_invalid() {
        let tg = group(vec![task("a", None), task("a", None)]);
        assert!(tg.validate().unwrap_err().contains("duplicate task"));
    }

    #[test]
    fn lifecycle_stages_follow_hook_order() {
        let tg = group(vec![
            task("main", None),
            task(
                "init",
                Some(Lifecycle {
                    hook: LifecycleHook::Prestart,
                    sidecar: false,
                }),
            ),
            task(
                "proxy",
                Some(Lifecycle {
                    hook: LifecycleHook::Prestart,
                    sidecar: true,
                }),
            ),
            task(
                "announce",
                Some(Lifecycle {
                    hook: LifecycleHook::Poststart,
                    sidecar: false,
                }),
            ),
            task(
                "cleanup",
                Some(Lifecycle {
                    hook: LifecycleHook::Poststop,
                    sidecar: false,
                }),
            ),
        ]);
        assert!(tg.validate().is_ok());

        let stages = tg.lifecycle_stages();
        let names = |v: &[&Task]| v.iter().map(|t| t.name.clone()).collect::<Vec<_>>();
        assert_eq!(names(&stages.prestart), vec!["init"]);
        assert_eq!(names(&stages.main), vec!["main", "proxy"]);
        assert_eq!(names(&stages.poststart), vec!["announce"]);
        assert_eq!(names(&stages.poststop), vec!["cleanup"]);
    }

    #[test]
    fn group_with_only_hooks_is_invalid() {
        let tg = group(vec![task(
            "init",
            Some(Lifecycle {
                hook: LifecycleHook::Prestart,
                sidecar: false,
            }),
        )]);
        assert!(tg.validate().is_err());
    }

    #[test]
    fn zero_max_parallel_disables_the_update_strategy() {
        let mut tg = group(vec![task("server", None)]);
        assert!(tg.update_strategy().is_none());

        tg.update = Some(UpdateStrategy::default());
        assert_eq!(tg.update_strategy().map(|u| u.max_parallel), Some(1));

        tg.update = Some(UpdateStrategy {
            max_parallel: 0,
            canary: 2,
            ..Default::default()
        });
        assert!(tg.validate().is_ok());
        assert!(tg.update_strategy().is_none());
    }

    #[test]
    fn allocated_resources_include_disk_and_network() {
        let mut tg = group(vec![task("a", None), task("b", None)]);
        tg.network = Some(NetworkRequest {
            mbits: 10,
            static_ports: vec![8080],
        });
        let res = tg.allocated_resources();
        assert_eq!(res.comparable(), Resources::new(200, 128, 150, 10));
        assert!(res.ports.contains(&8080));
    }

    #[test]
    fn computed_class_ignores_unique_attributes() {
        let mut a = Node::new("a", "dc1");
        a.attributes.insert("kernel.name".into(), "linux".into());
        a.attributes.insert("unique.hostname".into(), "host-a".into());
        let mut b = a.clone();
        b.id = "b".into();
        b.attributes.insert("unique.hostname".into(), "host-b".into());

        a.compute_class();
        b.compute_class();
        assert_eq!(a.computed_class, b.computed_class);
        assert!(a.computed_class.starts_with("v1:"));

        b.attributes.insert("kernel.name".into(), "darwin".into());
        b.compute_class();
        assert_ne!(a.computed_class, b.computed_class);
    }

    #[test]
    fn eval_transitions() {
        use EvalStatus::*;
        assert!(Pending.can_transition_to(Blocked));
        assert!(Blocked.can_transition_to(Pending));
        assert!(!Complete.can_transition_to(Pending));
        assert!(!Failed.can_transition_to(Blocked));
        assert!(!Canceled.can_transition_to(Complete));
    }

    #[test]
    fn reschedule_window_counts_recent_events() {
        let mut a = Allocation::new("a", "job", "web", 0, "n1");
        for time in [100, 900, 1000] {
            a.reschedule_events.push(RescheduleEvent {
                prev_alloc_id: "x".into(),
                prev_node_id: "n0".into(),
                time,
            });
        }
        assert_eq!(a.reschedules_within(1000, 200), 2);
        assert_eq!(a.reschedules_within(1000, 10_000), 3);
    }
}
