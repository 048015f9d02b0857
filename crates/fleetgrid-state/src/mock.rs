//! Pre-populated fixtures for tests.
//!
//! Enabled for this crate's own tests and, through the `mock` feature, for
//! downstream crates' tests. Every fixture is deterministic: IDs derive from
//! the arguments so assertions can name them.

use std::collections::BTreeMap;

use crate::constraint::{Constraint, Operand, Target};
use crate::plan::Plan;
use crate::resources::Resources;
use crate::types::*;

fn driver(healthy: bool) -> DriverInfo {
    DriverInfo {
        detected: true,
        healthy,
    }
}

/// A ready linux node in `dc1` with room for several `job` allocations.
pub fn node(id: &str) -> Node {
    let mut node = Node::new(id, "dc1");
    node.name = format!("{id}.fleet.local");
    node.node_class = "linux-medium-pci".to_string();
    node.attributes = BTreeMap::from([
        ("kernel.name".to_string(), "linux".to_string()),
        ("cpu.arch".to_string(), "amd64".to_string()),
        ("os.version".to_string(), "22.04".to_string()),
        ("driver.exec".to_string(), "1".to_string()),
        ("agent.version".to_string(), "1.6.2".to_string()),
        ("unique.hostname".to_string(), format!("{id}.fleet.local")),
    ]);
    node.meta = BTreeMap::from([
        ("pci-dss".to_string(), "true".to_string()),
        ("rack".to_string(), "r1".to_string()),
    ]);
    node.drivers = BTreeMap::from([
        ("exec".to_string(), driver(true)),
        ("docker".to_string(), driver(true)),
    ]);
    node.resources = Resources::new(4000, 8192, 100 * 1024, 1000);
    node.reserved = Resources::new(100, 256, 4 * 1024, 1);
    node.reserved_ports.insert(22);
    node.compute_class();
    node
}

/// A node being drained: allocations must migrate off it.
pub fn drain_node(id: &str) -> Node {
    let mut node = node(id);
    node.eligibility = SchedulingEligibility::Draining;
    node
}

fn web_task() -> Task {
    Task {
        name: "web".to_string(),
        driver: "exec".to_string(),
        config: BTreeMap::from([
            ("command".to_string(), serde_json::json!("/bin/date")),
            ("args".to_string(), serde_json::json!(["+%s"])),
        ]),
        env: BTreeMap::from([("FOO".to_string(), "bar".to_string())]),
        resources: Resources::new(500, 256, 0, 0),
        lifecycle: None,
        constraints: vec![],
        affinities: vec![],
        meta: BTreeMap::new(),
    }
}

fn web_group(count: u32) -> TaskGroup {
    TaskGroup {
        name: "web".to_string(),
        count,
        constraints: vec![],
        affinities: vec![],
        spreads: vec![],
        tasks: vec![web_task()],
        ephemeral_disk_mb: 150,
        network: Some(NetworkRequest {
            mbits: 50,
            static_ports: vec![],
        }),
        restart_policy: RestartPolicy::default(),
        reschedule_policy: ReschedulePolicy::default(),
        update: None,
        meta: BTreeMap::new(),
    }
}

/// A service job with one group `web` of ten `exec` tasks constrained to
/// linux nodes.
pub fn job(id: &str) -> Job {
    Job {
        namespace: DEFAULT_NAMESPACE.to_string(),
        id: id.to_string(),
        name: id.to_string(),
        job_type: JobType::Service,
        priority: 50,
        all_at_once: false,
        datacenters: vec!["dc1".to_string()],
        constraints: vec![Constraint::new(
            Target::attr("kernel.name"),
            Operand::Equal,
            Target::literal("linux"),
        )],
        affinities: vec![],
        spreads: vec![],
        task_groups: vec![web_group(10)],
        stop: false,
        version: 0,
        meta: BTreeMap::from([("owner".to_string(), "armon".to_string())]),
        create_index: 0,
        modify_index: 0,
    }
}

/// A batch job with a single `worker` group.
pub fn batch_job(id: &str) -> Job {
    let mut job = job(id);
    job.job_type = JobType::Batch;
    job.priority = 50;
    let mut group = web_group(10);
    group.name = "worker".to_string();
    group.network = None;
    group.reschedule_policy = ReschedulePolicy {
        attempts: 1,
        interval_secs: 86_400,
        unlimited: false,
    };
    group.tasks[0].name = "worker".to_string();
    group.tasks[0].resources = Resources::new(100, 100, 0, 0);
    job.task_groups = vec![group];
    job
}

/// A job whose group exercises every lifecycle hook.
pub fn lifecycle_job(id: &str) -> Job {
    let mut job = job(id);
    let hook = |name: &str, hook: LifecycleHook, sidecar: bool| Task {
        name: name.to_string(),
        lifecycle: Some(Lifecycle { hook, sidecar }),
        resources: Resources::new(100, 64, 0, 0),
        ..web_task()
    };
    let mut group = web_group(1);
    group.tasks = vec![
        web_task(),
        hook("init", LifecycleHook::Prestart, false),
        hook("side", LifecycleHook::Prestart, true),
        hook("poststart", LifecycleHook::Poststart, false),
        hook("poststop", LifecycleHook::Poststop, false),
    ];
    job.task_groups = vec![group];
    job
}

/// A pending allocation for slot `index` of the job's first group.
pub fn alloc(job: &Job, index: u32, node_id: &str) -> Allocation {
    let group = &job.task_groups[0];
    let mut alloc = Allocation::new(
        &format!("{}-{}-{index}-{node_id}", job.id, group.name),
        &job.id,
        &group.name,
        index,
        node_id,
    );
    alloc.namespace = job.namespace.clone();
    alloc.eval_id = format!("eval-{}", job.id);
    alloc.job_version = job.version;
    alloc.job_priority = job.priority;
    alloc.allocated = group.allocated_resources();
    alloc
}

/// A pending register evaluation for the job.
pub fn eval(job: &Job) -> Evaluation {
    Evaluation::new(&format!("eval-{}", job.id), job, EvalTrigger::JobRegister)
}

/// A blocked evaluation that ran out of memory on one class.
pub fn blocked_eval(job: &Job) -> Evaluation {
    let mut eval = eval(job);
    eval.id = format!("blocked-{}", job.id);
    eval.status = EvalStatus::Blocked;
    eval.status_description = "created due to placement conflicts".to_string();
    let mut metric = AllocMetric {
        nodes_evaluated: 1,
        nodes_exhausted: 1,
        ..Default::default()
    };
    metric.dimension_exhausted.insert("memory".to_string(), 1);
    eval.failed_tg_allocs
        .insert(job.task_groups[0].name.clone(), metric);
    eval.class_eligibility.insert("v1:aaaaaaaaaaaaaaaa".to_string(), true);
    eval.queued_allocations
        .insert(job.task_groups[0].name.clone(), 1);
    eval
}

/// A running deployment covering every group of the job.
pub fn deployment(job: &Job) -> Deployment {
    let task_groups = job
        .task_groups
        .iter()
        .map(|tg| {
            let update = tg.update.clone().unwrap_or_default();
            (
                tg.name.clone(),
                DeploymentState {
                    desired_total: tg.count,
                    desired_canaries: update.canary,
                    auto_promote: update.auto_promote,
                    auto_revert: update.auto_revert,
                    ..Default::default()
                },
            )
        })
        .collect();
    Deployment {
        id: format!("deploy-{}-{}", job.id, job.version),
        namespace: job.namespace.clone(),
        job_id: job.id.clone(),
        job_version: job.version,
        task_groups,
        status: DeploymentStatus::Running,
        status_description: "deployment is running".to_string(),
        create_index: 0,
        modify_index: 0,
    }
}

/// A plan placing one allocation of the job on `node_id`.
pub fn plan(job: &Job, node_id: &str) -> Plan {
    let mut plan = Plan::new(&eval(job), Some(job.clone()), 0);
    plan.append_alloc(alloc(job, 0, node_id));
    plan
}
