//! Placement report printed after a scenario settles.

use std::collections::BTreeMap;
use std::fmt;

use fleetgrid_scheduler::{Service, ServiceStats};
use fleetgrid_state::{AllocClientStatus, AllocDesiredStatus, AllocMetric, EvalStatus};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct Report {
    pub jobs: Vec<JobReport>,
    pub stats: ServiceStats,
}

#[derive(Debug, Serialize)]
pub struct JobReport {
    pub namespace: String,
    pub id: String,
    pub version: u64,
    pub stopped: bool,
    pub allocations: Vec<AllocLine>,
    /// Group → placements still waiting for capacity.
    pub queued: BTreeMap<String, u32>,
    pub blocked: BTreeMap<String, AllocMetric>,
}

#[derive(Debug, Serialize)]
pub struct AllocLine {
    pub name: String,
    pub node: String,
    pub version: u64,
    pub desired: AllocDesiredStatus,
    pub client: AllocClientStatus,
}

impl Report {
    pub async fn collect(service: &Service, include_stopped: bool) -> anyhow::Result<Self> {
        let store = service.store();
        let mut jobs = Vec::new();
        for job in store.list_jobs()? {
            let mut allocations: Vec<AllocLine> = store
                .allocs_by_job(&job.namespace, &job.id)?
                .into_iter()
                .filter(|a| include_stopped || !a.terminal_status())
                .map(|a| AllocLine {
                    name: a.name,
                    node: a.node_id,
                    version: a.job_version,
                    desired: a.desired_status,
                    client: a.client_status,
                })
                .collect();
            allocations.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.node.cmp(&b.node)));

            let mut queued = BTreeMap::new();
            let mut blocked = BTreeMap::new();
            for eval in store.evals_by_job(&job.namespace, &job.id)? {
                if eval.status == EvalStatus::Blocked {
                    queued.extend(eval.queued_allocations.into_iter().filter(|(_, n)| *n > 0));
                    blocked.extend(eval.failed_tg_allocs);
                }
            }

            jobs.push(JobReport {
                namespace: job.namespace,
                id: job.id,
                version: job.version,
                stopped: job.stop,
                allocations,
                queued,
                blocked,
            });
        }
        Ok(Self {
            jobs,
            stats: service.stats().await,
        })
    }
}

fn status<T: Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => s,
        _ => "?".to_string(),
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for job in &self.jobs {
            let state = if job.stopped { " stopped" } else { "" };
            writeln!(f, "job {}/{} v{}{}", job.namespace, job.id, job.version, state)?;
            for alloc in &job.allocations {
                writeln!(
                    f,
                    "  {:<32} {:<20} v{:<3} {}/{}",
                    alloc.name,
                    alloc.node,
                    alloc.version,
                    status(&alloc.desired),
                    status(&alloc.client)
                )?;
            }
            for (group, metric) in &job.blocked {
                let queued = job.queued.get(group).copied().unwrap_or(0);
                write!(
                    f,
                    "  blocked {group}: {queued} queued, {} evaluated, {} filtered, {} exhausted",
                    metric.nodes_evaluated, metric.nodes_filtered, metric.nodes_exhausted
                )?;
                for (dimension, n) in &metric.dimension_exhausted {
                    write!(f, " [{dimension}={n}]")?;
                }
                for (constraint, n) in &metric.constraint_filtered {
                    write!(f, " [{constraint}: {n}]")?;
                }
                writeln!(f)?;
            }
        }
        write!(
            f,
            "broker ready={} pending={} inflight={}, blocked={} (escaped {})",
            self.stats.broker.ready,
            self.stats.broker.pending,
            self.stats.broker.inflight,
            self.stats.blocked.total,
            self.stats.blocked.escaped
        )
    }
}
