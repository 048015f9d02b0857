//! Scenario files: the nodes to register, the jobs to submit, and the
//! cluster events to replay once the initial placement has settled.
//!
//! ```toml
//! [[nodes]]
//! id = "node-1"
//! datacenter = "dc1"
//! status = "ready"
//! attributes = { "kernel.name" = "linux" }
//! drivers = { exec = { detected = true, healthy = true } }
//! resources = { cpu = 4000, memory_mb = 8192 }
//!
//! [[jobs]]
//! id = "web"
//! datacenters = ["dc1"]
//!
//! [[jobs.task_groups]]
//! name = "web"
//! count = 3
//!
//! [[jobs.task_groups.tasks]]
//! name = "server"
//! driver = "exec"
//! resources = { cpu = 500, memory_mb = 256 }
//!
//! [[events]]
//! action = "drain_node"
//! node = "node-1"
//! ```

use std::path::Path;

use anyhow::{Context, anyhow, bail};
use fleetgrid_scheduler::Service;
use fleetgrid_state::{AllocClientStatus, EvalId, Job, Node, NodeStatus};
use serde::Deserialize;
use tracing::info;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Scenario {
    pub nodes: Vec<Node>,
    pub jobs: Vec<Job>,
    pub events: Vec<Event>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Event {
    /// Migrate every allocation off a node.
    DrainNode { node: String },
    /// Mark a node down; its allocations are lost and replaced.
    NodeDown { node: String },
    /// Report the allocation at `index` of a job as failed on its client.
    FailAlloc {
        job: String,
        #[serde(default = "default_namespace")]
        namespace: String,
        #[serde(default)]
        group: Option<String>,
        index: u32,
    },
    /// Stop a job.
    Deregister {
        job: String,
        #[serde(default = "default_namespace")]
        namespace: String,
    },
}

fn default_namespace() -> String {
    "default".to_string()
}

impl Scenario {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("read scenario {}", path.display()))?;
        Self::from_toml_str(&content).with_context(|| format!("parse scenario {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let scenario: Scenario = toml::from_str(content)?;
        scenario.validate()?;
        Ok(scenario)
    }

    fn validate(&self) -> anyhow::Result<()> {
        for job in &self.jobs {
            job.validate().map_err(|reason| anyhow!("job {}: {reason}", job.id))?;
        }
        for event in &self.events {
            if let Event::DrainNode { node } | Event::NodeDown { node } = event {
                if !self.nodes.iter().any(|n| &n.id == node) {
                    bail!("event references unknown node {node}");
                }
            }
        }
        Ok(())
    }

    /// Register every node, then submit every job.
    pub async fn load(&self, service: &Service) -> anyhow::Result<Vec<EvalId>> {
        for node in &self.nodes {
            service.upsert_node(node).await?;
        }
        info!(nodes = self.nodes.len(), "nodes registered");

        let mut evals = Vec::with_capacity(self.jobs.len());
        for job in &self.jobs {
            let (job, eval_id) = service.register_job(job).await?;
            info!(job = %job.id, version = job.version, eval = %eval_id, "job registered");
            evals.push(eval_id);
        }
        Ok(evals)
    }
}

impl Event {
    pub async fn apply(&self, service: &Service) -> anyhow::Result<Vec<EvalId>> {
        info!(event = ?self, "applying event");
        match self {
            Event::DrainNode { node } => Ok(service.drain_node(node).await?),
            Event::NodeDown { node } => {
                let (_, evals) = service.update_node_status(node, NodeStatus::Down).await?;
                Ok(evals)
            }
            Event::FailAlloc {
                job,
                namespace,
                group,
                index,
            } => {
                let allocs = service.store().allocs_by_job(namespace, job)?;
                let Some(alloc) = allocs.into_iter().find(|a| {
                    !a.terminal_status()
                        && a.index == *index
                        && group.as_ref().is_none_or(|g| &a.task_group == g)
                }) else {
                    bail!("no live allocation {index} for job {namespace}/{job}");
                };
                service
                    .update_alloc_client_status(
                        &alloc.id,
                        AllocClientStatus::Failed,
                        "failed by scenario",
                    )
                    .await?;
                Ok(Vec::new())
            }
            Event::Deregister { job, namespace } => {
                Ok(vec![service.deregister_job(namespace, job).await?])
            }
        }
    }
}
