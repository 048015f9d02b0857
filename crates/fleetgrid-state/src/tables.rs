//! redb table definitions for the FleetGrid state store.
//!
//! Record tables use `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). Composite keys follow `{namespace}/{id}` or
//! `{namespace}/{id}@{version:020}` so that a key scan returns versions in order.

use redb::TableDefinition;

/// Latest job version keyed by `{namespace}/{job_id}`.
pub const JOBS: TableDefinition<&str, &[u8]> = TableDefinition::new("jobs");

/// Every job version keyed by `{namespace}/{job_id}@{version:020}`.
pub const JOB_VERSIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("job_versions");

/// Nodes keyed by `{node_id}`.
pub const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");

/// Allocations keyed by `{alloc_id}`.
pub const ALLOCS: TableDefinition<&str, &[u8]> = TableDefinition::new("allocs");

/// Evaluations keyed by `{eval_id}`.
pub const EVALS: TableDefinition<&str, &[u8]> = TableDefinition::new("evals");

/// Deployments keyed by `{deployment_id}`.
pub const DEPLOYMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("deployments");

/// Store-wide counters. `index` is bumped by every write transaction.
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

/// Key of the modify-index counter in [`META`].
pub const INDEX_KEY: &str = "index";
