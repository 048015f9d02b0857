//! fleetgrid-state: fleet data model and state store for FleetGrid.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for jobs, nodes, allocations, evaluations, and deployments, plus
//! the resource model, typed constraint expressions, and plans shared by the
//! placement and scheduling crates.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Schedulers read through a [`StateSnapshot`] taken from one read
//! transaction and write only through [`StateStore::apply_plan`], which
//! re-checks every node's slice inside one write transaction.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod constraint;
pub mod error;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod plan;
pub mod resources;
pub mod snapshot;
pub mod store;
pub mod tables;
pub mod types;

pub use constraint::{Affinity, Constraint, ConstraintError, Operand, Spread, SpreadTarget, Target};
pub use error::{StateError, StateResult};
pub use plan::{DesiredUpdates, NodeRejection, Plan, PlanOutcome, PlanResult};
pub use resources::{AllocatedResources, Dimension, FitResult, Resources, allocs_fit, score_fit};
pub use snapshot::{State, StateSnapshot};
pub use store::StateStore;
pub use types::*;
