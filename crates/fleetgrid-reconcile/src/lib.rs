//! FleetGrid reconciliation: desired versus actual allocations.
//!
//! Given a job and its existing allocations, decide what must be placed,
//! stopped, migrated, or updated, and drive the job's deployment. Nothing
//! here picks nodes (that's `fleetgrid-placement`) or writes state.
//!
//! # Components
//!
//! - **`diff`**: Per-group allocation diff
//! - **`reconciler`**: Job-level diff plus deployment bookkeeping
//! - **`update`**: In-place versus destructive update policies
//! - **`deployment`**: Deployment creation, health assessment, promotion

pub mod deployment;
pub mod diff;
pub mod error;
pub mod reconciler;
pub mod update;

pub use diff::{
    DestructiveUpdate, GroupDiff, GroupInput, Migration, PlaceRequest, StopRequest, TaintedNodes,
    diff_group, stop_all, tainted_nodes,
};
pub use error::{ReconcileError, ReconcileResult};
pub use reconciler::{ReconcileInput, Reconciliation, reconcile};
pub use update::{SpecChangePolicy, TaskChangePolicy, UpdateKind, UpdatePolicy, policy_by_name};
