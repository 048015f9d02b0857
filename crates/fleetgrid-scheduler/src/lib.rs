//! fleetgrid-scheduler: evaluation processing for FleetGrid.
//!
//! Evaluations flow through a broker to a pool of workers. Each worker runs
//! the [`GenericScheduler`] against a state snapshot and submits the
//! resulting plan to a single applier task, which commits it through the
//! store's plan gate.
//!
//! # Architecture
//!
//! ```text
//! Service
//!   ├── EvalBroker (priority queue, one evaluation per job in flight)
//!   ├── BlockedEvals (released on capacity changes)
//!   ├── Worker × num_workers
//!   │     └── GenericScheduler (snapshot → reconcile → place → plan)
//!   └── PlanApplier (serialized StateStore::apply_plan)
//! ```

pub mod blocked;
pub mod broker;
pub mod config;
pub mod error;
#[cfg(test)]
mod harness;
pub mod ids;
pub mod plan_apply;
pub mod planner;
pub mod scheduler;
pub mod service;
pub mod worker;

pub use blocked::{BlockOutcome, BlockedEvals, BlockedStats};
pub use broker::{BrokerStats, Delivery, EvalBroker, NackOutcome};
pub use config::{FleetConfig, PreemptionConfig, SchedulerConfig, StoreConfig};
pub use error::{SchedulerError, SchedulerResult};
pub use plan_apply::{CapacityListener, PlanApplier, PlanQueue};
pub use planner::Planner;
pub use scheduler::{EvalOutcome, GenericScheduler};
pub use service::{Service, ServiceStats};
