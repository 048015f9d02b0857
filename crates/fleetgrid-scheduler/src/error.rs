//! Scheduler error types.

use fleetgrid_state::EvalStatus;
use thiserror::Error;

/// Errors that can occur while scheduling.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("evaluation not found: {0}")]
    EvalNotFound(String),

    #[error("deployment not found: {0}")]
    DeploymentNotFound(String),

    #[error("evaluation {eval}: illegal transition {from:?} -> {to:?}")]
    InvalidTransition {
        eval: String,
        from: EvalStatus,
        to: EvalStatus,
    },

    #[error("evaluation not in flight: {0}")]
    NotInflight(String),

    #[error("plan queue closed")]
    PlanQueueClosed,

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state store error: {0}")]
    State(#[from] fleetgrid_state::StateError),

    #[error("reconcile error: {0}")]
    Reconcile(#[from] fleetgrid_reconcile::ReconcileError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
