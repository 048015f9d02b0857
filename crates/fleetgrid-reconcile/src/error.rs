//! Error types for reconciliation and deployment control.

use thiserror::Error;

/// Result type alias for reconciliation operations.
pub type ReconcileResult<T> = Result<T, ReconcileError>;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("unknown update policy: {0}")]
    UnknownPolicy(String),

    #[error("deployment {0} is not active")]
    DeploymentNotActive(String),

    #[error("deployment {id} has no canaries awaiting promotion in group {group}")]
    NothingToPromote { id: String, group: String },

    #[error("deployment {id} group {group}: {healthy} of {desired} canaries healthy")]
    UnhealthyCanaries {
        id: String,
        group: String,
        healthy: u32,
        desired: u32,
    },

    #[error("deployment {id} has no task group {group}")]
    UnknownGroup { id: String, group: String },
}
