//! Planning and optimization errors.

use thiserror::Error;

use crate::catalog::CatalogError;

/// Result type for planning operations.
pub type PlanResult<T> = Result<T, PlanError>;

/// Query planning errors.
#[derive(Debug, Clone, Error)]
pub enum PlanError {
    /// A plan node violates a structural invariant.
    #[error("malformed plan: {0}")]
    MalformedPlan(String),

    /// No index applies to a scan's predicates.
    #[error("no usable index on table {table}")]
    UnresolvableIndexChoice { table: String },

    /// A correlated subquery cannot be rewritten without changing results.
    #[error("decorrelation unsafe: {0}")]
    DecorrelationUnsafe(String),

    /// Too many relations for exhaustive join enumeration.
    #[error("join order search over {relations} relations exceeds the limit of {limit}")]
    JoinOrderExplosionGuard { relations: usize, limit: usize },

    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("invalid optimizer configuration: {0}")]
    InvalidConfig(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl PlanError {
    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        PlanError::MalformedPlan(msg.into())
    }

    /// Whether a rule may recover from this error locally, leaving the
    /// affected subtree as it was.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PlanError::UnresolvableIndexChoice { .. }
                | PlanError::DecorrelationUnsafe(_)
                | PlanError::JoinOrderExplosionGuard { .. }
        )
    }
}
