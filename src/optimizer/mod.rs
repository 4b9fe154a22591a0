//! Cost-aware rewriting of logical plans.
//!
//! The [`Optimizer`] runs a fixed pipeline of [`RewriteRule`]s to a
//! fixpoint against a [`CatalogSnapshot`](crate::catalog::CatalogSnapshot)
//! taken once per query. Every rule preserves the plan's output schema and
//! its rows; they differ only in how cheaply the plan can be executed.

mod config;
mod cost;
mod driver;
mod rule;
pub mod rules;

pub use config::{OptimizerConfig, MAX_EXHAUSTIVE_JOIN_RELATIONS};
pub use cost::{preference_rank, Cost, CostModel, STRATEGY_PREFERENCE};
pub use driver::Optimizer;
pub use rule::{OptimizedPlan, RewriteRule, RuleContext, RuleTrace, Transformed};
pub use rules::{
    JoinOperatorSelection, JoinOrderSelection, PredicatePushdown, ProjectionPruning, SubqueryDecorrelation,
};
