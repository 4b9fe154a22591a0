//! Rewrite rule trait and the records the driver keeps about rule runs.

use std::sync::Arc;

use super::config::OptimizerConfig;
use super::cost::CostModel;
use crate::catalog::CatalogSnapshot;
use crate::planner::{PlanError, PlanNode, PlanResult};

/// Everything a rule may consult besides the plan.
pub struct RuleContext<'a> {
    pub snapshot: &'a CatalogSnapshot,
    pub config: &'a OptimizerConfig,
    pub cost: CostModel,
}

impl<'a> RuleContext<'a> {
    pub fn new(snapshot: &'a CatalogSnapshot, config: &'a OptimizerConfig) -> Self {
        Self {
            snapshot,
            config,
            cost: CostModel::new(config),
        }
    }
}

/// A single rewrite over a whole plan.
///
/// A rule must return a plan with the same output schema and the same rows
/// as its input. It reports whether it changed anything so the driver can
/// detect a fixpoint.
pub trait RewriteRule: Send + Sync {
    /// Get the name of this rule.
    fn name(&self) -> &'static str;

    /// Rewrite `plan`.
    fn rewrite(&self, plan: &Arc<PlanNode>, ctx: &RuleContext<'_>) -> PlanResult<Transformed>;
}

/// The result of applying a rewrite rule.
#[derive(Debug, Clone)]
pub struct Transformed {
    /// The (potentially transformed) plan.
    pub plan: Arc<PlanNode>,
    /// Whether the plan was actually changed.
    pub changed: bool,
}

impl Transformed {
    /// The plan was changed.
    pub fn yes(plan: Arc<PlanNode>) -> Self {
        Self { plan, changed: true }
    }

    /// The plan was left as it was.
    pub fn no(plan: Arc<PlanNode>) -> Self {
        Self { plan, changed: false }
    }

    /// Changed when `plan` differs structurally from `original`.
    pub fn compare(original: &Arc<PlanNode>, plan: Arc<PlanNode>) -> Self {
        let changed = !Arc::ptr_eq(original, &plan) && original.as_ref() != plan.as_ref();
        if changed {
            Self::yes(plan)
        } else {
            Self::no(Arc::clone(original))
        }
    }
}

/// A trace entry for a single rule application.
#[derive(Debug, Clone)]
pub struct RuleTrace {
    pub rule_name: String,
    /// Explain output before the rule ran.
    pub before: String,
    /// Explain output after the rule ran.
    pub after: String,
}

impl RuleTrace {
    pub fn new(rule_name: impl Into<String>, before: impl Into<String>, after: impl Into<String>) -> Self {
        Self {
            rule_name: rule_name.into(),
            before: before.into(),
            after: after.into(),
        }
    }
}

/// The result of optimization with bookkeeping.
#[derive(Debug, Clone)]
pub struct OptimizedPlan {
    /// The final plan.
    pub plan: Arc<PlanNode>,
    /// Pipeline passes performed.
    pub iterations: usize,
    /// Rule applications that changed the plan.
    pub rules_applied: usize,
    /// Before/after record of each change (when tracing is enabled).
    pub trace: Vec<RuleTrace>,
    /// The error the engine recovered from by returning the last valid plan.
    pub fallback: Option<PlanError>,
}

impl OptimizedPlan {
    pub fn new(plan: Arc<PlanNode>) -> Self {
        Self {
            plan,
            iterations: 0,
            rules_applied: 0,
            trace: Vec::new(),
            fallback: None,
        }
    }
}
