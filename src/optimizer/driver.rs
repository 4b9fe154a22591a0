//! The optimizer driver.
//!
//! Rules run in a fixed order. Each rule is re-applied until it reports no
//! change or hits `max_rule_iterations`, and the pipeline repeats until a
//! whole pass changes nothing or `max_pipeline_passes` is reached.
//!
//! A rule failure never aborts the query: the driver logs it and returns the
//! last plan that passed validation. Only a malformed input plan is reported
//! to the caller.

use std::sync::Arc;

use log::{debug, trace, warn};

use super::config::OptimizerConfig;
use super::rule::{OptimizedPlan, RewriteRule, RuleContext, RuleTrace};
use super::rules::{
    JoinOperatorSelection, JoinOrderSelection, PredicatePushdown, ProjectionPruning, SubqueryDecorrelation,
};
use crate::catalog::{CatalogProvider, CatalogSnapshot};
use crate::planner::{PlanError, PlanNode, PlanResult};

/// Cost-aware plan rewriter.
pub struct Optimizer {
    catalog: Arc<dyn CatalogProvider>,
    /// The rules to apply (in order).
    rules: Vec<Box<dyn RewriteRule>>,
    config: OptimizerConfig,
}

impl Optimizer {
    /// Optimizer with the default rule pipeline and configuration.
    pub fn new(catalog: Arc<dyn CatalogProvider>) -> Self {
        Self {
            catalog,
            rules: default_rules(),
            config: OptimizerConfig::default(),
        }
    }

    /// Optimizer with the default rule pipeline and a custom configuration.
    pub fn with_config(catalog: Arc<dyn CatalogProvider>, config: OptimizerConfig) -> PlanResult<Self> {
        config.validate()?;
        Ok(Self {
            catalog,
            rules: default_rules(),
            config,
        })
    }

    /// Append a rule to the end of the pipeline.
    pub fn add_rule<R: RewriteRule + 'static>(&mut self, rule: R) {
        self.rules.push(Box::new(rule));
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Names of the pipeline's rules, in order.
    pub fn rule_names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    /// Optimize a plan.
    pub fn optimize(&self, plan: &Arc<PlanNode>) -> PlanResult<Arc<PlanNode>> {
        Ok(self.optimize_with_report(plan)?.plan)
    }

    /// Optimize a plan and report what the pipeline did.
    pub fn optimize_with_report(&self, plan: &Arc<PlanNode>) -> PlanResult<OptimizedPlan> {
        plan.validate()?;

        let mut report = OptimizedPlan::new(Arc::clone(plan));
        let tables = plan.referenced_tables();
        let snapshot = match CatalogSnapshot::capture(self.catalog.as_ref(), tables.iter().map(String::as_str)) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Catalog snapshot failed, returning the plan unoptimized: {}", e);
                report.fallback = Some(e.into());
                return Ok(report);
            }
        };
        let ctx = RuleContext::new(&snapshot, &self.config);

        let mut current = Arc::clone(plan);
        'passes: loop {
            if report.iterations >= self.config.max_pipeline_passes {
                debug!(
                    "Optimizer reached max pipeline passes ({}), stopping",
                    self.config.max_pipeline_passes
                );
                break;
            }
            report.iterations += 1;
            let mut changed_this_pass = false;

            for rule in &self.rules {
                for round in 0..self.config.max_rule_iterations {
                    let result = rule
                        .rewrite(&current, &ctx)
                        .and_then(|t| if t.changed { check_output(plan, &t.plan).map(|_| t) } else { Ok(t) });
                    let transformed = match result {
                        Ok(t) => t,
                        Err(e) => {
                            warn!(
                                "Rule '{}' failed in pass {}, keeping the last valid plan: {}",
                                rule.name(),
                                report.iterations,
                                e
                            );
                            report.fallback = Some(e);
                            break 'passes;
                        }
                    };
                    if !transformed.changed {
                        break;
                    }

                    changed_this_pass = true;
                    report.rules_applied += 1;
                    debug!(
                        "Rule '{}' applied in pass {} (round {})",
                        rule.name(),
                        report.iterations,
                        round + 1
                    );
                    trace!("Plan after '{}':\n{}", rule.name(), transformed.plan);
                    if self.config.enable_trace {
                        report
                            .trace
                            .push(RuleTrace::new(rule.name(), current.to_string(), transformed.plan.to_string()));
                    }
                    current = transformed.plan;
                }
            }

            if !changed_this_pass {
                debug!("No changes in pass {}, reached fixpoint", report.iterations);
                break;
            }
        }

        report.plan = current;
        Ok(report)
    }
}

fn default_rules() -> Vec<Box<dyn RewriteRule>> {
    vec![
        Box::new(ProjectionPruning),
        Box::new(PredicatePushdown),
        Box::new(SubqueryDecorrelation),
        Box::new(JoinOrderSelection),
        Box::new(JoinOperatorSelection),
    ]
}

/// A rule output must be a valid plan with the input's output shape.
fn check_output(original: &PlanNode, rewritten: &PlanNode) -> PlanResult<()> {
    rewritten.validate()?;
    let before = original.schema();
    let after = rewritten.schema();
    let same_shape = before.len() == after.len()
        && before
            .fields()
            .iter()
            .zip(after.fields())
            .all(|(a, b)| a.name == b.name && a.data_type == b.data_type && a.nullable == b.nullable);
    if !same_shape {
        return Err(PlanError::malformed(format!(
            "rewrite changed the output schema from {} to {}",
            before, after
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{DataType, MemoryCatalog, SchemaBuilder};
    use crate::optimizer::rule::Transformed;
    use crate::planner::{Expr, IndexLookup, JoinStrategy, JoinType};

    fn catalog() -> Arc<MemoryCatalog> {
        let catalog = MemoryCatalog::new();
        catalog
            .create_table(
                SchemaBuilder::new("xy")
                    .add_required_column("x", DataType::Integer)
                    .add_column("y", DataType::Integer)
                    .primary_key(&["x"])
                    .build()
                    .unwrap(),
            )
            .unwrap();
        catalog.set_row_count("xy", 1000.0).unwrap();
        Arc::new(catalog)
    }

    fn xy_scan(catalog: &MemoryCatalog) -> Arc<PlanNode> {
        PlanNode::scan(&catalog.schema("xy").unwrap()).unwrap()
    }

    /// Replaces the plan with one that has a different shape.
    struct BrokenRule;

    impl RewriteRule for BrokenRule {
        fn name(&self) -> &'static str {
            "Broken"
        }

        fn rewrite(&self, plan: &Arc<PlanNode>, _ctx: &RuleContext<'_>) -> PlanResult<Transformed> {
            Ok(Transformed::yes(PlanNode::project_columns(Arc::clone(plan), &[0])?))
        }
    }

    /// Turns an inner join into a left join, making its right side nullable.
    struct OuterJoinRule;

    impl RewriteRule for OuterJoinRule {
        fn name(&self) -> &'static str {
            "OuterJoin"
        }

        fn rewrite(&self, plan: &Arc<PlanNode>, _ctx: &RuleContext<'_>) -> PlanResult<Transformed> {
            match plan.as_join() {
                Some(j) if j.join_type() == JoinType::Inner => Ok(Transformed::yes(PlanNode::join(
                    JoinType::Left,
                    Arc::clone(j.left()),
                    Arc::clone(j.right()),
                    j.condition().cloned(),
                    JoinStrategy::NestedLoop,
                )?)),
                _ => Ok(Transformed::no(Arc::clone(plan))),
            }
        }
    }

    /// Always fails.
    struct FailingRule;

    impl RewriteRule for FailingRule {
        fn name(&self) -> &'static str {
            "Failing"
        }

        fn rewrite(&self, _plan: &Arc<PlanNode>, _ctx: &RuleContext<'_>) -> PlanResult<Transformed> {
            Err(PlanError::Internal("boom".into()))
        }
    }

    #[test]
    fn test_default_pipeline_order() {
        let optimizer = Optimizer::new(catalog());
        assert_eq!(
            optimizer.rule_names(),
            vec![
                "ProjectionPruning",
                "PredicatePushdown",
                "SubqueryDecorrelation",
                "JoinOrderSelection",
                "JoinOperatorSelection"
            ]
        );
    }

    #[test]
    fn test_point_lookup_reaches_fixpoint() {
        let catalog = catalog();
        let plan = PlanNode::filter(xy_scan(&catalog), Expr::eq(Expr::col(0), Expr::int(1))).unwrap();
        let optimizer = Optimizer::with_config(catalog, OptimizerConfig::default().with_trace(true)).unwrap();

        let report = optimizer.optimize_with_report(&plan).unwrap();
        assert!(report.fallback.is_none());
        assert!(report.rules_applied >= 1);
        assert!(!report.trace.is_empty());
        let scan = report.plan.as_table_scan().expect("filter should be consumed");
        assert!(matches!(scan.access().map(|a| a.lookup()), Some(IndexLookup::Static { .. })));

        let again = optimizer.optimize(&report.plan).unwrap();
        assert_eq!(again, report.plan);
    }

    #[test]
    fn test_rule_changing_schema_falls_back() {
        let catalog = catalog();
        let plan = xy_scan(&catalog);
        let mut optimizer = Optimizer::new(catalog);
        optimizer.add_rule(BrokenRule);

        let report = optimizer.optimize_with_report(&plan).unwrap();
        assert!(matches!(report.fallback, Some(PlanError::MalformedPlan(_))));
        assert_eq!(report.plan.schema().len(), 2);
    }

    #[test]
    fn test_rule_changing_nullability_falls_back() {
        let catalog = catalog();
        let plan = PlanNode::join(
            JoinType::Inner,
            xy_scan(&catalog),
            xy_scan(&catalog),
            Some(Expr::eq(Expr::col(0), Expr::col(2))),
            JoinStrategy::NestedLoop,
        )
        .unwrap();
        let mut optimizer = Optimizer::new(catalog);
        optimizer.add_rule(OuterJoinRule);

        let report = optimizer.optimize_with_report(&plan).unwrap();
        assert!(matches!(report.fallback, Some(PlanError::MalformedPlan(_))));
        assert_eq!(report.plan.as_join().map(|j| j.join_type()), Some(JoinType::Inner));
        assert!(!report.plan.schema().field(2).unwrap().nullable);
    }

    #[test]
    fn test_rule_error_keeps_last_valid_plan() {
        let catalog = catalog();
        let plan = PlanNode::filter(xy_scan(&catalog), Expr::eq(Expr::col(0), Expr::int(1))).unwrap();
        let mut optimizer = Optimizer::new(catalog);
        optimizer.add_rule(FailingRule);

        let report = optimizer.optimize_with_report(&plan).unwrap();
        assert!(matches!(report.fallback, Some(PlanError::Internal(_))));
        // The built-in rules ran before the failing one.
        assert!(report.plan.as_table_scan().is_some());
    }

    #[test]
    fn test_missing_table_returns_input() {
        let catalog = catalog();
        let plan = xy_scan(&catalog);
        catalog.drop_table("xy").unwrap();

        let report = Optimizer::new(catalog).optimize_with_report(&plan).unwrap();
        assert!(matches!(report.fallback, Some(PlanError::Catalog(_))));
        assert!(Arc::ptr_eq(&report.plan, &plan));
    }

    #[test]
    fn test_malformed_input_is_an_error() {
        let catalog = catalog();
        let body = PlanNode::filter(xy_scan(&catalog), Expr::eq(Expr::col(0), Expr::outer(0))).unwrap();
        let result = Optimizer::new(catalog).optimize(&body);
        assert!(matches!(result, Err(PlanError::MalformedPlan(_))));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = Optimizer::with_config(catalog(), OptimizerConfig::default().with_lookup_cost_factor(0.5));
        assert!(matches!(result, Err(PlanError::InvalidConfig(_))));
    }
}
