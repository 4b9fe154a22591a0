//! Join operator selection.
//!
//! Every join gets the cheapest strategy available to it:
//!
//! | Strategy   | Available when                                              |
//! |------------|-------------------------------------------------------------|
//! | NestedLoop | always                                                      |
//! | Hash       | an equi-key exists and the right input fits the hash budget |
//! | Merge      | both inputs arrive sorted on the first equi-key             |
//! | Lookup     | equi-keys bind the leading key of a right-table index       |
//!
//! Lookups are only planned for inner, left, semi and anti joins whose
//! right input is a plain scan, possibly under filters. Equal costs go to
//! the earlier strategy in [`STRATEGY_PREFERENCE`](crate::optimizer::STRATEGY_PREFERENCE).

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use log::debug;

use super::{base_scan, lookup_index, sorted_on, strip_dynamic, transform_up};
use crate::catalog::CatalogSnapshot;
use crate::optimizer::cost::preference_rank;
use crate::optimizer::rule::{RewriteRule, RuleContext, Transformed};
use crate::planner::{
    equi_key_pairs, Expr, IndexAccess, Join, JoinStrategy, JoinType, PlanError, PlanNode, PlanResult,
};

/// Join operator selection rule.
pub struct JoinOperatorSelection;

impl RewriteRule for JoinOperatorSelection {
    fn name(&self) -> &'static str {
        "JoinOperatorSelection"
    }

    fn rewrite(&self, plan: &Arc<PlanNode>, ctx: &RuleContext<'_>) -> PlanResult<Transformed> {
        let rewritten = transform_up(plan, &mut |node| {
            let chosen = match node.as_ref() {
                PlanNode::Join(join) => choose_strategy(join, ctx)?,
                _ => None,
            };
            Ok(chosen.unwrap_or(node))
        })?;
        Ok(Transformed::compare(plan, rewritten))
    }
}

/// The join rebuilt with its cheapest strategy, or `None` when it already
/// has it.
fn choose_strategy(join: &Join, ctx: &RuleContext<'_>) -> PlanResult<Option<Arc<PlanNode>>> {
    let right = strip_dynamic(join.right())?;
    let pairs = equi_key_pairs(join.condition(), join.left().schema().len());
    let outer = join.left().estimated_rows(ctx.snapshot);
    let inner = right.estimated_rows(ctx.snapshot);
    let model = &ctx.cost;

    let mut candidates = vec![(
        JoinStrategy::NestedLoop,
        model.join_cost(JoinStrategy::NestedLoop, outer, inner),
        Arc::clone(&right),
    )];
    if let Some(&(left_key, right_key)) = pairs.first() {
        if model.hash_fits(inner) {
            candidates.push((
                JoinStrategy::Hash,
                model.join_cost(JoinStrategy::Hash, outer, inner),
                Arc::clone(&right),
            ));
        }
        if sorted_on(join.left(), left_key, ctx.snapshot) && sorted_on(&right, right_key, ctx.snapshot) {
            candidates.push((
                JoinStrategy::Merge,
                model.join_cost(JoinStrategy::Merge, outer, inner),
                Arc::clone(&right),
            ));
        }
        let lookup_allowed = matches!(
            join.join_type(),
            JoinType::Inner | JoinType::Left | JoinType::Semi | JoinType::Anti
        );
        if lookup_allowed {
            if let Some(probe) = lookup_input(&right, &pairs, ctx.snapshot)? {
                candidates.push((
                    JoinStrategy::Lookup,
                    model.join_cost(JoinStrategy::Lookup, outer, inner),
                    probe,
                ));
            }
        }
    }

    let Some((strategy, cost, right)) = candidates
        .into_iter()
        .min_by_key(|(strategy, cost, _)| (*cost, preference_rank(*strategy)))
    else {
        return Ok(None);
    };
    if strategy == join.strategy() && right == *join.right() {
        return Ok(None);
    }

    debug!(
        "{} join over {:?}: {} -> {} (cost {})",
        join.join_type(),
        join.right().referenced_tables(),
        join.strategy(),
        strategy,
        cost
    );
    PlanNode::join(
        join.join_type(),
        Arc::clone(join.left()),
        right,
        join.condition().cloned(),
        strategy,
    )
    .map(Some)
}

/// `right` with its base scan turned into a per-row index probe keyed by
/// the left columns of `pairs`.
fn lookup_input(
    right: &Arc<PlanNode>,
    pairs: &[(usize, usize)],
    snapshot: &CatalogSnapshot,
) -> PlanResult<Option<Arc<PlanNode>>> {
    let Some(scan) = base_scan(right) else {
        return Ok(None);
    };
    if scan.access().is_some() {
        return Ok(None);
    }

    // table ordinal -> left column bound to it
    let mut bound = BTreeMap::new();
    for &(left, r) in pairs {
        if let Some(&ordinal) = scan.projection().get(r) {
            bound.entry(ordinal).or_insert(left);
        }
    }
    let ordinals: BTreeSet<usize> = bound.keys().copied().collect();
    let Some((index, prefix)) = lookup_index(scan, &ordinals, snapshot) else {
        return Ok(None);
    };

    let keys = index.key_columns[..prefix]
        .iter()
        .map(|o| bound.get(o).map(|&left| Expr::Column(left)))
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| PlanError::Internal(format!("lookup key of {} lost its binding", index.name)))?;
    let access = IndexAccess::dynamic(index.clone(), keys)?;
    let probe = PlanNode::table_scan(
        scan.table(),
        scan.columns().to_vec(),
        scan.projection().to_vec(),
        Some(access),
    )?;
    replace_base_scan(right, probe).map(Some)
}

fn replace_base_scan(node: &Arc<PlanNode>, scan: Arc<PlanNode>) -> PlanResult<Arc<PlanNode>> {
    match node.as_ref() {
        PlanNode::Filter(f) => PlanNode::filter(replace_base_scan(f.input(), scan)?, f.predicate().clone()),
        _ => Ok(scan),
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::*;
    use super::*;
    use crate::catalog::MemoryCatalog;
    use crate::optimizer::OptimizerConfig;

    fn apply_with(catalog: &MemoryCatalog, config: OptimizerConfig, plan: &Arc<PlanNode>) -> Transformed {
        let snapshot = snapshot(catalog);
        let ctx = RuleContext::new(&snapshot, &config);
        JoinOperatorSelection.rewrite(plan, &ctx).unwrap()
    }

    fn apply(catalog: &MemoryCatalog, plan: &Arc<PlanNode>) -> Transformed {
        apply_with(catalog, OptimizerConfig::default(), plan)
    }

    fn join(join_type: JoinType, left: Arc<PlanNode>, right: Arc<PlanNode>, condition: Expr) -> Arc<PlanNode> {
        PlanNode::join(join_type, left, right, Some(condition), JoinStrategy::NestedLoop).unwrap()
    }

    fn strategy(plan: &PlanNode) -> JoinStrategy {
        plan.as_join().map(|j| j.strategy()).expect("expected a join")
    }

    #[test]
    fn test_lookup_beats_hash_into_large_table() {
        let catalog = catalog();
        let plan = join(
            JoinType::Inner,
            scan(&catalog, "xy"),
            scan(&catalog, "uv"),
            Expr::eq(Expr::col(0), Expr::col(4)),
        );

        let result = apply(&catalog, &plan);
        assert_eq!(
            result.plan.to_string(),
            "Join: INNER Lookup ON (#0 = #4)\n  TableScan: xy [x, y, z, w]\n  TableScan: uv [u, v, r, s] index=PRIMARY[0] keys=[#0]\n"
        );
        result.plan.validate().unwrap();

        let again = apply(&catalog, &result.plan);
        assert!(!again.changed);
    }

    #[test]
    fn test_merge_wins_tie_with_hash() {
        let catalog = catalog();
        let plan = join(
            JoinType::Inner,
            scan(&catalog, "xy"),
            scan(&catalog, "xy"),
            Expr::eq(Expr::col(0), Expr::col(4)),
        );
        assert_eq!(strategy(&apply(&catalog, &plan).plan), JoinStrategy::Merge);
    }

    #[test]
    fn test_hash_without_order_or_index() {
        let catalog = catalog();
        let plan = join(
            JoinType::Inner,
            scan(&catalog, "xy"),
            scan(&catalog, "xy"),
            Expr::eq(Expr::col(1), Expr::col(5)),
        );
        assert_eq!(strategy(&apply(&catalog, &plan).plan), JoinStrategy::Hash);

        let tight = OptimizerConfig::default().with_hash_build_row_budget(10.0);
        let result = apply_with(&catalog, tight, &plan);
        assert!(!result.changed);
        assert_eq!(strategy(&result.plan), JoinStrategy::NestedLoop);
    }

    #[test]
    fn test_semi_join_probes_index_under_filter() {
        let catalog = catalog();
        let left = PlanNode::filter(scan(&catalog, "xy"), Expr::eq(Expr::col(1), Expr::int(5))).unwrap();
        let right = PlanNode::filter(scan(&catalog, "uv"), Expr::eq(Expr::col(2), Expr::int(1))).unwrap();
        let plan = join(JoinType::Semi, left, right, Expr::eq(Expr::col(4), Expr::col(0)));

        let result = apply(&catalog, &plan);
        assert_eq!(
            result.plan.to_string(),
            "Join: SEMI Lookup ON (#4 = #0)\n  Filter: (#1 = 5)\n    TableScan: xy [x, y, z, w]\n  Filter: (#2 = 1)\n    TableScan: uv [u, v, r, s] index=PRIMARY[0] keys=[#0]\n"
        );
    }

    #[test]
    fn test_right_join_never_probes() {
        let catalog = catalog();
        let plan = join(
            JoinType::Right,
            scan(&catalog, "xy"),
            scan(&catalog, "uv"),
            Expr::eq(Expr::col(0), Expr::col(4)),
        );
        assert_eq!(strategy(&apply(&catalog, &plan).plan), JoinStrategy::Merge);
    }

    #[test]
    fn test_secondary_index_probe() {
        let catalog = catalog();
        let plan = join(
            JoinType::Inner,
            scan(&catalog, "xy"),
            scan(&catalog, "uv"),
            Expr::eq(Expr::col(1), Expr::col(5)),
        );

        let result = apply(&catalog, &plan);
        let right = result.plan.as_join().map(|j| Arc::clone(j.right())).unwrap();
        assert_eq!(right.to_string(), "TableScan: uv [u, v, r, s] index=uv_v[1] keys=[#1]\n");
    }
}
