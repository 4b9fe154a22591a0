//! Predicate pushdown and index selection.
//!
//! Filter conjuncts travel down the tree as far as they legally can. Once
//! they reach a scan without an index access, the sargable ones are turned
//! into key ranges over the best matching index and removed; whatever is
//! left stays as a residual filter right above the scan.
//!
//! # Legal When
//!
//! - Through `Project` only when every referenced item is a plain column
//! - Through joins only into a side whose rows the join does not preserve
//!   regardless of the predicate
//! - Never through `GroupBy`, `Limit` or a derived-table subquery
//! - Conjuncts reading the outer scope stay put until decorrelation

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use log::debug;

use super::{map_subquery_body, with_filter};
use crate::catalog::{clamp_selectivity, Statistics};
use crate::optimizer::cost::Cost;
use crate::optimizer::rule::{RewriteRule, RuleContext, Transformed};
use crate::planner::{
    analyze_sargable, key_range_selectivity, ColumnRange, Expr, IndexAccess, JoinType, KeyRange, PlanError,
    PlanNode, PlanResult, ProjectItem, RangeSet, TableScan,
};

/// Predicate pushdown rule.
pub struct PredicatePushdown;

impl RewriteRule for PredicatePushdown {
    fn name(&self) -> &'static str {
        "PredicatePushdown"
    }

    fn rewrite(&self, plan: &Arc<PlanNode>, ctx: &RuleContext<'_>) -> PlanResult<Transformed> {
        let pushed = push(plan, Vec::new(), ctx)?;
        Ok(Transformed::compare(plan, pushed))
    }
}

/// Which join input a conjunct reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Left,
    Right,
    Both,
    /// Reads no input column, or reads the outer scope.
    Pinned,
}

fn side_of(expr: &Expr, left_width: usize) -> Side {
    let refs = expr.column_refs();
    if refs.is_empty() || !expr.outer_refs().is_empty() {
        Side::Pinned
    } else if refs.iter().all(|&c| c < left_width) {
        Side::Left
    } else if refs.iter().all(|&c| c >= left_width) {
        Side::Right
    } else {
        Side::Both
    }
}

/// Whether a conjunct may leave the node it was written at.
fn movable(expr: &Expr) -> bool {
    expr.outer_refs().is_empty() && !expr.column_refs().is_empty()
}

/// Optimize the bodies of the subqueries embedded in `expr` on their own.
fn push_into_subqueries(expr: &Expr, ctx: &RuleContext<'_>) -> PlanResult<Expr> {
    if !expr.contains_subquery() {
        return Ok(expr.clone());
    }
    expr.map_subqueries(&mut |_, sq| map_subquery_body(sq, &mut |body| push(body, Vec::new(), ctx)))
}

/// Rebuild `node` with `preds` (over its output) applied as deep as legal.
fn push(node: &Arc<PlanNode>, preds: Vec<Expr>, ctx: &RuleContext<'_>) -> PlanResult<Arc<PlanNode>> {
    match node.as_ref() {
        PlanNode::TableScan(scan) => {
            if preds.is_empty() || scan.access().is_some() {
                return with_filter(Arc::clone(node), preds);
            }
            match select_index(scan, &preds, ctx) {
                Ok(Some((access, residual))) => {
                    let indexed = PlanNode::table_scan(
                        scan.table(),
                        scan.columns().to_vec(),
                        scan.projection().to_vec(),
                        Some(access),
                    )?;
                    with_filter(indexed, residual)
                }
                Ok(None) => with_filter(Arc::clone(node), preds),
                Err(e) if e.is_recoverable() => {
                    debug!("{}; keeping a filter over the full scan", e);
                    with_filter(Arc::clone(node), preds)
                }
                Err(e) => Err(e),
            }
        }
        PlanNode::Filter(f) => {
            let mut down = preds;
            let mut stay = Vec::new();
            for conjunct in push_into_subqueries(f.predicate(), ctx)?.conjuncts() {
                if movable(&conjunct) {
                    down.push(conjunct);
                } else {
                    stay.push(conjunct);
                }
            }
            let input = push(f.input(), down, ctx)?;
            with_filter(input, stay)
        }
        PlanNode::Project(p) => {
            let source = |c: usize| match p.items().get(c).map(|i| &i.expr) {
                Some(Expr::Column(i)) => Some(*i),
                _ => None,
            };
            let mut down = Vec::new();
            let mut stay = Vec::new();
            for pred in preds {
                if pred.column_refs().iter().all(|&c| source(c).is_some()) {
                    down.push(pred.remap_columns(&source)?);
                } else {
                    stay.push(pred);
                }
            }
            let input = push(p.input(), down, ctx)?;
            let items = p
                .items()
                .iter()
                .map(|i| Ok(ProjectItem::new(push_into_subqueries(&i.expr, ctx)?, i.alias.clone())))
                .collect::<PlanResult<Vec<_>>>()?;
            with_filter(PlanNode::project(input, items)?, stay)
        }
        PlanNode::Join(j) => {
            let lw = j.left().schema().len();
            let join_type = j.join_type();
            let mut left = Vec::new();
            let mut right = Vec::new();
            let mut condition = Vec::new();
            let mut above = Vec::new();

            if let Some(c) = j.condition() {
                for conjunct in push_into_subqueries(c, ctx)?.conjuncts() {
                    match (join_type, side_of(&conjunct, lw)) {
                        (JoinType::Inner | JoinType::Semi | JoinType::Right, Side::Left) => left.push(conjunct),
                        (JoinType::Inner | JoinType::Semi | JoinType::Left | JoinType::Anti, Side::Right) => {
                            right.push(conjunct)
                        }
                        _ => condition.push(conjunct),
                    }
                }
            }
            for pred in preds {
                match (join_type, side_of(&pred, lw)) {
                    // Only the left columns are visible above these.
                    (JoinType::Semi | JoinType::Anti, _) => left.push(pred),
                    (JoinType::Inner | JoinType::Cross | JoinType::Left, Side::Left) => left.push(pred),
                    (JoinType::Inner | JoinType::Cross | JoinType::Right, Side::Right) => right.push(pred),
                    (JoinType::Inner | JoinType::Cross, Side::Both) => condition.push(pred),
                    _ => above.push(pred),
                }
            }

            let right = right
                .into_iter()
                .map(|p| p.remap_columns(&|c| c.checked_sub(lw)))
                .collect::<PlanResult<Vec<_>>>()?;
            let new_left = push(j.left(), left, ctx)?;
            let new_right = push(j.right(), right, ctx)?;
            let join_type = if join_type == JoinType::Cross && !condition.is_empty() {
                JoinType::Inner
            } else {
                join_type
            };
            let joined = PlanNode::join(
                join_type,
                new_left,
                new_right,
                Expr::conjunction(condition),
                j.strategy(),
            )?;
            with_filter(joined, above)
        }
        PlanNode::Subquery(_) => {
            let rebuilt = map_subquery_body(node, &mut |body| push(body, Vec::new(), ctx))?;
            with_filter(rebuilt, preds)
        }
        PlanNode::GroupBy(g) => {
            let input = push(g.input(), Vec::new(), ctx)?;
            let rebuilt = node.rebuild_exprs(vec![input], &mut |e| push_into_subqueries(e, ctx))?;
            with_filter(rebuilt, preds)
        }
        PlanNode::Sort(s) => PlanNode::sort(push(s.input(), preds, ctx)?, s.order().to_vec()),
        PlanNode::Limit(l) => {
            let input = push(l.input(), Vec::new(), ctx)?;
            with_filter(PlanNode::limit(input, l.limit(), l.offset())?, preds)
        }
    }
}

/// A usable index and how many rows it reads.
struct Candidate {
    access: IndexAccess,
    covering: bool,
    rows: f64,
    /// Declaration position.
    order: usize,
}

/// Choose an index for `preds` over `scan`.
///
/// Returns `None` when no conjunct is sargable, the chosen access plus the
/// residual conjuncts otherwise, and `UnresolvableIndexChoice` when
/// sargable conjuncts exist but no index is worth using.
fn select_index(
    scan: &TableScan,
    preds: &[Expr],
    ctx: &RuleContext<'_>,
) -> PlanResult<Option<(IndexAccess, Vec<Expr>)>> {
    let mut sets: BTreeMap<usize, RangeSet> = BTreeMap::new();
    let mut pred_columns = Vec::with_capacity(preds.len());
    for pred in preds {
        let ordinal = analyze_sargable(pred, scan.schema()).and_then(|cp| {
            let ordinal = *scan.projection().get(cp.column)?;
            let set = sets.entry(ordinal).or_insert_with(RangeSet::full);
            *set = set.intersect(&cp.ranges);
            Some(ordinal)
        });
        pred_columns.push(ordinal);
    }
    if sets.is_empty() {
        return Ok(None);
    }

    let table = scan.table();
    let table_rows = ctx.snapshot.row_count(table);
    let width = scan.columns().len();
    let primary_key = ctx
        .snapshot
        .schema(table)
        .map(|s| s.primary_key().to_vec())
        .unwrap_or_default();
    let needed: BTreeSet<usize> = scan.projection().iter().copied().collect();

    let mut candidates = Vec::new();
    for (order, index) in ctx.snapshot.indexes(table).iter().enumerate() {
        if index.key_columns.iter().any(|&c| c >= width) {
            continue;
        }
        let mut prefix: Vec<&RangeSet> = Vec::new();
        for column in &index.key_columns {
            let Some(set) = sets.get(column) else { break };
            prefix.push(set);
            if !set.is_points() {
                break;
            }
        }
        while !prefix.is_empty() && box_count(&prefix) > ctx.config.max_range_boxes {
            prefix.pop();
        }
        if prefix.is_empty() {
            continue;
        }

        let boxes = cross_product(&prefix);
        let key_columns = index.leading_columns(prefix.len());
        let selectivity: f64 = boxes
            .iter()
            .map(|b| key_range_selectivity(table, key_columns, b, ctx.snapshot))
            .sum();
        let rows = table_rows * clamp_selectivity(selectivity);
        let covering = index.covers(&needed, width, &primary_key);
        if !covering && ctx.cost.index_scan_cost(rows, false) >= Cost(table_rows) {
            debug!(
                "Index {} on {} declined: {:.1} rows through lookups cost more than a full scan of {:.1}",
                index.name, table, rows, table_rows
            );
            continue;
        }

        candidates.push(Candidate {
            access: IndexAccess::static_ranges(index.clone(), prefix.len(), boxes)?,
            covering,
            rows,
            order,
        });
    }

    let best = candidates
        .into_iter()
        .min_by_key(|c| (!c.covering, Reverse(c.access.prefix_len()), Cost(c.rows), c.order))
        .ok_or_else(|| PlanError::UnresolvableIndexChoice {
            table: table.to_string(),
        })?;
    debug!(
        "Index {} chosen for {} (covering: {}, estimated rows: {:.1})",
        best.access.index().name,
        table,
        best.covering,
        best.rows
    );

    let consumed: BTreeSet<usize> = best.access.key_columns().iter().copied().collect();
    let residual = preds
        .iter()
        .zip(&pred_columns)
        .filter(|(_, ordinal)| !matches!(ordinal, Some(o) if consumed.contains(o)))
        .map(|(p, _)| p.clone())
        .collect();
    Ok(Some((best.access, residual)))
}

fn box_count(sets: &[&RangeSet]) -> usize {
    sets.iter().fold(1usize, |n, s| n.saturating_mul(s.len()))
}

/// Every combination of one range per column, in key order.
fn cross_product(sets: &[&RangeSet]) -> Vec<KeyRange> {
    let mut boxes: Vec<Vec<ColumnRange>> = vec![Vec::new()];
    for set in sets {
        boxes = boxes
            .iter()
            .flat_map(|prefix| {
                set.ranges().iter().map(move |r| {
                    let mut b = prefix.clone();
                    b.push(r.clone());
                    b
                })
            })
            .collect();
    }
    boxes.into_iter().map(KeyRange::new).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogProvider, DataType, MemoryCatalog, PredicateShape, SchemaBuilder};
    use crate::optimizer::rules::test_util::*;
    use crate::optimizer::OptimizerConfig;
    use crate::planner::{BinaryOperator, IndexLookup, JoinStrategy};

    fn run_with(catalog: &MemoryCatalog, plan: &Arc<PlanNode>, config: OptimizerConfig) -> Arc<PlanNode> {
        let snapshot = snapshot(catalog);
        let ctx = RuleContext::new(&snapshot, &config);
        PredicatePushdown.rewrite(plan, &ctx).unwrap().plan
    }

    fn run(catalog: &MemoryCatalog, plan: &Arc<PlanNode>) -> Arc<PlanNode> {
        run_with(catalog, plan, OptimizerConfig::default())
    }

    fn ranges(node: &PlanNode) -> (String, Vec<KeyRange>) {
        let scan = super::super::base_scan(node).expect("scan");
        let access = scan.access().expect("index access");
        match access.lookup() {
            IndexLookup::Static { ranges } => (access.index().name.clone(), ranges.clone()),
            other => panic!("unexpected lookup {:?}", other),
        }
    }

    fn gt(column: usize, value: i64) -> Expr {
        Expr::binary(Expr::col(column), BinaryOperator::Gt, Expr::int(value))
    }

    #[test]
    fn test_point_predicate_becomes_primary_lookup() {
        let catalog = catalog();
        let plan = PlanNode::filter(scan(&catalog, "xy"), Expr::eq(Expr::col(0), Expr::int(1))).unwrap();

        let result = run(&catalog, &plan);
        assert!(result.as_table_scan().is_some(), "filter should be consumed: {}", result);
        assert_eq!(result.to_string(), "TableScan: xy [x, y, z, w] index=PRIMARY[0] ranges=[{[1]}]\n");
    }

    #[test]
    fn test_residual_filter_kept() {
        let catalog = catalog();
        let pred = Expr::and(Expr::eq(Expr::col(0), Expr::int(1)), Expr::eq(Expr::col(1), Expr::col(2)));
        let plan = PlanNode::filter(scan(&catalog, "xy"), pred).unwrap();

        let result = run(&catalog, &plan);
        assert_eq!(
            result.to_string(),
            "Filter: (#1 = #2)\n  TableScan: xy [x, y, z, w] index=PRIMARY[0] ranges=[{[1]}]\n"
        );
    }

    #[test]
    fn test_disjunction_unions_ranges() {
        let catalog = catalog();
        let pred = Expr::or(Expr::eq(Expr::col(0), Expr::int(3)), Expr::eq(Expr::col(0), Expr::int(1)));
        let plan = PlanNode::filter(scan(&catalog, "xy"), pred).unwrap();

        let (index, boxes) = ranges(&run(&catalog, &plan));
        assert_eq!(index, "PRIMARY");
        let shown: Vec<String> = boxes.iter().map(|b| b.to_string()).collect();
        assert_eq!(shown, vec!["{[1]}", "{[3]}"]);
    }

    #[test]
    fn test_through_project_and_into_join_sides() {
        let catalog = catalog();
        let join = PlanNode::join(
            JoinType::Cross,
            scan(&catalog, "xy"),
            scan(&catalog, "uv"),
            None,
            JoinStrategy::NestedLoop,
        )
        .unwrap();
        let project = PlanNode::project_columns(join, &[0, 1, 4, 5]).unwrap();
        let pred = Expr::conjunction(vec![
            Expr::eq(Expr::col(0), Expr::int(7)),
            Expr::eq(Expr::col(3), Expr::int(2)),
            Expr::eq(Expr::col(1), Expr::col(2)),
        ])
        .unwrap();
        let plan = PlanNode::filter(project, pred).unwrap();

        let result = run(&catalog, &plan);
        assert_eq!(
            result.to_string(),
            "Project: [#0 AS x, #1 AS y, #4 AS u, #5 AS v]\n  Join: INNER NestedLoop ON (#1 = #4)\n    TableScan: xy [x, y, z, w] index=PRIMARY[0] ranges=[{[7]}]\n    TableScan: uv [u, v, r, s] index=uv_v[1] ranges=[{[2]}]\n"
        );
    }

    #[test]
    fn test_computed_project_item_blocks_pushdown() {
        let catalog = catalog();
        let project = PlanNode::project(
            scan(&catalog, "xy"),
            vec![ProjectItem::new(
                Expr::binary(Expr::col(0), BinaryOperator::Plus, Expr::int(1)),
                "x1",
            )],
        )
        .unwrap();
        let plan = PlanNode::filter(project, Expr::eq(Expr::col(0), Expr::int(2))).unwrap();
        assert_eq!(run(&catalog, &plan), plan);
    }

    #[test]
    fn test_left_join_keeps_right_predicate_above() {
        let catalog = catalog();
        let join = PlanNode::join(
            JoinType::Left,
            scan(&catalog, "xy"),
            scan(&catalog, "uv"),
            Some(Expr::and(Expr::eq(Expr::col(1), Expr::col(4)), Expr::eq(Expr::col(5), Expr::int(3)))),
            JoinStrategy::NestedLoop,
        )
        .unwrap();
        let pred = Expr::and(Expr::eq(Expr::col(0), Expr::int(1)), Expr::is_null(Expr::col(4), false));
        let plan = PlanNode::filter(join, pred).unwrap();

        let result = run(&catalog, &plan);
        assert_eq!(
            result.to_string(),
            "Filter: #4 IS NULL\n  Join: LEFT NestedLoop ON (#1 = #4)\n    TableScan: xy [x, y, z, w] index=PRIMARY[0] ranges=[{[1]}]\n    TableScan: uv [u, v, r, s] index=uv_v[1] ranges=[{[3]}]\n"
        );
    }

    #[test]
    fn test_non_selective_non_covering_index_declined() {
        let catalog = catalog();
        let plan = PlanNode::filter(scan(&catalog, "uv"), gt(1, 5)).unwrap();
        // 10000 / 3 rows, each paying a primary-key lookup, exceed a full scan.
        assert_eq!(run(&catalog, &plan), plan);

        // Reading only `u` and `v`, the same index covers the scan.
        let narrow = PlanNode::filter(scan_columns(&catalog, "uv", vec![0, 1]), gt(1, 5)).unwrap();
        let (index, _) = ranges(&run(&catalog, &narrow));
        assert_eq!(index, "uv_v");
    }

    #[test]
    fn test_covering_index_preferred() {
        let catalog = MemoryCatalog::new();
        catalog
            .create_table(
                SchemaBuilder::new("t")
                    .add_required_column("a", DataType::Integer)
                    .add_column("b", DataType::Integer)
                    .add_column("c", DataType::Integer)
                    .add_column("d", DataType::Integer)
                    .primary_key(&["a"])
                    .index("t_b", &["b"])
                    .covering_index("t_b_c", &["b"], &["c"])
                    .build()
                    .unwrap(),
            )
            .unwrap();
        catalog.set_row_count("t", 1000.0).unwrap();
        let scan = PlanNode::table_scan("t", catalog.schema("t").unwrap().columns, vec![1, 2], None).unwrap();
        let plan = PlanNode::filter(scan, Expr::eq(Expr::col(0), Expr::int(5))).unwrap();

        let (index, _) = ranges(&run(&catalog, &plan));
        assert_eq!(index, "t_b_c");
    }

    #[test]
    fn test_covering_index_beats_more_selective_plain_one() {
        let catalog = MemoryCatalog::new();
        catalog
            .create_table(
                SchemaBuilder::new("t")
                    .add_required_column("a", DataType::Integer)
                    .add_column("b", DataType::Integer)
                    .add_column("c", DataType::Integer)
                    .add_column("d", DataType::Integer)
                    .primary_key(&["a"])
                    .covering_index("t_b", &["b"], &["c", "d"])
                    .index("t_c", &["c"])
                    .build()
                    .unwrap(),
            )
            .unwrap();
        catalog.set_row_count("t", 10000.0).unwrap();
        catalog
            .set_selectivity("t", &["c"], PredicateShape::Equality, 0.001)
            .unwrap();
        let scan = PlanNode::table_scan("t", catalog.schema("t").unwrap().columns, vec![1, 2, 3], None).unwrap();
        let plan = PlanNode::filter(scan, Expr::and(gt(0, 5), Expr::eq(Expr::col(1), Expr::int(7)))).unwrap();

        // t_c reads ten rows but pays a lookup for each; t_b needs none.
        let result = run(&catalog, &plan);
        let (index, _) = ranges(&result);
        assert_eq!(index, "t_b");
        let PlanNode::Filter(residual) = result.as_ref() else {
            panic!("expected c = 7 to stay as a residual filter: {}", result);
        };
        assert_eq!(residual.predicate(), &Expr::eq(Expr::col(1), Expr::int(7)));
    }

    #[test]
    fn test_composite_prefix_intersects_components() {
        let catalog = MemoryCatalog::new();
        catalog
            .create_table(
                SchemaBuilder::new("ab")
                    .add_required_column("a", DataType::Integer)
                    .add_required_column("b", DataType::Integer)
                    .add_column("c", DataType::Integer)
                    .primary_key(&["a", "b"])
                    .build()
                    .unwrap(),
            )
            .unwrap();
        let pred = Expr::conjunction(vec![
            Expr::in_list(Expr::col(0), vec![Expr::int(1), Expr::int(2)], false),
            gt(1, 3),
            Expr::binary(Expr::col(1), BinaryOperator::LtEq, Expr::int(9)),
        ])
        .unwrap();
        let plan = PlanNode::filter(PlanNode::scan(&catalog.schema("ab").unwrap()).unwrap(), pred).unwrap();

        let result = run(&catalog, &plan);
        assert!(result.as_table_scan().is_some());
        let (_, boxes) = ranges(&result);
        let shown: Vec<String> = boxes.iter().map(|b| b.to_string()).collect();
        assert_eq!(shown, vec!["{[1], (3, 9]}", "{[2], (3, 9]}"]);

        // A tight box cap keeps only the leading column.
        let capped = run_with(&catalog, &plan, OptimizerConfig::default().with_max_range_boxes(1));
        assert!(matches!(capped.as_ref(), PlanNode::Filter(_)));
    }

    #[test]
    fn test_outer_reference_stays_in_subquery_body() {
        let catalog = catalog();
        let body = PlanNode::filter(
            scan(&catalog, "uv"),
            Expr::and(Expr::eq(Expr::col(0), Expr::outer(0)), Expr::eq(Expr::col(0), Expr::int(4))),
        )
        .unwrap();
        let sq = PlanNode::subquery(body, false).unwrap();
        let plan = PlanNode::filter(scan(&catalog, "xy"), Expr::Exists(sq)).unwrap();

        let result = run(&catalog, &plan);
        let PlanNode::Filter(f) = result.as_ref() else {
            panic!("expected the EXISTS filter to stay, got {}", result);
        };
        let Expr::Exists(sq) = f.predicate() else {
            panic!("unexpected predicate {}", f.predicate());
        };
        assert_eq!(
            sq.children()[0].to_string(),
            "Filter: (#0 = outer#0)\n  TableScan: uv [u, v, r, s] index=PRIMARY[0] ranges=[{[4]}]\n"
        );
    }

    #[test]
    fn test_pushdown_is_idempotent() {
        let catalog = catalog();
        let pred = Expr::and(Expr::eq(Expr::col(0), Expr::int(1)), Expr::eq(Expr::col(1), Expr::col(2)));
        let plan = PlanNode::filter(scan(&catalog, "xy"), pred).unwrap();
        let once = run(&catalog, &plan);
        assert_eq!(run(&catalog, &once), once);
    }
}
