//! Projection pruning.
//!
//! Remove unused columns early. The set of columns each node's parent
//! consumes travels down the tree; scans drop the table columns nobody
//! reads and projects drop unread items. Every rebuilt node reports how
//! its old output positions moved so the parent can re-index its
//! expressions.
//!
//! # Legal When
//!
//! - Dropped columns are not referenced by any ancestor
//! - A scan keeps at least one column, so row existence is still carried

use std::collections::BTreeSet;
use std::sync::Arc;

use super::map_subquery_body;
use crate::optimizer::rule::{RewriteRule, RuleContext, Transformed};
use crate::planner::{
    lookup_target, AggregateExpr, Expr, IndexLookup, JoinStrategy, PlanError, PlanNode, PlanResult, ProjectItem,
    Schema, SortKey, SubqueryKind,
};

/// Projection pruning rule.
pub struct ProjectionPruning;

impl RewriteRule for ProjectionPruning {
    fn name(&self) -> &'static str {
        "ProjectionPruning"
    }

    fn rewrite(&self, plan: &Arc<PlanNode>, _ctx: &RuleContext<'_>) -> PlanResult<Transformed> {
        let all: BTreeSet<usize> = (0..plan.schema().len()).collect();
        let (pruned, _) = prune(plan, &all)?;
        Ok(Transformed::compare(plan, pruned))
    }
}

/// New position of each old output position; `None` once dropped.
type ColumnMap = Vec<Option<usize>>;

fn identity(width: usize) -> ColumnMap {
    (0..width).map(Some).collect()
}

/// Map for keeping `kept` (ascending) out of `width` positions.
fn positions(width: usize, kept: &[usize]) -> ColumnMap {
    let mut map = vec![None; width];
    for (new, &old) in kept.iter().enumerate() {
        map[old] = Some(new);
    }
    map
}

fn position(map: &[Option<usize>], column: usize) -> PlanResult<usize> {
    map.get(column)
        .copied()
        .flatten()
        .ok_or_else(|| PlanError::Internal(format!("pruning dropped required column #{}", column)))
}

/// Re-index `expr` and prune the bodies of the subqueries it embeds.
fn remap(expr: &Expr, map: &[Option<usize>]) -> PlanResult<Expr> {
    let moved = expr.remap_columns(&|i| map.get(i).copied().flatten())?;
    moved.map_subqueries(&mut |kind, sq| map_subquery_body(sq, &mut |body| prune_body(kind, body)))
}

fn prune_body(kind: SubqueryKind, body: &Arc<PlanNode>) -> PlanResult<Arc<PlanNode>> {
    let required = match kind {
        SubqueryKind::Exists => BTreeSet::new(),
        SubqueryKind::Scalar => BTreeSet::from([0]),
    };
    Ok(prune(body, &required)?.0)
}

/// Prune `node` to (at least) the `required` output positions.
fn prune(node: &Arc<PlanNode>, required: &BTreeSet<usize>) -> PlanResult<(Arc<PlanNode>, ColumnMap)> {
    match node.as_ref() {
        PlanNode::TableScan(scan) => {
            let width = scan.projection().len();
            let mut keep: Vec<usize> = (0..width).filter(|p| required.contains(p)).collect();
            if keep.is_empty() {
                keep.push(0);
            }
            if keep.len() == width {
                return Ok((Arc::clone(node), identity(width)));
            }
            let projection = keep.iter().map(|&p| scan.projection()[p]).collect();
            let pruned = PlanNode::table_scan(
                scan.table(),
                scan.columns().to_vec(),
                projection,
                scan.access().cloned(),
            )?;
            Ok((pruned, positions(width, &keep)))
        }
        PlanNode::Filter(f) => {
            let mut need = required.clone();
            need.extend(f.predicate().column_refs());
            let (input, map) = prune(f.input(), &need)?;
            let predicate = remap(f.predicate(), &map)?;
            Ok((PlanNode::filter(input, predicate)?, map))
        }
        PlanNode::Project(p) => {
            let mut keep: Vec<usize> = (0..p.items().len()).filter(|i| required.contains(i)).collect();
            if keep.is_empty() {
                keep.push(0);
            }
            let need: BTreeSet<usize> = keep.iter().flat_map(|&i| p.items()[i].expr.column_refs()).collect();
            let (input, map) = prune(p.input(), &need)?;
            let items = keep
                .iter()
                .map(|&i| {
                    let item = &p.items()[i];
                    Ok(ProjectItem::new(remap(&item.expr, &map)?, item.alias.clone()))
                })
                .collect::<PlanResult<Vec<_>>>()?;
            let out = positions(p.items().len(), &keep);
            if is_identity(&items, input.schema()) {
                return Ok((input, out));
            }
            Ok((PlanNode::project(input, items)?, out))
        }
        PlanNode::Join(j) => {
            let lw = j.left().schema().len();
            let cond_refs = j.condition().map(|c| c.column_refs()).unwrap_or_default();
            let mut need_left: BTreeSet<usize> =
                required.iter().chain(&cond_refs).copied().filter(|&c| c < lw).collect();
            let need_right: BTreeSet<usize> = required
                .iter()
                .chain(&cond_refs)
                .copied()
                .filter(|&c| c >= lw)
                .map(|c| c - lw)
                .collect();
            if j.strategy() == JoinStrategy::Lookup {
                if let Some(IndexLookup::Dynamic { keys, .. }) =
                    lookup_target(j.right()).and_then(|s| s.access()).map(|a| a.lookup())
                {
                    need_left.extend(keys.iter().flat_map(|k| k.column_refs()));
                }
            }

            let (left, lmap) = prune(j.left(), &need_left)?;
            let (mut right, rmap) = prune(j.right(), &need_right)?;
            if j.strategy() == JoinStrategy::Lookup {
                right = remap_lookup_keys(&right, &lmap)?;
            }
            let new_lw = left.schema().len();
            let mut map = lmap.clone();
            map.extend(rmap.iter().map(|m| m.map(|c| c + new_lw)));
            let condition = j.condition().map(|c| remap(c, &map)).transpose()?;
            let joined = PlanNode::join(j.join_type(), left, right, condition, j.strategy())?;
            let out = if j.join_type().is_left_only() { lmap } else { map };
            Ok((joined, out))
        }
        PlanNode::Subquery(s) => {
            let (body, map) = prune(s.plan(), required)?;
            let cacheable = s.cacheable() && body.outer_refs().is_empty();
            Ok((PlanNode::subquery(body, cacheable)?, map))
        }
        PlanNode::GroupBy(g) => {
            let nkeys = g.group_by().len();
            let naggs = g.aggregates().len();
            let mut keep: Vec<usize> = (0..naggs).filter(|i| required.contains(&(nkeys + i))).collect();
            if nkeys == 0 && keep.is_empty() {
                keep.push(0);
            }
            let mut need: BTreeSet<usize> = g.group_by().iter().copied().collect();
            for &i in &keep {
                if let Some(arg) = &g.aggregates()[i].arg {
                    need.extend(arg.column_refs());
                }
            }

            let (input, map) = prune(g.input(), &need)?;
            let group_by = g
                .group_by()
                .iter()
                .map(|&c| position(&map, c))
                .collect::<PlanResult<Vec<_>>>()?;
            let aggregates = keep
                .iter()
                .map(|&i| {
                    let agg = &g.aggregates()[i];
                    let arg = agg.arg.as_ref().map(|e| remap(e, &map)).transpose()?;
                    Ok(AggregateExpr::new(agg.function, arg, agg.alias.clone()))
                })
                .collect::<PlanResult<Vec<_>>>()?;

            let mut out = identity(nkeys);
            out.extend(positions(naggs, &keep).into_iter().map(|m| m.map(|i| i + nkeys)));
            Ok((PlanNode::group_by(input, group_by, aggregates)?, out))
        }
        PlanNode::Sort(s) => {
            let mut need = required.clone();
            need.extend(s.order().iter().map(|k| k.column));
            let (input, map) = prune(s.input(), &need)?;
            let order = s
                .order()
                .iter()
                .map(|k| {
                    Ok(SortKey {
                        column: position(&map, k.column)?,
                        ..*k
                    })
                })
                .collect::<PlanResult<Vec<_>>>()?;
            Ok((PlanNode::sort(input, order)?, map))
        }
        PlanNode::Limit(l) => {
            let (input, map) = prune(l.input(), required)?;
            Ok((PlanNode::limit(input, l.limit(), l.offset())?, map))
        }
    }
}

/// Whether `items` reproduce `input` exactly: same columns, order and
/// names.
fn is_identity(items: &[ProjectItem], input: &Schema) -> bool {
    items.len() == input.len()
        && items.iter().enumerate().all(|(i, item)| {
            item.expr == Expr::Column(i) && input.field(i).map(|f| f.name == item.alias).unwrap_or(false)
        })
}

/// Re-index the dynamic lookup keys of a lookup join's right input after
/// the left input was pruned.
fn remap_lookup_keys(node: &Arc<PlanNode>, map: &[Option<usize>]) -> PlanResult<Arc<PlanNode>> {
    match node.as_ref() {
        PlanNode::Filter(f) => PlanNode::filter(remap_lookup_keys(f.input(), map)?, f.predicate().clone()),
        PlanNode::TableScan(scan) => match scan.access() {
            Some(access) if access.is_dynamic() => {
                let access = access.map_keys(|k| k.remap_columns(&|i| map.get(i).copied().flatten()))?;
                PlanNode::table_scan(
                    scan.table(),
                    scan.columns().to_vec(),
                    scan.projection().to_vec(),
                    Some(access),
                )
            }
            _ => Ok(Arc::clone(node)),
        },
        _ => Ok(Arc::clone(node)),
    }
}
