//! The rewrite rules of the default pipeline, plus the tree-walking helpers
//! they share.

mod decorrelate;
mod join_operator;
mod join_order;
mod pruning;
mod pushdown;

pub use decorrelate::SubqueryDecorrelation;
pub use join_operator::JoinOperatorSelection;
pub use join_order::JoinOrderSelection;
pub use pruning::ProjectionPruning;
pub use pushdown::PredicatePushdown;

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::catalog::{CatalogSnapshot, IndexDescriptor};
use crate::planner::{Expr, PlanError, PlanNode, PlanResult, TableScan};

/// Rebuild `node` over inputs produced by `f`: each relational child and
/// the body of each subquery embedded in the node's expressions.
pub(crate) fn map_inputs(
    node: &Arc<PlanNode>,
    f: &mut dyn FnMut(&Arc<PlanNode>) -> PlanResult<Arc<PlanNode>>,
) -> PlanResult<Arc<PlanNode>> {
    let children = node
        .children()
        .into_iter()
        .map(|c| f(c))
        .collect::<PlanResult<Vec<_>>>()?;

    let has_subqueries = node.expressions().iter().any(|e| e.contains_subquery());
    if has_subqueries {
        return node.rebuild_exprs(children, &mut |e| {
            e.map_subqueries(&mut |_, sq| map_subquery_body(sq, &mut *f))
        });
    }

    let unchanged = node
        .children()
        .into_iter()
        .zip(&children)
        .all(|(old, new)| Arc::ptr_eq(old, new));
    if unchanged {
        Ok(Arc::clone(node))
    } else {
        node.with_new_children(children)
    }
}

/// Rebuild `node` bottom-up, applying `f` to every node once its inputs
/// and embedded subquery bodies have been rebuilt.
pub(crate) fn transform_up(
    node: &Arc<PlanNode>,
    f: &mut dyn FnMut(Arc<PlanNode>) -> PlanResult<Arc<PlanNode>>,
) -> PlanResult<Arc<PlanNode>> {
    let rebuilt = map_inputs(node, &mut |c| transform_up(c, &mut *f))?;
    f(rebuilt)
}

/// Replace the body of the `Subquery` node `sq` with `f(body)`. The
/// cacheable mark survives only while the body stays uncorrelated.
pub(crate) fn map_subquery_body(
    sq: &Arc<PlanNode>,
    f: &mut dyn FnMut(&Arc<PlanNode>) -> PlanResult<Arc<PlanNode>>,
) -> PlanResult<Arc<PlanNode>> {
    match sq.as_ref() {
        PlanNode::Subquery(s) => {
            let body = f(s.plan())?;
            if Arc::ptr_eq(&body, s.plan()) {
                return Ok(Arc::clone(sq));
            }
            let cacheable = s.cacheable() && body.outer_refs().is_empty();
            PlanNode::subquery(body, cacheable)
        }
        _ => Err(PlanError::malformed("expression subquery is not a Subquery node")),
    }
}

/// `node` under a filter of `preds`, or `node` itself when there are none.
pub(crate) fn with_filter(node: Arc<PlanNode>, preds: Vec<Expr>) -> PlanResult<Arc<PlanNode>> {
    match Expr::conjunction(preds) {
        Some(predicate) => PlanNode::filter(node, predicate),
        None => Ok(node),
    }
}

/// Drop the dynamic lookup from the scan at the bottom of a `Filter*`
/// chain, turning a lookup join's right input back into a plain relation.
/// Other nodes are returned as they are.
pub(crate) fn strip_dynamic(node: &Arc<PlanNode>) -> PlanResult<Arc<PlanNode>> {
    match node.as_ref() {
        PlanNode::Filter(f) => {
            let input = strip_dynamic(f.input())?;
            if Arc::ptr_eq(&input, f.input()) {
                Ok(Arc::clone(node))
            } else {
                PlanNode::filter(input, f.predicate().clone())
            }
        }
        PlanNode::TableScan(scan) if scan.has_dynamic_access() => {
            PlanNode::table_scan(scan.table(), scan.columns().to_vec(), scan.projection().to_vec(), None)
        }
        _ => Ok(Arc::clone(node)),
    }
}

/// The scan at the bottom of a `Filter*` chain.
pub(crate) fn base_scan(node: &PlanNode) -> Option<&TableScan> {
    match node {
        PlanNode::Filter(f) => base_scan(f.input()),
        PlanNode::TableScan(scan) => Some(scan),
        _ => None,
    }
}

/// The index a lookup into `scan` should probe when the table columns in
/// `bound` are known for each outer row: the longest bound key prefix wins,
/// then declaration order. `None` when no index has its leading key bound.
pub(crate) fn lookup_index<'a>(
    scan: &TableScan,
    bound: &BTreeSet<usize>,
    snapshot: &'a CatalogSnapshot,
) -> Option<(&'a IndexDescriptor, usize)> {
    let mut best: Option<(&IndexDescriptor, usize)> = None;
    for index in snapshot.indexes(scan.table()) {
        let prefix = index.key_columns.iter().take_while(|c| bound.contains(c)).count();
        if prefix > 0 && best.map_or(true, |(_, p)| prefix > p) {
            best = Some((index, prefix));
        }
    }
    best
}

/// Whether rows of `node` arrive in ascending order of output `column`.
///
/// A plain scan yields primary key order, a static index access yields
/// index order, and a `Sort` yields its own order. Filters, limits and
/// plain column projections keep the order of their input.
pub(crate) fn sorted_on(node: &PlanNode, column: usize, snapshot: &CatalogSnapshot) -> bool {
    match node {
        PlanNode::TableScan(scan) => {
            let Some(&ordinal) = scan.projection().get(column) else {
                return false;
            };
            match scan.access() {
                Some(access) if access.is_dynamic() => false,
                Some(access) => access.index().key_columns.first() == Some(&ordinal),
                None => snapshot
                    .schema(scan.table())
                    .map(|s| s.primary_key().first() == Some(&ordinal))
                    .unwrap_or(false),
            }
        }
        PlanNode::Sort(s) => s
            .order()
            .first()
            .map(|k| k.column == column && k.ascending)
            .unwrap_or(false),
        PlanNode::Filter(f) => sorted_on(f.input(), column, snapshot),
        PlanNode::Limit(l) => sorted_on(l.input(), column, snapshot),
        PlanNode::Project(p) => match p.items().get(column).map(|i| &i.expr) {
            Some(Expr::Column(c)) => sorted_on(p.input(), *c, snapshot),
            _ => false,
        },
        PlanNode::Join(_) | PlanNode::Subquery(_) | PlanNode::GroupBy(_) => false,
    }
}
