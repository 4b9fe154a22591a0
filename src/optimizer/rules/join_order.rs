//! Join order selection.
//!
//! A maximal tree of inner and cross joins is flattened into a cluster of
//! relations plus the conjuncts of all its conditions. Small clusters are
//! ordered by trying every left-deep permutation; larger ones fall back to
//! a greedy order that starts from the smallest relation and keeps adding
//! the cheapest connected one.
//!
//! Each step of an order costs what its cheapest available join strategy
//! costs, so a selective relation that can drive lookups into a large one
//! moves to the front. When the chosen order differs from the current one
//! the cluster is rebuilt left-deep, every conjunct attached to the first
//! join that sees all of its relations, under a projection that restores
//! the original column order.
//!
//! # Legal When
//!
//! - Only inner and cross joins are reordered; outer, semi and anti joins
//!   bound a cluster

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use log::debug;

use super::{base_scan, lookup_index, map_inputs, map_subquery_body, sorted_on, strip_dynamic};
use crate::optimizer::config::MAX_EXHAUSTIVE_JOIN_RELATIONS;
use crate::optimizer::cost::Cost;
use crate::optimizer::rule::{RewriteRule, RuleContext, Transformed};
use crate::planner::{
    conjunct_selectivity, Expr, JoinStrategy, JoinType, PlanError, PlanNode, PlanResult, Schema,
};

/// Join order selection rule.
pub struct JoinOrderSelection;

impl RewriteRule for JoinOrderSelection {
    fn name(&self) -> &'static str {
        "JoinOrderSelection"
    }

    fn rewrite(&self, plan: &Arc<PlanNode>, ctx: &RuleContext<'_>) -> PlanResult<Transformed> {
        let reordered = reorder(plan, ctx)?;
        Ok(Transformed::compare(plan, reordered))
    }
}

fn is_cluster_join(node: &PlanNode) -> bool {
    matches!(node, PlanNode::Join(j) if matches!(j.join_type(), JoinType::Inner | JoinType::Cross))
}

fn reorder(node: &Arc<PlanNode>, ctx: &RuleContext<'_>) -> PlanResult<Arc<PlanNode>> {
    if !is_cluster_join(node) {
        return map_inputs(node, &mut |c| reorder(c, ctx));
    }

    let cluster = Cluster::flatten(node, ctx)?;
    let limit = ctx.config.join_order_exhaustive_limit.min(MAX_EXHAUSTIVE_JOIN_RELATIONS);
    let order = if cluster.relations.len() <= limit {
        cluster.exhaustive_order(ctx)
    } else {
        let guard = PlanError::JoinOrderExplosionGuard {
            relations: cluster.relations.len(),
            limit,
        };
        debug!("{}; ordering greedily", guard);
        cluster.greedy_order(ctx)
    };

    if order.iter().enumerate().all(|(i, &r)| i == r) {
        return keep_order(node, ctx);
    }
    debug!("Reordered a {}-relation join cluster to {:?}", cluster.relations.len(), order);
    cluster.build(&order)
}

/// Rebuild a cluster in its current shape, reordering only inside its
/// relations and the subqueries of its conditions.
fn keep_order(node: &Arc<PlanNode>, ctx: &RuleContext<'_>) -> PlanResult<Arc<PlanNode>> {
    let PlanNode::Join(join) = node.as_ref() else {
        return reorder(node, ctx);
    };
    if !is_cluster_join(node) {
        return reorder(node, ctx);
    }

    let left = keep_order(join.left(), ctx)?;
    let right = keep_order(join.right(), ctx)?;
    let condition = join.condition().map(|c| reorder_subqueries(c, ctx)).transpose()?;
    if Arc::ptr_eq(&left, join.left()) && Arc::ptr_eq(&right, join.right()) && condition.as_ref() == join.condition() {
        return Ok(Arc::clone(node));
    }
    PlanNode::join(join.join_type(), left, right, condition, join.strategy())
}

fn reorder_subqueries(expr: &Expr, ctx: &RuleContext<'_>) -> PlanResult<Expr> {
    if !expr.contains_subquery() {
        return Ok(expr.clone());
    }
    expr.map_subqueries(&mut |_, sq| map_subquery_body(sq, &mut |body| reorder(body, ctx)))
}

/// One input of a join cluster.
struct Relation {
    plan: Arc<PlanNode>,
    /// First column in the cluster's original output.
    offset: usize,
    width: usize,
    rows: f64,
    /// Whether the relation already reads through a static index access.
    indexed: bool,
}

/// A condition conjunct over the cluster's original output.
struct Conjunct {
    expr: Expr,
    relations: BTreeSet<usize>,
}

struct Cluster {
    relations: Vec<Relation>,
    conjuncts: Vec<Conjunct>,
    /// Concatenated relation schemas in the original order.
    schema: Schema,
}

impl Cluster {
    fn flatten(root: &Arc<PlanNode>, ctx: &RuleContext<'_>) -> PlanResult<Self> {
        let mut relations = Vec::new();
        let mut exprs = Vec::new();
        collect(root, 0, ctx, &mut relations, &mut exprs)?;

        let schema = relations
            .iter()
            .fold(Schema::empty(), |acc, r: &Relation| acc.concat(r.plan.schema()));
        let mut cluster = Cluster {
            relations,
            conjuncts: Vec::new(),
            schema,
        };
        cluster.conjuncts = exprs
            .into_iter()
            .map(|expr| {
                let relations = expr.column_refs().iter().map(|&c| cluster.relation_of(c)).collect();
                Conjunct { expr, relations }
            })
            .collect();
        Ok(cluster)
    }

    fn relation_of(&self, column: usize) -> usize {
        self.relations.iter().rposition(|r| r.offset <= column).unwrap_or(0)
    }

    fn width(&self) -> usize {
        self.relations.iter().map(|r| r.width).sum()
    }

    /// Whether `conjunct` belongs to the join that adds `next` to `before`.
    /// The first join also takes the conjuncts over its driving relation
    /// alone and those over no relation at all.
    fn attaches(&self, conjunct: &Conjunct, before: &BTreeSet<usize>, next: usize, first: bool) -> bool {
        let complete = conjunct.relations.iter().all(|r| *r == next || before.contains(r));
        complete && (first || !conjunct.relations.iter().all(|r| before.contains(r)))
    }

    fn connected(&self, before: &BTreeSet<usize>, next: usize) -> bool {
        self.conjuncts
            .iter()
            .any(|c| c.relations.contains(&next) && c.relations.iter().any(|r| before.contains(r)))
    }

    /// Cost of joining `outer_rows` rows of the relations in `before` with
    /// `next`, and the number of rows the join produces.
    fn step(&self, before: &BTreeSet<usize>, outer_rows: f64, next: usize, ctx: &RuleContext<'_>) -> (Cost, f64) {
        let first = before.len() == 1;
        let inner = &self.relations[next];
        let attached: Vec<&Conjunct> = self
            .conjuncts
            .iter()
            .filter(|c| self.attaches(c, before, next, first))
            .collect();

        let selectivity: f64 = attached
            .iter()
            .map(|c| conjunct_selectivity(&c.expr, &self.schema, ctx.snapshot))
            .product();
        let rows = outer_rows * inner.rows * selectivity;

        // (outer column in the cluster output, inner column in `next`)
        let pairs: Vec<(usize, usize)> = attached
            .iter()
            .filter_map(|c| c.expr.as_column_equality())
            .filter_map(|(a, b)| {
                let (ra, rb) = (self.relation_of(a), self.relation_of(b));
                if before.contains(&ra) && rb == next {
                    Some((a, b - inner.offset))
                } else if before.contains(&rb) && ra == next {
                    Some((b, a - inner.offset))
                } else {
                    None
                }
            })
            .collect();

        let model = &ctx.cost;
        let mut cost = model.join_cost(JoinStrategy::NestedLoop, outer_rows, inner.rows);
        if let Some(&(outer_col, inner_col)) = pairs.first() {
            if model.hash_fits(inner.rows) {
                cost = cost.min(model.join_cost(JoinStrategy::Hash, outer_rows, inner.rows));
            }
            if can_lookup(inner, &pairs, ctx) {
                cost = cost.min(model.join_cost(JoinStrategy::Lookup, outer_rows, inner.rows));
            }
            if first {
                let driver = &self.relations[self.relation_of(outer_col)];
                if sorted_on(&driver.plan, outer_col - driver.offset, ctx.snapshot)
                    && sorted_on(&inner.plan, inner_col, ctx.snapshot)
                {
                    cost = cost.min(model.join_cost(JoinStrategy::Merge, outer_rows, inner.rows));
                }
            }
        }
        (cost, rows)
    }

    /// Total cost of a left-deep order, then whether its driving relation
    /// lacks an index access.
    fn order_key(&self, order: &[usize], ctx: &RuleContext<'_>) -> (Cost, bool) {
        let mut before = BTreeSet::from([order[0]]);
        let mut rows = self.relations[order[0]].rows;
        let mut total = Cost::ZERO;
        for &next in &order[1..] {
            let (cost, out) = self.step(&before, rows, next, ctx);
            total = total + cost;
            rows = out;
            before.insert(next);
        }
        (total, !self.relations[order[0]].indexed)
    }

    /// Cheapest permutation. Permutations are visited in lexicographic
    /// order from the current one and only a strictly better key replaces
    /// the best so far.
    fn exhaustive_order(&self, ctx: &RuleContext<'_>) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.relations.len()).collect();
        let mut best = order.clone();
        let mut best_key = self.order_key(&order, ctx);
        while next_permutation(&mut order) {
            let key = self.order_key(&order, ctx);
            if key < best_key {
                best_key = key;
                best = order.clone();
            }
        }
        best
    }

    fn greedy_order(&self, ctx: &RuleContext<'_>) -> Vec<usize> {
        let n = self.relations.len();
        let Some(start) = (0..n).min_by_key(|&r| Cost(self.relations[r].rows)) else {
            return Vec::new();
        };

        let mut order = vec![start];
        let mut before = BTreeSet::from([start]);
        let mut rows = self.relations[start].rows;
        while order.len() < n {
            let remaining: Vec<usize> = (0..n).filter(|r| !before.contains(r)).collect();
            let connected: Vec<usize> = remaining.iter().copied().filter(|&r| self.connected(&before, r)).collect();
            let pool = if connected.is_empty() { remaining } else { connected };

            let Some((next, _, out)) = pool
                .into_iter()
                .map(|r| {
                    let (cost, out) = self.step(&before, rows, r, ctx);
                    (r, cost, out)
                })
                .min_by_key(|&(_, cost, _)| cost)
            else {
                break;
            };
            order.push(next);
            before.insert(next);
            rows = out;
        }
        order
    }

    /// Left-deep tree over `order` with the original column order restored.
    fn build(&self, order: &[usize]) -> PlanResult<Arc<PlanNode>> {
        let mut start = BTreeMap::new();
        let mut acc = 0;
        for &r in order {
            start.insert(r, acc);
            acc += self.relations[r].width;
        }
        let position = |c: usize| {
            let r = self.relation_of(c);
            start.get(&r).map(|s| s + c - self.relations[r].offset)
        };

        let mut tree = Arc::clone(&self.relations[order[0]].plan);
        let mut before = BTreeSet::from([order[0]]);
        for &next in &order[1..] {
            let first = before.len() == 1;
            let conjuncts = self
                .conjuncts
                .iter()
                .filter(|c| self.attaches(c, &before, next, first))
                .map(|c| c.expr.remap_columns(&position))
                .collect::<PlanResult<Vec<_>>>()?;
            let condition = Expr::conjunction(conjuncts);
            let join_type = if condition.is_some() { JoinType::Inner } else { JoinType::Cross };
            tree = PlanNode::join(
                join_type,
                tree,
                Arc::clone(&self.relations[next].plan),
                condition,
                JoinStrategy::NestedLoop,
            )?;
            before.insert(next);
        }

        let restore = (0..self.width())
            .map(|c| position(c).ok_or_else(|| PlanError::Internal(format!("cluster column #{} lost", c))))
            .collect::<PlanResult<Vec<_>>>()?;
        if restore.iter().enumerate().all(|(i, &c)| i == c) {
            return Ok(tree);
        }
        PlanNode::project_columns(tree, &restore)
    }
}

fn collect(
    node: &Arc<PlanNode>,
    offset: usize,
    ctx: &RuleContext<'_>,
    relations: &mut Vec<Relation>,
    exprs: &mut Vec<Expr>,
) -> PlanResult<()> {
    match node.as_ref() {
        PlanNode::Join(join) if is_cluster_join(node) => {
            collect(join.left(), offset, ctx, relations, exprs)?;
            collect(join.right(), offset + join.left().schema().len(), ctx, relations, exprs)?;
            if let Some(condition) = join.condition() {
                for conjunct in condition.conjuncts() {
                    let conjunct = reorder_subqueries(&conjunct, ctx)?;
                    exprs.push(conjunct.remap_columns(&|c| Some(c + offset))?);
                }
            }
            Ok(())
        }
        _ => {
            let plan = reorder(&strip_dynamic(node)?, ctx)?;
            let indexed = base_scan(&plan).map_or(false, |s| s.access().is_some());
            relations.push(Relation {
                offset,
                width: plan.schema().len(),
                rows: plan.estimated_rows(ctx.snapshot),
                indexed,
                plan,
            });
            Ok(())
        }
    }
}

/// Whether `inner` can be probed by index on the inner columns of `pairs`.
fn can_lookup(inner: &Relation, pairs: &[(usize, usize)], ctx: &RuleContext<'_>) -> bool {
    let Some(scan) = base_scan(&inner.plan) else {
        return false;
    };
    if scan.access().is_some() {
        return false;
    }
    let bound: BTreeSet<usize> = pairs
        .iter()
        .filter_map(|&(_, c)| scan.projection().get(c).copied())
        .collect();
    lookup_index(scan, &bound, ctx.snapshot).is_some()
}

/// Advance to the next lexicographic permutation; false after the last.
fn next_permutation(order: &mut [usize]) -> bool {
    let Some(i) = order.windows(2).rposition(|w| w[0] < w[1]) else {
        return false;
    };
    let Some(j) = order.iter().rposition(|&x| x > order[i]) else {
        return false;
    };
    order.swap(i, j);
    order[i + 1..].reverse();
    true
}
