//! Subquery decorrelation.
//!
//! An `EXISTS` conjunct of a filter whose body reads the outer row only
//! through the body's leading filters is taken apart:
//!
//! - conjuncts that read only the outer row move onto the outer input;
//! - simple comparisons between one outer column and the body become the
//!   condition of a semi join;
//! - the rest stays in the body.
//!
//! When nothing correlated is left the subquery stays an `EXISTS` and is
//! marked cacheable. `NOT EXISTS` becomes an anti join when it has at least
//! one correlated comparison. Every other uncorrelated `EXISTS` or scalar
//! subquery is marked cacheable as it is.
//!
//! # Legal When
//!
//! - The conjunct is a top-level conjunct of a filter
//! - Nothing below the body's leading filters reads the outer row
//! - Each correlated conjunct compares one bare outer column with an
//!   expression over the body
//!
//! Anything else is left correlated.

use std::sync::Arc;

use log::debug;

use super::{transform_up, with_filter};
use crate::optimizer::rule::{RewriteRule, RuleContext, Transformed};
use crate::planner::{
    Expr, Filter, JoinStrategy, JoinType, PlanError, PlanNode, PlanResult, UnaryOperator,
};

/// Subquery decorrelation rule.
pub struct SubqueryDecorrelation;

impl RewriteRule for SubqueryDecorrelation {
    fn name(&self) -> &'static str {
        "SubqueryDecorrelation"
    }

    fn rewrite(&self, plan: &Arc<PlanNode>, _ctx: &RuleContext<'_>) -> PlanResult<Transformed> {
        let rewritten = transform_up(plan, &mut |node| {
            let decorrelated = match node.as_ref() {
                PlanNode::Filter(f) => decorrelate_filter(f)?,
                _ => None,
            };
            cache_uncorrelated(decorrelated.unwrap_or(node))
        })?;
        Ok(Transformed::compare(plan, rewritten))
    }
}

/// The body of a correlated subquery, split by what its leading filter
/// conjuncts read.
struct Split {
    /// The body below its leading filters.
    base: Arc<PlanNode>,
    /// Conjuncts over the body alone.
    inner: Vec<Expr>,
    /// Conjuncts over the outer row alone, rebound to outer columns.
    outer_only: Vec<Expr>,
    /// Outer/body comparisons, rebound over `outer ++ body`.
    correlated: Vec<Expr>,
}

fn decorrelate_filter(filter: &Filter) -> PlanResult<Option<Arc<PlanNode>>> {
    let conjuncts = filter.predicate().conjuncts();
    if !conjuncts.iter().any(|c| exists_operand(c).is_some()) {
        return Ok(None);
    }

    let width = filter.input().schema().len();
    let mut input = Arc::clone(filter.input());
    let mut kept = Vec::new();
    let mut changed = false;
    for conjunct in conjuncts {
        match rewrite_conjunct(&conjunct, &input, width)? {
            Some((new_input, replacement)) => {
                changed = true;
                input = new_input;
                kept.extend(replacement);
            }
            None => kept.push(conjunct),
        }
    }

    if !changed {
        return Ok(None);
    }
    with_filter(input, kept).map(Some)
}

/// The subquery of an `EXISTS` or `NOT EXISTS` conjunct, and whether it is
/// negated.
fn exists_operand(conjunct: &Expr) -> Option<(&Arc<PlanNode>, bool)> {
    match conjunct {
        Expr::Exists(sq) => Some((sq, false)),
        Expr::UnaryOp {
            op: UnaryOperator::Not,
            expr,
        } => match expr.as_ref() {
            Expr::Exists(sq) => Some((sq, true)),
            _ => None,
        },
        _ => None,
    }
}

/// Decorrelate one filter conjunct. Returns the new filter input and the
/// conjunct that replaces it, or `None` to keep the conjunct as it is.
fn rewrite_conjunct(
    conjunct: &Expr,
    input: &Arc<PlanNode>,
    width: usize,
) -> PlanResult<Option<(Arc<PlanNode>, Option<Expr>)>> {
    let Some((sq, negated)) = exists_operand(conjunct) else {
        return Ok(None);
    };
    let PlanNode::Subquery(subquery) = sq.as_ref() else {
        return Ok(None);
    };
    if !subquery.correlated() {
        return Ok(None);
    }

    let split = match split_body(subquery.plan(), width) {
        Ok(split) => split,
        Err(e) if e.is_recoverable() => {
            debug!("{}; leaving the subquery correlated", e);
            return Ok(None);
        }
        Err(e) => return Err(e),
    };

    if negated {
        if split.correlated.is_empty() {
            return Ok(None);
        }
        let body = with_filter(split.base, split.inner)?;
        let condition = Expr::conjunction(split.outer_only.into_iter().chain(split.correlated));
        let joined = PlanNode::join(JoinType::Anti, Arc::clone(input), body, condition, JoinStrategy::NestedLoop)?;
        debug!("Rewrote correlated NOT EXISTS as an anti join");
        return Ok(Some((joined, None)));
    }

    let body = with_filter(split.base, split.inner)?;
    let outer = with_filter(Arc::clone(input), split.outer_only)?;
    if split.correlated.is_empty() {
        debug!("Hoisted the outer conjuncts of an EXISTS subquery; the body is now cacheable");
        let cached = PlanNode::subquery(body, true)?;
        return Ok(Some((outer, Some(Expr::Exists(cached)))));
    }

    let condition = Expr::conjunction(split.correlated);
    let joined = PlanNode::join(JoinType::Semi, outer, body, condition, JoinStrategy::NestedLoop)?;
    debug!("Rewrote correlated EXISTS as a semi join");
    Ok(Some((joined, None)))
}

fn split_body(body: &Arc<PlanNode>, outer_width: usize) -> PlanResult<Split> {
    let unsafe_body = |why: &str| {
        PlanError::DecorrelationUnsafe(format!(
            "{} in a subquery over {:?}",
            why,
            body.referenced_tables()
        ))
    };

    // Projection and ordering do not change whether a row exists.
    let mut node = body;
    loop {
        match node.as_ref() {
            PlanNode::Project(p) => node = p.input(),
            PlanNode::Sort(s) => node = s.input(),
            _ => break,
        }
    }

    let mut conjuncts = Vec::new();
    while let PlanNode::Filter(f) = node.as_ref() {
        conjuncts.extend(f.predicate().conjuncts());
        node = f.input();
    }
    if !node.outer_refs().is_empty() {
        return Err(unsafe_body("outer reference below the leading filters"));
    }

    let mut split = Split {
        base: Arc::clone(node),
        inner: Vec::new(),
        outer_only: Vec::new(),
        correlated: Vec::new(),
    };
    for conjunct in conjuncts {
        if conjunct.outer_refs().is_empty() {
            split.inner.push(conjunct);
        } else if conjunct.contains_subquery() {
            return Err(unsafe_body("outer reference next to a nested subquery"));
        } else if conjunct.column_refs().is_empty() {
            split.outer_only.push(conjunct.outer_to_columns(outer_width)?);
        } else if is_simple_correlation(&conjunct) {
            split.correlated.push(conjunct.outer_to_columns(outer_width)?);
        } else {
            return Err(unsafe_body(&format!("correlated predicate {}", conjunct)));
        }
    }
    Ok(split)
}

/// A comparison of a bare outer column with an expression over the body.
fn is_simple_correlation(expr: &Expr) -> bool {
    match expr {
        Expr::BinaryOp { left, op, right } if op.is_comparison() => {
            let bare_outer = |e: &Expr| matches!(e, Expr::OuterColumn(_));
            (bare_outer(left) && right.outer_refs().is_empty()) || (bare_outer(right) && left.outer_refs().is_empty())
        }
        _ => false,
    }
}

fn needs_cache_mark(sq: &PlanNode) -> bool {
    matches!(sq, PlanNode::Subquery(s) if !s.correlated() && !s.cacheable())
}

/// Mark the uncorrelated subqueries embedded in `node`'s expressions
/// cacheable.
fn cache_uncorrelated(node: Arc<PlanNode>) -> PlanResult<Arc<PlanNode>> {
    let pending = node
        .expressions()
        .iter()
        .any(|e| e.subqueries().iter().any(|sq| needs_cache_mark(sq)));
    if !pending {
        return Ok(node);
    }

    let children = node.children().into_iter().cloned().collect();
    node.rebuild_exprs(children, &mut |e| {
        e.map_subqueries(&mut |_, sq| match sq.as_ref() {
            PlanNode::Subquery(s) if needs_cache_mark(sq) => PlanNode::subquery(Arc::clone(s.plan()), true),
            _ => Ok(Arc::clone(sq)),
        })
    })
}
