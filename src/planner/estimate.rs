//! Cardinality estimation over plan trees.
//!
//! Estimates combine catalog statistics under the independence assumption:
//! the selectivity of a conjunction is the product of its conjuncts'.

use super::access::{IndexLookup, KeyRange};
use super::expr::{BinaryOperator, Expr, UnaryOperator};
use super::node::{JoinType, PlanNode, TableScan};
use super::sargable;
use super::schema::Schema;
use super::value::LiteralValue;
use crate::catalog::{clamp_selectivity, defaults, PredicateShape, Statistics};

impl PlanNode {
    /// Estimated number of output rows.
    pub fn estimated_rows(&self, stats: &dyn Statistics) -> f64 {
        match self {
            PlanNode::TableScan(scan) => scan_rows(scan, stats),
            PlanNode::Filter(f) => {
                let input = f.input().estimated_rows(stats);
                input * predicate_selectivity(f.predicate(), f.input().schema(), stats)
            }
            PlanNode::Project(p) => p.input().estimated_rows(stats),
            PlanNode::Join(j) => {
                let l = j.left().estimated_rows(stats);
                let r = j.right().estimated_rows(stats);
                let joined = j.left().schema().concat(j.right().schema());
                let sel = j
                    .condition()
                    .map(|c| predicate_selectivity(c, &joined, stats))
                    .unwrap_or(1.0);
                let inner = l * r * sel;
                match j.join_type() {
                    JoinType::Inner | JoinType::Cross => inner,
                    JoinType::Left => inner.max(l),
                    JoinType::Right => inner.max(r),
                    JoinType::Full => inner.max(l).max(r),
                    JoinType::Semi => l * (r * sel).min(1.0),
                    JoinType::Anti => l * (1.0 - (r * sel).min(1.0)),
                }
            }
            PlanNode::Subquery(s) => s.plan().estimated_rows(stats),
            PlanNode::GroupBy(g) => {
                let input = g.input().estimated_rows(stats);
                if g.group_by().is_empty() {
                    1.0
                } else {
                    (input / 10.0).max(input.min(1.0))
                }
            }
            PlanNode::Sort(s) => s.input().estimated_rows(stats),
            PlanNode::Limit(l) => {
                let input = l.input().estimated_rows(stats);
                (input - l.offset() as f64).max(0.0).min(l.limit() as f64)
            }
        }
    }
}

fn scan_rows(scan: &TableScan, stats: &dyn Statistics) -> f64 {
    let rows = stats.row_count(scan.table());
    match scan.access().map(|a| (a.key_columns(), a.lookup())) {
        Some((columns, IndexLookup::Static { ranges })) => {
            let sel: f64 = ranges
                .iter()
                .map(|r| key_range_selectivity(scan.table(), columns, r, stats))
                .sum();
            rows * clamp_selectivity(sel)
        }
        // A lookup's per-probe cost is accounted by the join; the scan
        // itself stands for the table.
        Some((_, IndexLookup::Dynamic { .. })) | None => rows,
    }
}

/// Fraction of a table inside one key box.
pub fn key_range_selectivity(table: &str, columns: &[usize], range: &KeyRange, stats: &dyn Statistics) -> f64 {
    let mut points = Vec::new();
    let mut ranged = Vec::new();
    for (&column, r) in columns.iter().zip(&range.columns) {
        if r.is_point() {
            points.push(column);
        } else if !r.is_full() {
            ranged.push(column);
        }
    }
    stats.selectivity(table, &points, PredicateShape::Equality) * stats.selectivity(table, &ranged, PredicateShape::Range)
}

/// Selectivity of a predicate over `schema`, conjuncts taken independently.
pub fn predicate_selectivity(predicate: &Expr, schema: &Schema, stats: &dyn Statistics) -> f64 {
    predicate
        .conjuncts()
        .iter()
        .map(|c| conjunct_selectivity(c, schema, stats))
        .product()
}

/// Selectivity of a single conjunct over `schema`.
pub fn conjunct_selectivity(expr: &Expr, schema: &Schema, stats: &dyn Statistics) -> f64 {
    let s = if let Some(pred) = sargable::analyze(expr, schema) {
        let origin = schema.field(pred.column).and_then(|f| f.origin.as_ref());
        let eq = |stats: &dyn Statistics| match origin {
            Some(o) => stats.selectivity(&o.table, &[o.column], PredicateShape::Equality),
            None => defaults::EQUALITY,
        };
        let range = |stats: &dyn Statistics| match origin {
            Some(o) => stats.selectivity(&o.table, &[o.column], PredicateShape::Range),
            None => defaults::RANGE,
        };
        pred.ranges
            .ranges()
            .iter()
            .map(|r| if r.is_point() { eq(stats) } else { range(stats) })
            .sum()
    } else if let Some((a, b)) = expr.as_column_equality() {
        let eq = |c: usize| {
            schema
                .field(c)
                .and_then(|f| f.origin.as_ref())
                .map(|o| stats.selectivity(&o.table, &[o.column], PredicateShape::Equality))
        };
        match (eq(a), eq(b)) {
            (Some(x), Some(y)) => x.min(y),
            (Some(x), None) | (None, Some(x)) => x,
            (None, None) => defaults::EQUALITY,
        }
    } else {
        match expr {
            Expr::UnaryOp {
                op: UnaryOperator::Not,
                expr,
            } => 1.0 - conjunct_selectivity(expr, schema, stats),
            Expr::BinaryOp {
                left,
                op: BinaryOperator::Or,
                right,
            } => {
                let l = conjunct_selectivity(left, schema, stats);
                let r = conjunct_selectivity(right, schema, stats);
                l + r - l * r
            }
            Expr::BinaryOp {
                op: BinaryOperator::And,
                ..
            } => predicate_selectivity(expr, schema, stats),
            Expr::IsNull { negated, .. } => {
                if *negated {
                    1.0 - defaults::NULL
                } else {
                    defaults::NULL
                }
            }
            Expr::Exists(_) => defaults::SEMI,
            Expr::Literal(LiteralValue::Boolean(true)) => 1.0,
            Expr::Literal(LiteralValue::Boolean(false)) | Expr::Literal(LiteralValue::Null) => 0.0,
            _ => defaults::OTHER,
        }
    };
    clamp_selectivity(s)
}
