//! Recognition of predicates an index can answer.
//!
//! A sargable predicate restricts a single column to a set of key ranges,
//! and a row passes it exactly when the column value (never NULL) falls in
//! one of those ranges.

use super::access::{ColumnRange, RangeSet};
use super::expr::{BinaryOperator, Expr};
use super::schema::Schema;
use super::value::LiteralValue;

/// A predicate reduced to ranges over one input column.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnPredicate {
    pub column: usize,
    pub ranges: RangeSet,
}

/// Reduce `expr` to a [`ColumnPredicate`] over `schema`, if it has a
/// sargable form.
pub fn analyze(expr: &Expr, schema: &Schema) -> Option<ColumnPredicate> {
    match expr {
        Expr::BinaryOp { left, op, right } if op.is_comparison() => {
            let (column, op, value) = match (left.as_ref(), right.as_ref()) {
                (Expr::Column(c), Expr::Literal(v)) => (*c, *op, v),
                (Expr::Literal(v), Expr::Column(c)) => (*c, op.flip(), v),
                _ => return None,
            };
            if !comparable(schema, column, value) {
                return None;
            }
            let range = match op {
                BinaryOperator::Eq => ColumnRange::point(value.clone()),
                BinaryOperator::Lt => ColumnRange::less_than(value.clone(), false),
                BinaryOperator::LtEq => ColumnRange::less_than(value.clone(), true),
                BinaryOperator::Gt => ColumnRange::greater_than(value.clone(), false),
                BinaryOperator::GtEq => ColumnRange::greater_than(value.clone(), true),
                _ => return None,
            };
            Some(ColumnPredicate {
                column,
                ranges: RangeSet::from_range(range),
            })
        }
        Expr::BinaryOp {
            left,
            op: op @ (BinaryOperator::And | BinaryOperator::Or),
            right,
        } => {
            let l = analyze(left, schema)?;
            let r = analyze(right, schema)?;
            if l.column != r.column {
                return None;
            }
            let ranges = if *op == BinaryOperator::And {
                l.ranges.intersect(&r.ranges)
            } else {
                l.ranges.union(&r.ranges)
            };
            Some(ColumnPredicate {
                column: l.column,
                ranges,
            })
        }
        Expr::InList {
            expr,
            list,
            negated: false,
        } => {
            let Expr::Column(column) = expr.as_ref() else {
                return None;
            };
            let mut values = Vec::with_capacity(list.len());
            for item in list {
                match item {
                    Expr::Literal(LiteralValue::Null) => {}
                    Expr::Literal(v) if comparable(schema, *column, v) => values.push(v.clone()),
                    _ => return None,
                }
            }
            Some(ColumnPredicate {
                column: *column,
                ranges: RangeSet::points(values),
            })
        }
        _ => None,
    }
}

fn comparable(schema: &Schema, column: usize, value: &LiteralValue) -> bool {
    !value.is_null()
        && schema
            .field(column)
            .map(|f| f.data_type.is_comparable_with(&value.data_type()))
            .unwrap_or(false)
}
