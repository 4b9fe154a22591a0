//! Scalar expressions with positional column references.
//!
//! `Column(i)` addresses position `i` of the input schema of the node holding
//! the expression; for a join that is the left schema followed by the right
//! one. `OuterColumn(i)` addresses position `i` of the input schema of the
//! node holding the enclosing subquery expression. Only one level of outer
//! scope is addressable.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use super::error::{PlanError, PlanResult};
use super::node::PlanNode;
use super::schema::Schema;
use super::value::LiteralValue;
use crate::catalog::DataType;

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOperator {
    // Comparison
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    // Logical
    And,
    Or,
    // Arithmetic
    Plus,
    Minus,
    Multiply,
    Divide,
    Modulo,
    // String
    Concat,
}

impl BinaryOperator {
    /// Check if this is a comparison operator.
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOperator::Eq
                | BinaryOperator::NotEq
                | BinaryOperator::Lt
                | BinaryOperator::LtEq
                | BinaryOperator::Gt
                | BinaryOperator::GtEq
        )
    }

    /// Check if this is a logical operator.
    pub fn is_logical(&self) -> bool {
        matches!(self, BinaryOperator::And | BinaryOperator::Or)
    }

    /// The operator with its operands swapped (`a < b` is `b > a`).
    pub fn flip(&self) -> BinaryOperator {
        match self {
            BinaryOperator::Lt => BinaryOperator::Gt,
            BinaryOperator::LtEq => BinaryOperator::GtEq,
            BinaryOperator::Gt => BinaryOperator::Lt,
            BinaryOperator::GtEq => BinaryOperator::LtEq,
            other => *other,
        }
    }

    fn symbol(&self) -> &'static str {
        match self {
            BinaryOperator::Eq => "=",
            BinaryOperator::NotEq => "<>",
            BinaryOperator::Lt => "<",
            BinaryOperator::LtEq => "<=",
            BinaryOperator::Gt => ">",
            BinaryOperator::GtEq => ">=",
            BinaryOperator::And => "AND",
            BinaryOperator::Or => "OR",
            BinaryOperator::Plus => "+",
            BinaryOperator::Minus => "-",
            BinaryOperator::Multiply => "*",
            BinaryOperator::Divide => "/",
            BinaryOperator::Modulo => "%",
            BinaryOperator::Concat => "||",
        }
    }
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOperator {
    Not,
    Minus,
}

/// Scalar expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Position in the holding node's input schema.
    Column(usize),
    /// Position in the input schema of the node holding the enclosing
    /// subquery expression.
    OuterColumn(usize),
    Literal(LiteralValue),
    BinaryOp {
        left: Box<Expr>,
        op: BinaryOperator,
        right: Box<Expr>,
    },
    UnaryOp {
        op: UnaryOperator,
        expr: Box<Expr>,
    },
    IsNull {
        expr: Box<Expr>,
        negated: bool,
    },
    InList {
        expr: Box<Expr>,
        list: Vec<Expr>,
        negated: bool,
    },
    /// `EXISTS (subquery)`; the node is always a `PlanNode::Subquery`.
    Exists(Arc<PlanNode>),
    /// Single-value subquery; the node is always a `PlanNode::Subquery`.
    ScalarSubquery(Arc<PlanNode>),
}

/// How an embedded subquery is consumed by its expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubqueryKind {
    /// Only row existence matters.
    Exists,
    /// The first column of the single row is read.
    Scalar,
}

/// Where a rebound column reference points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefTarget {
    Column(usize),
    Outer(usize),
}

impl Expr {
    pub fn col(index: usize) -> Expr {
        Expr::Column(index)
    }

    pub fn outer(index: usize) -> Expr {
        Expr::OuterColumn(index)
    }

    pub fn lit(value: LiteralValue) -> Expr {
        Expr::Literal(value)
    }

    pub fn int(value: i64) -> Expr {
        Expr::Literal(LiteralValue::Integer(value))
    }

    pub fn text(value: impl Into<String>) -> Expr {
        Expr::Literal(LiteralValue::String(value.into()))
    }

    pub fn null() -> Expr {
        Expr::Literal(LiteralValue::Null)
    }

    pub fn binary(left: Expr, op: BinaryOperator, right: Expr) -> Expr {
        Expr::BinaryOp {
            left: Box::new(left),
            op,
            right: Box::new(right),
        }
    }

    pub fn eq(left: Expr, right: Expr) -> Expr {
        Expr::binary(left, BinaryOperator::Eq, right)
    }

    pub fn and(left: Expr, right: Expr) -> Expr {
        Expr::binary(left, BinaryOperator::And, right)
    }

    pub fn or(left: Expr, right: Expr) -> Expr {
        Expr::binary(left, BinaryOperator::Or, right)
    }

    pub fn not(expr: Expr) -> Expr {
        Expr::UnaryOp {
            op: UnaryOperator::Not,
            expr: Box::new(expr),
        }
    }

    pub fn is_null(expr: Expr, negated: bool) -> Expr {
        Expr::IsNull {
            expr: Box::new(expr),
            negated,
        }
    }

    pub fn in_list(expr: Expr, list: Vec<Expr>, negated: bool) -> Expr {
        Expr::InList {
            expr: Box::new(expr),
            list,
            negated,
        }
    }

    /// Split a predicate into its top-level `AND` conjuncts.
    pub fn conjuncts(&self) -> Vec<Expr> {
        let mut out = Vec::new();
        self.collect_conjuncts(&mut out);
        out
    }

    fn collect_conjuncts(&self, out: &mut Vec<Expr>) {
        match self {
            Expr::BinaryOp {
                left,
                op: BinaryOperator::And,
                right,
            } => {
                left.collect_conjuncts(out);
                right.collect_conjuncts(out);
            }
            other => out.push(other.clone()),
        }
    }

    /// Join conjuncts with `AND`; `None` when there are none.
    pub fn conjunction(conjuncts: impl IntoIterator<Item = Expr>) -> Option<Expr> {
        conjuncts.into_iter().reduce(Expr::and)
    }

    /// Input positions read by this expression, including the outer
    /// references of embedded subqueries.
    pub fn column_refs(&self) -> BTreeSet<usize> {
        let mut refs = BTreeSet::new();
        self.visit(&mut |e| match e {
            Expr::Column(i) => {
                refs.insert(*i);
            }
            Expr::Exists(sq) | Expr::ScalarSubquery(sq) => {
                refs.extend(sq.outer_refs());
            }
            _ => {}
        });
        refs
    }

    /// Outer-scope positions read at this scope level.
    pub fn outer_refs(&self) -> BTreeSet<usize> {
        let mut refs = BTreeSet::new();
        self.visit(&mut |e| {
            if let Expr::OuterColumn(i) = e {
                refs.insert(*i);
            }
        });
        refs
    }

    /// Embedded subquery nodes at this scope level.
    pub fn subqueries(&self) -> Vec<&Arc<PlanNode>> {
        let mut out = Vec::new();
        self.visit(&mut |e| {
            if let Expr::Exists(sq) | Expr::ScalarSubquery(sq) = e {
                out.push(sq);
            }
        });
        out
    }

    pub fn contains_subquery(&self) -> bool {
        !self.subqueries().is_empty()
    }

    /// Pre-order walk that does not descend into subquery bodies.
    fn visit<'a>(&'a self, f: &mut dyn FnMut(&'a Expr)) {
        f(self);
        match self {
            Expr::BinaryOp { left, right, .. } => {
                left.visit(f);
                right.visit(f);
            }
            Expr::UnaryOp { expr, .. } | Expr::IsNull { expr, .. } => expr.visit(f),
            Expr::InList { expr, list, .. } => {
                expr.visit(f);
                for item in list {
                    item.visit(f);
                }
            }
            Expr::Column(_)
            | Expr::OuterColumn(_)
            | Expr::Literal(_)
            | Expr::Exists(_)
            | Expr::ScalarSubquery(_) => {}
        }
    }

    /// Re-index column references (and the outer references of embedded
    /// subquery bodies). A column the mapping drops is an error.
    pub fn remap_columns(&self, f: &dyn Fn(usize) -> Option<usize>) -> PlanResult<Expr> {
        self.rebind(&|i| f(i).map(RefTarget::Column), &|i| Some(RefTarget::Outer(i)))
    }

    /// Re-index outer references at this scope level.
    pub fn map_outer_refs(&self, f: &dyn Fn(usize) -> Option<usize>) -> PlanResult<Expr> {
        self.rebind(&|i| Some(RefTarget::Column(i)), &|i| f(i).map(RefTarget::Outer))
    }

    /// Rebind an expression written inside a subquery body so it can be
    /// evaluated over `outer ++ body`: outer references become columns of
    /// the left side and body columns shift right by `outer_width`.
    pub fn outer_to_columns(&self, outer_width: usize) -> PlanResult<Expr> {
        self.rebind(
            &|i| Some(RefTarget::Column(outer_width + i)),
            &|i| Some(RefTarget::Column(i)),
        )
    }

    fn rebind(
        &self,
        column: &dyn Fn(usize) -> Option<RefTarget>,
        outer: &dyn Fn(usize) -> Option<RefTarget>,
    ) -> PlanResult<Expr> {
        let target = |t: Option<RefTarget>, what: &str, i: usize| -> PlanResult<Expr> {
            match t {
                Some(RefTarget::Column(n)) => Ok(Expr::Column(n)),
                Some(RefTarget::Outer(n)) => Ok(Expr::OuterColumn(n)),
                None => Err(PlanError::malformed(format!("{} #{} has no position after rewrite", what, i))),
            }
        };

        Ok(match self {
            Expr::Column(i) => target(column(*i), "column", *i)?,
            Expr::OuterColumn(i) => target(outer(*i), "outer column", *i)?,
            Expr::Literal(v) => Expr::Literal(v.clone()),
            Expr::BinaryOp { left, op, right } => Expr::BinaryOp {
                left: Box::new(left.rebind(column, outer)?),
                op: *op,
                right: Box::new(right.rebind(column, outer)?),
            },
            Expr::UnaryOp { op, expr } => Expr::UnaryOp {
                op: *op,
                expr: Box::new(expr.rebind(column, outer)?),
            },
            Expr::IsNull { expr, negated } => Expr::IsNull {
                expr: Box::new(expr.rebind(column, outer)?),
                negated: *negated,
            },
            Expr::InList { expr, list, negated } => Expr::InList {
                expr: Box::new(expr.rebind(column, outer)?),
                list: list
                    .iter()
                    .map(|e| e.rebind(column, outer))
                    .collect::<PlanResult<Vec<_>>>()?,
                negated: *negated,
            },
            Expr::Exists(sq) => Expr::Exists(Self::rebind_subquery(sq, column)?),
            Expr::ScalarSubquery(sq) => Expr::ScalarSubquery(Self::rebind_subquery(sq, column)?),
        })
    }

    fn rebind_subquery(
        sq: &Arc<PlanNode>,
        column: &dyn Fn(usize) -> Option<RefTarget>,
    ) -> PlanResult<Arc<PlanNode>> {
        let refs = sq.outer_refs();
        if refs.iter().all(|&i| column(i) == Some(RefTarget::Column(i))) {
            return Ok(Arc::clone(sq));
        }
        sq.map_outer_refs(&|i| match column(i) {
            Some(RefTarget::Column(n)) => Some(n),
            _ => None,
        })
    }

    /// Rebuild the expression with each embedded subquery node replaced.
    pub fn map_subqueries(
        &self,
        f: &mut dyn FnMut(SubqueryKind, &Arc<PlanNode>) -> PlanResult<Arc<PlanNode>>,
    ) -> PlanResult<Expr> {
        Ok(match self {
            Expr::Column(_) | Expr::OuterColumn(_) | Expr::Literal(_) => self.clone(),
            Expr::BinaryOp { left, op, right } => Expr::BinaryOp {
                left: Box::new(left.map_subqueries(f)?),
                op: *op,
                right: Box::new(right.map_subqueries(f)?),
            },
            Expr::UnaryOp { op, expr } => Expr::UnaryOp {
                op: *op,
                expr: Box::new(expr.map_subqueries(f)?),
            },
            Expr::IsNull { expr, negated } => Expr::IsNull {
                expr: Box::new(expr.map_subqueries(f)?),
                negated: *negated,
            },
            Expr::InList { expr, list, negated } => Expr::InList {
                expr: Box::new(expr.map_subqueries(f)?),
                list: list
                    .iter()
                    .map(|e| e.map_subqueries(f))
                    .collect::<PlanResult<Vec<_>>>()?,
                negated: *negated,
            },
            Expr::Exists(sq) => Expr::Exists(f(SubqueryKind::Exists, sq)?),
            Expr::ScalarSubquery(sq) => Expr::ScalarSubquery(f(SubqueryKind::Scalar, sq)?),
        })
    }

    /// `(left, right)` when this is `Column(left) = Column(right)`.
    pub fn as_column_equality(&self) -> Option<(usize, usize)> {
        match self {
            Expr::BinaryOp {
                left,
                op: BinaryOperator::Eq,
                right,
            } => match (left.as_ref(), right.as_ref()) {
                (Expr::Column(l), Expr::Column(r)) => Some((*l, *r)),
                _ => None,
            },
            _ => None,
        }
    }

    /// Result type over `input`. Outer references are typed `Null` since
    /// the enclosing schema is not known here.
    pub fn data_type(&self, input: &Schema) -> DataType {
        match self {
            Expr::Column(i) => input.field(*i).map(|f| f.data_type).unwrap_or(DataType::Null),
            Expr::OuterColumn(_) => DataType::Null,
            Expr::Literal(v) => v.data_type(),
            Expr::BinaryOp { left, op, right } => {
                if op.is_comparison() || op.is_logical() {
                    DataType::Boolean
                } else if *op == BinaryOperator::Concat {
                    DataType::Text
                } else {
                    let l = left.data_type(input);
                    let r = right.data_type(input);
                    if l == DataType::Float || r == DataType::Float {
                        DataType::Float
                    } else if l == DataType::Null && r == DataType::Null {
                        DataType::Null
                    } else {
                        DataType::Integer
                    }
                }
            }
            Expr::UnaryOp { op: UnaryOperator::Not, .. } => DataType::Boolean,
            Expr::UnaryOp { op: UnaryOperator::Minus, expr } => expr.data_type(input),
            Expr::IsNull { .. } | Expr::InList { .. } | Expr::Exists(_) => DataType::Boolean,
            Expr::ScalarSubquery(sq) => sq
                .schema()
                .field(0)
                .map(|f| f.data_type)
                .unwrap_or(DataType::Null),
        }
    }

    /// Whether the expression may evaluate to NULL over `input`.
    pub fn nullable(&self, input: &Schema) -> bool {
        match self {
            Expr::Column(i) => input.field(*i).map(|f| f.nullable).unwrap_or(true),
            Expr::OuterColumn(_) | Expr::ScalarSubquery(_) => true,
            Expr::Literal(v) => v.is_null(),
            Expr::BinaryOp { left, op, right } => {
                matches!(op, BinaryOperator::Divide | BinaryOperator::Modulo)
                    || left.nullable(input)
                    || right.nullable(input)
            }
            Expr::UnaryOp { expr, .. } => expr.nullable(input),
            Expr::IsNull { .. } | Expr::Exists(_) => false,
            Expr::InList { expr, list, .. } => {
                expr.nullable(input) || list.iter().any(|e| e.nullable(input))
            }
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Column(i) => write!(f, "#{}", i),
            Expr::OuterColumn(i) => write!(f, "outer#{}", i),
            Expr::Literal(v) => write!(f, "{}", v),
            Expr::BinaryOp { left, op, right } => write!(f, "({} {} {})", left, op.symbol(), right),
            Expr::UnaryOp { op: UnaryOperator::Not, expr } => write!(f, "NOT {}", expr),
            Expr::UnaryOp { op: UnaryOperator::Minus, expr } => write!(f, "-{}", expr),
            Expr::IsNull { expr, negated } => {
                write!(f, "{} IS {}NULL", expr, if *negated { "NOT " } else { "" })
            }
            Expr::InList { expr, list, negated } => {
                let items: Vec<String> = list.iter().map(|e| e.to_string()).collect();
                write!(
                    f,
                    "{} {}IN ({})",
                    expr,
                    if *negated { "NOT " } else { "" },
                    items.join(", ")
                )
            }
            Expr::Exists(sq) => write!(f, "EXISTS({})", subquery_label(sq)),
            Expr::ScalarSubquery(sq) => write!(f, "SCALAR({})", subquery_label(sq)),
        }
    }
}

fn subquery_label(sq: &PlanNode) -> String {
    let tables: Vec<String> = sq.referenced_tables().into_iter().collect();
    tables.join(", ")
}
