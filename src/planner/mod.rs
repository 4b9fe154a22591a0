//! Logical plan model.
//!
//! Plans are immutable trees of [`PlanNode`]s with positional column
//! references. This module provides the node and expression types, the
//! key range algebra used by index accesses, cardinality estimation and
//! explain output.

mod access;
mod error;
mod estimate;
mod explain;
mod expr;
mod node;
mod sargable;
mod schema;
mod value;

pub use access::{ColumnRange, IndexAccess, IndexLookup, KeyBound, KeyRange, RangeSet};
pub use error::{PlanError, PlanResult};
pub use estimate::{conjunct_selectivity, key_range_selectivity, predicate_selectivity};
pub use expr::{BinaryOperator, Expr, SubqueryKind, UnaryOperator};
pub use node::{
    equi_key_pairs, AggregateExpr, AggregateFunction, Filter, GroupBy, Join, JoinStrategy, JoinType, Limit,
    PlanNode, Project, ProjectItem, Sort, SortKey, Subquery, TableScan,
};
pub(crate) use node::lookup_target;
pub use sargable::{analyze as analyze_sargable, ColumnPredicate};
pub use schema::{ColumnOrigin, Field, Schema};
pub use value::LiteralValue;
