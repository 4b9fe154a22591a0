//! costplan - A cost-aware logical plan rewriter
//!
//! This crate takes a relational query plan (scans, filters, projections,
//! joins, subqueries, grouping, sorting, limits) and rewrites it into an
//! equivalent plan that is cheaper to run. Choices are made against table
//! statistics and index definitions read from a catalog.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use costplan::catalog::{CatalogProvider, DataType, MemoryCatalog, SchemaBuilder};
//! use costplan::optimizer::Optimizer;
//! use costplan::planner::{Expr, PlanNode};
//!
//! let catalog = Arc::new(MemoryCatalog::new());
//! catalog.create_table(
//!     SchemaBuilder::new("users")
//!         .add_required_column("id", DataType::Integer)
//!         .add_column("name", DataType::Text)
//!         .primary_key(&["id"])
//!         .build()?,
//! )?;
//! catalog.set_row_count("users", 1000.0)?;
//!
//! let scan = PlanNode::scan(&catalog.schema("users")?)?;
//! let plan = PlanNode::filter(scan, Expr::eq(Expr::col(0), Expr::int(1)))?;
//!
//! let optimized = Optimizer::new(catalog).optimize(&plan)?;
//! assert_eq!(
//!     optimized.to_string(),
//!     "TableScan: users [id, name] index=PRIMARY[0] ranges=[{[1]}]\n"
//! );
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod catalog;
pub mod optimizer;
pub mod planner;

pub use catalog::{CatalogProvider, CatalogSnapshot, MemoryCatalog};
pub use optimizer::{OptimizedPlan, Optimizer, OptimizerConfig};
pub use planner::{Expr, PlanError, PlanNode, PlanResult};
