//! Catalog facade for table definitions, indexes and statistics.
//!
//! The optimizer reads the catalog through [`CatalogProvider`] and never
//! consults it directly while rewriting: it works on a [`CatalogSnapshot`]
//! captured once per optimization.

mod manager;
mod schema;
mod snapshot;
mod stats;
mod types;

pub use manager::{CatalogEntry, CatalogProvider, MemoryCatalog};
pub use schema::{CatalogError, CatalogResult, SchemaBuilder, TableSchema};
pub use snapshot::{CatalogSnapshot, TableSnapshot};
pub use stats::{clamp_selectivity, defaults, PredicateShape, SelectivityOverride, Statistics, TableStats};
pub use types::{ColumnDef, DataType, IndexDescriptor};
