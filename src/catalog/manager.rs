//! Catalog provider interface and the in-memory catalog.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::schema::{CatalogError, CatalogResult, TableSchema};
use super::stats::{clamp_selectivity, defaults, PredicateShape, TableStats};
use super::types::IndexDescriptor;

/// Read access to table definitions and statistics.
///
/// Implementations must be safe to share between concurrently running
/// optimizations.
pub trait CatalogProvider: Send + Sync {
    /// Schema (columns and indexes) of a table.
    fn schema(&self, table: &str) -> CatalogResult<TableSchema>;

    /// Indexes of a table, in declaration order.
    fn indexes(&self, table: &str) -> CatalogResult<Vec<IndexDescriptor>> {
        Ok(self.schema(table)?.indexes)
    }

    /// Estimated row count of a table.
    fn row_count(&self, table: &str) -> CatalogResult<f64>;

    /// Estimated selectivity of a predicate over `columns` (table ordinals).
    fn selectivity(&self, table: &str, columns: &[usize], shape: PredicateShape) -> CatalogResult<f64>;
}

/// A table definition together with its statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub schema: TableSchema,
    #[serde(default)]
    pub stats: TableStats,
}

impl CatalogEntry {
    fn column_ordinal(&self, column: &str) -> CatalogResult<usize> {
        self.schema
            .column_index(column)
            .ok_or_else(|| CatalogError::ColumnNotFound {
                table: self.schema.name.clone(),
                column: column.to_string(),
            })
    }

    fn single_column_selectivity(&self, column: usize, shape: PredicateShape) -> f64 {
        if let Some(s) = self.stats.override_for(&[column], shape) {
            return s;
        }
        match shape {
            PredicateShape::Equality => {
                if self.unique_on(&[column]) {
                    return 1.0 / self.stats.row_count.max(1.0);
                }
                match self.stats.distinct_counts.get(&column) {
                    Some(&ndv) if ndv > 0 => 1.0 / ndv as f64,
                    _ => defaults::EQUALITY,
                }
            }
            PredicateShape::Range => defaults::RANGE,
        }
    }

    /// Whether some unique index key is fully bound by `columns`.
    fn unique_on(&self, columns: &[usize]) -> bool {
        let bound: BTreeSet<usize> = columns.iter().copied().collect();
        self.schema
            .indexes
            .iter()
            .filter(|i| i.unique)
            .any(|i| i.key_columns.iter().all(|c| bound.contains(c)))
    }

    fn selectivity(&self, columns: &[usize], shape: PredicateShape) -> f64 {
        if columns.is_empty() {
            return 1.0;
        }
        if let Some(s) = self.stats.override_for(columns, shape) {
            return clamp_selectivity(s);
        }
        if shape == PredicateShape::Equality && columns.len() > 1 && self.unique_on(columns) {
            return clamp_selectivity(1.0 / self.stats.row_count.max(1.0));
        }
        let product = columns
            .iter()
            .map(|&c| self.single_column_selectivity(c, shape))
            .product();
        clamp_selectivity(product)
    }
}

/// In-memory catalog guarded by a reader-writer lock.
#[derive(Default)]
pub struct MemoryCatalog {
    tables: RwLock<BTreeMap<String, CatalogEntry>>,
}

impl MemoryCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new table with default statistics.
    pub fn create_table(&self, schema: TableSchema) -> CatalogResult<()> {
        schema.validate()?;

        let mut tables = self.tables.write();
        if tables.contains_key(&schema.name) {
            return Err(CatalogError::TableExists(schema.name));
        }
        tables.insert(
            schema.name.clone(),
            CatalogEntry {
                schema,
                stats: TableStats::default(),
            },
        );
        Ok(())
    }

    /// Remove a table and its statistics.
    pub fn drop_table(&self, name: &str) -> CatalogResult<()> {
        self.tables
            .write()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| CatalogError::TableNotFound(name.to_string()))
    }

    /// Remove an index from a table.
    pub fn drop_index(&self, table: &str, index: &str) -> CatalogResult<()> {
        self.with_entry_mut(table, |entry| {
            let before = entry.schema.indexes.len();
            entry.schema.indexes.retain(|i| i.name != index);
            if entry.schema.indexes.len() == before {
                return Err(CatalogError::IndexNotFound {
                    table: table.to_string(),
                    index: index.to_string(),
                });
            }
            Ok(())
        })
    }

    /// Check if a table exists.
    pub fn table_exists(&self, name: &str) -> bool {
        self.tables.read().contains_key(name)
    }

    /// List all table names.
    pub fn list_tables(&self) -> Vec<String> {
        self.tables.read().keys().cloned().collect()
    }

    /// Set the row count of a table.
    pub fn set_row_count(&self, table: &str, rows: f64) -> CatalogResult<()> {
        if !rows.is_finite() || rows < 0.0 {
            return Err(CatalogError::InvalidStatistic(format!(
                "row count {} for table {}",
                rows, table
            )));
        }
        self.with_entry_mut(table, |entry| {
            entry.stats.row_count = rows;
            entry.stats.analyzed_at = Some(chrono::Utc::now());
            Ok(())
        })
    }

    /// Set the number of distinct values of a column.
    pub fn set_distinct_count(&self, table: &str, column: &str, distinct: u64) -> CatalogResult<()> {
        self.with_entry_mut(table, |entry| {
            let ordinal = entry.column_ordinal(column)?;
            entry.stats.distinct_counts.insert(ordinal, distinct);
            entry.stats.analyzed_at = Some(chrono::Utc::now());
            Ok(())
        })
    }

    /// Record an explicit selectivity for a predicate shape over columns.
    pub fn set_selectivity(
        &self,
        table: &str,
        columns: &[&str],
        shape: PredicateShape,
        selectivity: f64,
    ) -> CatalogResult<()> {
        if !(0.0..=1.0).contains(&selectivity) {
            return Err(CatalogError::InvalidStatistic(format!(
                "selectivity {} outside [0, 1]",
                selectivity
            )));
        }
        self.with_entry_mut(table, |entry| {
            let ordinals = columns
                .iter()
                .map(|c| entry.column_ordinal(c))
                .collect::<CatalogResult<Vec<_>>>()?;
            entry.stats.set_override(ordinals, shape, selectivity);
            Ok(())
        })
    }

    /// Statistics currently recorded for a table.
    pub fn stats(&self, table: &str) -> CatalogResult<TableStats> {
        self.tables
            .read()
            .get(table)
            .map(|e| e.stats.clone())
            .ok_or_else(|| CatalogError::TableNotFound(table.to_string()))
    }

    /// Load a catalog from its JSON form (a list of entries).
    pub fn from_json(json: &str) -> CatalogResult<Self> {
        let entries: Vec<CatalogEntry> =
            serde_json::from_str(json).map_err(|e| CatalogError::Serialization(e.to_string()))?;

        let mut tables = BTreeMap::new();
        for entry in entries {
            entry.schema.validate()?;
            let name = entry.schema.name.clone();
            if tables.insert(name.clone(), entry).is_some() {
                return Err(CatalogError::TableExists(name));
            }
        }
        Ok(Self {
            tables: RwLock::new(tables),
        })
    }

    /// Serialize the catalog to JSON.
    pub fn to_json(&self) -> CatalogResult<String> {
        let tables = self.tables.read();
        let entries: Vec<&CatalogEntry> = tables.values().collect();
        serde_json::to_string_pretty(&entries).map_err(|e| CatalogError::Serialization(e.to_string()))
    }

    fn with_entry_mut<T>(
        &self,
        table: &str,
        f: impl FnOnce(&mut CatalogEntry) -> CatalogResult<T>,
    ) -> CatalogResult<T> {
        let mut tables = self.tables.write();
        let entry = tables
            .get_mut(table)
            .ok_or_else(|| CatalogError::TableNotFound(table.to_string()))?;
        f(entry)
    }

    fn with_entry<T>(&self, table: &str, f: impl FnOnce(&CatalogEntry) -> T) -> CatalogResult<T> {
        let tables = self.tables.read();
        let entry = tables
            .get(table)
            .ok_or_else(|| CatalogError::TableNotFound(table.to_string()))?;
        Ok(f(entry))
    }
}

impl CatalogProvider for MemoryCatalog {
    fn schema(&self, table: &str) -> CatalogResult<TableSchema> {
        self.with_entry(table, |e| e.schema.clone())
    }

    fn row_count(&self, table: &str) -> CatalogResult<f64> {
        self.with_entry(table, |e| e.stats.row_count)
    }

    fn selectivity(&self, table: &str, columns: &[usize], shape: PredicateShape) -> CatalogResult<f64> {
        self.with_entry(table, |e| e.selectivity(columns, shape))
    }
}
