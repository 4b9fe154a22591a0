//! Point-in-time copy of the catalog facts one optimization needs.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};

use super::manager::CatalogProvider;
use super::schema::{CatalogResult, TableSchema};
use super::stats::{clamp_selectivity, defaults, PredicateShape, Statistics};
use super::types::IndexDescriptor;

/// Statistics and definitions of one table at capture time.
#[derive(Debug, Clone)]
pub struct TableSnapshot {
    pub schema: TableSchema,
    pub row_count: f64,
    /// Equality selectivities keyed by sorted column ordinals.
    equality: BTreeMap<Vec<usize>, f64>,
    range: BTreeMap<usize, f64>,
}

impl TableSnapshot {
    fn capture(provider: &dyn CatalogProvider, table: &str) -> CatalogResult<Self> {
        let schema = provider.schema(table)?;
        let row_count = provider.row_count(table)?;

        let mut equality = BTreeMap::new();
        let mut range = BTreeMap::new();
        for column in 0..schema.columns.len() {
            equality.insert(
                vec![column],
                provider.selectivity(table, &[column], PredicateShape::Equality)?,
            );
            range.insert(column, provider.selectivity(table, &[column], PredicateShape::Range)?);
        }
        for index in &schema.indexes {
            for len in 2..=index.key_columns.len() {
                let prefix = index.leading_columns(len);
                let mut key = prefix.to_vec();
                key.sort_unstable();
                if !equality.contains_key(&key) {
                    let s = provider.selectivity(table, prefix, PredicateShape::Equality)?;
                    equality.insert(key, s);
                }
            }
        }

        Ok(Self {
            schema,
            row_count,
            equality,
            range,
        })
    }

    fn selectivity(&self, columns: &[usize], shape: PredicateShape) -> f64 {
        if columns.is_empty() {
            return 1.0;
        }
        let mut key = columns.to_vec();
        key.sort_unstable();
        key.dedup();

        match shape {
            PredicateShape::Equality => {
                if let Some(&s) = self.equality.get(&key) {
                    return s;
                }
                key.iter()
                    .map(|c| self.equality.get(&vec![*c]).copied().unwrap_or(defaults::EQUALITY))
                    .product()
            }
            PredicateShape::Range => key
                .iter()
                .map(|c| self.range.get(c).copied().unwrap_or(defaults::RANGE))
                .product(),
        }
    }
}

/// Immutable catalog view captured once per optimization.
#[derive(Debug, Clone)]
pub struct CatalogSnapshot {
    tables: HashMap<String, TableSnapshot>,
    captured_at: DateTime<Utc>,
}

impl CatalogSnapshot {
    /// Copy the definitions and statistics of `tables` from the provider.
    pub fn capture<'a>(
        provider: &dyn CatalogProvider,
        tables: impl IntoIterator<Item = &'a str>,
    ) -> CatalogResult<Self> {
        let mut captured = HashMap::new();
        for table in tables {
            if captured.contains_key(table) {
                continue;
            }
            captured.insert(table.to_string(), TableSnapshot::capture(provider, table)?);
        }
        Ok(Self {
            tables: captured,
            captured_at: Utc::now(),
        })
    }

    /// Snapshot without any tables; every estimate falls back to defaults.
    pub fn empty() -> Self {
        Self {
            tables: HashMap::new(),
            captured_at: Utc::now(),
        }
    }

    /// When the snapshot was taken.
    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    pub fn table(&self, name: &str) -> Option<&TableSnapshot> {
        self.tables.get(name)
    }

    pub fn schema(&self, table: &str) -> Option<&TableSchema> {
        self.tables.get(table).map(|t| &t.schema)
    }

    /// Indexes of a table in declaration order (empty if unknown).
    pub fn indexes(&self, table: &str) -> &[IndexDescriptor] {
        self.tables
            .get(table)
            .map(|t| t.schema.indexes.as_slice())
            .unwrap_or(&[])
    }
}

impl Statistics for CatalogSnapshot {
    fn row_count(&self, table: &str) -> f64 {
        self.tables
            .get(table)
            .map(|t| t.row_count)
            .unwrap_or(defaults::ROW_COUNT)
    }

    fn selectivity(&self, table: &str, columns: &[usize], shape: PredicateShape) -> f64 {
        let s = match self.tables.get(table) {
            Some(t) => t.selectivity(columns, shape),
            None if columns.is_empty() => 1.0,
            None => {
                let per_column = match shape {
                    PredicateShape::Equality => defaults::EQUALITY,
                    PredicateShape::Range => defaults::RANGE,
                };
                per_column.powi(columns.len() as i32)
            }
        };
        clamp_selectivity(s)
    }
}
