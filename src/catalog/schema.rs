//! Table schema definitions and validation.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::types::{ColumnDef, DataType, IndexDescriptor};

/// Table schema: ordered columns plus the indexes declared over them.
///
/// Index order is declaration order; the optimizer relies on it as the
/// final tie-break between equally good indexes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Table name.
    pub name: String,
    /// Column definitions.
    pub columns: Vec<ColumnDef>,
    /// Index definitions, in declaration order.
    #[serde(default)]
    pub indexes: Vec<IndexDescriptor>,
}

impl TableSchema {
    /// Create a new table schema without indexes.
    pub fn new(name: impl Into<String>, columns: Vec<ColumnDef>) -> Self {
        Self {
            name: name.into(),
            columns,
            indexes: Vec::new(),
        }
    }

    /// Get a column ordinal by name.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Get column names.
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// The primary index, if the table declares one.
    pub fn primary_index(&self) -> Option<&IndexDescriptor> {
        self.indexes.iter().find(|i| i.primary)
    }

    /// Primary key ordinals (empty without a primary index).
    pub fn primary_key(&self) -> &[usize] {
        self.primary_index()
            .map(|i| i.key_columns.as_slice())
            .unwrap_or(&[])
    }

    /// Validate the schema itself.
    pub fn validate(&self) -> Result<(), CatalogError> {
        let mut seen = HashSet::new();
        for col in &self.columns {
            if !seen.insert(&col.name) {
                return Err(CatalogError::DuplicateColumn(col.name.clone()));
            }
        }

        let mut index_names = HashSet::new();
        let mut primaries = 0;
        for index in &self.indexes {
            if !index_names.insert(&index.name) {
                return Err(CatalogError::DuplicateIndex(index.name.clone()));
            }
            if index.key_columns.is_empty() {
                return Err(CatalogError::InvalidIndex(format!(
                    "index '{}' has no key columns",
                    index.name
                )));
            }
            let mut key_seen = HashSet::new();
            for &ordinal in index.key_columns.iter().chain(index.included_columns.iter()) {
                if ordinal >= self.columns.len() {
                    return Err(CatalogError::InvalidIndex(format!(
                        "index '{}' references column ordinal {} of a {}-column table",
                        index.name,
                        ordinal,
                        self.columns.len()
                    )));
                }
            }
            for &ordinal in &index.key_columns {
                if !key_seen.insert(ordinal) {
                    return Err(CatalogError::InvalidIndex(format!(
                        "index '{}' repeats key column {}",
                        index.name, ordinal
                    )));
                }
            }
            if index.primary {
                primaries += 1;
            }
        }
        if primaries > 1 {
            return Err(CatalogError::MultiplePrimaryKeys(self.name.clone()));
        }

        Ok(())
    }
}

/// Result type for catalog operations.
pub type CatalogResult<T> = Result<T, CatalogError>;

/// Catalog and schema errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CatalogError {
    #[error("duplicate column: {0}")]
    DuplicateColumn(String),

    #[error("duplicate index: {0}")]
    DuplicateIndex(String),

    #[error("invalid index: {0}")]
    InvalidIndex(String),

    #[error("table {0} declares more than one primary key")]
    MultiplePrimaryKeys(String),

    #[error("column not found: {table}.{column}")]
    ColumnNotFound { table: String, column: String },

    #[error("index not found: {table}.{index}")]
    IndexNotFound { table: String, index: String },

    #[error("table already exists: {0}")]
    TableExists(String),

    #[error("table not found: {0}")]
    TableNotFound(String),

    #[error("invalid statistic: {0}")]
    InvalidStatistic(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

struct IndexSpec {
    name: String,
    keys: Vec<String>,
    included: Vec<String>,
    unique: bool,
    primary: bool,
}

/// Builder for creating table schemas with named columns and indexes.
pub struct SchemaBuilder {
    name: String,
    columns: Vec<ColumnDef>,
    indexes: Vec<IndexSpec>,
}

impl SchemaBuilder {
    /// Start building a new schema.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            indexes: Vec::new(),
        }
    }

    /// Add a column.
    pub fn column(mut self, column: ColumnDef) -> Self {
        self.columns.push(column);
        self
    }

    /// Add a nullable column with just name and type.
    pub fn add_column(mut self, name: impl Into<String>, data_type: DataType) -> Self {
        self.columns.push(ColumnDef::new(name, data_type));
        self
    }

    /// Add a non-nullable column.
    pub fn add_required_column(mut self, name: impl Into<String>, data_type: DataType) -> Self {
        self.columns.push(ColumnDef::new(name, data_type).not_null());
        self
    }

    /// Declare the primary key.
    pub fn primary_key(mut self, columns: &[&str]) -> Self {
        self.indexes.push(IndexSpec {
            name: "PRIMARY".to_string(),
            keys: columns.iter().map(|c| c.to_string()).collect(),
            included: Vec::new(),
            unique: true,
            primary: true,
        });
        self
    }

    /// Declare a secondary index.
    pub fn index(mut self, name: impl Into<String>, columns: &[&str]) -> Self {
        self.indexes.push(IndexSpec {
            name: name.into(),
            keys: columns.iter().map(|c| c.to_string()).collect(),
            included: Vec::new(),
            unique: false,
            primary: false,
        });
        self
    }

    /// Declare a unique secondary index.
    pub fn unique_index(mut self, name: impl Into<String>, columns: &[&str]) -> Self {
        self.indexes.push(IndexSpec {
            name: name.into(),
            keys: columns.iter().map(|c| c.to_string()).collect(),
            included: Vec::new(),
            unique: true,
            primary: false,
        });
        self
    }

    /// Declare a secondary index carrying extra (covering) columns.
    pub fn covering_index(mut self, name: impl Into<String>, columns: &[&str], included: &[&str]) -> Self {
        self.indexes.push(IndexSpec {
            name: name.into(),
            keys: columns.iter().map(|c| c.to_string()).collect(),
            included: included.iter().map(|c| c.to_string()).collect(),
            unique: false,
            primary: false,
        });
        self
    }

    /// Build the schema, resolving index column names.
    pub fn build(self) -> Result<TableSchema, CatalogError> {
        let mut schema = TableSchema::new(self.name, self.columns);

        let resolve = |schema: &TableSchema, names: &[String]| -> Result<Vec<usize>, CatalogError> {
            names
                .iter()
                .map(|n| {
                    schema.column_index(n).ok_or_else(|| CatalogError::ColumnNotFound {
                        table: schema.name.clone(),
                        column: n.clone(),
                    })
                })
                .collect()
        };

        let mut indexes = Vec::with_capacity(self.indexes.len());
        for spec in &self.indexes {
            indexes.push(IndexDescriptor {
                name: spec.name.clone(),
                key_columns: resolve(&schema, &spec.keys)?,
                included_columns: resolve(&schema, &spec.included)?,
                unique: spec.unique,
                primary: spec.primary,
            });
        }
        // The clustered index is always declared first.
        indexes.sort_by_key(|i| !i.primary);
        schema.indexes = indexes;

        schema.validate()?;
        Ok(schema)
    }
}
