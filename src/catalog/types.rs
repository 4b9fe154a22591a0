//! Column types, column definitions and index descriptors.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// SQL-like data types understood by the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// Text/string data (VARCHAR in SQL).
    Text,
    /// Integer numbers (BIGINT in SQL).
    Integer,
    /// Floating point numbers (DOUBLE in SQL).
    Float,
    /// Boolean values.
    Boolean,
    /// Type of an untyped NULL literal. Never used for table columns.
    Null,
}

impl DataType {
    /// Get the SQL name for this type.
    pub fn sql_name(&self) -> &'static str {
        match self {
            DataType::Text => "TEXT",
            DataType::Integer => "INTEGER",
            DataType::Float => "REAL",
            DataType::Boolean => "BOOLEAN",
            DataType::Null => "NULL",
        }
    }

    /// Check if this is a numeric type.
    pub fn is_numeric(&self) -> bool {
        matches!(self, DataType::Integer | DataType::Float)
    }

    /// Check if values of the two types can be ordered against each other.
    pub fn is_comparable_with(&self, other: &DataType) -> bool {
        self == other || (self.is_numeric() && other.is_numeric())
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.sql_name())
    }
}

fn default_nullable() -> bool {
    true
}

/// Column definition: name, type and nullability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    /// Column name.
    pub name: String,
    /// Data type.
    pub data_type: DataType,
    /// Whether the column admits NULL.
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

impl ColumnDef {
    /// Create a new nullable column definition.
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
        }
    }

    /// Mark the column NOT NULL.
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

impl fmt::Display for ColumnDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.data_type)?;
        if !self.nullable {
            write!(f, " NOT NULL")?;
        }
        Ok(())
    }
}

/// Description of an index over a table.
///
/// Column references are table ordinals. The primary index is clustered:
/// it stores every column of the row. A secondary index stores its key
/// columns, its included columns and the primary key of the row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    /// Index name, unique within its table.
    pub name: String,
    /// Ordered key columns.
    pub key_columns: Vec<usize>,
    /// Extra columns stored in the index entries.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub included_columns: Vec<usize>,
    /// Whether the full key is unique.
    #[serde(default)]
    pub unique: bool,
    /// Whether this is the table's primary (clustered) index.
    #[serde(default)]
    pub primary: bool,
}

impl IndexDescriptor {
    /// Create the primary index of a table.
    pub fn primary(name: impl Into<String>, key_columns: Vec<usize>) -> Self {
        Self {
            name: name.into(),
            key_columns,
            included_columns: Vec::new(),
            unique: true,
            primary: true,
        }
    }

    /// Create a non-unique secondary index.
    pub fn secondary(name: impl Into<String>, key_columns: Vec<usize>) -> Self {
        Self {
            name: name.into(),
            key_columns,
            included_columns: Vec::new(),
            unique: false,
            primary: false,
        }
    }

    /// Add included (covering) columns.
    pub fn with_included(mut self, columns: Vec<usize>) -> Self {
        self.included_columns = columns;
        self
    }

    /// Mark the index unique.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// The first `n` key columns.
    pub fn leading_columns(&self, n: usize) -> &[usize] {
        &self.key_columns[..n.min(self.key_columns.len())]
    }

    /// Table columns readable from the index entries alone.
    pub fn covered_columns(&self, table_width: usize, primary_key: &[usize]) -> BTreeSet<usize> {
        if self.primary {
            return (0..table_width).collect();
        }
        self.key_columns
            .iter()
            .chain(self.included_columns.iter())
            .chain(primary_key.iter())
            .copied()
            .collect()
    }

    /// Check whether the index supplies every one of `columns` without a
    /// secondary primary-key lookup.
    pub fn covers(&self, columns: &BTreeSet<usize>, table_width: usize, primary_key: &[usize]) -> bool {
        let covered = self.covered_columns(table_width, primary_key);
        columns.is_subset(&covered)
    }
}

impl fmt::Display for IndexDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.primary {
            write!(f, "PRIMARY ")?;
        } else if self.unique {
            write!(f, "UNIQUE ")?;
        }
        write!(f, "{}{:?}", self.name, self.key_columns)?;
        if !self.included_columns.is_empty() {
            write!(f, " INCLUDE {:?}", self.included_columns)?;
        }
        Ok(())
    }
}
