//! Output schemas of plan nodes.

use std::fmt;

use crate::catalog::{ColumnDef, DataType};

/// Base-table column a field is derived from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnOrigin {
    pub table: String,
    /// Table column ordinal.
    pub column: usize,
}

/// A named, typed output column.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
    pub origin: Option<ColumnOrigin>,
}

impl Field {
    pub fn new(name: impl Into<String>, data_type: DataType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable,
            origin: None,
        }
    }

    /// Field produced by reading `column` (ordinal `ordinal`) of `table`.
    pub fn from_column(table: &str, ordinal: usize, column: &ColumnDef) -> Self {
        Self {
            name: column.name.clone(),
            data_type: column.data_type,
            nullable: column.nullable,
            origin: Some(ColumnOrigin {
                table: table.to_string(),
                column: ordinal,
            }),
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.data_type)?;
        if self.nullable {
            write!(f, "?")?;
        }
        Ok(())
    }
}

/// Ordered list of output fields.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Schema {
    fields: Vec<Field>,
}

impl Schema {
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field(&self, index: usize) -> Option<&Field> {
        self.fields.get(index)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Left fields followed by right fields.
    pub fn concat(&self, other: &Schema) -> Schema {
        let mut fields = self.fields.clone();
        fields.extend(other.fields.iter().cloned());
        Schema { fields }
    }

    /// The same fields, all made nullable.
    pub fn with_nullable(&self) -> Schema {
        Schema {
            fields: self
                .fields
                .iter()
                .map(|f| Field {
                    nullable: true,
                    ..f.clone()
                })
                .collect(),
        }
    }

    /// Field names in order.
    pub fn names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fields: Vec<String> = self.fields.iter().map(|x| x.to_string()).collect();
        write!(f, "[{}]", fields.join(", "))
    }
}
