//! Literal values carried by expressions and index ranges.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::catalog::DataType;

/// Literal value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LiteralValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
}

impl LiteralValue {
    /// Type of the value.
    pub fn data_type(&self) -> DataType {
        match self {
            LiteralValue::Null => DataType::Null,
            LiteralValue::Boolean(_) => DataType::Boolean,
            LiteralValue::Integer(_) => DataType::Integer,
            LiteralValue::Float(_) => DataType::Float,
            LiteralValue::String(_) => DataType::Text,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, LiteralValue::Null)
    }

    /// SQL ordering between two values. `None` when either side is NULL or
    /// the types cannot be compared. Integers and floats compare by value.
    pub fn compare(&self, other: &LiteralValue) -> Option<Ordering> {
        match (self, other) {
            (LiteralValue::Boolean(a), LiteralValue::Boolean(b)) => Some(a.cmp(b)),
            (LiteralValue::Integer(a), LiteralValue::Integer(b)) => Some(a.cmp(b)),
            (LiteralValue::Float(a), LiteralValue::Float(b)) => a.partial_cmp(b),
            (LiteralValue::Integer(a), LiteralValue::Float(b)) => (*a as f64).partial_cmp(b),
            (LiteralValue::Float(a), LiteralValue::Integer(b)) => a.partial_cmp(&(*b as f64)),
            (LiteralValue::String(a), LiteralValue::String(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl fmt::Display for LiteralValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LiteralValue::Null => write!(f, "NULL"),
            LiteralValue::Boolean(b) => write!(f, "{}", if *b { "TRUE" } else { "FALSE" }),
            LiteralValue::Integer(n) => write!(f, "{}", n),
            LiteralValue::Float(x) => write!(f, "{}", x),
            LiteralValue::String(s) => write!(f, "'{}'", s.replace('\'', "''")),
        }
    }
}
