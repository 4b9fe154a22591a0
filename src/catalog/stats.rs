//! Table statistics and the read-only statistics interface used for costing.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Shape of a predicate whose selectivity is being estimated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PredicateShape {
    /// `col = k` (or a conjunction of equalities over several columns).
    Equality,
    /// A one- or two-sided range over a column.
    Range,
}

/// Fallback estimates used when no statistic is known.
pub mod defaults {
    /// Row count assumed for a table without statistics.
    pub const ROW_COUNT: f64 = 1000.0;
    /// Selectivity of an equality predicate.
    pub const EQUALITY: f64 = 0.1;
    /// Selectivity of a range predicate.
    pub const RANGE: f64 = 1.0 / 3.0;
    /// Selectivity of a predicate the estimator cannot analyze.
    pub const OTHER: f64 = 1.0 / 3.0;
    /// Selectivity of `IS NULL`.
    pub const NULL: f64 = 0.1;
    /// Fraction of outer rows an `EXISTS` keeps.
    pub const SEMI: f64 = 0.5;
}

/// Read-only statistics consulted by row estimation and costing.
pub trait Statistics {
    /// Estimated number of rows in `table`.
    fn row_count(&self, table: &str) -> f64;

    /// Estimated fraction of rows of `table` satisfying a predicate of
    /// `shape` over `columns` (table ordinals). Always in `[0, 1]`.
    fn selectivity(&self, table: &str, columns: &[usize], shape: PredicateShape) -> f64;
}

/// Explicit selectivity recorded for a column set and predicate shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectivityOverride {
    pub columns: Vec<usize>,
    pub shape: PredicateShape,
    pub selectivity: f64,
}

/// Statistics stored for one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableStats {
    /// Number of rows.
    pub row_count: f64,
    /// Number of distinct values per column ordinal.
    #[serde(default)]
    pub distinct_counts: BTreeMap<usize, u64>,
    /// Selectivities supplied directly, taking precedence over derived ones.
    #[serde(default)]
    pub overrides: Vec<SelectivityOverride>,
    /// When the statistics were last refreshed.
    #[serde(default)]
    pub analyzed_at: Option<DateTime<Utc>>,
}

impl Default for TableStats {
    fn default() -> Self {
        Self {
            row_count: defaults::ROW_COUNT,
            distinct_counts: BTreeMap::new(),
            overrides: Vec::new(),
            analyzed_at: None,
        }
    }
}

impl TableStats {
    /// Statistics with a known row count.
    pub fn with_row_count(row_count: f64) -> Self {
        Self {
            row_count,
            analyzed_at: Some(Utc::now()),
            ..Self::default()
        }
    }

    /// Look up an explicit selectivity.
    pub fn override_for(&self, columns: &[usize], shape: PredicateShape) -> Option<f64> {
        self.overrides
            .iter()
            .find(|o| o.shape == shape && o.columns == columns)
            .map(|o| o.selectivity)
    }

    /// Record an explicit selectivity, replacing an existing one.
    pub fn set_override(&mut self, columns: Vec<usize>, shape: PredicateShape, selectivity: f64) {
        self.overrides.retain(|o| !(o.shape == shape && o.columns == columns));
        self.overrides.push(SelectivityOverride {
            columns,
            shape,
            selectivity,
        });
        self.analyzed_at = Some(Utc::now());
    }
}

/// Clamp an estimate into a valid selectivity.
pub fn clamp_selectivity(s: f64) -> f64 {
    if s.is_nan() {
        defaults::OTHER
    } else {
        s.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_override_replaces_previous() {
        let mut stats = TableStats::with_row_count(10.0);
        stats.set_override(vec![0], PredicateShape::Equality, 0.5);
        stats.set_override(vec![0], PredicateShape::Equality, 0.25);

        assert_eq!(stats.overrides.len(), 1);
        assert_eq!(stats.override_for(&[0], PredicateShape::Equality), Some(0.25));
        assert_eq!(stats.override_for(&[0], PredicateShape::Range), None);
    }

    #[test]
    fn test_clamp_selectivity() {
        assert_eq!(clamp_selectivity(1.5), 1.0);
        assert_eq!(clamp_selectivity(-0.1), 0.0);
        assert_eq!(clamp_selectivity(f64::NAN), defaults::OTHER);
    }

    #[test]
    fn test_stats_deserialize_defaults() {
        let stats: TableStats = serde_json::from_str(r#"{"row_count": 42.0}"#).unwrap();
        assert_eq!(stats.row_count, 42.0);
        assert!(stats.distinct_counts.is_empty());
        assert!(stats.analyzed_at.is_none());
    }
}
