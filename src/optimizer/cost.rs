//! Cost model shared by index, join order and join operator selection.
//!
//! Cost is measured in expected rows touched. It is attached to candidate
//! plans while they are compared and never stored in a plan.

use std::cmp::Ordering;
use std::fmt;
use std::ops::Add;

use super::config::OptimizerConfig;
use crate::planner::JoinStrategy;

/// Totally ordered cost scalar.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cost(pub f64);

impl Cost {
    pub const ZERO: Cost = Cost(0.0);

    pub fn value(&self) -> f64 {
        self.0
    }
}

impl Eq for Cost {}

impl PartialOrd for Cost {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Cost {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl Add for Cost {
    type Output = Cost;

    fn add(self, rhs: Cost) -> Cost {
        Cost(self.0 + rhs.0)
    }
}

impl fmt::Display for Cost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}

/// Join strategies in tie-break order: on equal cost the earlier wins.
pub const STRATEGY_PREFERENCE: [JoinStrategy; 4] = [
    JoinStrategy::Merge,
    JoinStrategy::Hash,
    JoinStrategy::Lookup,
    JoinStrategy::NestedLoop,
];

/// Rank of a strategy in [`STRATEGY_PREFERENCE`].
pub fn preference_rank(strategy: JoinStrategy) -> usize {
    STRATEGY_PREFERENCE
        .iter()
        .position(|s| *s == strategy)
        .unwrap_or(STRATEGY_PREFERENCE.len())
}

/// Cost formulas parameterized by the optimizer configuration.
#[derive(Debug, Clone)]
pub struct CostModel {
    lookup_cost_factor: f64,
    hash_build_row_budget: f64,
}

impl CostModel {
    pub fn new(config: &OptimizerConfig) -> Self {
        Self {
            lookup_cost_factor: config.lookup_cost_factor,
            hash_build_row_budget: config.hash_build_row_budget,
        }
    }

    pub fn lookup_cost_factor(&self) -> f64 {
        self.lookup_cost_factor
    }

    /// Whether a hash table over `build_rows` rows fits the budget.
    pub fn hash_fits(&self, build_rows: f64) -> bool {
        build_rows <= self.hash_build_row_budget
    }

    /// Cost of joining `outer` rows with `inner` rows using `strategy`.
    ///
    /// Merge reads both inputs once, hash builds on the inner side and
    /// probes with the outer one, lookup probes an index once per outer
    /// row, and nested loop compares every pair.
    pub fn join_cost(&self, strategy: JoinStrategy, outer: f64, inner: f64) -> Cost {
        match strategy {
            JoinStrategy::Merge => Cost(outer + inner),
            JoinStrategy::Hash => Cost(inner + outer),
            JoinStrategy::Lookup => Cost(outer * self.lookup_cost_factor),
            JoinStrategy::NestedLoop => Cost(outer * inner),
        }
    }

    /// Cost of reading `rows` rows through an index: each row costs a
    /// probe unless the index covers every needed column.
    pub fn index_scan_cost(&self, rows: f64, covering: bool) -> Cost {
        if covering {
            Cost(rows)
        } else {
            Cost(rows * self.lookup_cost_factor)
        }
    }
}
