//! Optimizer tunables.

use serde::{Deserialize, Serialize};

use crate::planner::{PlanError, PlanResult};

/// Ceiling for `join_order_exhaustive_limit`. Enumeration visits n!
/// left-deep orders, so larger clusters are always ordered greedily.
pub const MAX_EXHAUSTIVE_JOIN_RELATIONS: usize = 10;

/// Configuration for the optimizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Maximum applications of one rule before moving on.
    pub max_rule_iterations: usize,
    /// Maximum passes over the whole rule pipeline.
    pub max_pipeline_passes: usize,
    /// Largest join cluster whose orders are enumerated exhaustively. At
    /// most [`MAX_EXHAUSTIVE_JOIN_RELATIONS`].
    pub join_order_exhaustive_limit: usize,
    /// Largest build side, in estimated rows, a hash join may use.
    pub hash_build_row_budget: f64,
    /// Cost of one index probe relative to reading one row. Must exceed 1.
    pub lookup_cost_factor: f64,
    /// Maximum number of key boxes a static index access may carry.
    pub max_range_boxes: usize,
    /// Record before/after explain output for every applied rule.
    pub enable_trace: bool,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            max_rule_iterations: 8,
            max_pipeline_passes: 4,
            join_order_exhaustive_limit: 6,
            hash_build_row_budget: 100_000.0,
            lookup_cost_factor: 4.0,
            max_range_boxes: 64,
            enable_trace: false,
        }
    }
}

impl OptimizerConfig {
    /// Parse a (possibly partial) JSON document over the defaults.
    pub fn from_json(json: &str) -> PlanResult<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| PlanError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> PlanResult<()> {
        let caps = [
            ("max_rule_iterations", self.max_rule_iterations),
            ("max_pipeline_passes", self.max_pipeline_passes),
            ("join_order_exhaustive_limit", self.join_order_exhaustive_limit),
            ("max_range_boxes", self.max_range_boxes),
        ];
        if let Some((name, _)) = caps.iter().find(|(_, v)| *v == 0) {
            return Err(PlanError::InvalidConfig(format!("{} must be positive", name)));
        }
        if self.join_order_exhaustive_limit > MAX_EXHAUSTIVE_JOIN_RELATIONS {
            return Err(PlanError::InvalidConfig(format!(
                "join_order_exhaustive_limit must be at most {}, got {}",
                MAX_EXHAUSTIVE_JOIN_RELATIONS, self.join_order_exhaustive_limit
            )));
        }
        if !(self.hash_build_row_budget > 0.0) {
            return Err(PlanError::InvalidConfig("hash_build_row_budget must be positive".into()));
        }
        if !(self.lookup_cost_factor > 1.0) || !self.lookup_cost_factor.is_finite() {
            return Err(PlanError::InvalidConfig(format!(
                "lookup_cost_factor must be greater than 1, got {}",
                self.lookup_cost_factor
            )));
        }
        Ok(())
    }

    pub fn with_max_rule_iterations(mut self, max: usize) -> Self {
        self.max_rule_iterations = max;
        self
    }

    pub fn with_max_pipeline_passes(mut self, max: usize) -> Self {
        self.max_pipeline_passes = max;
        self
    }

    pub fn with_join_order_exhaustive_limit(mut self, limit: usize) -> Self {
        self.join_order_exhaustive_limit = limit;
        self
    }

    pub fn with_hash_build_row_budget(mut self, rows: f64) -> Self {
        self.hash_build_row_budget = rows;
        self
    }

    pub fn with_lookup_cost_factor(mut self, factor: f64) -> Self {
        self.lookup_cost_factor = factor;
        self
    }

    pub fn with_max_range_boxes(mut self, max: usize) -> Self {
        self.max_range_boxes = max;
        self
    }

    /// Enable or disable tracing.
    pub fn with_trace(mut self, enable: bool) -> Self {
        self.enable_trace = enable;
        self
    }
}
