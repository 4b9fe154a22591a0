//! Index access descriptions and the key range algebra behind them.

use std::cmp::Ordering;
use std::fmt;

use super::error::{PlanError, PlanResult};
use super::expr::Expr;
use super::value::LiteralValue;
use crate::catalog::IndexDescriptor;

/// One end of a key range.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyBound {
    pub value: LiteralValue,
    pub inclusive: bool,
}

impl KeyBound {
    pub fn inclusive(value: LiteralValue) -> Self {
        Self {
            value,
            inclusive: true,
        }
    }

    pub fn exclusive(value: LiteralValue) -> Self {
        Self {
            value,
            inclusive: false,
        }
    }
}

/// Order of lower bounds; an absent bound is the smallest and, at equal
/// values, an inclusive bound comes first.
fn cmp_start(a: &Option<KeyBound>, b: &Option<KeyBound>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => a
            .value
            .compare(&b.value)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.inclusive.cmp(&a.inclusive)),
    }
}

/// Order of upper bounds; an absent bound is the largest and, at equal
/// values, an exclusive bound comes first.
fn cmp_end(a: &Option<KeyBound>, b: &Option<KeyBound>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => a
            .value
            .compare(&b.value)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.inclusive.cmp(&b.inclusive)),
    }
}

/// Whether a range starting at `start` begins no later than a range ending
/// at `end` finishes, so the two touch or overlap.
fn starts_before_end(start: &Option<KeyBound>, end: &Option<KeyBound>) -> bool {
    match (start, end) {
        (None, _) | (_, None) => true,
        (Some(s), Some(e)) => match s.value.compare(&e.value) {
            Some(Ordering::Less) => true,
            Some(Ordering::Equal) => s.inclusive || e.inclusive,
            _ => false,
        },
    }
}

/// Contiguous range over a single key column. Never matches NULL.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnRange {
    pub start: Option<KeyBound>,
    pub end: Option<KeyBound>,
}

impl ColumnRange {
    /// Every non-NULL value.
    pub fn full() -> Self {
        Self { start: None, end: None }
    }

    /// `[value, value]`.
    pub fn point(value: LiteralValue) -> Self {
        Self {
            start: Some(KeyBound::inclusive(value.clone())),
            end: Some(KeyBound::inclusive(value)),
        }
    }

    /// `(value, +inf)` or `[value, +inf)`.
    pub fn greater_than(value: LiteralValue, inclusive: bool) -> Self {
        Self {
            start: Some(KeyBound { value, inclusive }),
            end: None,
        }
    }

    /// `(-inf, value)` or `(-inf, value]`.
    pub fn less_than(value: LiteralValue, inclusive: bool) -> Self {
        Self {
            start: None,
            end: Some(KeyBound { value, inclusive }),
        }
    }

    pub fn is_empty(&self) -> bool {
        match (&self.start, &self.end) {
            (Some(s), Some(e)) => match s.value.compare(&e.value) {
                Some(Ordering::Less) => false,
                Some(Ordering::Equal) => !(s.inclusive && e.inclusive),
                _ => true,
            },
            (Some(b), None) | (None, Some(b)) => b.value.is_null(),
            (None, None) => false,
        }
    }

    pub fn is_point(&self) -> bool {
        match (&self.start, &self.end) {
            (Some(s), Some(e)) => {
                s.inclusive && e.inclusive && s.value.compare(&e.value) == Some(Ordering::Equal)
            }
            _ => false,
        }
    }

    pub fn is_full(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }

    pub fn contains(&self, value: &LiteralValue) -> bool {
        if value.is_null() {
            return false;
        }
        let above_start = match &self.start {
            None => true,
            Some(b) => match value.compare(&b.value) {
                Some(Ordering::Greater) => true,
                Some(Ordering::Equal) => b.inclusive,
                _ => false,
            },
        };
        let below_end = match &self.end {
            None => true,
            Some(b) => match value.compare(&b.value) {
                Some(Ordering::Less) => true,
                Some(Ordering::Equal) => b.inclusive,
                _ => false,
            },
        };
        above_start && below_end
    }

    pub fn intersect(&self, other: &ColumnRange) -> ColumnRange {
        let start = if cmp_start(&self.start, &other.start) == Ordering::Less {
            other.start.clone()
        } else {
            self.start.clone()
        };
        let end = if cmp_end(&self.end, &other.end) == Ordering::Greater {
            other.end.clone()
        } else {
            self.end.clone()
        };
        ColumnRange { start, end }
    }
}

impl fmt::Display for ColumnRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_point() {
            if let Some(s) = &self.start {
                return write!(f, "[{}]", s.value);
            }
        }
        match &self.start {
            None => write!(f, "(-inf")?,
            Some(b) => write!(f, "{}{}", if b.inclusive { "[" } else { "(" }, b.value)?,
        }
        match &self.end {
            None => write!(f, ", +inf)"),
            Some(b) => write!(f, ", {}{}", b.value, if b.inclusive { "]" } else { ")" }),
        }
    }
}

/// Sorted, disjoint union of column ranges.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeSet {
    ranges: Vec<ColumnRange>,
}

impl RangeSet {
    pub fn empty() -> Self {
        Self { ranges: Vec::new() }
    }

    pub fn full() -> Self {
        Self {
            ranges: vec![ColumnRange::full()],
        }
    }

    pub fn from_range(range: ColumnRange) -> Self {
        Self::normalize(vec![range])
    }

    pub fn points(values: impl IntoIterator<Item = LiteralValue>) -> Self {
        Self::normalize(values.into_iter().map(ColumnRange::point).collect())
    }

    fn normalize(mut ranges: Vec<ColumnRange>) -> Self {
        ranges.retain(|r| !r.is_empty());
        ranges.sort_by(|a, b| cmp_start(&a.start, &b.start));

        let mut merged: Vec<ColumnRange> = Vec::with_capacity(ranges.len());
        for range in ranges {
            match merged.last_mut() {
                Some(last) if starts_before_end(&range.start, &last.end) => {
                    if cmp_end(&range.end, &last.end) == Ordering::Greater {
                        last.end = range.end;
                    }
                }
                _ => merged.push(range),
            }
        }
        Self { ranges: merged }
    }

    pub fn ranges(&self) -> &[ColumnRange] {
        &self.ranges
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Whether every range is a single point.
    pub fn is_points(&self) -> bool {
        self.ranges.iter().all(ColumnRange::is_point)
    }

    pub fn union(&self, other: &RangeSet) -> RangeSet {
        let mut ranges = self.ranges.clone();
        ranges.extend(other.ranges.iter().cloned());
        Self::normalize(ranges)
    }

    pub fn intersect(&self, other: &RangeSet) -> RangeSet {
        let mut ranges = Vec::new();
        for a in &self.ranges {
            for b in &other.ranges {
                ranges.push(a.intersect(b));
            }
        }
        Self::normalize(ranges)
    }

    pub fn contains(&self, value: &LiteralValue) -> bool {
        self.ranges.iter().any(|r| r.contains(value))
    }
}

/// A box over the leading key columns of an index: one range per column.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyRange {
    pub columns: Vec<ColumnRange>,
}

impl KeyRange {
    pub fn new(columns: Vec<ColumnRange>) -> Self {
        Self { columns }
    }

    /// Whether the key prefix `values` falls inside the box.
    pub fn contains(&self, values: &[LiteralValue]) -> bool {
        self.columns.len() == values.len()
            && self.columns.iter().zip(values).all(|(r, v)| r.contains(v))
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.columns.iter().map(|c| c.to_string()).collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}

/// How the key prefix of an index is bound.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexLookup {
    /// Ranges fixed at plan time.
    Static { ranges: Vec<KeyRange> },
    /// Keys computed per row of a lookup join's left input. Key expressions
    /// are positional over the left input.
    Dynamic {
        keys: Vec<Expr>,
        sort_ascending: Vec<bool>,
    },
}

/// Index access chosen for a table scan.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexAccess {
    index: IndexDescriptor,
    prefix_len: usize,
    lookup: IndexLookup,
}

impl IndexAccess {
    /// Static access over `ranges`, each a box of `prefix_len` columns.
    pub fn static_ranges(index: IndexDescriptor, prefix_len: usize, ranges: Vec<KeyRange>) -> PlanResult<Self> {
        let access = Self {
            index,
            prefix_len,
            lookup: IndexLookup::Static { ranges },
        };
        access.validate()?;
        Ok(access)
    }

    /// Per-row access keyed by `keys`, one per leading key column.
    pub fn dynamic(index: IndexDescriptor, keys: Vec<Expr>) -> PlanResult<Self> {
        let sort_ascending = vec![true; keys.len()];
        let access = Self {
            index,
            prefix_len: keys.len(),
            lookup: IndexLookup::Dynamic { keys, sort_ascending },
        };
        access.validate()?;
        Ok(access)
    }

    pub fn index(&self) -> &IndexDescriptor {
        &self.index
    }

    pub fn prefix_len(&self) -> usize {
        self.prefix_len
    }

    pub fn lookup(&self) -> &IndexLookup {
        &self.lookup
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self.lookup, IndexLookup::Dynamic { .. })
    }

    /// Table ordinals of the bound key prefix.
    pub fn key_columns(&self) -> &[usize] {
        self.index.leading_columns(self.prefix_len)
    }

    /// Same access with dynamic key expressions rebuilt by `f`.
    pub fn map_keys(&self, f: impl Fn(&Expr) -> PlanResult<Expr>) -> PlanResult<Self> {
        match &self.lookup {
            IndexLookup::Static { .. } => Ok(self.clone()),
            IndexLookup::Dynamic { keys, sort_ascending } => {
                let keys = keys.iter().map(f).collect::<PlanResult<Vec<_>>>()?;
                let access = Self {
                    index: self.index.clone(),
                    prefix_len: self.prefix_len,
                    lookup: IndexLookup::Dynamic {
                        keys,
                        sort_ascending: sort_ascending.clone(),
                    },
                };
                access.validate()?;
                Ok(access)
            }
        }
    }

    pub fn validate(&self) -> PlanResult<()> {
        let width = self.index.key_columns.len();
        if self.prefix_len == 0 || self.prefix_len > width {
            return Err(PlanError::malformed(format!(
                "index {} used with prefix length {} of {} key columns",
                self.index.name, self.prefix_len, width
            )));
        }
        match &self.lookup {
            IndexLookup::Static { ranges } => {
                if let Some(bad) = ranges.iter().find(|r| r.columns.len() != self.prefix_len) {
                    return Err(PlanError::malformed(format!(
                        "key range {} on index {} does not match prefix length {}",
                        bad, self.index.name, self.prefix_len
                    )));
                }
            }
            IndexLookup::Dynamic { keys, sort_ascending } => {
                if keys.len() != self.prefix_len || sort_ascending.len() != self.prefix_len {
                    return Err(PlanError::malformed(format!(
                        "lookup on index {} binds {} keys for prefix length {}",
                        self.index.name,
                        keys.len(),
                        self.prefix_len
                    )));
                }
                if let Some(key) = keys.iter().find(|k| !k.outer_refs().is_empty() || k.contains_subquery()) {
                    return Err(PlanError::malformed(format!("unsupported lookup key {}", key)));
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for IndexAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:?}", self.index.name, self.key_columns())?;
        match &self.lookup {
            IndexLookup::Static { ranges } => {
                let parts: Vec<String> = ranges.iter().map(|r| r.to_string()).collect();
                write!(f, " ranges=[{}]", parts.join(", "))
            }
            IndexLookup::Dynamic { keys, .. } => {
                let parts: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
                write!(f, " keys=[{}]", parts.join(", "))
            }
        }
    }
}
