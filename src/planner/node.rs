//! Plan node model.
//!
//! A plan is an immutable tree of [`PlanNode`]s sharing children through
//! `Arc`. Every node is built through a validating constructor, so a plan
//! that exists satisfies the local invariants of each of its nodes;
//! [`PlanNode::validate`] re-checks the whole tree plus the invariants that
//! depend on where a node sits.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use super::access::{IndexAccess, IndexLookup};
use super::error::{PlanError, PlanResult};
use super::expr::Expr;
use super::schema::{Field, Schema};
use crate::catalog::{ColumnDef, DataType, TableSchema};

/// Join types supported by the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JoinType {
    Inner,
    Left,
    Right,
    Full,
    Cross,
    /// Left rows with at least one match; outputs only left columns.
    Semi,
    /// Left rows without a match; outputs only left columns.
    Anti,
}

impl JoinType {
    /// Whether the join outputs only the left input's columns.
    pub fn is_left_only(&self) -> bool {
        matches!(self, JoinType::Semi | JoinType::Anti)
    }
}

impl fmt::Display for JoinType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinType::Inner => write!(f, "INNER"),
            JoinType::Left => write!(f, "LEFT"),
            JoinType::Right => write!(f, "RIGHT"),
            JoinType::Full => write!(f, "FULL"),
            JoinType::Cross => write!(f, "CROSS"),
            JoinType::Semi => write!(f, "SEMI"),
            JoinType::Anti => write!(f, "ANTI"),
        }
    }
}

/// Physical join algorithm annotated on a join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JoinStrategy {
    NestedLoop,
    /// Per left row, probe an index of the right table.
    Lookup,
    Hash,
    Merge,
}

impl fmt::Display for JoinStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinStrategy::NestedLoop => write!(f, "NestedLoop"),
            JoinStrategy::Lookup => write!(f, "Lookup"),
            JoinStrategy::Hash => write!(f, "Hash"),
            JoinStrategy::Merge => write!(f, "Merge"),
        }
    }
}

/// Aggregate function types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregateFunction {
    Count,
    Sum,
    Avg,
    Min,
    Max,
    CountDistinct,
}

impl fmt::Display for AggregateFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AggregateFunction::Count => write!(f, "COUNT"),
            AggregateFunction::Sum => write!(f, "SUM"),
            AggregateFunction::Avg => write!(f, "AVG"),
            AggregateFunction::Min => write!(f, "MIN"),
            AggregateFunction::Max => write!(f, "MAX"),
            AggregateFunction::CountDistinct => write!(f, "COUNT_DISTINCT"),
        }
    }
}

/// Projected expression with its output name.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectItem {
    pub expr: Expr,
    pub alias: String,
}

impl ProjectItem {
    pub fn new(expr: Expr, alias: impl Into<String>) -> Self {
        Self {
            expr,
            alias: alias.into(),
        }
    }
}

/// An aggregate expression. `arg` is `None` only for `COUNT(*)`.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateExpr {
    pub function: AggregateFunction,
    pub arg: Option<Expr>,
    pub alias: String,
}

impl AggregateExpr {
    pub fn new(function: AggregateFunction, arg: Option<Expr>, alias: impl Into<String>) -> Self {
        Self {
            function,
            arg,
            alias: alias.into(),
        }
    }
}

/// Sort specification over an input column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortKey {
    pub column: usize,
    pub ascending: bool,
    pub nulls_first: bool,
}

impl SortKey {
    pub fn asc(column: usize) -> Self {
        Self {
            column,
            ascending: true,
            nulls_first: true,
        }
    }

    pub fn desc(column: usize) -> Self {
        Self {
            column,
            ascending: false,
            nulls_first: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableScan {
    table: String,
    columns: Vec<ColumnDef>,
    projection: Vec<usize>,
    access: Option<IndexAccess>,
    schema: Schema,
}

impl TableScan {
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Every column of the table.
    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    /// Table ordinals produced, in output order.
    pub fn projection(&self) -> &[usize] {
        &self.projection
    }

    /// Output schema, one field per projected column.
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn access(&self) -> Option<&IndexAccess> {
        self.access.as_ref()
    }

    pub fn has_dynamic_access(&self) -> bool {
        self.access.as_ref().map(|a| a.is_dynamic()).unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    predicate: Expr,
    input: Arc<PlanNode>,
}

impl Filter {
    pub fn predicate(&self) -> &Expr {
        &self.predicate
    }

    pub fn input(&self) -> &Arc<PlanNode> {
        &self.input
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Project {
    items: Vec<ProjectItem>,
    input: Arc<PlanNode>,
    schema: Schema,
}

impl Project {
    pub fn items(&self) -> &[ProjectItem] {
        &self.items
    }

    pub fn input(&self) -> &Arc<PlanNode> {
        &self.input
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    join_type: JoinType,
    left: Arc<PlanNode>,
    right: Arc<PlanNode>,
    condition: Option<Expr>,
    strategy: JoinStrategy,
    schema: Schema,
}

impl Join {
    pub fn join_type(&self) -> JoinType {
        self.join_type
    }

    pub fn left(&self) -> &Arc<PlanNode> {
        &self.left
    }

    pub fn right(&self) -> &Arc<PlanNode> {
        &self.right
    }

    pub fn condition(&self) -> Option<&Expr> {
        self.condition.as_ref()
    }

    pub fn strategy(&self) -> JoinStrategy {
        self.strategy
    }

    /// Equi-key pairs `(left column, right column)` of the condition.
    pub fn equi_keys(&self) -> Vec<(usize, usize)> {
        equi_key_pairs(self.condition.as_ref(), self.left.schema().len())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Subquery {
    plan: Arc<PlanNode>,
    correlated: bool,
    cacheable: bool,
}

impl Subquery {
    pub fn plan(&self) -> &Arc<PlanNode> {
        &self.plan
    }

    /// Whether the body reads outer-scope columns.
    pub fn correlated(&self) -> bool {
        self.correlated
    }

    /// Whether the runtime may evaluate the body once and reuse the result.
    pub fn cacheable(&self) -> bool {
        self.cacheable
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupBy {
    group_by: Vec<usize>,
    aggregates: Vec<AggregateExpr>,
    input: Arc<PlanNode>,
    schema: Schema,
}

impl GroupBy {
    pub fn group_by(&self) -> &[usize] {
        &self.group_by
    }

    pub fn aggregates(&self) -> &[AggregateExpr] {
        &self.aggregates
    }

    pub fn input(&self) -> &Arc<PlanNode> {
        &self.input
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sort {
    order: Vec<SortKey>,
    input: Arc<PlanNode>,
}

impl Sort {
    pub fn order(&self) -> &[SortKey] {
        &self.order
    }

    pub fn input(&self) -> &Arc<PlanNode> {
        &self.input
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Limit {
    limit: usize,
    offset: usize,
    input: Arc<PlanNode>,
}

impl Limit {
    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn input(&self) -> &Arc<PlanNode> {
        &self.input
    }
}

/// Logical query plan node.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanNode {
    /// Read a table, optionally through an index.
    TableScan(TableScan),
    Filter(Filter),
    Project(Project),
    Join(Join),
    /// A nested query, used as a derived table or inside an expression.
    Subquery(Subquery),
    GroupBy(GroupBy),
    Sort(Sort),
    Limit(Limit),
}

/// Equi-key pairs `(left, right)` of a join condition over a left input of
/// `left_width` columns. Right positions are relative to the right input.
pub fn equi_key_pairs(condition: Option<&Expr>, left_width: usize) -> Vec<(usize, usize)> {
    let Some(condition) = condition else {
        return Vec::new();
    };
    condition
        .conjuncts()
        .iter()
        .filter_map(|c| c.as_column_equality())
        .filter_map(|(a, b)| {
            if a < left_width && b >= left_width {
                Some((a, b - left_width))
            } else if b < left_width && a >= left_width {
                Some((b, a - left_width))
            } else {
                None
            }
        })
        .collect()
}

fn check_expr(expr: &Expr, width: usize, what: &str) -> PlanResult<()> {
    if let Some(bad) = expr.column_refs().into_iter().find(|&c| c >= width) {
        return Err(PlanError::malformed(format!(
            "{} {} references column #{} of a {}-column input",
            what, expr, bad, width
        )));
    }
    for sq in expr.subqueries() {
        if !matches!(sq.as_ref(), PlanNode::Subquery(_)) {
            return Err(PlanError::malformed(format!(
                "{} embeds a subquery that is not a Subquery node",
                what
            )));
        }
    }
    Ok(())
}

/// The dynamic scan at the bottom of a `Filter*` chain, if any.
pub(crate) fn lookup_target(node: &PlanNode) -> Option<&TableScan> {
    match node {
        PlanNode::Filter(f) => lookup_target(&f.input),
        PlanNode::TableScan(scan) if scan.has_dynamic_access() => Some(scan),
        _ => None,
    }
}

impl PlanNode {
    /// Scan of `columns` of `table`, producing `projection` in order.
    pub fn table_scan(
        table: impl Into<String>,
        columns: Vec<ColumnDef>,
        projection: Vec<usize>,
        access: Option<IndexAccess>,
    ) -> PlanResult<Arc<PlanNode>> {
        let table = table.into();
        let schema = Schema::new(
            projection
                .iter()
                .filter_map(|&i| columns.get(i).map(|c| Field::from_column(&table, i, c)))
                .collect(),
        );
        let node = PlanNode::TableScan(TableScan {
            table,
            columns,
            projection,
            access,
            schema,
        });
        node.check()?;
        Ok(Arc::new(node))
    }

    /// Full scan of every column of a table.
    pub fn scan(table: &TableSchema) -> PlanResult<Arc<PlanNode>> {
        Self::table_scan(
            table.name.clone(),
            table.columns.clone(),
            (0..table.columns.len()).collect(),
            None,
        )
    }

    pub fn filter(input: Arc<PlanNode>, predicate: Expr) -> PlanResult<Arc<PlanNode>> {
        let node = PlanNode::Filter(Filter { predicate, input });
        node.check()?;
        Ok(Arc::new(node))
    }

    pub fn project(input: Arc<PlanNode>, items: Vec<ProjectItem>) -> PlanResult<Arc<PlanNode>> {
        let in_schema = input.schema();
        let schema = Schema::new(
            items
                .iter()
                .map(|item| {
                    let origin = match &item.expr {
                        Expr::Column(i) => in_schema.field(*i).and_then(|f| f.origin.clone()),
                        _ => None,
                    };
                    Field {
                        name: item.alias.clone(),
                        data_type: item.expr.data_type(in_schema),
                        nullable: item.expr.nullable(in_schema),
                        origin,
                    }
                })
                .collect(),
        );
        let node = PlanNode::Project(Project { items, input, schema });
        node.check()?;
        Ok(Arc::new(node))
    }

    /// Project that selects input `columns` by position, keeping names.
    pub fn project_columns(input: Arc<PlanNode>, columns: &[usize]) -> PlanResult<Arc<PlanNode>> {
        let items = columns
            .iter()
            .map(|&c| {
                let name = input
                    .schema()
                    .field(c)
                    .map(|f| f.name.clone())
                    .ok_or_else(|| PlanError::malformed(format!("project of missing column #{}", c)))?;
                Ok(ProjectItem::new(Expr::Column(c), name))
            })
            .collect::<PlanResult<Vec<_>>>()?;
        Self::project(input, items)
    }

    pub fn join(
        join_type: JoinType,
        left: Arc<PlanNode>,
        right: Arc<PlanNode>,
        condition: Option<Expr>,
        strategy: JoinStrategy,
    ) -> PlanResult<Arc<PlanNode>> {
        let (l, r) = (left.schema(), right.schema());
        let schema = match join_type {
            JoinType::Inner | JoinType::Cross => l.concat(r),
            JoinType::Left => l.concat(&r.with_nullable()),
            JoinType::Right => l.with_nullable().concat(r),
            JoinType::Full => l.with_nullable().concat(&r.with_nullable()),
            JoinType::Semi | JoinType::Anti => l.clone(),
        };
        let node = PlanNode::Join(Join {
            join_type,
            left,
            right,
            condition,
            strategy,
            schema,
        });
        node.check()?;
        Ok(Arc::new(node))
    }

    /// Wrap a plan as a subquery. Correlation is derived from the body.
    pub fn subquery(plan: Arc<PlanNode>, cacheable: bool) -> PlanResult<Arc<PlanNode>> {
        let correlated = !plan.outer_refs().is_empty();
        let node = PlanNode::Subquery(Subquery {
            plan,
            correlated,
            cacheable,
        });
        node.check()?;
        Ok(Arc::new(node))
    }

    pub fn group_by(
        input: Arc<PlanNode>,
        group_by: Vec<usize>,
        aggregates: Vec<AggregateExpr>,
    ) -> PlanResult<Arc<PlanNode>> {
        let in_schema = input.schema();
        let mut fields: Vec<Field> = group_by
            .iter()
            .filter_map(|&c| in_schema.field(c).cloned())
            .collect();
        for agg in &aggregates {
            let arg_type = agg
                .arg
                .as_ref()
                .map(|a| a.data_type(in_schema))
                .unwrap_or(DataType::Null);
            let (data_type, nullable) = match agg.function {
                AggregateFunction::Count | AggregateFunction::CountDistinct => (DataType::Integer, false),
                AggregateFunction::Avg => (DataType::Float, true),
                AggregateFunction::Sum | AggregateFunction::Min | AggregateFunction::Max => (arg_type, true),
            };
            fields.push(Field::new(agg.alias.clone(), data_type, nullable));
        }
        let node = PlanNode::GroupBy(GroupBy {
            group_by,
            aggregates,
            input,
            schema: Schema::new(fields),
        });
        node.check()?;
        Ok(Arc::new(node))
    }

    pub fn sort(input: Arc<PlanNode>, order: Vec<SortKey>) -> PlanResult<Arc<PlanNode>> {
        let node = PlanNode::Sort(Sort { order, input });
        node.check()?;
        Ok(Arc::new(node))
    }

    pub fn limit(input: Arc<PlanNode>, limit: usize, offset: usize) -> PlanResult<Arc<PlanNode>> {
        Ok(Arc::new(PlanNode::Limit(Limit { limit, offset, input })))
    }

    /// Local invariants of this node.
    fn check(&self) -> PlanResult<()> {
        match self {
            PlanNode::TableScan(scan) => {
                if scan.projection.is_empty() {
                    return Err(PlanError::malformed(format!("scan of {} projects no columns", scan.table)));
                }
                let mut seen = BTreeSet::new();
                for &c in &scan.projection {
                    if c >= scan.columns.len() || !seen.insert(c) {
                        return Err(PlanError::malformed(format!(
                            "scan of {} has invalid projection {:?}",
                            scan.table, scan.projection
                        )));
                    }
                }
                if let Some(access) = &scan.access {
                    access.validate()?;
                    if let Some(&c) = access.index().key_columns.iter().find(|&&c| c >= scan.columns.len()) {
                        return Err(PlanError::malformed(format!(
                            "index {} on {} keys missing column {}",
                            access.index().name,
                            scan.table,
                            c
                        )));
                    }
                }
                Ok(())
            }
            PlanNode::Filter(f) => check_expr(&f.predicate, f.input.schema().len(), "filter"),
            PlanNode::Project(p) => {
                if p.items.is_empty() {
                    return Err(PlanError::malformed("project has no items"));
                }
                let width = p.input.schema().len();
                p.items.iter().try_for_each(|i| check_expr(&i.expr, width, "project item"))
            }
            PlanNode::Join(j) => self.check_join(j),
            PlanNode::Subquery(s) => {
                if s.correlated != !s.plan.outer_refs().is_empty() {
                    return Err(PlanError::malformed("subquery correlation flag disagrees with its body"));
                }
                if s.cacheable && s.correlated {
                    return Err(PlanError::malformed("correlated subquery marked cacheable"));
                }
                Ok(())
            }
            PlanNode::GroupBy(g) => {
                let width = g.input.schema().len();
                if g.group_by.is_empty() && g.aggregates.is_empty() {
                    return Err(PlanError::malformed("group by produces no columns"));
                }
                if let Some(c) = g.group_by.iter().find(|&&c| c >= width) {
                    return Err(PlanError::malformed(format!("group by column #{} out of range", c)));
                }
                for agg in &g.aggregates {
                    match &agg.arg {
                        Some(arg) => check_expr(arg, width, "aggregate argument")?,
                        None if agg.function == AggregateFunction::Count => {}
                        None => {
                            return Err(PlanError::malformed(format!("{} requires an argument", agg.function)));
                        }
                    }
                }
                Ok(())
            }
            PlanNode::Sort(s) => {
                let width = s.input.schema().len();
                if s.order.is_empty() {
                    return Err(PlanError::malformed("sort has no keys"));
                }
                match s.order.iter().find(|k| k.column >= width) {
                    Some(k) => Err(PlanError::malformed(format!("sort column #{} out of range", k.column))),
                    None => Ok(()),
                }
            }
            PlanNode::Limit(_) => Ok(()),
        }
    }

    fn check_join(&self, j: &Join) -> PlanResult<()> {
        let left_width = j.left.schema().len();
        let width = left_width + j.right.schema().len();
        if let Some(cond) = &j.condition {
            check_expr(cond, width, "join condition")?;
            if j.join_type == JoinType::Cross {
                return Err(PlanError::malformed("cross join with a condition"));
            }
        }
        match j.strategy {
            JoinStrategy::NestedLoop => Ok(()),
            JoinStrategy::Hash | JoinStrategy::Merge => {
                if equi_key_pairs(j.condition.as_ref(), left_width).is_empty() {
                    return Err(PlanError::malformed(format!("{} join without an equi-key", j.strategy)));
                }
                Ok(())
            }
            JoinStrategy::Lookup => {
                if !matches!(
                    j.join_type,
                    JoinType::Inner | JoinType::Left | JoinType::Semi | JoinType::Anti
                ) {
                    return Err(PlanError::malformed(format!("lookup strategy on a {} join", j.join_type)));
                }
                let scan = lookup_target(&j.right).ok_or_else(|| {
                    PlanError::malformed("lookup join whose right input is not an index lookup")
                })?;
                if let Some(IndexLookup::Dynamic { keys, .. }) = scan.access().map(|a| a.lookup()) {
                    for key in keys {
                        check_expr(key, left_width, "lookup key")?;
                    }
                }
                Ok(())
            }
        }
    }

    /// Output schema.
    pub fn schema(&self) -> &Schema {
        match self {
            PlanNode::TableScan(s) => &s.schema,
            PlanNode::Filter(f) => f.input.schema(),
            PlanNode::Project(p) => &p.schema,
            PlanNode::Join(j) => &j.schema,
            PlanNode::Subquery(s) => s.plan.schema(),
            PlanNode::GroupBy(g) => &g.schema,
            PlanNode::Sort(s) => s.input.schema(),
            PlanNode::Limit(l) => l.input.schema(),
        }
    }

    /// Relational inputs (not subqueries embedded in expressions).
    pub fn children(&self) -> Vec<&Arc<PlanNode>> {
        match self {
            PlanNode::TableScan(_) => Vec::new(),
            PlanNode::Filter(f) => vec![&f.input],
            PlanNode::Project(p) => vec![&p.input],
            PlanNode::Join(j) => vec![&j.left, &j.right],
            PlanNode::Subquery(s) => vec![&s.plan],
            PlanNode::GroupBy(g) => vec![&g.input],
            PlanNode::Sort(s) => vec![&s.input],
            PlanNode::Limit(l) => vec![&l.input],
        }
    }

    /// Same node over new inputs, re-validated.
    pub fn with_new_children(&self, children: Vec<Arc<PlanNode>>) -> PlanResult<Arc<PlanNode>> {
        let expected = self.children().len();
        if children.len() != expected {
            return Err(PlanError::Internal(format!(
                "expected {} children, got {}",
                expected,
                children.len()
            )));
        }
        let mut it = children.into_iter();
        let mut next = || it.next().ok_or_else(|| PlanError::Internal("missing child".into()));
        match self {
            PlanNode::TableScan(_) => Ok(Arc::new(self.clone())),
            PlanNode::Filter(f) => Self::filter(next()?, f.predicate.clone()),
            PlanNode::Project(p) => Self::project(next()?, p.items.clone()),
            PlanNode::Join(j) => {
                let left = next()?;
                let right = next()?;
                Self::join(j.join_type, left, right, j.condition.clone(), j.strategy)
            }
            PlanNode::Subquery(s) => {
                let plan = next()?;
                let cacheable = s.cacheable && plan.outer_refs().is_empty();
                Self::subquery(plan, cacheable)
            }
            PlanNode::GroupBy(g) => Self::group_by(next()?, g.group_by.clone(), g.aggregates.clone()),
            PlanNode::Sort(s) => Self::sort(next()?, s.order.clone()),
            PlanNode::Limit(l) => Self::limit(next()?, l.limit, l.offset),
        }
    }

    /// Expressions held by this node, evaluated over its input.
    pub fn expressions(&self) -> Vec<&Expr> {
        match self {
            PlanNode::Filter(f) => vec![&f.predicate],
            PlanNode::Project(p) => p.items.iter().map(|i| &i.expr).collect(),
            PlanNode::Join(j) => j.condition.iter().collect(),
            PlanNode::GroupBy(g) => g.aggregates.iter().filter_map(|a| a.arg.as_ref()).collect(),
            PlanNode::TableScan(_) | PlanNode::Subquery(_) | PlanNode::Sort(_) | PlanNode::Limit(_) => Vec::new(),
        }
    }

    /// Outer-scope positions read anywhere in this subtree at its own scope
    /// level.
    pub fn outer_refs(&self) -> BTreeSet<usize> {
        let mut refs = BTreeSet::new();
        for expr in self.expressions() {
            refs.extend(expr.outer_refs());
        }
        for child in self.children() {
            refs.extend(child.outer_refs());
        }
        refs
    }

    /// Tables read by this plan, including those of embedded subqueries.
    pub fn referenced_tables(&self) -> BTreeSet<String> {
        let mut tables = BTreeSet::new();
        self.collect_tables(&mut tables);
        tables
    }

    fn collect_tables(&self, tables: &mut BTreeSet<String>) {
        if let PlanNode::TableScan(scan) = self {
            tables.insert(scan.table.clone());
        }
        for expr in self.expressions() {
            for sq in expr.subqueries() {
                sq.collect_tables(tables);
            }
        }
        for child in self.children() {
            child.collect_tables(tables);
        }
    }

    /// Rebuild the subtree with outer references re-indexed by `f`.
    pub fn map_outer_refs(&self, f: &dyn Fn(usize) -> Option<usize>) -> PlanResult<Arc<PlanNode>> {
        let children = self
            .children()
            .into_iter()
            .map(|c| c.map_outer_refs(f))
            .collect::<PlanResult<Vec<_>>>()?;
        self.rebuild_exprs(children, &mut |e| e.map_outer_refs(f))
    }

    /// Same node over `children` with every held expression rewritten by
    /// `f`.
    pub fn rebuild_exprs(
        &self,
        children: Vec<Arc<PlanNode>>,
        f: &mut dyn FnMut(&Expr) -> PlanResult<Expr>,
    ) -> PlanResult<Arc<PlanNode>> {
        let mut it = children.into_iter();
        let mut next = || it.next().ok_or_else(|| PlanError::Internal("missing child".into()));
        match self {
            PlanNode::Filter(x) => Self::filter(next()?, f(&x.predicate)?),
            PlanNode::Project(x) => {
                let items = x
                    .items
                    .iter()
                    .map(|i| Ok(ProjectItem::new(f(&i.expr)?, i.alias.clone())))
                    .collect::<PlanResult<Vec<_>>>()?;
                Self::project(next()?, items)
            }
            PlanNode::Join(x) => {
                let condition = x.condition.as_ref().map(|c| f(c)).transpose()?;
                let left = next()?;
                let right = next()?;
                Self::join(x.join_type, left, right, condition, x.strategy)
            }
            PlanNode::GroupBy(x) => {
                let aggregates = x
                    .aggregates
                    .iter()
                    .map(|a| {
                        Ok(AggregateExpr {
                            function: a.function,
                            arg: a.arg.as_ref().map(|e| f(e)).transpose()?,
                            alias: a.alias.clone(),
                        })
                    })
                    .collect::<PlanResult<Vec<_>>>()?;
                Self::group_by(next()?, x.group_by.clone(), aggregates)
            }
            PlanNode::TableScan(_) | PlanNode::Subquery(_) | PlanNode::Sort(_) | PlanNode::Limit(_) => {
                drop(next);
                self.with_new_children(it.collect())
            }
        }
    }

    /// Re-check the whole tree.
    pub fn validate(&self) -> PlanResult<()> {
        let outer = self.outer_refs();
        if !outer.is_empty() {
            return Err(PlanError::malformed(format!(
                "outer references {:?} outside any subquery",
                outer
            )));
        }
        self.validate_tree(false)
    }

    fn validate_tree(&self, dynamic_allowed: bool) -> PlanResult<()> {
        self.check()?;
        match self {
            PlanNode::TableScan(scan) => {
                if scan.has_dynamic_access() && !dynamic_allowed {
                    return Err(PlanError::malformed(format!(
                        "index lookup on {} outside a lookup join",
                        scan.table
                    )));
                }
            }
            PlanNode::Subquery(s) if s.correlated => {
                return Err(PlanError::malformed("correlated subquery used as a relation"));
            }
            _ => {}
        }

        for expr in self.expressions() {
            for sq in expr.subqueries() {
                match sq.as_ref() {
                    PlanNode::Subquery(s) => {
                        sq.check()?;
                        s.plan.validate_tree(false)?;
                    }
                    _ => return Err(PlanError::malformed("expression subquery is not a Subquery node")),
                }
            }
        }

        match self {
            PlanNode::Join(j) => {
                j.left.validate_tree(false)?;
                j.right.validate_tree(j.strategy == JoinStrategy::Lookup)
            }
            PlanNode::Filter(f) => f.input.validate_tree(dynamic_allowed),
            _ => self.children().into_iter().try_for_each(|c| c.validate_tree(false)),
        }
    }

    pub fn as_table_scan(&self) -> Option<&TableScan> {
        match self {
            PlanNode::TableScan(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_join(&self) -> Option<&Join> {
        match self {
            PlanNode::Join(j) => Some(j),
            _ => None,
        }
    }
}
