//! Shared fixtures and a reference interpreter for the integration tests.
//!
//! The interpreter runs a plan by brute force. Joins are nested loops
//! whatever strategy they are annotated with, an index lookup reads the
//! whole table and leaves matching to the join condition, and a static
//! index access keeps the rows whose key falls in one of its ranges.

#![allow(dead_code)]

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use costplan::catalog::{DataType, MemoryCatalog, SchemaBuilder};
use costplan::planner::{
    AggregateExpr, AggregateFunction, BinaryOperator, Expr, IndexLookup, JoinType, LiteralValue, PlanNode,
    UnaryOperator,
};

pub type Row = Vec<LiteralValue>;

fn int(n: i64) -> LiteralValue {
    LiteralValue::Integer(n)
}

fn int_or_null(n: i64, null: bool) -> LiteralValue {
    if null {
        LiteralValue::Null
    } else {
        int(n)
    }
}

/// `xy(x pk, y, z, w)`, `uv(u pk, v, r, s)` with `v` indexed, and
/// `ab(a, b, c)` keyed on `(a, b)` with `c` covered by a secondary index.
pub fn catalog() -> Arc<MemoryCatalog> {
    let catalog = MemoryCatalog::new();
    catalog
        .create_table(
            SchemaBuilder::new("xy")
                .add_required_column("x", DataType::Integer)
                .add_column("y", DataType::Integer)
                .add_column("z", DataType::Integer)
                .add_column("w", DataType::Integer)
                .primary_key(&["x"])
                .build()
                .unwrap(),
        )
        .unwrap();
    catalog
        .create_table(
            SchemaBuilder::new("uv")
                .add_required_column("u", DataType::Integer)
                .add_column("v", DataType::Integer)
                .add_column("r", DataType::Integer)
                .add_column("s", DataType::Integer)
                .primary_key(&["u"])
                .index("uv_v", &["v"])
                .build()
                .unwrap(),
        )
        .unwrap();
    catalog
        .create_table(
            SchemaBuilder::new("ab")
                .add_required_column("a", DataType::Integer)
                .add_required_column("b", DataType::Integer)
                .add_column("c", DataType::Integer)
                .primary_key(&["a", "b"])
                .covering_index("ab_c", &["c"], &["b"])
                .build()
                .unwrap(),
        )
        .unwrap();
    catalog.set_row_count("xy", 1000.0).unwrap();
    catalog.set_row_count("uv", 10000.0).unwrap();
    catalog.set_row_count("ab", 100.0).unwrap();
    Arc::new(catalog)
}

/// Rows matching [`catalog`], with NULLs in the nullable columns.
pub fn database() -> Database {
    let mut db = Database::default();
    db.insert(
        "xy",
        (0..12)
            .map(|x| vec![int(x), int_or_null(x % 4, x % 5 == 4), int((x * 3) % 7), int(x % 2)])
            .collect(),
    );
    db.insert(
        "uv",
        (0..16)
            .map(|u| vec![int(u), int(u % 5), int_or_null(u % 6, u % 3 == 0), int(u % 3)])
            .collect(),
    );
    db.insert(
        "ab",
        (0..16)
            .map(|i| vec![int(i / 4), int(i % 4), int_or_null((i / 4 + i % 4) % 3, i == 7)])
            .collect(),
    );
    db
}

pub fn scan(catalog: &MemoryCatalog, table: &str) -> Arc<PlanNode> {
    use costplan::catalog::CatalogProvider;
    PlanNode::scan(&catalog.schema(table).unwrap()).unwrap()
}

/// Rows as sorted debug strings, for multiset comparison.
pub fn canonical(rows: Vec<Row>) -> Vec<String> {
    let mut out: Vec<String> = rows.iter().map(|r| format!("{:?}", r)).collect();
    out.sort();
    out
}

/// Columns read per table over every scan of the plan, subquery bodies
/// included, plus the total number of columns read.
pub fn scanned_columns(plan: &PlanNode) -> (BTreeMap<String, BTreeSet<usize>>, usize) {
    fn walk(node: &PlanNode, cols: &mut BTreeMap<String, BTreeSet<usize>>, total: &mut usize) {
        if let PlanNode::TableScan(scan) = node {
            cols.entry(scan.table().to_string())
                .or_default()
                .extend(scan.projection().iter().copied());
            *total += scan.projection().len();
        }
        for expr in node.expressions() {
            for sq in expr.subqueries() {
                walk(sq, cols, total);
            }
        }
        for child in node.children() {
            walk(child, cols, total);
        }
    }
    let mut cols = BTreeMap::new();
    let mut total = 0;
    walk(plan, &mut cols, &mut total);
    (cols, total)
}

/// Table contents by name; each row holds every column of its table.
#[derive(Default)]
pub struct Database {
    tables: BTreeMap<String, Vec<Row>>,
}

impl Database {
    pub fn insert(&mut self, table: &str, rows: Vec<Row>) {
        self.tables.insert(table.to_string(), rows);
    }

    pub fn run(&self, plan: &PlanNode) -> Vec<Row> {
        self.eval(plan, &[])
    }

    fn eval(&self, plan: &PlanNode, outer: &[LiteralValue]) -> Vec<Row> {
        match plan {
            PlanNode::TableScan(scan) => {
                let rows = self.tables.get(scan.table()).cloned().unwrap_or_default();
                rows.into_iter()
                    .filter(|row| match scan.access().map(|a| (a.key_columns(), a.lookup())) {
                        Some((columns, IndexLookup::Static { ranges })) => {
                            let key: Row = columns.iter().map(|&c| row[c].clone()).collect();
                            ranges.iter().any(|r| r.contains(&key))
                        }
                        _ => true,
                    })
                    .map(|row| scan.projection().iter().map(|&c| row[c].clone()).collect())
                    .collect()
            }
            PlanNode::Filter(f) => self
                .eval(f.input(), outer)
                .into_iter()
                .filter(|row| self.truth(f.predicate(), row, outer) == Some(true))
                .collect(),
            PlanNode::Project(p) => self
                .eval(p.input(), outer)
                .iter()
                .map(|row| p.items().iter().map(|i| self.value(&i.expr, row, outer)).collect())
                .collect(),
            PlanNode::Join(j) => {
                let left = self.eval(j.left(), outer);
                let right = self.eval(j.right(), outer);
                let nulls = |n: usize| vec![LiteralValue::Null; n];
                let concat = |l: &Row, r: &Row| l.iter().chain(r.iter()).cloned().collect::<Row>();
                let (lw, rw) = (j.left().schema().len(), j.right().schema().len());

                let mut out = Vec::new();
                let mut right_matched = vec![false; right.len()];
                for l in &left {
                    let mut matched = false;
                    for (i, r) in right.iter().enumerate() {
                        let row = concat(l, r);
                        let hit = j
                            .condition()
                            .map_or(true, |c| self.truth(c, &row, outer) == Some(true));
                        if hit {
                            matched = true;
                            right_matched[i] = true;
                            if !j.join_type().is_left_only() {
                                out.push(row);
                            }
                        }
                    }
                    match j.join_type() {
                        JoinType::Semi if matched => out.push(l.clone()),
                        JoinType::Anti if !matched => out.push(l.clone()),
                        JoinType::Left | JoinType::Full if !matched => out.push(concat(l, &nulls(rw))),
                        _ => {}
                    }
                }
                if matches!(j.join_type(), JoinType::Right | JoinType::Full) {
                    for (r, matched) in right.iter().zip(right_matched) {
                        if !matched {
                            out.push(concat(&nulls(lw), r));
                        }
                    }
                }
                out
            }
            PlanNode::Subquery(s) => self.eval(s.plan(), outer),
            PlanNode::GroupBy(g) => {
                let mut groups: Vec<(Row, Vec<Row>)> = Vec::new();
                for row in self.eval(g.input(), outer) {
                    let key: Row = g.group_by().iter().map(|&c| row[c].clone()).collect();
                    match groups.iter_mut().find(|(k, _)| same_row(k, &key)) {
                        Some((_, members)) => members.push(row),
                        None => groups.push((key, vec![row])),
                    }
                }
                if g.group_by().is_empty() && groups.is_empty() {
                    groups.push((Vec::new(), Vec::new()));
                }
                groups
                    .into_iter()
                    .map(|(mut key, members)| {
                        for agg in g.aggregates() {
                            key.push(self.aggregate(agg, &members, outer));
                        }
                        key
                    })
                    .collect()
            }
            PlanNode::Sort(s) => {
                let mut rows = self.eval(s.input(), outer);
                rows.sort_by(|a, b| {
                    for key in s.order() {
                        let (x, y) = (&a[key.column], &b[key.column]);
                        let ord = match (x.is_null(), y.is_null()) {
                            (true, true) => Ordering::Equal,
                            (true, false) if key.nulls_first => Ordering::Less,
                            (true, false) => Ordering::Greater,
                            (false, true) if key.nulls_first => Ordering::Greater,
                            (false, true) => Ordering::Less,
                            (false, false) => {
                                let o = x.compare(y).unwrap_or(Ordering::Equal);
                                if key.ascending {
                                    o
                                } else {
                                    o.reverse()
                                }
                            }
                        };
                        if ord != Ordering::Equal {
                            return ord;
                        }
                    }
                    Ordering::Equal
                });
                rows
            }
            PlanNode::Limit(l) => self
                .eval(l.input(), outer)
                .into_iter()
                .skip(l.offset())
                .take(l.limit())
                .collect(),
        }
    }

    fn aggregate(&self, agg: &AggregateExpr, members: &[Row], outer: &[LiteralValue]) -> LiteralValue {
        let Some(arg) = &agg.arg else {
            return int(members.len() as i64);
        };
        let values: Vec<LiteralValue> = members
            .iter()
            .map(|row| self.value(arg, row, outer))
            .filter(|v| !v.is_null())
            .collect();
        match agg.function {
            AggregateFunction::Count => int(values.len() as i64),
            AggregateFunction::CountDistinct => {
                let mut distinct: Vec<&LiteralValue> = Vec::new();
                for v in &values {
                    if !distinct.iter().any(|d| same_value(d, v)) {
                        distinct.push(v);
                    }
                }
                int(distinct.len() as i64)
            }
            AggregateFunction::Sum => values
                .iter()
                .filter_map(as_int)
                .reduce(i64::wrapping_add)
                .map(int)
                .unwrap_or(LiteralValue::Null),
            AggregateFunction::Avg => {
                let ints: Vec<i64> = values.iter().filter_map(as_int).collect();
                if ints.is_empty() {
                    LiteralValue::Null
                } else {
                    let sum: i64 = ints.iter().fold(0, |a, b| a.wrapping_add(*b));
                    LiteralValue::Float(sum as f64 / ints.len() as f64)
                }
            }
            AggregateFunction::Min | AggregateFunction::Max => {
                let want = if agg.function == AggregateFunction::Min {
                    Ordering::Less
                } else {
                    Ordering::Greater
                };
                values
                    .into_iter()
                    .reduce(|best, v| if v.compare(&best) == Some(want) { v } else { best })
                    .unwrap_or(LiteralValue::Null)
            }
        }
    }

    fn truth(&self, expr: &Expr, row: &[LiteralValue], outer: &[LiteralValue]) -> Option<bool> {
        match self.value(expr, row, outer) {
            LiteralValue::Boolean(b) => Some(b),
            _ => None,
        }
    }

    fn value(&self, expr: &Expr, row: &[LiteralValue], outer: &[LiteralValue]) -> LiteralValue {
        let boolean = |b: Option<bool>| b.map(LiteralValue::Boolean).unwrap_or(LiteralValue::Null);
        match expr {
            Expr::Column(i) => row[*i].clone(),
            Expr::OuterColumn(i) => outer[*i].clone(),
            Expr::Literal(v) => v.clone(),
            Expr::BinaryOp {
                left,
                op: BinaryOperator::And,
                right,
            } => boolean(match (self.truth(left, row, outer), self.truth(right, row, outer)) {
                (Some(false), _) | (_, Some(false)) => Some(false),
                (Some(true), Some(true)) => Some(true),
                _ => None,
            }),
            Expr::BinaryOp {
                left,
                op: BinaryOperator::Or,
                right,
            } => boolean(match (self.truth(left, row, outer), self.truth(right, row, outer)) {
                (Some(true), _) | (_, Some(true)) => Some(true),
                (Some(false), Some(false)) => Some(false),
                _ => None,
            }),
            Expr::BinaryOp { left, op, right } => {
                let (l, r) = (self.value(left, row, outer), self.value(right, row, outer));
                if op.is_comparison() {
                    return boolean(l.compare(&r).map(|o| match op {
                        BinaryOperator::Eq => o == Ordering::Equal,
                        BinaryOperator::NotEq => o != Ordering::Equal,
                        BinaryOperator::Lt => o == Ordering::Less,
                        BinaryOperator::LtEq => o != Ordering::Greater,
                        BinaryOperator::Gt => o == Ordering::Greater,
                        _ => o != Ordering::Less,
                    }));
                }
                match (op, as_int(&l), as_int(&r)) {
                    (BinaryOperator::Plus, Some(a), Some(b)) => int(a.wrapping_add(b)),
                    (BinaryOperator::Minus, Some(a), Some(b)) => int(a.wrapping_sub(b)),
                    (BinaryOperator::Multiply, Some(a), Some(b)) => int(a.wrapping_mul(b)),
                    (BinaryOperator::Divide, Some(a), Some(b)) if b != 0 => int(a.wrapping_div(b)),
                    (BinaryOperator::Modulo, Some(a), Some(b)) if b != 0 => int(a.wrapping_rem(b)),
                    _ => LiteralValue::Null,
                }
            }
            Expr::UnaryOp {
                op: UnaryOperator::Not,
                expr,
            } => boolean(self.truth(expr, row, outer).map(|b| !b)),
            Expr::UnaryOp {
                op: UnaryOperator::Minus,
                expr,
            } => as_int(&self.value(expr, row, outer))
                .map(|n| int(n.wrapping_neg()))
                .unwrap_or(LiteralValue::Null),
            Expr::IsNull { expr, negated } => {
                LiteralValue::Boolean(self.value(expr, row, outer).is_null() != *negated)
            }
            Expr::InList { expr, list, negated } => {
                let v = self.value(expr, row, outer);
                let mut result = Some(false);
                for item in list {
                    match v.compare(&self.value(item, row, outer)) {
                        Some(Ordering::Equal) => {
                            result = Some(true);
                            break;
                        }
                        Some(_) => {}
                        None => result = None,
                    }
                }
                boolean(if *negated { result.map(|b| !b) } else { result })
            }
            Expr::Exists(sq) => LiteralValue::Boolean(!self.eval(sq, row).is_empty()),
            Expr::ScalarSubquery(sq) => self
                .eval(sq, row)
                .into_iter()
                .next()
                .and_then(|r| r.into_iter().next())
                .unwrap_or(LiteralValue::Null),
        }
    }
}

fn as_int(v: &LiteralValue) -> Option<i64> {
    match v {
        LiteralValue::Integer(n) => Some(*n),
        _ => None,
    }
}

/// Grouping equality: NULL matches NULL.
fn same_value(a: &LiteralValue, b: &LiteralValue) -> bool {
    (a.is_null() && b.is_null()) || a.compare(b) == Some(Ordering::Equal)
}

fn same_row(a: &[LiteralValue], b: &[LiteralValue]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| same_value(x, y))
}
