//! Indented explain output for plan trees.

use std::fmt;

use super::node::PlanNode;

impl fmt::Display for PlanNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.format_indent(f, 0)
    }
}

impl PlanNode {
    fn format_indent(&self, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
        let pad = "  ".repeat(indent);
        match self {
            PlanNode::TableScan(scan) => {
                let cols: Vec<&str> = scan
                    .projection()
                    .iter()
                    .filter_map(|&i| scan.columns().get(i).map(|c| c.name.as_str()))
                    .collect();
                write!(f, "{}TableScan: {} [{}]", pad, scan.table(), cols.join(", "))?;
                if let Some(access) = scan.access() {
                    write!(f, " index={}", access)?;
                }
                writeln!(f)?;
            }
            PlanNode::Filter(filter) => {
                writeln!(f, "{}Filter: {}", pad, filter.predicate())?;
            }
            PlanNode::Project(project) => {
                let items: Vec<String> = project
                    .items()
                    .iter()
                    .map(|i| format!("{} AS {}", i.expr, i.alias))
                    .collect();
                writeln!(f, "{}Project: [{}]", pad, items.join(", "))?;
            }
            PlanNode::Join(join) => {
                write!(f, "{}Join: {} {}", pad, join.join_type(), join.strategy())?;
                if let Some(cond) = join.condition() {
                    write!(f, " ON {}", cond)?;
                }
                writeln!(f)?;
            }
            PlanNode::Subquery(sq) => {
                write!(f, "{}Subquery", pad)?;
                if sq.correlated() {
                    write!(f, " correlated")?;
                }
                if sq.cacheable() {
                    write!(f, " cacheable")?;
                }
                writeln!(f)?;
            }
            PlanNode::GroupBy(g) => {
                let keys: Vec<String> = g.group_by().iter().map(|c| format!("#{}", c)).collect();
                let aggs: Vec<String> = g
                    .aggregates()
                    .iter()
                    .map(|a| match &a.arg {
                        Some(arg) => format!("{}({}) AS {}", a.function, arg, a.alias),
                        None => format!("{}(*) AS {}", a.function, a.alias),
                    })
                    .collect();
                writeln!(f, "{}GroupBy: group=[{}], aggs=[{}]", pad, keys.join(", "), aggs.join(", "))?;
            }
            PlanNode::Sort(sort) => {
                let ord: Vec<String> = sort
                    .order()
                    .iter()
                    .map(|k| {
                        format!(
                            "#{} {} NULLS {}",
                            k.column,
                            if k.ascending { "ASC" } else { "DESC" },
                            if k.nulls_first { "FIRST" } else { "LAST" }
                        )
                    })
                    .collect();
                writeln!(f, "{}Sort: [{}]", pad, ord.join(", "))?;
            }
            PlanNode::Limit(limit) => {
                write!(f, "{}Limit: {}", pad, limit.limit())?;
                if limit.offset() > 0 {
                    write!(f, " OFFSET {}", limit.offset())?;
                }
                writeln!(f)?;
            }
        }

        for expr in self.expressions() {
            for sq in expr.subqueries() {
                sq.format_indent(f, indent + 2)?;
            }
        }
        for child in self.children() {
            child.format_indent(f, indent + 1)?;
        }
        Ok(())
    }
}
