//! End-to-end rewrites through the default pipeline.

mod common;

use std::sync::Arc;

use costplan::catalog::{CatalogProvider, DataType, MemoryCatalog, PredicateShape, SchemaBuilder};
use costplan::optimizer::{Optimizer, OptimizerConfig};
use costplan::planner::{BinaryOperator, Expr, IndexLookup, JoinStrategy, JoinType, PlanNode, TableScan};

use common::{canonical, catalog, database, scan};

/// The scan a chain of filters and projects reads from.
fn leaf_scan(node: &PlanNode) -> &TableScan {
    match node {
        PlanNode::TableScan(scan) => scan,
        PlanNode::Filter(f) => leaf_scan(f.input()),
        PlanNode::Project(p) => leaf_scan(p.input()),
        other => panic!("no scan under {}", other),
    }
}

fn assert_same_rows(before: &Arc<PlanNode>, after: &Arc<PlanNode>) {
    let db = database();
    assert_eq!(
        canonical(db.run(before)),
        canonical(db.run(after)),
        "before:\n{}\nafter:\n{}",
        before,
        after
    );
}

#[test]
fn test_point_predicate_uses_primary_key() {
    let catalog = catalog();
    let plan = PlanNode::filter(scan(&catalog, "xy"), Expr::eq(Expr::col(0), Expr::int(1))).unwrap();

    let optimized = Optimizer::new(catalog).optimize(&plan).unwrap();
    assert_eq!(
        optimized.to_string(),
        "TableScan: xy [x, y, z, w] index=PRIMARY[0] ranges=[{[1]}]\n"
    );
    assert_same_rows(&plan, &optimized);
}

#[test]
fn test_filtered_large_table_drives_join() {
    let catalog = catalog();
    catalog
        .set_selectivity("uv", &["v"], PredicateShape::Equality, 0.000001)
        .unwrap();
    let filtered = PlanNode::filter(scan(&catalog, "uv"), Expr::eq(Expr::col(1), Expr::int(3))).unwrap();
    let plan = PlanNode::join(
        JoinType::Inner,
        scan(&catalog, "xy"),
        filtered,
        Some(Expr::eq(Expr::col(0), Expr::col(4))),
        JoinStrategy::NestedLoop,
    )
    .unwrap();

    let report = Optimizer::new(catalog).optimize_with_report(&plan).unwrap();
    assert!(report.fallback.is_none());
    let optimized = report.plan;
    assert_eq!(optimized.schema(), plan.schema());

    let PlanNode::Project(project) = optimized.as_ref() else {
        panic!("expected the original column order restored:\n{}", optimized);
    };
    let join = project.input().as_join().expect("expected a join under the project");
    assert_eq!(join.join_type(), JoinType::Inner);
    assert_eq!(join.strategy(), JoinStrategy::Lookup);

    let driver = leaf_scan(join.left());
    assert_eq!(driver.table(), "uv");
    assert_eq!(driver.access().map(|a| a.index().name.as_str()), Some("uv_v"));
    let probed = leaf_scan(join.right());
    assert_eq!(probed.table(), "xy");
    assert!(probed.has_dynamic_access());

    assert_same_rows(&plan, &optimized);
}

#[test]
fn test_uncorrelated_exists_cached_and_outer_filter_hoisted() {
    let catalog = catalog();
    let body = PlanNode::filter(scan(&catalog, "uv"), Expr::eq(Expr::outer(0), Expr::int(0))).unwrap();
    let exists = Expr::Exists(PlanNode::subquery(body, false).unwrap());
    let plan = PlanNode::filter(scan(&catalog, "xy"), exists).unwrap();

    let optimized = Optimizer::new(catalog).optimize(&plan).unwrap();
    let PlanNode::Filter(filter) = optimized.as_ref() else {
        panic!("expected the EXISTS to stay a filter:\n{}", optimized);
    };
    let Expr::Exists(sq) = filter.predicate() else {
        panic!("unexpected predicate {}", filter.predicate());
    };
    let PlanNode::Subquery(sq) = sq.as_ref() else {
        panic!("expected a subquery node");
    };
    assert!(sq.cacheable());
    assert!(!sq.correlated());
    assert!(sq.plan().outer_refs().is_empty());

    // x = 0 now restricts the outer scan through its primary key.
    let outer = filter.input().as_table_scan().expect("expected the outer scan");
    assert_eq!(outer.table(), "xy");
    assert!(matches!(
        outer.access().map(|a| a.lookup()),
        Some(IndexLookup::Static { .. })
    ));

    assert_same_rows(&plan, &optimized);
}

#[test]
fn test_correlated_exists_becomes_semi_join() {
    let catalog = catalog();
    let body = PlanNode::filter(scan(&catalog, "uv"), Expr::eq(Expr::col(0), Expr::outer(0))).unwrap();
    let exists = Expr::Exists(PlanNode::subquery(body, false).unwrap());
    let plan = PlanNode::filter(scan(&catalog, "xy"), exists).unwrap();

    let optimized = Optimizer::new(catalog).optimize(&plan).unwrap();
    let join = optimized.as_join().expect("expected a semi join");
    assert_eq!(join.join_type(), JoinType::Semi);
    assert_eq!(join.strategy(), JoinStrategy::Lookup);
    assert!(leaf_scan(join.right()).has_dynamic_access());
    assert_eq!(optimized.schema(), plan.schema());

    assert_same_rows(&plan, &optimized);
}

#[test]
fn test_correlated_not_exists_becomes_anti_join() {
    let catalog = catalog();
    let body = PlanNode::filter(
        scan(&catalog, "uv"),
        Expr::and(
            Expr::eq(Expr::col(1), Expr::outer(1)),
            Expr::binary(Expr::col(0), BinaryOperator::Gt, Expr::int(4)),
        ),
    )
    .unwrap();
    let not_exists = Expr::not(Expr::Exists(PlanNode::subquery(body, false).unwrap()));
    let plan = PlanNode::filter(scan(&catalog, "xy"), not_exists).unwrap();

    let optimized = Optimizer::new(catalog).optimize(&plan).unwrap();
    let join = optimized.as_join().expect("expected an anti join");
    assert_eq!(join.join_type(), JoinType::Anti);

    assert_same_rows(&plan, &optimized);
}

#[test]
fn test_covering_index_chosen_over_plain_one() {
    let catalog = MemoryCatalog::new();
    catalog
        .create_table(
            SchemaBuilder::new("t")
                .add_required_column("a", DataType::Integer)
                .add_column("b", DataType::Integer)
                .add_column("c", DataType::Integer)
                .add_column("d", DataType::Integer)
                .primary_key(&["a"])
                .index("t_b", &["b"])
                .covering_index("t_b_c", &["b"], &["c"])
                .build()
                .unwrap(),
        )
        .unwrap();
    catalog.set_row_count("t", 1000.0).unwrap();
    let scan = PlanNode::table_scan("t", catalog.schema("t").unwrap().columns, vec![1, 2], None).unwrap();
    let plan = PlanNode::filter(scan, Expr::eq(Expr::col(0), Expr::int(5))).unwrap();

    let optimized = Optimizer::new(Arc::new(catalog)).optimize(&plan).unwrap();
    let scan = optimized.as_table_scan().expect("filter should be consumed");
    assert_eq!(scan.access().map(|a| a.index().name.as_str()), Some("t_b_c"));
}

#[test]
fn test_wide_range_on_secondary_index_keeps_full_scan() {
    let catalog = catalog();
    let plan = PlanNode::filter(
        scan(&catalog, "uv"),
        Expr::binary(Expr::col(1), BinaryOperator::Gt, Expr::int(5)),
    )
    .unwrap();

    let optimized = Optimizer::new(catalog).optimize(&plan).unwrap();
    assert_eq!(optimized, plan);
}

#[test]
fn test_pruning_narrows_scans_below_join() {
    let catalog = catalog();
    let join = PlanNode::join(
        JoinType::Inner,
        scan(&catalog, "ab"),
        scan(&catalog, "uv"),
        Some(Expr::eq(Expr::col(2), Expr::col(4))),
        JoinStrategy::NestedLoop,
    )
    .unwrap();
    let plan = PlanNode::project_columns(join, &[0, 5]).unwrap();

    let optimized = Optimizer::new(catalog).optimize(&plan).unwrap();
    assert_eq!(optimized.schema(), plan.schema());
    let (scanned, total) = common::scanned_columns(&optimized);
    assert_eq!(total, 4);
    assert_eq!(scanned["ab"].len(), 2);
    assert_eq!(scanned["uv"].len(), 2);

    assert_same_rows(&plan, &optimized);
}

#[test]
fn test_config_from_json_drives_pipeline() {
    let config = OptimizerConfig::from_json(r#"{"max_pipeline_passes": 1, "enable_trace": true}"#).unwrap();
    let catalog = catalog();
    let plan = PlanNode::filter(scan(&catalog, "xy"), Expr::eq(Expr::col(0), Expr::int(7))).unwrap();

    let report = Optimizer::with_config(catalog, config).unwrap().optimize_with_report(&plan).unwrap();
    assert_eq!(report.iterations, 1);
    assert!(report.trace.iter().any(|t| t.rule_name == "PredicatePushdown"));
}
