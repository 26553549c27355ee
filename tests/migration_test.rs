use chrono::{Datelike, Local, NaiveDate};
use migration_qa::cleaners::{normalize_phone, validate_phone};
use migration_qa::config::QaConfig;
use migration_qa::roles::Tier;
use migration_qa::store::{RuleKey, RuleStore, SqliteRuleStore};
use migration_qa::table::{column_cells, Cell};
use migration_qa::validation::Dimension;
use migration_qa::{
    apply_transformations, MappingRow, MappingSheet, MigrationPipeline, QaError, Role, RoleResolver,
    RunContext, ValidationEngine,
};
use polars::prelude::*;
use std::fs;
use tempfile::TempDir;

fn headers(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

#[test]
fn explicit_headers_resolve_exactly() {
    let roles = RoleResolver::default()
        .resolve(&headers(&["Source Field", "Target Field", "Notes"]))
        .unwrap();
    assert_eq!(roles.get(Role::Source), Some("Source Field"));
    assert_eq!(roles.get(Role::Target), Some("Target Field"));
    assert_eq!(roles.get_match(Role::Source).unwrap().tier, Tier::Exact);
    assert_eq!(roles.get_match(Role::Target).unwrap().tier, Tier::Exact);
}

#[test]
fn synonym_headers_need_fuzzy_matching() {
    let roles = RoleResolver::default()
        .resolve(&headers(&["Beginning", "Ending"]))
        .unwrap();
    let target = roles.get_match(Role::Target).unwrap();
    assert_eq!(target.column, "Ending");
    assert_eq!(target.tier, Tier::Fuzzy);
    assert!(target.score >= 0.6, "score {}", target.score);
}

#[test]
fn unresolvable_headers_fail_with_available_list() {
    let err = RoleResolver::default()
        .resolve(&headers(&["123", "456"]))
        .unwrap_err();
    match err {
        QaError::UnresolvedRole { missing, available } => {
            assert!(missing.contains(&"target".to_string()));
            assert_eq!(available, vec!["123", "456"]);
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn years_since_uses_the_current_year() {
    let source = df![ "dob" => ["2000-01-01"] ].unwrap();
    let rows = vec![MappingRow::new("dob", "age").with_expression("years_since(df['dob'])")];
    let derived = apply_transformations(&source, &rows).unwrap();

    let expected = Local::now().date_naive().year() as i64 - 2000;
    assert_eq!(column_cells(&derived, "age").unwrap(), vec![Cell::Int(expected)]);
}

#[test]
fn gender_conditional_maps_every_value() {
    let source = df![ "Gender" => ["M", "F", "M"] ].unwrap();
    let rows = vec![MappingRow::new("Gender", "Gender")
        .with_conditional("If Gender == 'M' then 'Male' else 'Female'")];
    let derived = apply_transformations(&source, &rows).unwrap();
    assert_eq!(
        column_cells(&derived, "Gender").unwrap(),
        vec![Cell::str("Male"), Cell::str("Female"), Cell::str("Male")]
    );
}

#[test]
fn missing_values_take_the_else_branch() {
    let source = df![ "Gender" => [Some("M"), None] ].unwrap();
    let rows = vec![MappingRow::new("Gender", "Gender")
        .with_conditional("If Gender == 'M' then 'Male' else 'Female'")];
    let derived = apply_transformations(&source, &rows).unwrap();
    assert_eq!(
        column_cells(&derived, "Gender").unwrap(),
        vec![Cell::str("Male"), Cell::str("Female")]
    );
}

#[test]
fn deeply_nested_expression_only_fails_its_row() {
    let source = df![ "amount" => [1i64, 2] ].unwrap();
    let deep = format!("{}df['amount']{}", "(".repeat(5000), ")".repeat(5000));
    let rows = vec![
        MappingRow::new("amount", "Amount").with_expression(&deep),
        MappingRow::new("amount", "Doubled").with_expression("df['amount'] * 2"),
    ];
    let derived = apply_transformations(&source, &rows).unwrap();
    assert_eq!(column_cells(&derived, "Amount").unwrap(), vec![Cell::Int(1), Cell::Int(2)]);
    assert_eq!(column_cells(&derived, "Doubled").unwrap(), vec![Cell::Int(2), Cell::Int(4)]);
}

#[test]
fn transformations_are_idempotent() {
    let source = df![
        "first" => [Some("Ada"), None, Some("Grace")],
        "salary" => [Some(5000.0), Some(15000.0), None]
    ]
    .unwrap();
    let rows = vec![
        MappingRow::new("first", "First").with_default("Unknown"),
        MappingRow::new("salary", "Salary").with_expression("cap_value(df['salary'])"),
        MappingRow::new("", "Greeting").with_expression("concat('Hello', renamed['First'], sep=', ')"),
    ];
    let a = apply_transformations(&source, &rows).unwrap();
    let b = apply_transformations(&source, &rows).unwrap();
    assert!(a.equals_missing(&b));
    assert_eq!(
        column_cells(&a, "Greeting").unwrap()[1],
        Cell::str("Hello, Unknown")
    );
}

#[test]
fn completeness_counts_missing_values() {
    let values: Vec<Option<i64>> = (0..100).map(|i| if i < 90 { Some(i) } else { None }).collect();
    let df = df![ "id" => values ].unwrap();

    for engine in [ValidationEngine::default(), ValidationEngine::default().with_backend(None)] {
        let summary = engine.validate_frame(&df).unwrap();
        let completeness = summary
            .results
            .iter()
            .find(|r| r.dimension == Dimension::Completeness)
            .unwrap();
        assert_eq!(completeness.passed_count, 90);
        assert_eq!(completeness.failed_count, 10);
        assert_eq!(completeness.passed_score, 90.0);
    }
}

#[test]
fn every_rule_result_balances() {
    let df = df![
        "email" => [Some("a@example.com"), Some("bad"), None, Some("c@example.com")],
        "amount" => [Some(10.0), Some(12.5), Some(-3.0), None],
        "phone" => ["815-454-1041", "+1-212-555-0100", "n/a", "5550100"]
    ]
    .unwrap();

    for engine in [ValidationEngine::default(), ValidationEngine::default().with_backend(None)] {
        let summary = engine.validate_frame(&df).unwrap();
        assert!(!summary.results.is_empty());
        for r in &summary.results {
            assert_eq!(r.passed_count + r.failed_count, r.total_evaluated, "{}", r.rule_type);
            assert!(
                (r.passed_score + r.failed_score - 100.0).abs() < 0.011,
                "{} {} {}",
                r.rule_type,
                r.passed_score,
                r.failed_score
            );
        }
    }
}

#[test]
fn phone_normalization_round_trips() {
    let inputs = [
        "4541041",
        "454-1041",
        "8154541041",
        "(815) 454-1041",
        "815.454.1041 x12",
        "18154541041",
        "+1 815 454 1041 ext. 9",
    ];
    for input in inputs {
        let formatted = normalize_phone(input, "000").unwrap();
        assert!(validate_phone(&formatted), "{input} -> {formatted}");
    }
    assert_eq!(normalize_phone("12345", "000"), None);
}

#[test]
fn full_run_writes_artifacts_and_persists_rules() {
    let temp_dir = TempDir::new().unwrap();
    let source_path = temp_dir.path().join("customers.parquet");
    let mapping_path = temp_dir.path().join("mapping.csv");
    let db_path = temp_dir.path().join("rules.db");
    let out_dir = temp_dir.path().join("artifacts");

    let mut source = df![
        "cust_name" => [Some("Ada Lovelace"), Some("Alan Turing"), None],
        "contact_phone" => [Some("(815)454-1041"), Some("2125550100"), None],
        "sex" => ["F", "M", "X"],
        "balance" => [120.5, 99999.0, 10.0]
    ]
    .unwrap();
    let mut file = fs::File::create(&source_path).unwrap();
    ParquetWriter::new(&mut file).finish(&mut source).unwrap();

    fs::write(
        &mapping_path,
        "\
Source Column,Target Column,Transformation Rule,Conditional Mapping,Default Value,Required
cust_name,Name,,,Unknown,yes
contact_phone,Phone,,,,yes
sex,Gender,,\"If sex == 'M' then 'Male' else sex\",,
balance,Balance,\"cap_value(df['balance'], 50000)\",,,
,Segment,,,,
",
    )
    .unwrap();

    let store = SqliteRuleStore::open(&db_path).unwrap();
    let mut ctx = RunContext::new(42).with_store(Box::new(store));
    let pipeline = MigrationPipeline::new(&QaConfig::default())
        .unwrap()
        .with_today(NaiveDate::from_ymd_opt(2026, 10, 18).unwrap());
    let outcome = pipeline
        .run_files(&source_path, &mapping_path, &out_dir, &mut ctx)
        .unwrap();

    let derived = &outcome.transform.derived;
    assert_eq!(derived.names(), &["Name", "Phone", "Gender", "Balance", "Segment"]);
    assert_eq!(derived.get("Name").unwrap()[2], Cell::str("Unknown"));
    assert_eq!(derived.get("Phone").unwrap()[1], Cell::str("+1-212-555-0100"));
    assert_eq!(
        derived.get("Gender").unwrap(),
        &[Cell::str("F"), Cell::str("Male"), Cell::str("X")]
    );
    assert_eq!(derived.get("Balance").unwrap()[1], Cell::Float(50000.0));
    assert_eq!(outcome.transform.report.required_warnings(), vec![("Phone", 1)]);

    for file in [
        "mapped_output.csv",
        "failed_rows.csv",
        "validation_rules_summary.csv",
        "overall_validation_summary.csv",
        "migration_summary.csv",
        "mapping_status.csv",
    ] {
        assert!(out_dir.join(file).exists(), "{file} missing");
    }
    assert!(outcome.persisted > 0);

    let reopened = SqliteRuleStore::open(&db_path).unwrap();
    let key = RuleKey {
        column_name: "Name".to_string(),
        rule_type: "expect_column_values_to_not_be_null".to_string(),
        dimension: "completeness".to_string(),
        project_id: 42,
    };
    assert!(reopened.rule_exists(&key).unwrap());
    assert_eq!(reopened.metrics(&key).unwrap().unwrap().score, 100.0);
}

#[test]
fn mapping_sheet_without_roles_stops_the_run() {
    let sheet = MappingSheet::from_reader("123,456\na,b\n".as_bytes()).unwrap();
    let source = df![ "a" => [1i64] ].unwrap();
    let pipeline = MigrationPipeline::new(&QaConfig::default()).unwrap();
    let err = pipeline
        .run(&source, &sheet, &mut RunContext::new(1))
        .unwrap_err();
    assert!(matches!(err, QaError::UnresolvedRole { .. }));
}
