//! Transformation engine: builds the derived table from a source table and
//! the typed mapping rows.
//!
//! Rows run in declaration order and each one goes through the same steps:
//! base copy, conditional override, expression, default fill, required check.
//! Only a broken table aborts a run; expression and conditional problems are
//! logged, recorded in the report and leave the target as it was.

use crate::conditional::ConditionalParser;
use crate::error::Result;
use crate::expression::{EvalContext, Expression};
use crate::mapping::MappingRow;
use crate::table::{Cell, CellKind, Columns};
use chrono::{Local, NaiveDate};
use polars::prelude::DataFrame;
use serde::Serialize;
use tracing::{debug, info, warn};

/// What happened to a mapping row.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum TransformStep {
    /// No source column, no expression, no conditional.
    Skipped,
    BaseCopy,
    Conditional,
    /// Rule text that no strategy could parse.
    ConditionalIgnored,
    Expression,
    ExpressionFailed { error: String },
    DefaultFill { filled: usize },
    RequiredMissing { missing: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowReport {
    pub line: usize,
    pub target: String,
    pub steps: Vec<TransformStep>,
}

impl RowReport {
    pub fn skipped(&self) -> bool {
        self.steps.contains(&TransformStep::Skipped)
    }

    pub fn expression_error(&self) -> Option<&str> {
        self.steps.iter().find_map(|s| match s {
            TransformStep::ExpressionFailed { error } => Some(error.as_str()),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TransformReport {
    pub rows: Vec<RowReport>,
}

impl TransformReport {
    pub fn skipped(&self) -> usize {
        self.rows.iter().filter(|r| r.skipped()).count()
    }

    pub fn failed_expressions(&self) -> impl Iterator<Item = &RowReport> {
        self.rows.iter().filter(|r| r.expression_error().is_some())
    }

    /// Targets flagged required that still hold missing values.
    pub fn required_warnings(&self) -> Vec<(&str, usize)> {
        self.rows
            .iter()
            .flat_map(|r| {
                r.steps.iter().filter_map(move |s| match s {
                    TransformStep::RequiredMissing { missing } => Some((r.target.as_str(), *missing)),
                    _ => None,
                })
            })
            .collect()
    }
}

/// The derived table plus a per-row account of how it was built.
#[derive(Debug, Clone)]
pub struct TransformOutcome {
    /// Distinct targets in first-declared order; never-produced targets are all-null.
    pub derived: Columns,
    pub report: TransformReport,
}

impl TransformOutcome {
    pub fn to_frame(&self) -> Result<DataFrame> {
        self.derived.to_frame(self.derived.names())
    }
}

pub struct TransformationEngine {
    conditional: ConditionalParser,
    today: NaiveDate,
}

impl Default for TransformationEngine {
    fn default() -> Self {
        Self::new(ConditionalParser::default())
    }
}

/// Cell to fill missing values with, typed like the column's present values when it parses.
fn default_cell(value: &str, existing: &[Cell]) -> Cell {
    let kinds: Vec<CellKind> = existing.iter().filter_map(|c| c.kind()).collect();
    let trimmed = value.trim();
    if !kinds.is_empty() && kinds.iter().all(|k| *k == CellKind::Int) {
        if let Ok(v) = trimmed.parse::<i64>() {
            return Cell::Int(v);
        }
    }
    if !kinds.is_empty() && kinds.iter().all(|k| matches!(k, CellKind::Int | CellKind::Float)) {
        if let Ok(v) = trimmed.parse::<f64>() {
            return Cell::Float(v);
        }
    }
    Cell::str(value)
}

impl TransformationEngine {
    pub fn new(conditional: ConditionalParser) -> Self {
        Self {
            conditional,
            today: Local::now().date_naive(),
        }
    }

    /// Pin the date `years_since` measures against.
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = today;
        self
    }

    pub fn today(&self) -> NaiveDate {
        self.today
    }

    pub fn apply(&self, source: &Columns, rows: &[MappingRow]) -> Result<TransformOutcome> {
        info!("Applying {} mapping rows to {} source rows", rows.len(), source.height());

        let mut derived = Columns::with_height(source.height());
        let mut report = TransformReport::default();
        let mut targets: Vec<String> = Vec::new();

        for row in rows {
            if !targets.contains(&row.target_ref) {
                targets.push(row.target_ref.clone());
            }
            let steps = self.apply_row(source, &mut derived, row)?;
            report.rows.push(RowReport {
                line: row.line,
                target: row.target_ref.clone(),
                steps,
            });
        }

        let mut ordered = Columns::with_height(source.height());
        for target in &targets {
            let cells = derived
                .get(target)
                .map(|c| c.to_vec())
                .unwrap_or_else(|| vec![Cell::Null; source.height()]);
            ordered.insert(target, cells)?;
        }

        info!(
            "Derived table has {} columns ({} rows skipped, {} expression failures)",
            targets.len(),
            report.skipped(),
            report.failed_expressions().count()
        );
        Ok(TransformOutcome {
            derived: ordered,
            report,
        })
    }

    fn apply_row(&self, source: &Columns, derived: &mut Columns, row: &MappingRow) -> Result<Vec<TransformStep>> {
        let target = row.target_ref.as_str();
        let source_cells = row.source_ref.as_deref().and_then(|name| source.get(name));
        let mut steps = Vec::new();

        if source_cells.is_none() && row.transformation_expr.is_none() && row.conditional_rule.is_none() {
            debug!(
                "Row {}: source '{}' not found and no rule given; skipping '{}'",
                row.line,
                row.source_ref.as_deref().unwrap_or(""),
                target
            );
            steps.push(TransformStep::Skipped);
            return Ok(steps);
        }

        if let Some(cells) = source_cells {
            derived.insert(target, cells.to_vec())?;
            steps.push(TransformStep::BaseCopy);
        }

        let mut conditional_applied = false;
        if let (Some(text), Some(cells)) = (row.conditional_rule.as_deref(), source_cells) {
            let field = row.source_ref.as_deref().unwrap_or("");
            match self.conditional.parse(text, field) {
                Some(rule) => {
                    derived.insert(target, rule.apply(cells))?;
                    steps.push(TransformStep::Conditional);
                    conditional_applied = true;
                    info!("Row {}: applied conditional to '{}'", row.line, target);
                }
                None => steps.push(TransformStep::ConditionalIgnored),
            }
        }

        if !conditional_applied {
            if let Some(text) = row.transformation_expr.as_deref() {
                match self.evaluate(text, source, derived) {
                    Ok(cells) => {
                        derived.insert(target, cells)?;
                        steps.push(TransformStep::Expression);
                        info!("Row {}: applied transformation to '{}'", row.line, target);
                    }
                    Err(e) => {
                        warn!("Row {}: transformation failed for '{}': {}", row.line, target, e);
                        steps.push(TransformStep::ExpressionFailed { error: e.to_string() });
                    }
                }
            }
        }

        if let Some(value) = row.default_value.as_deref() {
            let current = derived
                .get(target)
                .map(|c| c.to_vec())
                .unwrap_or_else(|| vec![Cell::Null; derived.height()]);
            let fill = default_cell(value, &current);
            let filled = current.iter().filter(|c| c.is_missing()).count();
            let cells = current
                .into_iter()
                .map(|c| if c.is_missing() { fill.clone() } else { c })
                .collect();
            derived.insert(target, cells)?;
            if filled > 0 {
                debug!("Row {}: filled {} missing values in '{}'", row.line, filled, target);
            }
            steps.push(TransformStep::DefaultFill { filled });
        }

        if row.required {
            let missing = derived
                .get(target)
                .map(|c| c.iter().filter(|v| v.is_missing()).count())
                .unwrap_or(derived.height());
            if missing > 0 {
                warn!("Required field '{}' has {} missing values", target, missing);
                steps.push(TransformStep::RequiredMissing { missing });
            }
        }

        Ok(steps)
    }

    fn evaluate(&self, text: &str, source: &Columns, derived: &Columns) -> Result<Vec<Cell>> {
        let expression = Expression::parse(text)?;
        expression.evaluate(&EvalContext {
            source,
            derived,
            today: self.today,
        })
    }
}

/// Frame-level entry point using the template-only conditional parser.
pub fn apply_transformations(source: &DataFrame, rows: &[MappingRow]) -> Result<DataFrame> {
    let columns = Columns::from_frame(source)?;
    TransformationEngine::default().apply(&columns, rows)?.to_frame()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> TransformationEngine {
        TransformationEngine::default().with_today(NaiveDate::from_ymd_opt(2026, 10, 18).unwrap())
    }

    fn source() -> Columns {
        let mut t = Columns::with_height(3);
        t.insert("first", vec![Cell::str("Ada"), Cell::str("Alan"), Cell::Null]).unwrap();
        t.insert("last", vec![Cell::str("Lovelace"), Cell::str("Turing"), Cell::str("Hopper")]).unwrap();
        t.insert("gender", vec![Cell::str("F"), Cell::str("M"), Cell::Null]).unwrap();
        t.insert("salary", vec![Cell::Int(5000), Cell::Int(25000), Cell::Null]).unwrap();
        t
    }

    #[test]
    fn test_base_copy_and_skip() {
        let rows = vec![
            MappingRow::new("first", "FirstName"),
            MappingRow::new("legacy_id", "LegacyId"),
        ];
        let outcome = engine().apply(&source(), &rows).unwrap();
        assert_eq!(outcome.derived.names(), &["FirstName", "LegacyId"]);
        assert_eq!(outcome.derived.get("FirstName").unwrap()[1], Cell::str("Alan"));
        assert!(outcome.derived.get("LegacyId").unwrap().iter().all(|c| c.is_missing()));
        assert_eq!(outcome.report.skipped(), 1);
    }

    #[test]
    fn test_conditional_beats_expression() {
        let rows = vec![MappingRow::new("gender", "Gender")
            .with_conditional("If gender == 'M' then 'Male' else 'Female'")
            .with_expression("df['gender'].str.lower()")];
        let outcome = engine().apply(&source(), &rows).unwrap();
        assert_eq!(
            outcome.derived.get("Gender").unwrap(),
            &[Cell::str("Female"), Cell::str("Male"), Cell::str("Female")]
        );
        assert_eq!(
            outcome.report.rows[0].steps,
            vec![TransformStep::BaseCopy, TransformStep::Conditional]
        );
    }

    #[test]
    fn test_expression_over_source_and_derived() {
        let rows = vec![
            MappingRow::new("first", "FirstName"),
            MappingRow::new("", "FullName").with_expression("concat(renamed['FirstName'], df['last'])"),
            MappingRow::new("salary", "Salary").with_expression("cap_value(df['salary'], 10000)"),
        ];
        let outcome = engine().apply(&source(), &rows).unwrap();
        let full = outcome.derived.get("FullName").unwrap();
        assert_eq!(full[0], Cell::str("Ada Lovelace"));
        assert_eq!(full[2], Cell::str(" Hopper"));
        let salary = outcome.derived.get("Salary").unwrap();
        assert_eq!(salary[0], Cell::Int(5000));
        assert_eq!(salary[1], Cell::Int(10000));
    }

    #[test]
    fn test_failed_expression_keeps_base_copy() {
        let rows = vec![MappingRow::new("first", "FirstName").with_expression("df['missing'] + 1")];
        let outcome = engine().apply(&source(), &rows).unwrap();
        assert_eq!(outcome.derived.get("FirstName").unwrap()[0], Cell::str("Ada"));
        assert!(outcome.report.rows[0].expression_error().is_some());

        let rows = vec![MappingRow::new("", "Broken").with_expression("import os")];
        let outcome = engine().apply(&source(), &rows).unwrap();
        assert!(outcome.derived.get("Broken").unwrap().iter().all(|c| c.is_missing()));
    }

    #[test]
    fn test_default_fill_and_required() {
        let rows = vec![
            MappingRow::new("first", "FirstName").with_default("Unknown"),
            MappingRow::new("salary", "Salary").with_default("0"),
            MappingRow::new("", "Country")
                .with_expression("renamed['NoSuchColumn']")
                .with_default("US"),
            MappingRow::new("", "Region").with_default("EU"),
            MappingRow::new("gender", "Gender").required(),
        ];
        let outcome = engine().apply(&source(), &rows).unwrap();
        assert_eq!(outcome.derived.get("FirstName").unwrap()[2], Cell::str("Unknown"));
        assert_eq!(outcome.derived.get("Salary").unwrap()[2], Cell::Int(0));
        assert!(outcome.derived.get("Country").unwrap().iter().all(|c| *c == Cell::str("US")));
        // a default alone does not make a row productive
        assert!(outcome.derived.get("Region").unwrap().iter().all(|c| c.is_missing()));
        assert_eq!(outcome.report.required_warnings(), vec![("Gender", 1)]);
    }

    #[test]
    fn test_targets_deduplicated_later_rows_overwrite() {
        let rows = vec![
            MappingRow::new("first", "Name"),
            MappingRow::new("last", "Other"),
            MappingRow::new("last", "Name"),
        ];
        let outcome = engine().apply(&source(), &rows).unwrap();
        assert_eq!(outcome.derived.names(), &["Name", "Other"]);
        assert_eq!(outcome.derived.get("Name").unwrap()[0], Cell::str("Lovelace"));
    }

    #[test]
    fn test_idempotent() {
        let rows = vec![
            MappingRow::new("gender", "Gender").with_conditional("map m/f to male/female"),
            MappingRow::new("salary", "Salary").with_expression("round(df['salary'] / 3, 2)"),
        ];
        let a = engine().apply(&source(), &rows).unwrap();
        let b = engine().apply(&source(), &rows).unwrap();
        assert_eq!(a.derived, b.derived);
        assert!(a.to_frame().unwrap().equals_missing(&b.to_frame().unwrap()));
    }
}
