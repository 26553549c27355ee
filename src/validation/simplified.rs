//! Simplified mode: one rule per dimension, computed directly from the values.

use super::{Dimension, RuleResult};
use crate::cleaners::{validate_phone, ColumnCleaner, PhoneCleaner};
use crate::config::{PhoneConfig, ValidationConfig};
use crate::table::{Cell, Columns};
use std::collections::{HashMap, HashSet};
use tracing::debug;

const PHONE_RULE_NAME: &str = r"Phone Number Format (^\+1-\d{3}-\d{3}-\d{4}$)";

pub struct SimplifiedValidator<'a> {
    config: &'a ValidationConfig,
    phone: &'a PhoneConfig,
}

/// Numbers, or text that is digits once `.` and `-` are removed.
fn is_numeric_like(cell: &Cell) -> bool {
    match cell {
        Cell::Bool(_) | Cell::Int(_) => true,
        Cell::Float(v) => !v.is_nan(),
        Cell::Str(s) => {
            let stripped: String = s.chars().filter(|c| *c != '.' && *c != '-').collect();
            !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_digit())
        }
        Cell::Null => false,
    }
}

fn numeric_value(cell: &Cell) -> Option<f64> {
    match cell {
        Cell::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Cell::Str(_) if !is_numeric_like(cell) => None,
        other => other.as_f64(),
    }
}

/// Character-class shape of a value: letters -> `A`, digits -> `9`, anything else -> `X`.
pub fn value_shape(text: &str, collapse_runs: bool) -> String {
    let mut shape = String::with_capacity(text.len());
    for ch in text.chars() {
        let class = if ch.is_alphabetic() {
            'A'
        } else if ch.is_numeric() {
            '9'
        } else {
            'X'
        };
        if collapse_runs && shape.ends_with(class) {
            continue;
        }
        shape.push(class);
    }
    shape
}

impl<'a> SimplifiedValidator<'a> {
    pub fn new(config: &'a ValidationConfig, phone: &'a PhoneConfig) -> Self {
        Self { config, phone }
    }

    pub fn validate(&self, table: &Columns) -> Vec<RuleResult> {
        let phone_columns: HashSet<String> = PhoneCleaner::new(self.phone.clone())
            .detect_candidate_columns(table)
            .into_iter()
            .collect();
        debug!("Detected phone columns: {:?}", phone_columns);

        let mut results = Vec::with_capacity(table.names().len() * 5);
        for name in table.names() {
            let Some(cells) = table.get(name) else { continue };
            let present: Vec<&Cell> = cells.iter().filter(|c| !c.is_missing()).collect();

            results.push(self.completeness(name, cells.len(), present.len()));
            results.push(self.uniqueness(name, &present));
            results.push(self.validity(name, &present, phone_columns.contains(name)));
            results.push(self.consistency(name, &present));
            results.push(self.accuracy(name, &present));
        }
        results
    }

    fn completeness(&self, column: &str, rows: usize, present: usize) -> RuleResult {
        RuleResult::scored(
            column,
            "completeness_check",
            "No Missing Values",
            Dimension::Completeness,
            present,
            rows - present,
        )
    }

    fn uniqueness(&self, column: &str, present: &[&Cell]) -> RuleResult {
        let (rule, name) = ("uniqueness_check", "Unique Values Check");
        if present.is_empty() {
            return RuleResult::no_data(column, rule, name, Dimension::Uniqueness);
        }
        let distinct = present.iter().map(|c| c.to_string()).collect::<HashSet<_>>().len();
        RuleResult::scored(column, rule, name, Dimension::Uniqueness, distinct, present.len() - distinct)
    }

    fn validity(&self, column: &str, present: &[&Cell], is_phone: bool) -> RuleResult {
        let name = if is_phone { PHONE_RULE_NAME } else { "Data Type Validity" };
        let valid = if is_phone {
            present
                .iter()
                .filter(|c| matches!(c, Cell::Str(s) if validate_phone(s)))
                .count()
        } else {
            let numeric = present.iter().filter(|c| is_numeric_like(c)).count();
            let other = present.len() - numeric;
            if numeric > other {
                numeric
            } else {
                let max_len = self.config.max_string_length;
                let invalid = present
                    .iter()
                    .filter(|c| match c {
                        Cell::Str(s) => s.trim().is_empty() || s.chars().count() > max_len,
                        _ => false,
                    })
                    .count();
                present.len() - invalid
            }
        };
        RuleResult::scored(
            column,
            "validity_check",
            name,
            Dimension::Validity,
            valid,
            present.len() - valid,
        )
    }

    /// Share of values in the largest shape cluster.
    fn consistency(&self, column: &str, present: &[&Cell]) -> RuleResult {
        let mut counts: HashMap<String, usize> = HashMap::new();
        for cell in present {
            let shape = value_shape(&cell.to_string(), self.config.collapse_shape_runs);
            *counts.entry(shape).or_insert(0) += 1;
        }
        let largest = counts.values().copied().max().unwrap_or(0);
        RuleResult::scored(
            column,
            "consistency_check",
            "Pattern Consistency",
            Dimension::Consistency,
            largest,
            present.len() - largest,
        )
    }

    /// Numeric values within `outlier_sigma` standard deviations of the mean.
    /// Only numeric values are evaluated; a column without any scores every
    /// present value as accurate.
    fn accuracy(&self, column: &str, present: &[&Cell]) -> RuleResult {
        let numbers: Vec<f64> = present.iter().filter_map(|c| numeric_value(c)).collect();
        let evaluated = if numbers.is_empty() { present.len() } else { numbers.len() };
        let outliers = if numbers.len() > 1 {
            let n = numbers.len() as f64;
            let mean = numbers.iter().sum::<f64>() / n;
            let std = (numbers.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n).sqrt();
            let limit = self.config.outlier_sigma * std;
            numbers
                .iter()
                .filter(|x| std > 0.0 && (*x - mean).abs() > limit)
                .count()
        } else {
            0
        };
        RuleResult::scored(
            column,
            "accuracy_check",
            "Value Range Accuracy",
            Dimension::Accuracy,
            evaluated - outliers,
            outliers,
        )
    }
}
