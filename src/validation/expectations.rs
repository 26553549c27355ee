//! Full-mode rule bank: five expectations per dimension.
//!
//! Column-map expectations count unexpected values among the non-missing
//! ones and scale that share to the column's row count. Aggregate
//! expectations (most common value, mean, median) pass or fail as a whole.
//! An expectation that cannot be evaluated for a column's value types
//! returns an error and is recorded as "Rule Not Applied".

use super::{Dimension, RuleBackend, RuleResult};
use crate::error::{QaError, Result};
use crate::table::{Cell, CellKind};
use chrono::NaiveDate;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashMap;
use tracing::warn;

#[derive(Debug, Clone)]
pub enum Expectation {
    NotNull,
    MatchRegex(Regex),
    NotMatchRegex(Regex),
    InTypeList(Vec<CellKind>),
    OfType(CellKind),
    LengthBetween { min: usize, max: usize },
    Unique,
    /// `None` in the set stands for a missing value.
    MostCommonInSet(Vec<Option<String>>),
    MatchStrftime(String),
    Between { min: f64, max: f64 },
    InSet(Vec<String>),
    MeanBetween { min: f64, max: f64 },
    MedianBetween { min: f64, max: f64 },
}

/// One entry of the rule bank.
#[derive(Debug, Clone)]
pub struct RuleSpec {
    pub dimension: Dimension,
    pub rule_type: &'static str,
    pub friendly_name: &'static str,
    pub expectation: Expectation,
}

/// Outcome of a single expectation before scaling.
enum Outcome {
    /// Unexpected values among `of` evaluated values.
    Map { unexpected: usize, of: usize },
    /// Unexpected values among all rows (missing values included).
    AllRows { unexpected: usize },
    Aggregate(bool),
}

fn regex(pattern: &str) -> Regex {
    Regex::new(pattern).unwrap()
}

const TYPE_LIST: [CellKind; 3] = [CellKind::Int, CellKind::Float, CellKind::Str];

lazy_static! {
    static ref BLANK: Regex = regex(r"^\s*$");
    static ref TRIMMED: Regex = regex(r"^[^\s].*[^\s]$");
    static ref VALID_CHARS: Regex = regex(r"^[a-zA-Z0-9@.\s-]*$");
    static ref SPECIAL_CHARS: Regex = regex(r".*[!#$%^&*()].*");

    /// The bank, in evaluation order.
    pub static ref RULE_BANK: Vec<RuleSpec> = {
        use Dimension::*;
        use Expectation::*;
        let spec = |dimension, rule_type, friendly_name, expectation| RuleSpec {
            dimension,
            rule_type,
            friendly_name,
            expectation,
        };
        vec![
            spec(Completeness, "expect_column_values_to_not_be_null", "No Missing Values", NotNull),
            spec(Completeness, "expect_column_values_to_not_match_regex", "No Blank Strings", NotMatchRegex(BLANK.clone())),
            spec(Completeness, "expect_column_values_to_be_in_type_list", "Allowed Data Types", InTypeList(TYPE_LIST.to_vec())),
            spec(Completeness, "expect_column_value_lengths_to_be_between", "Field Length Within Limits", LengthBetween { min: 1, max: 255 }),
            spec(Completeness, "expect_column_values_to_be_of_type", "Expected Data Type", OfType(CellKind::Str)),

            spec(Uniqueness, "expect_column_values_to_be_unique", "Unique Values", Unique),
            spec(Uniqueness, "expect_column_most_common_value_to_be_in_set", "Most Frequent Value Check", MostCommonInSet(vec![None])),
            spec(Uniqueness, "expect_column_values_to_be_in_type_list", "Allowed Data Types", InTypeList(TYPE_LIST.to_vec())),
            spec(Uniqueness, "expect_column_values_to_be_of_type", "Expected Data Type", OfType(CellKind::Str)),
            spec(Uniqueness, "expect_column_values_to_match_regex", "Pattern Validity Check", MatchRegex(TRIMMED.clone())),

            spec(Validity, "expect_column_values_to_match_regex", "Valid Character Pattern", MatchRegex(VALID_CHARS.clone())),
            spec(Validity, "expect_column_values_to_not_match_regex", "No Disallowed Special Characters", NotMatchRegex(SPECIAL_CHARS.clone())),
            spec(Validity, "expect_column_value_lengths_to_be_between", "Field Length Within Limits", LengthBetween { min: 1, max: 255 }),
            spec(Validity, "expect_column_values_to_be_in_type_list", "Allowed Data Types", InTypeList(TYPE_LIST.to_vec())),
            spec(Validity, "expect_column_values_to_be_of_type", "Expected Data Type", OfType(CellKind::Str)),

            spec(Consistency, "expect_column_values_to_match_strftime_format", "Date Format Consistency", MatchStrftime("%Y-%m-%d".to_string())),
            spec(Consistency, "expect_column_values_to_be_in_type_list", "Allowed Data Types", InTypeList(TYPE_LIST.to_vec())),
            spec(Consistency, "expect_column_values_to_match_regex", "No Surrounding Whitespace", MatchRegex(TRIMMED.clone())),
            spec(Consistency, "expect_column_values_to_be_of_type", "Expected Data Type", OfType(CellKind::Str)),
            spec(Consistency, "expect_column_most_common_value_to_be_in_set", "Most Frequent Value Check", MostCommonInSet(vec![None])),

            spec(Accuracy, "expect_column_values_to_be_between", "Values Within Expected Range", Between { min: 0.0, max: 100.0 }),
            spec(Accuracy, "expect_column_values_to_be_in_set", "Expected Category Match", InSet(["A", "B", "C", "D"].iter().map(|s| s.to_string()).collect())),
            spec(Accuracy, "expect_column_values_to_be_of_type", "Expected Data Type", OfType(CellKind::Int)),
            spec(Accuracy, "expect_column_mean_to_be_between", "Mean Value Within Range", MeanBetween { min: 10.0, max: 90.0 }),
            spec(Accuracy, "expect_column_median_to_be_between", "Median Value Within Range", MedianBetween { min: 10.0, max: 90.0 }),
        ]
    };
}

fn not_applicable(message: impl Into<String>) -> QaError {
    QaError::RuleEvaluation(message.into())
}

/// Present values as text; fails if any present value is not text.
fn strings<'a>(present: &[&'a Cell], rule: &str) -> Result<Vec<&'a str>> {
    present
        .iter()
        .map(|c| match *c {
            Cell::Str(s) => Ok(s.as_str()),
            other => Err(not_applicable(format!(
                "{} needs string values, found {:?}",
                rule,
                other.kind().map(|k| k.as_str())
            ))),
        })
        .collect()
}

/// Present values as numbers; fails if any present value is not numeric.
fn numbers(present: &[&Cell], rule: &str) -> Result<Vec<f64>> {
    present
        .iter()
        .map(|c| match *c {
            Cell::Int(v) => Ok(*v as f64),
            Cell::Float(v) => Ok(*v),
            other => Err(not_applicable(format!(
                "{} needs numeric values, found {:?}",
                rule,
                other.kind().map(|k| k.as_str())
            ))),
        })
        .collect()
}

fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    Some(if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    })
}

impl Expectation {
    fn check(&self, cells: &[Cell], rule: &str) -> Result<Outcome> {
        let present: Vec<&Cell> = cells.iter().filter(|c| !c.is_missing()).collect();
        let of = present.len();
        let count = |pred: &dyn Fn(&Cell) -> bool| present.iter().filter(|c| pred(**c)).count();

        Ok(match self {
            Expectation::NotNull => Outcome::AllRows {
                unexpected: cells.len() - of,
            },
            Expectation::MatchRegex(re) => {
                let values = strings(&present, rule)?;
                Outcome::Map {
                    unexpected: values.iter().filter(|v| !re.is_match(v)).count(),
                    of,
                }
            }
            Expectation::NotMatchRegex(re) => {
                let values = strings(&present, rule)?;
                Outcome::Map {
                    unexpected: values.iter().filter(|v| re.is_match(v)).count(),
                    of,
                }
            }
            Expectation::InTypeList(kinds) => Outcome::Map {
                unexpected: count(&|c| c.kind().map_or(true, |k| !kinds.contains(&k))),
                of,
            },
            Expectation::OfType(kind) => Outcome::Map {
                unexpected: count(&|c| c.kind() != Some(*kind)),
                of,
            },
            Expectation::LengthBetween { min, max } => {
                let values = strings(&present, rule)?;
                Outcome::Map {
                    unexpected: values
                        .iter()
                        .filter(|v| {
                            let len = v.chars().count();
                            len < *min || len > *max
                        })
                        .count(),
                    of,
                }
            }
            Expectation::Unique => {
                let mut seen: HashMap<String, usize> = HashMap::new();
                for c in &present {
                    *seen.entry(c.to_string()).or_default() += 1;
                }
                Outcome::Map {
                    unexpected: seen.values().filter(|n| **n > 1).sum(),
                    of,
                }
            }
            Expectation::MostCommonInSet(set) => {
                let mut freq: HashMap<String, usize> = HashMap::new();
                for c in &present {
                    *freq.entry(c.to_string()).or_default() += 1;
                }
                let top = freq.values().copied().max().unwrap_or(0);
                // every value tied for most common must be in the set
                let modes: Vec<&String> = freq.iter().filter(|(_, n)| **n == top).map(|(v, _)| v).collect();
                let ok = modes.iter().all(|m| set.iter().any(|s| s.as_deref() == Some(m.as_str())));
                Outcome::Aggregate(ok)
            }
            Expectation::MatchStrftime(format) => {
                let values = strings(&present, rule)?;
                Outcome::Map {
                    unexpected: values
                        .iter()
                        .filter(|v| NaiveDate::parse_from_str(v, format).is_err())
                        .count(),
                    of,
                }
            }
            Expectation::Between { min, max } => {
                let values = numbers(&present, rule)?;
                Outcome::Map {
                    unexpected: values.iter().filter(|v| **v < *min || **v > *max).count(),
                    of,
                }
            }
            Expectation::InSet(set) => Outcome::Map {
                unexpected: count(&|c| !set.contains(&c.to_string())),
                of,
            },
            Expectation::MeanBetween { min, max } => {
                let values = numbers(&present, rule)?;
                if values.is_empty() {
                    return Err(not_applicable(format!("{} has no values to average", rule)));
                }
                let mean = values.iter().sum::<f64>() / values.len() as f64;
                Outcome::Aggregate(mean >= *min && mean <= *max)
            }
            Expectation::MedianBetween { min, max } => {
                let mut values = numbers(&present, rule)?;
                let median = median(&mut values)
                    .ok_or_else(|| not_applicable(format!("{} has no values", rule)))?;
                Outcome::Aggregate(median >= *min && median <= *max)
            }
        })
    }
}

/// Turn an outcome into `(passed, failed)` over `rows` rows.
fn scale(outcome: Outcome, rows: usize) -> (usize, usize) {
    let failed = match outcome {
        Outcome::AllRows { unexpected } => unexpected,
        Outcome::Map { of: 0, .. } => 0,
        Outcome::Map { unexpected, of } => ((unexpected as f64 / of as f64) * rows as f64).round() as usize,
        Outcome::Aggregate(true) => 0,
        Outcome::Aggregate(false) => rows,
    };
    let failed = failed.min(rows);
    (rows - failed, failed)
}

/// Built-in backend over `RULE_BANK`.
#[derive(Debug, Default)]
pub struct ExpectationBackend;

impl ExpectationBackend {
    pub fn new() -> Self {
        Self
    }

    pub fn evaluate(&self, spec: &RuleSpec, column: &str, cells: &[Cell]) -> RuleResult {
        match spec.expectation.check(cells, spec.rule_type) {
            Ok(outcome) => {
                let (passed, failed) = scale(outcome, cells.len());
                RuleResult::scored(column, spec.rule_type, spec.friendly_name, spec.dimension, passed, failed)
            }
            Err(e) => {
                warn!(
                    "Rule failed -> column: {}, rule: {}, dimension: {}, error: {}",
                    column, spec.rule_type, spec.dimension, e
                );
                RuleResult::not_applied(column, spec.rule_type, spec.friendly_name, spec.dimension, cells.len())
            }
        }
    }
}

impl RuleBackend for ExpectationBackend {
    fn name(&self) -> &'static str {
        "expectation"
    }

    fn evaluate_column(&self, column: &str, cells: &[Cell]) -> Vec<RuleResult> {
        RULE_BANK
            .iter()
            .map(|spec| self.evaluate(spec, column, cells))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::RuleStatus;

    fn result_for<'a>(results: &'a [RuleResult], dimension: Dimension, rule_type: &str) -> &'a RuleResult {
        results
            .iter()
            .find(|r| r.dimension == dimension && r.rule_type == rule_type)
            .unwrap()
    }

    #[test]
    fn test_bank_shape() {
        assert_eq!(RULE_BANK.len(), 25);
        for dimension in Dimension::ALL {
            assert_eq!(RULE_BANK.iter().filter(|s| s.dimension == dimension).count(), 5);
        }
    }

    #[test]
    fn test_string_column() {
        let cells = vec![
            Cell::str("alice"),
            Cell::str("bob"),
            Cell::str("bob"),
            Cell::str(" "),
            Cell::Null,
        ];
        let results = ExpectationBackend::new().evaluate_column("name", &cells);
        assert_eq!(results.len(), 25);

        let not_null = result_for(&results, Dimension::Completeness, "expect_column_values_to_not_be_null");
        assert_eq!((not_null.passed_count, not_null.failed_count), (4, 1));

        // 1 blank of 4 present -> 25% of 5 rows
        let blank = result_for(&results, Dimension::Completeness, "expect_column_values_to_not_match_regex");
        assert_eq!(blank.failed_count, 1);

        // both "bob"s are unexpected: 2 of 4 -> 50% of 5 rows, rounded
        let unique = result_for(&results, Dimension::Uniqueness, "expect_column_values_to_be_unique");
        assert_eq!(unique.failed_count, 3);

        // most common value is "bob", not missing
        let mode = result_for(&results, Dimension::Uniqueness, "expect_column_most_common_value_to_be_in_set");
        assert_eq!((mode.passed_count, mode.failed_count), (0, 5));

        let mean = result_for(&results, Dimension::Accuracy, "expect_column_mean_to_be_between");
        assert_eq!(mean.status, RuleStatus::NotApplied);
        assert_eq!(mean.failed_score, 100.0);
    }

    #[test]
    fn test_numeric_column() {
        let cells = vec![Cell::Int(20), Cell::Int(40), Cell::Int(400), Cell::Int(60)];
        let results = ExpectationBackend::new().evaluate_column("score", &cells);

        let between = result_for(&results, Dimension::Accuracy, "expect_column_values_to_be_between");
        assert_eq!((between.passed_count, between.failed_count), (3, 1));

        let mean = result_for(&results, Dimension::Accuracy, "expect_column_mean_to_be_between");
        assert_eq!(mean.status, RuleStatus::Applied);
        assert_eq!(mean.failed_count, 4);

        let median = result_for(&results, Dimension::Accuracy, "expect_column_median_to_be_between");
        assert_eq!(median.passed_score, 100.0);

        let int_type = result_for(&results, Dimension::Accuracy, "expect_column_values_to_be_of_type");
        assert_eq!(int_type.failed_count, 0);

        // regex rules do not apply to integers
        let pattern = result_for(&results, Dimension::Validity, "expect_column_values_to_match_regex");
        assert_eq!(pattern.status, RuleStatus::NotApplied);
    }

    #[test]
    fn test_date_format() {
        let cells = vec![Cell::str("2024-01-31"), Cell::str("31/01/2024")];
        let results = ExpectationBackend::new().evaluate_column("d", &cells);
        let dates = result_for(&results, Dimension::Consistency, "expect_column_values_to_match_strftime_format");
        assert_eq!((dates.passed_count, dates.failed_count), (1, 1));
    }
}
