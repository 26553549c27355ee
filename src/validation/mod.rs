//! Dimension-based validation and scoring.
//!
//! Every column of the derived table is scored along five dimensions. Full
//! mode runs the rule bank of a `RuleBackend` (25 rules per column); without
//! a backend the engine downgrades to simplified mode (one rule per dimension)
//! and says so on the summary.

pub mod expectations;
pub mod simplified;
pub mod summary;

use crate::config::{ModePreference, PhoneConfig, ValidationConfig};
use crate::error::Result;
use crate::table::{Cell, Columns};
use polars::prelude::DataFrame;
use serde::Serialize;
use std::fmt;
use tracing::{info, warn};
use uuid::Uuid;

pub use expectations::{Expectation, ExpectationBackend, RuleSpec};
pub use simplified::SimplifiedValidator;
pub use summary::{dimension_scores, kpis, DimensionScore, Kpis};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Completeness,
    Uniqueness,
    Validity,
    Consistency,
    Accuracy,
}

impl Dimension {
    pub const ALL: [Dimension; 5] = [
        Dimension::Completeness,
        Dimension::Uniqueness,
        Dimension::Validity,
        Dimension::Consistency,
        Dimension::Accuracy,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::Completeness => "completeness",
            Dimension::Uniqueness => "uniqueness",
            Dimension::Validity => "validity",
            Dimension::Consistency => "consistency",
            Dimension::Accuracy => "accuracy",
        }
    }

    /// Score reported when nothing was evaluated. An empty table is not complete.
    pub fn empty_score(&self) -> f64 {
        match self {
            Dimension::Completeness => 0.0,
            _ => 100.0,
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RuleStatus {
    #[serde(rename = "Rule Applied")]
    Applied,
    #[serde(rename = "Rule Not Applied")]
    NotApplied,
    #[serde(rename = "No Data to Evaluate")]
    NoData,
}

impl RuleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleStatus::Applied => "Rule Applied",
            RuleStatus::NotApplied => "Rule Not Applied",
            RuleStatus::NoData => "No Data to Evaluate",
        }
    }
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// One scored outcome of one rule on one column.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleResult {
    pub column_name: String,
    pub rule_type: String,
    pub friendly_name: String,
    pub dimension: Dimension,
    pub passed_count: usize,
    pub failed_count: usize,
    pub total_evaluated: usize,
    pub passed_score: f64,
    pub failed_score: f64,
    pub status: RuleStatus,
}

impl RuleResult {
    /// Applied rule; `total_evaluated` is `passed + failed`.
    pub fn scored(
        column: &str,
        rule_type: &str,
        friendly_name: &str,
        dimension: Dimension,
        passed: usize,
        failed: usize,
    ) -> Self {
        let total = passed + failed;
        let passed_score = if total > 0 {
            round2(100.0 * passed as f64 / total as f64)
        } else {
            dimension.empty_score()
        };
        Self {
            column_name: column.to_string(),
            rule_type: rule_type.to_string(),
            friendly_name: friendly_name.to_string(),
            dimension,
            passed_count: passed,
            failed_count: failed,
            total_evaluated: total,
            passed_score,
            failed_score: round2(100.0 - passed_score),
            status: RuleStatus::Applied,
        }
    }

    /// Degraded result for a rule that could not be evaluated: every row counts as failed.
    pub fn not_applied(column: &str, rule_type: &str, friendly_name: &str, dimension: Dimension, rows: usize) -> Self {
        Self {
            column_name: column.to_string(),
            rule_type: rule_type.to_string(),
            friendly_name: friendly_name.to_string(),
            dimension,
            passed_count: 0,
            failed_count: rows,
            total_evaluated: rows,
            passed_score: 0.0,
            failed_score: 100.0,
            status: RuleStatus::NotApplied,
        }
    }

    pub fn no_data(column: &str, rule_type: &str, friendly_name: &str, dimension: Dimension) -> Self {
        Self {
            status: RuleStatus::NoData,
            passed_score: 100.0,
            failed_score: 0.0,
            ..Self::scored(column, rule_type, friendly_name, dimension, 0, 0)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMode {
    Full,
    Simplified,
}

impl ValidationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationMode::Full => "full",
            ValidationMode::Simplified => "simplified",
        }
    }
}

/// All rule results of one validation run.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationSummary {
    pub run_id: Uuid,
    pub mode: ValidationMode,
    /// Full mode was wanted but no backend was available.
    pub downgraded: bool,
    pub results: Vec<RuleResult>,
}

impl ValidationSummary {
    pub fn for_column<'a>(&'a self, column: &'a str) -> impl Iterator<Item = &'a RuleResult> + 'a {
        self.results.iter().filter(move |r| r.column_name == column)
    }

    pub fn dimension_scores(&self) -> Vec<DimensionScore> {
        dimension_scores(&self.results)
    }

    pub fn kpis(&self) -> Kpis {
        kpis(&self.results)
    }
}

/// A declarative per-column rule evaluator.
pub trait RuleBackend {
    fn name(&self) -> &'static str;

    /// All rules of the bank against one column, in bank order.
    fn evaluate_column(&self, column: &str, cells: &[Cell]) -> Vec<RuleResult>;
}

pub struct ValidationEngine {
    config: ValidationConfig,
    phone: PhoneConfig,
    backend: Option<Box<dyn RuleBackend>>,
}

impl Default for ValidationEngine {
    fn default() -> Self {
        Self::new(ValidationConfig::default(), PhoneConfig::default())
    }
}

impl ValidationEngine {
    /// Engine backed by the built-in expectation bank.
    pub fn new(config: ValidationConfig, phone: PhoneConfig) -> Self {
        Self {
            config,
            phone,
            backend: Some(Box::new(ExpectationBackend::new())),
        }
    }

    pub fn with_backend(mut self, backend: Option<Box<dyn RuleBackend>>) -> Self {
        self.backend = backend;
        self
    }

    /// Resolve the configured preference against backend availability.
    pub fn mode(&self) -> (ValidationMode, bool) {
        match (self.config.mode, self.backend.is_some()) {
            (ModePreference::Simplified, _) => (ValidationMode::Simplified, false),
            (_, true) => (ValidationMode::Full, false),
            (ModePreference::Auto, false) | (ModePreference::Full, false) => (ValidationMode::Simplified, true),
        }
    }

    pub fn validate(&self, table: &Columns) -> ValidationSummary {
        let (mode, downgraded) = self.mode();
        if downgraded {
            warn!("No rule backend available; downgrading to simplified validation");
        }

        let results = match (mode, &self.backend) {
            (ValidationMode::Full, Some(backend)) => {
                info!("Running full validation with the {} backend", backend.name());
                table
                    .names()
                    .iter()
                    .filter_map(|name| table.get(name).map(|cells| (name, cells)))
                    .flat_map(|(name, cells)| backend.evaluate_column(name, cells))
                    .collect()
            }
            _ => {
                info!("Running simplified validation");
                SimplifiedValidator::new(&self.config, &self.phone).validate(table)
            }
        };

        info!("Validation produced {} rule results", results.len());
        ValidationSummary {
            run_id: Uuid::new_v4(),
            mode,
            downgraded,
            results,
        }
    }

    pub fn validate_frame(&self, df: &DataFrame) -> Result<ValidationSummary> {
        Ok(self.validate(&Columns::from_frame(df)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> Columns {
        let mut cells = vec![Cell::str("x"); 90];
        cells.extend(vec![Cell::Null; 10]);
        let mut t = Columns::with_height(100);
        t.insert("name", cells).unwrap();
        t
    }

    #[test]
    fn test_score_invariants() {
        let r = RuleResult::scored("c", "r", "R", Dimension::Validity, 2, 1);
        assert_eq!(r.total_evaluated, 3);
        assert_eq!(r.passed_score, 66.67);
        assert_eq!(r.failed_score, 33.33);

        let empty = RuleResult::scored("c", "r", "R", Dimension::Completeness, 0, 0);
        assert_eq!(empty.passed_score, 0.0);
        assert_eq!(empty.failed_score, 100.0);

        let na = RuleResult::not_applied("c", "r", "R", Dimension::Accuracy, 7);
        assert_eq!((na.passed_count, na.failed_count, na.total_evaluated), (0, 7, 7));
        assert_eq!(na.status.as_str(), "Rule Not Applied");

        let nd = RuleResult::no_data("c", "r", "R", Dimension::Uniqueness);
        assert_eq!((nd.passed_score, nd.failed_score), (100.0, 0.0));
    }

    #[test]
    fn test_mode_selection_and_downgrade() {
        let full = ValidationEngine::default();
        assert_eq!(full.mode(), (ValidationMode::Full, false));
        let summary = full.validate(&table());
        assert_eq!(summary.results.len(), 25);

        let downgraded = ValidationEngine::default().with_backend(None);
        let summary = downgraded.validate(&table());
        assert_eq!(summary.mode, ValidationMode::Simplified);
        assert!(summary.downgraded);
        assert_eq!(summary.results.len(), 5);

        let config = ValidationConfig {
            mode: ModePreference::Simplified,
            ..ValidationConfig::default()
        };
        let chosen = ValidationEngine::new(config, PhoneConfig::default());
        assert_eq!(chosen.mode(), (ValidationMode::Simplified, false));
    }

    #[test]
    fn test_completeness_ninety_of_hundred_in_both_modes() {
        for engine in [ValidationEngine::default(), ValidationEngine::default().with_backend(None)] {
            let summary = engine.validate(&table());
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
    fn test_every_result_balances() {
        let summary = ValidationEngine::default().validate(&table());
        for r in &summary.results {
            assert_eq!(r.passed_count + r.failed_count, r.total_evaluated, "{}", r.rule_type);
            assert!((r.passed_score + r.failed_score - 100.0).abs() < 0.011, "{}", r.rule_type);
        }
    }
}
