//! Column cleaners run over the source table before transformation.

use crate::config::PhoneConfig;
use crate::error::Result;
use crate::table::{Cell, Columns};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use tracing::{info, warn};

lazy_static! {
    static ref EXTENSION: Regex = Regex::new(r"(?i)\s*(x|ext|extension)\.?\s*[0-9]+").unwrap();
    static ref NON_DIGIT: Regex = Regex::new(r"[^0-9]").unwrap();
    static ref CANONICAL_PHONE: Regex = Regex::new(r"^\+1-[0-9]{3}-[0-9]{3}-[0-9]{4}$").unwrap();
    static ref PHONE_SHAPES: Vec<Regex> = [
        r"\([0-9]{3}\)\s*[0-9]{3}[-\s]?[0-9]{4}",
        r"[0-9]{3}[-\s][0-9]{3}[-\s][0-9]{4}",
        r"\+?1?[-\s]?[0-9]{10}",
        r"[0-9]{10}",
        r"[0-9]{3}\.[0-9]{3}\.[0-9]{4}",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect();
}

/// Digit counts a phone number can have before formatting.
const PHONE_DIGIT_COUNTS: [usize; 3] = [7, 10, 11];

/// Outcome of cleaning one column.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CleanReport {
    pub column: String,
    /// Non-missing values inspected.
    pub total: usize,
    /// Values in canonical form after cleaning.
    pub valid: usize,
    /// First few values left for manual review.
    pub needs_review: Vec<String>,
}

/// A specialised normaliser for one kind of column.
pub trait ColumnCleaner {
    fn name(&self) -> &'static str;

    /// Columns this cleaner should run on.
    fn detect_candidate_columns(&self, table: &Columns) -> Vec<String>;

    fn clean_value(&self, cell: &Cell) -> Cell;

    fn is_valid(&self, cell: &Cell) -> bool;

    /// Clean `columns` in place.
    fn normalize(&self, table: &mut Columns, columns: &[String]) -> Result<Vec<CleanReport>> {
        let mut reports = Vec::with_capacity(columns.len());
        for name in columns {
            let Some(cells) = table.get(name) else {
                warn!("{} cleaner: column '{}' not in table", self.name(), name);
                continue;
            };
            let cleaned: Vec<Cell> = cells.iter().map(|c| self.clean_value(c)).collect();

            let present: Vec<&Cell> = cleaned.iter().filter(|c| !c.is_missing()).collect();
            let valid = present.iter().filter(|c| self.is_valid(c)).count();
            let needs_review = present
                .iter()
                .filter(|c| !self.is_valid(c))
                .take(5)
                .map(|c| c.to_string())
                .collect::<Vec<_>>();

            info!(
                "{} cleaner: '{}' {}/{} values in standard format",
                self.name(),
                name,
                valid,
                present.len()
            );
            if !needs_review.is_empty() {
                warn!("Some values in '{}' need manual review: {:?}", name, needs_review);
            }

            reports.push(CleanReport {
                column: name.clone(),
                total: present.len(),
                valid,
                needs_review,
            });
            table.insert(name, cleaned)?;
        }
        Ok(reports)
    }

    /// Detect, then clean.
    fn apply(&self, table: &mut Columns) -> Result<Vec<CleanReport>> {
        let columns = self.detect_candidate_columns(table);
        if !columns.is_empty() {
            info!("Detected {} columns: {:?}", self.name(), columns);
        }
        self.normalize(table, &columns)
    }
}

fn digits_of(text: &str) -> String {
    NON_DIGIT.replace_all(text, "").into_owned()
}

/// Reformat a phone number as `+1-AAA-BBB-CCCC`. `None` for digit counts
/// other than 7, 10, or 11 with a leading `1`.
pub fn normalize_phone(text: &str, placeholder_area_code: &str) -> Option<String> {
    let without_ext = EXTENSION.replace_all(text.trim(), "");
    let digits = digits_of(&without_ext);
    match digits.len() {
        10 => Some(format!("+1-{}-{}-{}", &digits[..3], &digits[3..6], &digits[6..])),
        11 if digits.starts_with('1') => {
            Some(format!("+1-{}-{}-{}", &digits[1..4], &digits[4..7], &digits[7..]))
        }
        7 => Some(format!(
            "+1-{}-{}-{}",
            placeholder_area_code,
            &digits[..3],
            &digits[3..]
        )),
        _ => None,
    }
}

pub fn validate_phone(text: &str) -> bool {
    CANONICAL_PHONE.is_match(text)
}

/// Does `text` look like a phone number of any common shape?
pub fn looks_like_phone(text: &str) -> bool {
    PHONE_DIGIT_COUNTS.contains(&digits_of(text).len())
        && PHONE_SHAPES.iter().any(|p| p.is_match(text))
}

pub struct PhoneCleaner {
    config: PhoneConfig,
}

impl Default for PhoneCleaner {
    fn default() -> Self {
        Self::new(PhoneConfig::default())
    }
}

impl PhoneCleaner {
    pub fn new(config: PhoneConfig) -> Self {
        Self { config }
    }

    fn header_matches(&self, name: &str) -> bool {
        let lowered = name.to_lowercase();
        self.config.keywords.iter().any(|k| lowered.contains(k.as_str()))
    }

    /// Only text columns are sampled.
    fn values_match(&self, cells: &[Cell]) -> bool {
        let sample: Vec<&Cell> = cells
            .iter()
            .filter(|c| !c.is_missing())
            .take(self.config.sample_size)
            .collect();
        if sample.is_empty() || !sample.iter().all(|c| matches!(c, Cell::Str(_))) {
            return false;
        }
        let hits = sample
            .iter()
            .filter(|c| looks_like_phone(&c.to_string()))
            .count();
        hits as f64 / sample.len() as f64 >= self.config.min_match_ratio
    }
}

impl ColumnCleaner for PhoneCleaner {
    fn name(&self) -> &'static str {
        "phone"
    }

    fn detect_candidate_columns(&self, table: &Columns) -> Vec<String> {
        table
            .names()
            .iter()
            .filter(|name| {
                self.header_matches(name)
                    || table.get(name).is_some_and(|cells| self.values_match(cells))
            })
            .cloned()
            .collect()
    }

    /// Unformattable values are passed through unchanged.
    fn clean_value(&self, cell: &Cell) -> Cell {
        let text = match cell {
            _ if cell.is_missing() => return Cell::Null,
            Cell::Str(s) if s.is_empty() => return cell.clone(),
            Cell::Float(v) if v.fract() == 0.0 => format!("{}", *v as i64),
            other => other.to_string(),
        };
        match normalize_phone(&text, &self.config.placeholder_area_code) {
            Some(formatted) => Cell::Str(formatted),
            None => cell.clone(),
        }
    }

    fn is_valid(&self, cell: &Cell) -> bool {
        matches!(cell, Cell::Str(s) if validate_phone(s))
    }
}
