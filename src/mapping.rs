//! Mapping specification sheets.
//!
//! A mapping sheet is read as plain strings: its header names are free-form
//! and only become meaningful once the role resolver has run over them.

use crate::error::{QaError, Result};
use crate::roles::{Role, RoleMap};
use csv::ReaderBuilder;
use serde::Serialize;
use std::io::Read;
use std::path::Path;
use tracing::{debug, warn};

/// Cell texts that mean "no rule" in any optional mapping column.
const NO_RULE_SENTINELS: [&str; 5] = ["none", "n/a", "", "null", "nan"];

/// True when `text` is empty or one of the "no rule" sentinels (case-insensitive).
pub fn is_no_rule(text: &str) -> bool {
    let lowered = text.trim().to_lowercase();
    NO_RULE_SENTINELS.contains(&lowered.as_str())
}

/// `Some(trimmed text)` unless the cell is a "no rule" sentinel.
fn rule_text(text: Option<&str>) -> Option<String> {
    text.filter(|t| !is_no_rule(t)).map(|t| t.trim().to_string())
}

/// Raw mapping specification: ordered headers and string rows.
#[derive(Debug, Clone, PartialEq)]
pub struct MappingSheet {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl MappingSheet {
    pub fn new(headers: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        Self { headers, rows }
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|e| {
            QaError::Table(format!("Failed to open mapping file {}: {}", path.display(), e))
        })?;
        Self::from_reader(file)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut rdr = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(reader);

        let headers = rdr
            .headers()?
            .iter()
            .map(|h| h.trim().to_string())
            .collect::<Vec<_>>();

        let mut rows = Vec::new();
        for record in rdr.records() {
            let record = record?;
            let row = (0..headers.len())
                .map(|idx| record.get(idx).unwrap_or("").to_string())
                .collect::<Vec<_>>();
            if row.iter().all(|cell| cell.trim().is_empty()) {
                continue;
            }
            rows.push(row);
        }

        debug!("Read mapping sheet with {} headers and {} rows", headers.len(), rows.len());
        Ok(Self { headers, rows })
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Value of `role`'s column in row `idx`, if the role was resolved.
    pub fn value(&self, idx: usize, roles: &RoleMap, role: Role) -> Option<&str> {
        let column = roles.get(role)?;
        let col_idx = self.headers.iter().position(|h| h == column)?;
        self.rows.get(idx)?.get(col_idx).map(|s| s.as_str())
    }

    /// Typed mapping rows in declaration order. Rows without a target are dropped.
    pub fn mapping_rows(&self, roles: &RoleMap) -> Result<Vec<MappingRow>> {
        roles.require(Role::Source)?;
        roles.require(Role::Target)?;

        let mut out = Vec::with_capacity(self.rows.len());
        for idx in 0..self.rows.len() {
            let target = self
                .value(idx, roles, Role::Target)
                .map(str::trim)
                .filter(|t| !t.is_empty() && !is_no_rule(t));
            let Some(target) = target else {
                warn!("Mapping row {} has no target field; skipping", idx + 1);
                continue;
            };

            let flag = |role: Role| {
                self.value(idx, roles, role)
                    .map(|v| v.trim().eq_ignore_ascii_case("yes"))
                    .unwrap_or(false)
            };

            out.push(MappingRow {
                line: idx + 1,
                source_ref: self
                    .value(idx, roles, Role::Source)
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string),
                target_ref: target.to_string(),
                transformation_expr: rule_text(self.value(idx, roles, Role::Transformation)),
                conditional_rule: rule_text(self.value(idx, roles, Role::ConditionalMapping)),
                default_value: rule_text(self.value(idx, roles, Role::DefaultValue)),
                required: flag(Role::Required),
                direct_map: flag(Role::DirectMap),
            });
        }
        Ok(out)
    }
}

/// One declared field-level rule.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MappingRow {
    /// 1-based position in the mapping sheet.
    pub line: usize,
    pub source_ref: Option<String>,
    pub target_ref: String,
    pub transformation_expr: Option<String>,
    pub conditional_rule: Option<String>,
    pub default_value: Option<String>,
    pub required: bool,
    pub direct_map: bool,
}

impl MappingRow {
    pub fn new(source_ref: &str, target_ref: &str) -> Self {
        Self {
            line: 0,
            source_ref: Some(source_ref.to_string()).filter(|s| !s.is_empty()),
            target_ref: target_ref.to_string(),
            transformation_expr: None,
            conditional_rule: None,
            default_value: None,
            required: false,
            direct_map: false,
        }
    }

    pub fn with_expression(mut self, expr: &str) -> Self {
        self.transformation_expr = rule_text(Some(expr));
        self
    }

    pub fn with_conditional(mut self, rule: &str) -> Self {
        self.conditional_rule = rule_text(Some(rule));
        self
    }

    pub fn with_default(mut self, value: &str) -> Self {
        self.default_value = rule_text(Some(value));
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roles::RoleResolver;

    const SHEET: &str = "\
Source Field,Target Field,Transformation Logic,Required,Default Value,Conditional Rule
first_name,FirstName,,yes,,
dob,Age,years_since(df['dob']),no,N/A,
gender,Gender,none,,Unknown,If gender == 'M' then 'Male' else 'Female'
,,,,,
legacy_code,,,,,
";

    #[test]
    fn test_sentinels() {
        for text in ["", "None", "N/A", "null", " NaN "] {
            assert!(is_no_rule(text), "{text:?} should be a sentinel");
        }
        assert!(!is_no_rule("0"));
        assert!(!is_no_rule("Unknown"));
    }

    #[test]
    fn test_rows_are_typed_and_cleaned() {
        let sheet = MappingSheet::from_reader(SHEET.as_bytes()).unwrap();
        assert_eq!(sheet.len(), 4);

        let roles = RoleResolver::default().resolve(sheet.headers()).unwrap();
        let rows = sheet.mapping_rows(&roles).unwrap();

        // blank row skipped at read time, target-less row dropped here
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].target_ref, "FirstName");
        assert!(rows[0].required);
        assert_eq!(rows[1].transformation_expr.as_deref(), Some("years_since(df['dob'])"));
        assert_eq!(rows[1].default_value, None);
        assert_eq!(rows[2].transformation_expr, None);
        assert_eq!(rows[2].default_value.as_deref(), Some("Unknown"));
        assert_eq!(
            rows[2].conditional_rule.as_deref(),
            Some("If gender == 'M' then 'Male' else 'Female'")
        );
        assert_eq!(rows[2].line, 3);
    }
}
