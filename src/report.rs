//! Run summaries and the CSV artifacts written at the end of a run.

use crate::error::Result;
use crate::expression::Expression;
use crate::mapping::{is_no_rule, MappingSheet};
use crate::roles::{Role, RoleMap};
use crate::table::{write_csv, Columns};
use crate::validation::{round2, ValidationSummary};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;

/// Record-level outcome of a migration.
///
/// `failed` counts rows that came out entirely empty, `partial` rows with
/// some but not all values missing. `any_missing` is the union of both.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordSummary {
    pub total_records: usize,
    pub passed: usize,
    pub failed: usize,
    pub partial: usize,
    pub any_missing: usize,
    pub success_rate: f64,
    pub fail_rate: f64,
    pub partial_rate: f64,
}

fn rate(count: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        round2(100.0 * count as f64 / total as f64)
    }
}

impl RecordSummary {
    pub fn from_table(table: &Columns) -> Self {
        let (mut passed, mut failed, mut partial) = (0, 0, 0);
        for idx in 0..table.height() {
            let row = table.row(idx);
            let missing = row.iter().filter(|c| c.is_missing()).count();
            if missing == 0 {
                passed += 1;
            } else if missing == row.len() {
                failed += 1;
            } else {
                partial += 1;
            }
        }
        let total = table.height();
        Self {
            total_records: total,
            passed,
            failed,
            partial,
            any_missing: failed + partial,
            success_rate: rate(passed, total),
            fail_rate: rate(failed, total),
            partial_rate: rate(partial, total),
        }
    }
}

/// Rows holding at least one missing value.
pub fn failed_rows(table: &Columns) -> Result<Columns> {
    let indices: Vec<usize> = (0..table.height())
        .filter(|idx| table.row(*idx).iter().any(|c| c.is_missing()))
        .collect();
    table.select_rows(&indices)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MappingStatus {
    #[serde(rename = "Fully Mapped")]
    FullyMapped,
    #[serde(rename = "Column Mapped Correctly")]
    ColumnMapped,
    #[serde(rename = "Mapping Failed")]
    MappingFailed,
    #[serde(rename = "Not Mapped")]
    NotMapped,
}

impl MappingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MappingStatus::FullyMapped => "Fully Mapped",
            MappingStatus::ColumnMapped => "Column Mapped Correctly",
            MappingStatus::MappingFailed => "Mapping Failed",
            MappingStatus::NotMapped => "Not Mapped",
        }
    }

    /// Classify one mapping row by its target and transformation text.
    pub fn classify(target: Option<&str>, transformation: Option<&str>) -> Self {
        let has_target = target.is_some_and(|t| !t.trim().is_empty());
        if !has_target {
            return MappingStatus::NotMapped;
        }
        match transformation.filter(|t| !is_no_rule(t)) {
            None => MappingStatus::ColumnMapped,
            Some(text) => match Expression::parse(text.trim()) {
                Ok(_) => MappingStatus::FullyMapped,
                Err(_) => MappingStatus::MappingFailed,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MappingStatusRow {
    pub line: usize,
    pub source: String,
    pub target: String,
    pub status: MappingStatus,
}

/// Status of every row of the mapping sheet, including rows without a target.
pub fn mapping_status(sheet: &MappingSheet, roles: &RoleMap) -> Vec<MappingStatusRow> {
    (0..sheet.len())
        .map(|idx| {
            let target = sheet.value(idx, roles, Role::Target);
            MappingStatusRow {
                line: idx + 1,
                source: sheet.value(idx, roles, Role::Source).unwrap_or("").trim().to_string(),
                target: target.unwrap_or("").trim().to_string(),
                status: MappingStatus::classify(target, sheet.value(idx, roles, Role::Transformation)),
            }
        })
        .collect()
}

#[derive(Debug, Serialize)]
struct RuleRow<'a> {
    column_name: &'a str,
    rule_type: &'a str,
    friendly_rule_name: &'a str,
    dimension: &'a str,
    status: &'a str,
    passed_count: usize,
    failed_count: usize,
    total_evaluated: usize,
    passed_score: f64,
    failed_score: f64,
}

#[derive(Debug, Serialize)]
struct OverallRow<'a> {
    run_id: String,
    mode: &'a str,
    downgraded: bool,
    dimension: &'a str,
    rules: usize,
    mean_passed_score: f64,
}

fn write_rows<T: Serialize>(path: &Path, rows: impl IntoIterator<Item = T>) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

/// Writes the run artifacts into one directory.
pub struct ArtifactWriter {
    dir: PathBuf,
}

impl ArtifactWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn path(&self, file: &str) -> PathBuf {
        self.dir.join(file)
    }

    pub fn mapped_output(&self, derived: &Columns) -> Result<PathBuf> {
        let path = self.path("mapped_output.csv");
        write_csv(&mut derived.to_frame(derived.names())?, &path)?;
        Ok(path)
    }

    pub fn failed_rows(&self, derived: &Columns) -> Result<PathBuf> {
        let path = self.path("failed_rows.csv");
        let failed = failed_rows(derived)?;
        write_csv(&mut failed.into_frame()?, &path)?;
        Ok(path)
    }

    pub fn migration_summary(&self, summary: &RecordSummary) -> Result<PathBuf> {
        let path = self.path("migration_summary.csv");
        write_rows(&path, [summary])?;
        Ok(path)
    }

    pub fn mapping_status(&self, rows: &[MappingStatusRow]) -> Result<PathBuf> {
        let path = self.path("mapping_status.csv");
        write_rows(&path, rows)?;
        Ok(path)
    }

    pub fn validation_rules(&self, summary: &ValidationSummary) -> Result<PathBuf> {
        let path = self.path("validation_rules_summary.csv");
        write_rows(
            &path,
            summary.results.iter().map(|r| RuleRow {
                column_name: &r.column_name,
                rule_type: &r.rule_type,
                friendly_rule_name: &r.friendly_name,
                dimension: r.dimension.as_str(),
                status: r.status.as_str(),
                passed_count: r.passed_count,
                failed_count: r.failed_count,
                total_evaluated: r.total_evaluated,
                passed_score: r.passed_score,
                failed_score: r.failed_score,
            }),
        )?;
        Ok(path)
    }

    pub fn overall_validation(&self, summary: &ValidationSummary) -> Result<PathBuf> {
        let path = self.path("overall_validation_summary.csv");
        let mode = summary.mode.as_str();
        let scores = summary.dimension_scores();
        write_rows(
            &path,
            scores.iter().map(|s| OverallRow {
                run_id: summary.run_id.to_string(),
                mode,
                downgraded: summary.downgraded,
                dimension: s.dimension.as_str(),
                rules: s.rules,
                mean_passed_score: s.mean_passed_score,
            }),
        )?;
        Ok(path)
    }

    /// Every artifact of a finished run.
    pub fn write_all(
        &self,
        derived: &Columns,
        records: &RecordSummary,
        mapping: &[MappingStatusRow],
        validation: &ValidationSummary,
    ) -> Result<Vec<PathBuf>> {
        let written = vec![
            self.mapped_output(derived)?,
            self.failed_rows(derived)?,
            self.migration_summary(records)?,
            self.mapping_status(mapping)?,
            self.validation_rules(validation)?,
            self.overall_validation(validation)?,
        ];
        info!("Wrote {} artifacts to {}", written.len(), self.dir.display());
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roles::RoleResolver;
    use crate::table::Cell;
    use crate::validation::ValidationEngine;
    use tempfile::TempDir;

    fn derived() -> Columns {
        let mut t = Columns::with_height(4);
        t.insert("a", vec![Cell::Int(1), Cell::Null, Cell::Null, Cell::Int(4)]).unwrap();
        t.insert("b", vec![Cell::str("x"), Cell::str("y"), Cell::Null, Cell::str("z")]).unwrap();
        t
    }

    #[test]
    fn test_record_summary_policies() {
        let summary = RecordSummary::from_table(&derived());
        assert_eq!(summary.total_records, 4);
        assert_eq!((summary.passed, summary.partial, summary.failed), (2, 1, 1));
        assert_eq!(summary.any_missing, 2);
        assert_eq!(summary.success_rate, 50.0);
        assert_eq!(summary.partial_rate, 25.0);

        let failed = failed_rows(&derived()).unwrap();
        assert_eq!(failed.height(), 2);
        assert_eq!(failed.get("b").unwrap()[0], Cell::str("y"));
    }

    #[test]
    fn test_mapping_status() {
        assert_eq!(MappingStatus::classify(None, None), MappingStatus::NotMapped);
        assert_eq!(MappingStatus::classify(Some(" "), Some("x")), MappingStatus::NotMapped);
        assert_eq!(MappingStatus::classify(Some("Age"), Some("none")), MappingStatus::ColumnMapped);
        assert_eq!(
            MappingStatus::classify(Some("Age"), Some("years_since(df['dob'])")),
            MappingStatus::FullyMapped
        );
        assert_eq!(
            MappingStatus::classify(Some("Age"), Some("years_since(df['dob'")),
            MappingStatus::MappingFailed
        );

        let sheet = MappingSheet::from_reader(
            "Source,Target,Transformation\ndob,Age,years_since(df['dob'])\nlegacy,,\n".as_bytes(),
        )
        .unwrap();
        let roles = RoleResolver::default().resolve(sheet.headers()).unwrap();
        let rows = mapping_status(&sheet, &roles);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].status, MappingStatus::FullyMapped);
        assert_eq!(rows[1].status, MappingStatus::NotMapped);
    }

    #[test]
    fn test_write_all_artifacts() {
        let temp_dir = TempDir::new().unwrap();
        let writer = ArtifactWriter::new(temp_dir.path().join("artifacts")).unwrap();
        let table = derived();
        let validation = ValidationEngine::default().with_backend(None).validate(&table);

        let written = writer
            .write_all(&table, &RecordSummary::from_table(&table), &[], &validation)
            .unwrap();
        assert_eq!(written.len(), 6);
        assert!(written.iter().all(|p| p.exists()));

        let rules = std::fs::read_to_string(writer.path("validation_rules_summary.csv")).unwrap();
        assert!(rules.starts_with("column_name,rule_type,friendly_rule_name,dimension,status"));
        assert_eq!(rules.lines().count(), 1 + 10);

        let summary = std::fs::read_to_string(writer.path("migration_summary.csv")).unwrap();
        assert!(summary.starts_with("total_records,passed,failed,partial"));
    }
}
