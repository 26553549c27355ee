//! End-to-end run: clean, resolve, transform, validate, persist, report.

use crate::cleaners::{CleanReport, ColumnCleaner, PhoneCleaner};
use crate::conditional::ConditionalParser;
use crate::config::QaConfig;
use crate::error::Result;
use crate::llm::LlmClient;
use crate::mapping::{MappingRow, MappingSheet};
use crate::report::{mapping_status, ArtifactWriter, MappingStatusRow, RecordSummary};
use crate::roles::{Role, RoleMap, RoleResolver};
use crate::store::{persist_summary, RuleStore};
use crate::table::{load_table, Columns};
use crate::transform::{TransformOutcome, TransformationEngine};
use crate::validation::{ValidationEngine, ValidationSummary};
use chrono::NaiveDate;
use polars::prelude::DataFrame;
use std::path::{Path, PathBuf};
use tracing::info;

/// Per-run state handed in by the caller. Nothing here outlives the run.
pub struct RunContext {
    pub project_id: i64,
    pub store: Option<Box<dyn RuleStore>>,
}

impl RunContext {
    pub fn new(project_id: i64) -> Self {
        Self {
            project_id,
            store: None,
        }
    }

    pub fn with_store(mut self, store: Box<dyn RuleStore>) -> Self {
        self.store = Some(store);
        self
    }
}

#[derive(Debug)]
pub struct RunOutcome {
    pub roles: RoleMap,
    pub cleaned: Vec<CleanReport>,
    pub transform: TransformOutcome,
    pub records: RecordSummary,
    pub mapping_status: Vec<MappingStatusRow>,
    pub validation: ValidationSummary,
    /// Rule results pushed to the store.
    pub persisted: usize,
    pub artifacts: Vec<PathBuf>,
}

pub struct MigrationPipeline {
    resolver: RoleResolver,
    cleaners: Vec<Box<dyn ColumnCleaner>>,
    engine: TransformationEngine,
    validator: ValidationEngine,
}

impl MigrationPipeline {
    pub fn new(config: &QaConfig) -> Result<Self> {
        let conditional = match LlmClient::from_config(&config.llm)? {
            Some(client) => {
                info!("Conditional rules will be parsed with {} first", config.llm.model);
                ConditionalParser::with_oracle(Box::new(client))
            }
            None => ConditionalParser::default(),
        };

        Ok(Self {
            resolver: RoleResolver::new(config.resolver.clone()),
            cleaners: vec![Box::new(PhoneCleaner::new(config.phone.clone()))],
            engine: TransformationEngine::new(conditional),
            validator: ValidationEngine::new(config.validation.clone(), config.phone.clone()),
        })
    }

    pub fn with_resolver(mut self, resolver: RoleResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_validator(mut self, validator: ValidationEngine) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.engine = self.engine.with_today(today);
        self
    }

    pub fn resolve(&self, sheet: &MappingSheet) -> Result<RoleMap> {
        let roles = self.resolver.resolve(sheet.headers())?;
        roles.require(Role::Source)?;
        roles.require(Role::Target)?;
        Ok(roles)
    }

    /// Run every column cleaner over the source table in place.
    pub fn clean(&self, table: &mut Columns) -> Result<Vec<CleanReport>> {
        let mut reports = Vec::new();
        for cleaner in &self.cleaners {
            reports.extend(cleaner.apply(table)?);
        }
        Ok(reports)
    }

    pub fn transform(&self, table: &Columns, rows: &[MappingRow]) -> Result<TransformOutcome> {
        self.engine.apply(table, rows)
    }

    /// Run everything in memory. Artifacts are left to the caller.
    pub fn run(&self, source: &DataFrame, sheet: &MappingSheet, ctx: &mut RunContext) -> Result<RunOutcome> {
        let roles = self.resolve(sheet)?;
        for (role, matched) in roles.iter() {
            info!("Role {} -> '{}' ({:?}, {:.2})", role, matched.column, matched.tier, matched.score);
        }
        let rows = sheet.mapping_rows(&roles)?;

        let mut table = Columns::from_frame(source)?;
        let cleaned = self.clean(&mut table)?;

        let transform = self.transform(&table, &rows)?;
        let records = RecordSummary::from_table(&transform.derived);
        let validation = self.validator.validate(&transform.derived);

        let persisted = match ctx.store.as_deref_mut() {
            Some(store) => persist_summary(&validation, &transform.derived, store, ctx.project_id)?,
            None => 0,
        };

        info!(
            "Run finished: {} records ({} complete, {} partial, {} empty)",
            records.total_records, records.passed, records.partial, records.failed
        );
        Ok(RunOutcome {
            mapping_status: mapping_status(sheet, &roles),
            roles,
            cleaned,
            transform,
            records,
            validation,
            persisted,
            artifacts: Vec::new(),
        })
    }

    /// Load inputs from disk, run, and write every artifact into `out_dir`.
    pub fn run_files(
        &self,
        source_path: &Path,
        mapping_path: &Path,
        out_dir: &Path,
        ctx: &mut RunContext,
    ) -> Result<RunOutcome> {
        let source = load_table(source_path)?;
        let sheet = MappingSheet::from_path(mapping_path)?;
        let mut outcome = self.run(&source, &sheet, ctx)?;

        let writer = ArtifactWriter::new(out_dir)?;
        outcome.artifacts = writer.write_all(
            &outcome.transform.derived,
            &outcome.records,
            &outcome.mapping_status,
            &outcome.validation,
        )?;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryRuleStore;
    use polars::prelude::*;
    use tempfile::TempDir;

    const SHEET: &str = "\
Source Field,Target Field,Transformation Logic,Conditional Rule,Default Value,Required
name,FullName,,,,yes
phone,Phone,,,,
gender,Gender,,If gender == 'M' then 'Male' else 'Female',,
dob,Age,years_since(df['dob']),,,
";

    fn source() -> DataFrame {
        df![
            "name" => [Some("Ada"), Some("Alan"), None],
            "phone" => ["(815)454-1041", "212.555.0100", "555-0100"],
            "gender" => ["F", "M", "M"],
            "dob" => ["1990-05-01", "2000-01-01", "1985-12-31"]
        ]
        .unwrap()
    }

    fn pipeline() -> MigrationPipeline {
        MigrationPipeline::new(&QaConfig::default())
            .unwrap()
            .with_today(NaiveDate::from_ymd_opt(2026, 10, 18).unwrap())
    }

    #[test]
    fn test_run_in_memory() {
        let sheet = MappingSheet::from_reader(SHEET.as_bytes()).unwrap();
        let mut ctx = RunContext::new(1).with_store(Box::new(MemoryRuleStore::default()));
        let outcome = pipeline().run(&source(), &sheet, &mut ctx).unwrap();

        let derived = &outcome.transform.derived;
        assert_eq!(derived.names(), &["FullName", "Phone", "Gender", "Age"]);
        assert_eq!(derived.get("Phone").unwrap()[0], crate::table::Cell::str("+1-815-454-1041"));
        assert_eq!(derived.get("Age").unwrap()[1], crate::table::Cell::Int(26));
        assert_eq!(outcome.records.partial, 1);
        assert_eq!(outcome.cleaned.len(), 1);
        assert_eq!(outcome.validation.results.len(), 4 * 25);
        assert!(outcome.persisted > 0);
    }

    #[test]
    fn test_run_files_writes_artifacts() {
        let temp_dir = TempDir::new().unwrap();
        let source_path = temp_dir.path().join("source.csv");
        let mapping_path = temp_dir.path().join("mapping.csv");
        crate::table::write_csv(&mut source(), &source_path).unwrap();
        std::fs::write(&mapping_path, SHEET).unwrap();

        let out_dir = temp_dir.path().join("artifacts");
        let mut ctx = RunContext::new(1);
        let outcome = pipeline()
            .run_files(&source_path, &mapping_path, &out_dir, &mut ctx)
            .unwrap();
        assert_eq!(outcome.artifacts.len(), 6);
        assert_eq!(outcome.persisted, 0);
        assert!(out_dir.join("mapped_output.csv").exists());
    }
}
