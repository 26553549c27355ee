//! Persistence of rule definitions and their latest metrics.

use crate::error::Result;
use crate::table::Columns;
use crate::validation::{RuleResult, RuleStatus, ValidationMode, ValidationSummary};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

/// Identity of a stored rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct RuleKey {
    pub column_name: String,
    pub rule_type: String,
    pub dimension: String,
    pub project_id: i64,
}

impl RuleKey {
    pub fn for_result(result: &RuleResult, project_id: i64) -> Self {
        Self {
            column_name: result.column_name.clone(),
            rule_type: result.rule_type.clone(),
            dimension: result.dimension.as_str().to_string(),
            project_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleMetrics {
    pub valid_count: usize,
    pub invalid_count: usize,
    pub null_count: usize,
    pub total: usize,
    pub score: f64,
}

/// Pull/push contract of the rule store.
pub trait RuleStore {
    fn rule_exists(&self, key: &RuleKey) -> Result<bool>;

    fn insert_rule(&mut self, key: &RuleKey, friendly_name: &str) -> Result<()>;

    /// Replace the latest metrics of a rule.
    fn record_metrics(&mut self, key: &RuleKey, metrics: &RuleMetrics) -> Result<()>;
}

pub struct SqliteRuleStore {
    db: Connection,
}

impl SqliteRuleStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let store = Self {
            db: Connection::open(path)?,
        };
        store.init_schema()?;
        info!("Opened rule store at {}", path.display());
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let store = Self {
            db: Connection::open_in_memory()?,
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.db.execute(
            r#"
            CREATE TABLE IF NOT EXISTS validation_rules (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project_id INTEGER NOT NULL,
                column_name TEXT NOT NULL,
                rule_type TEXT NOT NULL,
                dimension TEXT NOT NULL,
                friendly_rule_name TEXT NOT NULL,
                valid_count INTEGER,
                invalid_count INTEGER,
                null_count INTEGER,
                total_count INTEGER,
                score REAL,
                created_at TEXT NOT NULL,
                updated_at TEXT,
                UNIQUE(column_name, rule_type, dimension, project_id)
            )
            "#,
            [],
        )?;
        self.db.execute(
            "CREATE INDEX IF NOT EXISTS idx_rules_project ON validation_rules(project_id)",
            [],
        )?;
        Ok(())
    }

    pub fn metrics(&self, key: &RuleKey) -> Result<Option<RuleMetrics>> {
        let row = self
            .db
            .query_row(
                "SELECT valid_count, invalid_count, null_count, total_count, score
                 FROM validation_rules
                 WHERE column_name = ?1 AND rule_type = ?2 AND dimension = ?3 AND project_id = ?4
                   AND score IS NOT NULL",
                params![key.column_name, key.rule_type, key.dimension, key.project_id],
                |row| {
                    Ok(RuleMetrics {
                        valid_count: row.get::<_, i64>(0)? as usize,
                        invalid_count: row.get::<_, i64>(1)? as usize,
                        null_count: row.get::<_, i64>(2)? as usize,
                        total: row.get::<_, i64>(3)? as usize,
                        score: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn rule_count(&self, project_id: i64) -> Result<usize> {
        let count: i64 = self.db.query_row(
            "SELECT COUNT(*) FROM validation_rules WHERE project_id = ?1",
            params![project_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

impl RuleStore for SqliteRuleStore {
    fn rule_exists(&self, key: &RuleKey) -> Result<bool> {
        let found = self
            .db
            .query_row(
                "SELECT 1 FROM validation_rules
                 WHERE column_name = ?1 AND rule_type = ?2 AND dimension = ?3 AND project_id = ?4",
                params![key.column_name, key.rule_type, key.dimension, key.project_id],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn insert_rule(&mut self, key: &RuleKey, friendly_name: &str) -> Result<()> {
        self.db.execute(
            "INSERT INTO validation_rules
                (project_id, column_name, rule_type, dimension, friendly_rule_name, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(column_name, rule_type, dimension, project_id) DO NOTHING",
            params![
                key.project_id,
                key.column_name,
                key.rule_type,
                key.dimension,
                friendly_name,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    fn record_metrics(&mut self, key: &RuleKey, metrics: &RuleMetrics) -> Result<()> {
        let updated = self.db.execute(
            "UPDATE validation_rules
             SET valid_count = ?5, invalid_count = ?6, null_count = ?7, total_count = ?8,
                 score = ?9, updated_at = ?10
             WHERE column_name = ?1 AND rule_type = ?2 AND dimension = ?3 AND project_id = ?4",
            params![
                key.column_name,
                key.rule_type,
                key.dimension,
                key.project_id,
                metrics.valid_count as i64,
                metrics.invalid_count as i64,
                metrics.null_count as i64,
                metrics.total as i64,
                metrics.score,
                Utc::now().to_rfc3339()
            ],
        )?;
        debug!("Recorded metrics for {:?} ({} rows)", key, updated);
        Ok(())
    }
}

/// Store for tests and runs without a database.
#[derive(Debug, Default)]
pub struct MemoryRuleStore {
    rules: HashMap<RuleKey, (String, Option<RuleMetrics>)>,
}

impl MemoryRuleStore {
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn metrics(&self, key: &RuleKey) -> Option<&RuleMetrics> {
        self.rules.get(key).and_then(|(_, m)| m.as_ref())
    }
}

impl RuleStore for MemoryRuleStore {
    fn rule_exists(&self, key: &RuleKey) -> Result<bool> {
        Ok(self.rules.contains_key(key))
    }

    fn insert_rule(&mut self, key: &RuleKey, friendly_name: &str) -> Result<()> {
        self.rules
            .entry(key.clone())
            .or_insert_with(|| (friendly_name.to_string(), None));
        Ok(())
    }

    fn record_metrics(&mut self, key: &RuleKey, metrics: &RuleMetrics) -> Result<()> {
        if let Some((_, slot)) = self.rules.get_mut(key) {
            *slot = Some(metrics.clone());
        }
        Ok(())
    }
}

/// Register and update every applied full-mode rule. Returns the number of rules pushed.
pub fn persist_summary(
    summary: &ValidationSummary,
    table: &Columns,
    store: &mut dyn RuleStore,
    project_id: i64,
) -> Result<usize> {
    if summary.mode != ValidationMode::Full {
        debug!("Simplified validation results are not persisted");
        return Ok(0);
    }

    let mut pushed = 0;
    for result in summary.results.iter().filter(|r| r.status == RuleStatus::Applied) {
        let key = RuleKey::for_result(result, project_id);
        if !store.rule_exists(&key)? {
            store.insert_rule(&key, &result.friendly_name)?;
        }
        let null_count = table
            .get(&result.column_name)
            .map(|cells| cells.iter().filter(|c| c.is_missing()).count())
            .unwrap_or(0);
        store.record_metrics(
            &key,
            &RuleMetrics {
                valid_count: result.passed_count,
                invalid_count: result.failed_count,
                null_count,
                total: result.total_evaluated,
                score: result.passed_score,
            },
        )?;
        pushed += 1;
    }
    info!("Persisted {} rule results for project {}", pushed, project_id);
    Ok(pushed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::Cell;
    use crate::validation::ValidationEngine;
    use tempfile::TempDir;

    fn key() -> RuleKey {
        RuleKey {
            column_name: "email".to_string(),
            rule_type: "expect_column_values_to_not_be_null".to_string(),
            dimension: "completeness".to_string(),
            project_id: 7,
        }
    }

    fn metrics(score: f64) -> RuleMetrics {
        RuleMetrics {
            valid_count: 9,
            invalid_count: 1,
            null_count: 1,
            total: 10,
            score,
        }
    }

    #[test]
    fn test_sqlite_upsert_and_metrics() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = SqliteRuleStore::open(temp_dir.path().join("rules.db")).unwrap();

        assert!(!store.rule_exists(&key()).unwrap());
        store.insert_rule(&key(), "No Missing Values").unwrap();
        store.insert_rule(&key(), "No Missing Values").unwrap();
        assert!(store.rule_exists(&key()).unwrap());
        assert_eq!(store.rule_count(7).unwrap(), 1);
        assert!(store.metrics(&key()).unwrap().is_none());

        store.record_metrics(&key(), &metrics(90.0)).unwrap();
        store.record_metrics(&key(), &metrics(95.0)).unwrap();
        assert_eq!(store.metrics(&key()).unwrap().unwrap().score, 95.0);

        let other_project = RuleKey { project_id: 8, ..key() };
        assert!(!store.rule_exists(&other_project).unwrap());
    }

    #[test]
    fn test_persist_summary_full_mode_only() {
        let mut table = Columns::with_height(2);
        table.insert("email", vec![Cell::str("a@b.c"), Cell::Null]).unwrap();

        let summary = ValidationEngine::default().validate(&table);
        let mut store = MemoryRuleStore::default();
        let pushed = persist_summary(&summary, &table, &mut store, 7).unwrap();
        let applied = summary
            .results
            .iter()
            .filter(|r| r.status == RuleStatus::Applied)
            .count();
        assert_eq!(pushed, applied);
        assert_eq!(store.metrics(&key()).unwrap().null_count, 1);

        let simplified = ValidationEngine::default().with_backend(None).validate(&table);
        let mut empty = MemoryRuleStore::default();
        assert_eq!(persist_summary(&simplified, &table, &mut empty, 7).unwrap(), 0);
        assert!(empty.is_empty());
    }
}
