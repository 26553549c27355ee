use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use migration_qa::config::{ModePreference, QaConfig};
use migration_qa::store::SqliteRuleStore;
use migration_qa::table::{load_table, write_csv, Columns};
use migration_qa::{MappingSheet, MigrationPipeline, RunContext, ValidationEngine};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "migration-qa")]
#[command(about = "Transform a source table through a mapping sheet and score the result")]
struct Args {
    /// JSON configuration file (environment overrides still apply)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    Auto,
    Full,
    Simplified,
}

impl From<Mode> for ModePreference {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Auto => ModePreference::Auto,
            Mode::Full => ModePreference::Full,
            Mode::Simplified => ModePreference::Simplified,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Show which mapping header was resolved to each role
    Roles { mapping: PathBuf },

    /// Apply a mapping sheet to a source table
    Transform {
        source: PathBuf,
        mapping: PathBuf,
        #[arg(short, long, default_value = "mapped_output.csv")]
        output: PathBuf,
    },

    /// Score every column of a table
    Validate {
        table: PathBuf,
        #[arg(long, value_enum)]
        mode: Option<Mode>,
    },

    /// Full run: clean, transform, validate, persist and write artifacts
    Run {
        source: PathBuf,
        mapping: PathBuf,
        #[arg(short, long, default_value = "artifacts")]
        out: PathBuf,
        #[arg(long, default_value_t = 0)]
        project_id: i64,
        /// SQLite database for rule definitions and metrics
        #[arg(long)]
        store: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut config = QaConfig::load(args.config.as_deref()).context("loading configuration")?;

    match args.command {
        Command::Roles { mapping } => {
            let sheet = MappingSheet::from_path(&mapping)?;
            let roles = MigrationPipeline::new(&config)?.resolve(&sheet)?;
            for (role, matched) in roles.iter() {
                println!(
                    "{:<20} {:<30} {:?} ({:.2})",
                    role.as_str(),
                    matched.column,
                    matched.tier,
                    matched.score
                );
            }
        }
        Command::Transform { source, mapping, output } => {
            let pipeline = MigrationPipeline::new(&config)?;
            let sheet = MappingSheet::from_path(&mapping)?;
            let roles = pipeline.resolve(&sheet)?;
            let rows = sheet.mapping_rows(&roles)?;

            let mut table = Columns::from_frame(&load_table(&source)?)?;
            pipeline.clean(&mut table)?;
            let outcome = pipeline.transform(&table, &rows)?;
            for (target, missing) in outcome.report.required_warnings() {
                println!("required field '{}' has {} missing values", target, missing);
            }
            write_csv(&mut outcome.to_frame()?, &output)?;
            info!("Wrote {}", output.display());
        }
        Command::Validate { table, mode } => {
            if let Some(mode) = mode {
                config.validation.mode = mode.into();
            }
            let df = load_table(&table)?;
            let summary = ValidationEngine::new(config.validation.clone(), config.phone.clone()).validate_frame(&df)?;
            if summary.downgraded {
                println!("note: full rule backend unavailable, simplified mode used");
            }
            for score in summary.dimension_scores() {
                println!("{:<14} {:>7.2}  ({} rules)", score.dimension.as_str(), score.mean_passed_score, score.rules);
            }
            let kpis = summary.kpis();
            println!(
                "{} rules over {} columns, {} without failures, average score {:.2}",
                kpis.total_rules, kpis.columns, kpis.clean_rules, kpis.average_score
            );
        }
        Command::Run {
            source,
            mapping,
            out,
            project_id,
            store,
        } => {
            let mut ctx = RunContext::new(project_id);
            if let Some(path) = store {
                ctx = ctx.with_store(Box::new(SqliteRuleStore::open(&path)?));
            }
            let outcome = MigrationPipeline::new(&config)?.run_files(&source, &mapping, &out, &mut ctx)?;
            let records = &outcome.records;
            println!(
                "{} records: {} complete ({:.1}%), {} partial ({:.1}%), {} empty ({:.1}%)",
                records.total_records,
                records.passed,
                records.success_rate,
                records.partial,
                records.partial_rate,
                records.failed,
                records.fail_rate
            );
            println!(
                "validation ({}): average score {:.2}, {} results persisted",
                outcome.validation.mode.as_str(),
                outcome.validation.kpis().average_score,
                outcome.persisted
            );
            for path in &outcome.artifacts {
                println!("  {}", path.display());
            }
        }
    }

    Ok(())
}
