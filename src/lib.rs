pub mod error;
pub mod config;
pub mod table;
pub mod mapping;
pub mod roles;
pub mod conditional;
pub mod expression;
pub mod transform;
pub mod cleaners;
pub mod validation;
pub mod llm;
pub mod store;
pub mod report;
pub mod pipeline;

pub use conditional::{parse_conditional, ConditionalParser, ConditionalRule};
pub use config::QaConfig;
pub use error::{QaError, Result};
pub use mapping::{MappingRow, MappingSheet};
pub use pipeline::{MigrationPipeline, RunContext, RunOutcome};
pub use roles::{Role, RoleMap, RoleResolver};
pub use table::{Cell, Columns};
pub use transform::{apply_transformations, TransformationEngine};
pub use validation::{RuleResult, ValidationEngine, ValidationSummary};
