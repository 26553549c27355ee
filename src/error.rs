use thiserror::Error;

#[derive(Error, Debug)]
pub enum QaError {
    /// A mandatory mapping role could not be resolved by any tier.
    #[error("Unresolved mapping roles {missing:?}; available headers: {available:?}")]
    UnresolvedRole {
        missing: Vec<String>,
        available: Vec<String>,
    },

    #[error("Expression error: {0}")]
    Expression(String),

    #[error("Conditional rule error: {0}")]
    ConditionalParse(String),

    #[error("Rule evaluation error: {0}")]
    RuleEvaluation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Table error: {0}")]
    Table(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Polars error: {0}")]
    Polars(String),
}

impl From<polars::error::PolarsError> for QaError {
    fn from(err: polars::error::PolarsError) -> Self {
        QaError::Polars(err.to_string())
    }
}

impl From<rusqlite::Error> for QaError {
    fn from(err: rusqlite::Error) -> Self {
        QaError::Store(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, QaError>;
