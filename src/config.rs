//! Run configuration
//!
//! Loaded from an optional JSON file, then overridden from the environment
//! (a `.env` file is honoured through `dotenv`).

use crate::error::{QaError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QaConfig {
    pub resolver: ResolverConfig,
    pub phone: PhoneConfig,
    pub validation: ValidationConfig,
    pub llm: LlmConfig,
}

/// String-similarity metric used by fuzzy role matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityMetric {
    /// Indel ratio over whitespace-sorted tokens.
    TokenSort,
    JaroWinkler,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    pub fuzzy_threshold: f64,
    pub relaxed_threshold: f64,
    pub metric: SimilarityMetric,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            fuzzy_threshold: 0.6,
            relaxed_threshold: 0.3,
            metric: SimilarityMetric::TokenSort,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PhoneConfig {
    /// Header keywords that mark a column as a phone column outright.
    pub keywords: Vec<String>,
    /// Number of leading non-missing values inspected by shape detection.
    pub sample_size: usize,
    /// Share of sampled values that must look like phone numbers.
    pub min_match_ratio: f64,
    /// Area code given to bare 7-digit local numbers.
    pub placeholder_area_code: String,
}

impl Default for PhoneConfig {
    fn default() -> Self {
        Self {
            keywords: ["phone", "tel", "telephone", "mobile", "cell", "contact"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            sample_size: 10,
            min_match_ratio: 0.6,
            placeholder_area_code: "000".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModePreference {
    /// Full mode when a rule backend is available, simplified otherwise.
    Auto,
    Full,
    Simplified,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub mode: ModePreference,
    /// Accuracy: numeric values further than this many standard deviations
    /// from the column mean are counted as failures.
    pub outlier_sigma: f64,
    /// Validity: strings longer than this are counted as failures.
    pub max_string_length: usize,
    /// Consistency: collapse runs of the same character class before
    /// clustering value shapes ("AAA-99" -> "AX9").
    pub collapse_shape_runs: bool,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            mode: ModePreference::Auto,
            outlier_sigma: 3.0,
            max_string_length: 1000,
            collapse_shape_runs: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub enabled: bool,
    /// OpenAI-compatible endpoint (Ollama serves one under `/v1`).
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    pub temperature: f64,
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "http://localhost:11434/v1".to_string(),
            model: "mistral:7b-instruct-q4_0".to_string(),
            api_key: None,
            timeout_secs: 20,
            temperature: 0.2,
            max_tokens: 500,
        }
    }
}

impl QaConfig {
    /// Load configuration from `path` (JSON) if given, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenv::dotenv().ok();

        let mut config = match path {
            Some(path) => {
                info!("Loading configuration from {}", path.display());
                let content = std::fs::read_to_string(path)?;
                serde_json::from_str::<QaConfig>(&content)?
            }
            None => QaConfig::default(),
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `QA_*` overrides through `lookup`, which is `std::env::var` outside tests.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(enabled) = lookup("QA_LLM_ENABLED") {
            self.llm.enabled = matches!(enabled.trim().to_lowercase().as_str(), "1" | "true" | "yes");
            debug!("QA_LLM_ENABLED override: {}", self.llm.enabled);
        }
        if let Some(base_url) = lookup("QA_LLM_BASE_URL") {
            self.llm.base_url = base_url;
        }
        if let Some(model) = lookup("QA_LLM_MODEL") {
            self.llm.model = model;
        }
        if let Some(api_key) = lookup("QA_LLM_API_KEY") {
            self.llm.api_key = Some(api_key);
        }
        if let Some(mode) = lookup("QA_VALIDATION_MODE") {
            self.validation.mode = match mode.trim().to_lowercase().as_str() {
                "auto" => ModePreference::Auto,
                "full" => ModePreference::Full,
                "simplified" => ModePreference::Simplified,
                other => {
                    return Err(QaError::Config(format!(
                        "QA_VALIDATION_MODE must be auto, full or simplified (got '{}')",
                        other
                    )))
                }
            };
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let unit = |name: &str, value: f64| -> Result<()> {
            if (0.0..=1.0).contains(&value) {
                Ok(())
            } else {
                Err(QaError::Config(format!("{} must be within [0, 1] (got {})", name, value)))
            }
        };
        unit("resolver.fuzzy_threshold", self.resolver.fuzzy_threshold)?;
        unit("resolver.relaxed_threshold", self.resolver.relaxed_threshold)?;
        unit("phone.min_match_ratio", self.phone.min_match_ratio)?;

        if self.resolver.relaxed_threshold > self.resolver.fuzzy_threshold {
            return Err(QaError::Config(
                "resolver.relaxed_threshold must not exceed resolver.fuzzy_threshold".to_string(),
            ));
        }
        if self.phone.sample_size == 0 {
            return Err(QaError::Config("phone.sample_size must be positive".to_string()));
        }
        if self.validation.outlier_sigma <= 0.0 {
            return Err(QaError::Config("validation.outlier_sigma must be positive".to_string()));
        }
        if self.llm.timeout_secs == 0 {
            return Err(QaError::Config("llm.timeout_secs must be positive".to_string()));
        }
        Ok(())
    }
}
