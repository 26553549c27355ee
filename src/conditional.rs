//! Conditional mapping rules.
//!
//! Short natural-language rules ("If Gender == 'M' then 'Male' else 'Female'")
//! are turned into a typed `ConditionalRule` by a chain of strategies. The
//! chain optionally starts with a generative oracle whose answer is validated
//! like any other untrusted input, then falls back to fixed templates.

use crate::error::{QaError, Result};
use crate::llm::{extract_json, TextOracle};
use crate::mapping::is_no_rule;
use crate::table::Cell;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

lazy_static! {
    static ref QUOTED_IF: Regex = Regex::new(
        r#"(?i)if\s+(\w+)\s*==\s*["']([^"']+)["']\s+then\s+["']([^"']+)["'],?\s*else\s+["']([^"']+)["']"#
    )
    .unwrap();
    static ref QUOTED_IF_KEEP: Regex = Regex::new(
        r#"(?i)if\s+(\w+)\s*==\s*["']([^"']+)["']\s+then\s+["']([^"']+)["'],?\s*else\s+(\w+)"#
    )
    .unwrap();
    static ref LOOSE_IF: Regex = Regex::new(
        r"(?i)if\s+(\w+)\s*=\s*([A-Za-z0-9]+)\s+then\s+([A-Za-z0-9]+)\s*else\s+([A-Za-z0-9]+)"
    )
    .unwrap();
    static ref WHEN_SET: Regex = Regex::new(
        r"(?i)when\s+(\w+)\s+equals?\s+([A-Za-z0-9]+)\s+set\s+to\s+([A-Za-z0-9]+)\s+otherwise\s+([A-Za-z0-9]+)"
    )
    .unwrap();
    static ref MAP_PAIRS: Regex =
        Regex::new(r"(?i)map\s+(\w+(?:\s*/\s*\w+)+)\s+to\s+(\w+(?:\s*/\s*\w+)+)").unwrap();
    static ref SPACED_QUOTED_IF: Regex = Regex::new(
        r#"(?i)if\s+(\w+)\s*==\s*["']([^"']+)["']\s+then\s+["']([^"']+)["']\s*,?\s*else\s+["']([^"']+)["']"#
    )
    .unwrap();
}

/// Values longer than this in an oracle answer are rejected.
const MAX_ORACLE_VALUE_LEN: usize = 200;

/// What a value that matches no case becomes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Branch {
    Literal(String),
    /// The original value, rendered as text.
    KeepOriginal,
}

/// Executable per-value mapper.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConditionalRule {
    /// `(when, then)` pairs, first match wins.
    pub cases: Vec<(String, String)>,
    pub otherwise: Branch,
    pub case_insensitive: bool,
}

impl ConditionalRule {
    pub fn if_else(when: &str, then: &str, otherwise: Branch) -> Self {
        Self {
            cases: vec![(when.to_string(), then.to_string())],
            otherwise,
            case_insensitive: false,
        }
    }

    /// Map one value. A missing value matches no case, so it takes the
    /// else branch (and stays missing under `KeepOriginal`).
    pub fn map_value(&self, cell: &Cell) -> Cell {
        let Some(text) = cell.text() else {
            return match &self.otherwise {
                Branch::Literal(value) => Cell::str(value.clone()),
                Branch::KeepOriginal => Cell::Null,
            };
        };
        let text = text.trim();

        let hit = self.cases.iter().find(|(when, _)| {
            if self.case_insensitive {
                when.eq_ignore_ascii_case(text)
            } else {
                when == text
            }
        });

        match (hit, &self.otherwise) {
            (Some((_, then)), _) => Cell::str(then.clone()),
            (None, Branch::Literal(value)) => Cell::str(value.clone()),
            (None, Branch::KeepOriginal) => Cell::str(text),
        }
    }

    pub fn apply(&self, cells: &[Cell]) -> Vec<Cell> {
        cells.iter().map(|c| self.map_value(c)).collect()
    }
}

/// One way of turning rule text into a `ConditionalRule`.
pub trait RuleStrategy {
    fn name(&self) -> &'static str;

    /// `field` is the source column the rule will be applied to.
    fn parse(&self, text: &str, field: &str) -> Option<ConditionalRule>;
}

/// Fixed template grammar, tried in order.
pub struct TemplateStrategy;

/// "male" -> "Male"; mixed-case words are left alone.
fn capitalize_lowercase(word: &str) -> String {
    if word.chars().all(|c| c.is_ascii_lowercase()) {
        let mut chars = word.chars();
        match chars.next() {
            Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
            None => String::new(),
        }
    } else {
        word.to_string()
    }
}

fn split_slashes(list: &str) -> Vec<String> {
    list.split('/').map(|s| s.trim().to_string()).collect()
}

impl TemplateStrategy {
    fn if_else(caps: &regex::Captures<'_>) -> ConditionalRule {
        ConditionalRule::if_else(&caps[2], &caps[3], Branch::Literal(caps[4].to_string()))
    }

    fn map_pairs(caps: &regex::Captures<'_>) -> Option<ConditionalRule> {
        let from = split_slashes(&caps[1]);
        let to = split_slashes(&caps[2]);
        if from.len() != to.len() {
            return None;
        }
        let to: Vec<String> = to.iter().map(|w| capitalize_lowercase(w)).collect();

        // "map m/f to male/female": the last target doubles as the else branch
        let otherwise = if to.len() == 2 {
            Branch::Literal(to[1].clone())
        } else {
            Branch::KeepOriginal
        };

        Some(ConditionalRule {
            cases: from.into_iter().zip(to).collect(),
            otherwise,
            case_insensitive: true,
        })
    }
}

impl RuleStrategy for TemplateStrategy {
    fn name(&self) -> &'static str {
        "template"
    }

    fn parse(&self, text: &str, field: &str) -> Option<ConditionalRule> {
        let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");

        if let Some(caps) = QUOTED_IF.captures(&normalized) {
            return Some(Self::if_else(&caps));
        }
        if let Some(caps) = QUOTED_IF_KEEP.captures(&normalized) {
            let else_word = &caps[4];
            let keeps_original = else_word.eq_ignore_ascii_case(&caps[1])
                || else_word.eq_ignore_ascii_case(field)
                || else_word.eq_ignore_ascii_case("original");
            let otherwise = if keeps_original {
                Branch::KeepOriginal
            } else {
                Branch::Literal(else_word.to_string())
            };
            return Some(ConditionalRule::if_else(&caps[2], &caps[3], otherwise));
        }
        if let Some(caps) = LOOSE_IF.captures(&normalized) {
            return Some(Self::if_else(&caps));
        }
        if let Some(caps) = WHEN_SET.captures(&normalized) {
            return Some(Self::if_else(&caps));
        }
        if let Some(rule) = MAP_PAIRS.captures(&normalized).and_then(|c| Self::map_pairs(&c)) {
            return Some(rule);
        }
        SPACED_QUOTED_IF.captures(text).map(|caps| Self::if_else(&caps))
    }
}

/// JSON shape requested from the oracle.
#[derive(Debug, Deserialize)]
struct OracleAnswer {
    cases: Vec<OracleCase>,
    /// `null` keeps the original value.
    otherwise: Option<String>,
    #[serde(default)]
    case_insensitive: bool,
}

#[derive(Debug, Deserialize)]
struct OracleCase {
    when: String,
    then: String,
}

/// Asks a generative oracle to describe the rule as JSON.
pub struct OracleStrategy {
    oracle: Box<dyn TextOracle>,
}

impl OracleStrategy {
    pub fn new(oracle: Box<dyn TextOracle>) -> Self {
        Self { oracle }
    }

    fn prompt(text: &str, field: &str) -> String {
        format!(
            r#"Convert this conditional mapping rule into a JSON value mapping.

Rule: {}
Source field: {}

Return JSON in this exact format:
{{
  "cases": [{{"when": "M", "then": "Male"}}],
  "otherwise": "Female",
  "case_insensitive": false
}}

Use "otherwise": null when unmatched values keep their original value.
Only return the JSON, no other text."#,
            text, field
        )
    }

    /// Parse and check an oracle reply.
    fn validate(reply: &str) -> Result<ConditionalRule> {
        let json = extract_json(reply)
            .ok_or_else(|| QaError::ConditionalParse("oracle reply contains no JSON".to_string()))?;
        let answer: OracleAnswer = serde_json::from_str(json)
            .map_err(|e| QaError::ConditionalParse(format!("oracle reply is not a rule: {}", e)))?;

        if answer.cases.is_empty() {
            return Err(QaError::ConditionalParse("oracle rule has no cases".to_string()));
        }
        let values = answer
            .cases
            .iter()
            .flat_map(|c| [&c.when, &c.then])
            .chain(answer.otherwise.as_ref());
        for value in values {
            if value.trim().is_empty() || value.len() > MAX_ORACLE_VALUE_LEN {
                return Err(QaError::ConditionalParse(format!(
                    "oracle rule value {:?} is empty or too long",
                    value
                )));
            }
        }

        Ok(ConditionalRule {
            cases: answer
                .cases
                .into_iter()
                .map(|c| (c.when.trim().to_string(), c.then))
                .collect(),
            otherwise: answer.otherwise.map_or(Branch::KeepOriginal, Branch::Literal),
            case_insensitive: answer.case_insensitive,
        })
    }
}

impl RuleStrategy for OracleStrategy {
    fn name(&self) -> &'static str {
        "oracle"
    }

    fn parse(&self, text: &str, field: &str) -> Option<ConditionalRule> {
        let reply = match self.oracle.complete(&Self::prompt(text, field)) {
            Ok(reply) => reply,
            Err(e) => {
                warn!("Oracle unavailable for conditional '{}': {}", text, e);
                return None;
            }
        };
        match Self::validate(&reply) {
            Ok(rule) => Some(rule),
            Err(e) => {
                warn!("Discarding oracle answer for '{}': {}", text, e);
                None
            }
        }
    }
}

/// Ordered strategy chain; the first strategy producing a rule wins.
pub struct ConditionalParser {
    strategies: Vec<Box<dyn RuleStrategy>>,
}

impl Default for ConditionalParser {
    fn default() -> Self {
        Self {
            strategies: vec![Box::new(TemplateStrategy)],
        }
    }
}

impl ConditionalParser {
    pub fn new(strategies: Vec<Box<dyn RuleStrategy>>) -> Self {
        Self { strategies }
    }

    /// Oracle first, templates as fallback.
    pub fn with_oracle(oracle: Box<dyn TextOracle>) -> Self {
        Self::new(vec![
            Box::new(OracleStrategy::new(oracle)),
            Box::new(TemplateStrategy),
        ])
    }

    pub fn parse(&self, text: &str, field: &str) -> Option<ConditionalRule> {
        if is_no_rule(text) {
            return None;
        }
        for strategy in &self.strategies {
            if let Some(rule) = strategy.parse(text, field) {
                debug!("Conditional '{}' parsed by {} strategy", text, strategy.name());
                info!("   Conditional rule: {:?}", rule);
                return Some(rule);
            }
        }
        warn!("Could not parse conditional: {}", text);
        None
    }
}

/// Template-only parse.
pub fn parse_conditional(text: &str) -> Option<ConditionalRule> {
    ConditionalParser::default().parse(text, "")
}
