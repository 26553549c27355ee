//! Column role resolution for mapping specification headers.
//!
//! Tier 1 matches fixed substring patterns; tier 2 runs fuzzy matching when
//! `source` or `target` is still missing, first at the configured threshold and
//! then at the relaxed one. Whatever is still missing after that is reported as
//! `QaError::UnresolvedRole` so the caller can supply explicit overrides.

use crate::config::{ResolverConfig, SimilarityMetric};
use crate::error::{QaError, Result};
use itertools::Itertools;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use strsim::jaro_winkler;
use tracing::{debug, info, warn};

/// Semantic role a mapping header can be resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Source,
    Target,
    Transformation,
    Required,
    DirectMap,
    DefaultValue,
    ConditionalMapping,
}

impl Role {
    /// All roles, in tier-1 resolution order.
    pub const ALL: [Role; 7] = [
        Role::Source,
        Role::Target,
        Role::Transformation,
        Role::Required,
        Role::DirectMap,
        Role::DefaultValue,
        Role::ConditionalMapping,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Source => "source",
            Role::Target => "target",
            Role::Transformation => "transformation",
            Role::Required => "required",
            Role::DirectMap => "direct_map",
            Role::DefaultValue => "default_value",
            Role::ConditionalMapping => "conditional_mapping",
        }
    }

    pub fn is_mandatory(&self) -> bool {
        matches!(self, Role::Source | Role::Target)
    }

    /// Tier-1 substring patterns, strongest first.
    pub fn exact_patterns(&self) -> &'static [&'static str] {
        match self {
            Role::Source => &[
                "source", "sourcefield", "source_field", "src", "from", "input", "original",
                "beginning", "start", "initial", "baseline", "raw_material", "initial_value",
            ],
            // "end"/"endpoint" are left to fuzzy matching: as substrings they
            // would claim headers such as "Spending Limit".
            Role::Target => &[
                "target", "targetfield", "target_field", "tgt", "to", "output", "destination",
                "dest", "final", "outcome", "finished_product", "final_value",
            ],
            Role::Transformation => &[
                "transformation", "transform", "transformation_code", "transform_code", "code",
                "logic", "rule", "formula", "expression", "method", "procedure", "process",
                "algorithm",
            ],
            Role::Required => &[
                "required", "mandatory", "req", "must", "essential", "necessary", "needed",
                "critical", "vital",
            ],
            Role::DirectMap => &[
                "direct", "direct_map", "directmap", "copy", "direct_copy", "simple", "plain",
                "unchanged", "identical",
            ],
            Role::DefaultValue => &[
                "default", "default_value", "defaultvalue", "fallback", "backup", "preset",
                "standard", "placeholder", "substitute",
            ],
            Role::ConditionalMapping => &[
                "conditional", "conditionalmapping", "conditional_mapping", "condition",
                "conditions", "conditional_logic", "if_then", "business_rule", "mapping_rule",
                "conditional_rule", "criteria", "criterion", "constraints", "requirements",
                "specifications",
            ],
        }
    }

    /// Tier-2 vocabulary: direct variations plus synonyms.
    pub fn fuzzy_patterns(&self) -> &'static [&'static str] {
        match self {
            Role::Source => &[
                "source", "sourcefield", "source_field", "source_column", "src", "from", "input",
                "original", "orig", "source_name", "input_field", "input_column", "origin",
                "beginning", "start", "initial", "baseline", "raw", "incoming", "inbound",
                "primary", "base", "foundation", "raw_material", "initial_value",
                "starting_point", "old", "existing", "current", "before", "legacy", "previous",
                "old_value", "predecessor", "antecedent", "originator", "parent", "root",
            ],
            Role::Target => &[
                "target", "targetfield", "target_field", "target_column", "tgt", "to", "output",
                "destination", "dest", "target_name", "output_field", "output_column", "result",
                "endpoint", "end", "final", "outcome", "finished", "outgoing", "outbound",
                "secondary", "derived", "conclusion", "finished_product", "final_value",
                "ending_point", "new", "updated", "modified", "after", "revised", "changed",
                "new_value", "successor", "consequent", "child", "offspring", "branch",
            ],
            Role::Transformation => &[
                "transformation", "transform", "transformation_code", "transform_code", "code",
                "logic", "rule", "formula", "expression", "transform_logic", "mapping_logic",
                "calculation", "function", "transform_rule", "transformation_rule", "method",
                "procedure", "process", "algorithm", "technique", "approach", "methodology",
                "operation", "conversion", "manipulation", "processing", "computation",
                "evaluation", "execution", "implementation", "derivation",
            ],
            Role::ConditionalMapping => &[
                "conditional", "conditionalmapping", "conditional_mapping", "condition",
                "conditions", "conditional_logic", "if_then", "business_rule", "mapping_rule",
                "conditional_rule", "criteria", "criterion", "constraints", "requirements",
                "specifications", "guidelines", "policies", "rules", "provisions",
                "stipulations", "parameters", "limitations", "restrictions", "filters",
                "validators",
            ],
            Role::Required => &[
                "required", "mandatory", "req", "must", "essential", "is_required",
                "is_mandatory", "mandatory_flag", "required_flag", "necessity", "compulsory",
                "obligatory", "necessary", "needed", "demanded", "critical", "vital",
                "important", "key", "fundamental", "indispensable", "prerequisite",
            ],
            Role::DirectMap => &[
                "direct", "direct_map", "directmap", "copy", "direct_copy", "is_direct",
                "direct_mapping", "passthrough", "direct_transfer", "straight", "simple",
                "plain", "basic", "unchanged", "identical", "mirror", "duplicate", "replicate",
                "clone", "reproduce",
            ],
            Role::DefaultValue => &[
                "default", "default_value", "defaultvalue", "fallback", "backup", "default_val",
                "fallback_value", "backup_value", "null_replacement", "preset", "standard",
                "initial", "baseline", "placeholder", "substitute", "alternative",
                "replacement", "standby", "reserve", "contingency",
            ],
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a role was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Supplied by the caller.
    Override,
    Exact,
    Fuzzy,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoleMatch {
    pub column: String,
    pub tier: Tier,
    pub score: f64,
}

/// Role -> mapping header. Built once per mapping sheet.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RoleMap {
    matches: BTreeMap<Role, RoleMatch>,
}

impl RoleMap {
    pub fn get(&self, role: Role) -> Option<&str> {
        self.matches.get(&role).map(|m| m.column.as_str())
    }

    pub fn get_match(&self, role: Role) -> Option<&RoleMatch> {
        self.matches.get(&role)
    }

    pub fn contains(&self, role: Role) -> bool {
        self.matches.contains_key(&role)
    }

    pub fn require(&self, role: Role) -> Result<&str> {
        self.get(role).ok_or_else(|| QaError::UnresolvedRole {
            missing: vec![role.as_str().to_string()],
            available: self.matches.values().map(|m| m.column.clone()).collect(),
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (Role, &RoleMatch)> {
        self.matches.iter().map(|(role, m)| (*role, m))
    }

    pub fn len(&self) -> usize {
        self.matches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }

    fn has_mandatory(&self) -> bool {
        self.contains(Role::Source) && self.contains(Role::Target)
    }

    fn claimed(&self) -> HashSet<&str> {
        self.matches.values().map(|m| m.column.as_str()).collect()
    }

    fn assign(&mut self, role: Role, column: &str, tier: Tier, score: f64) {
        self.matches.insert(
            role,
            RoleMatch {
                column: column.to_string(),
                tier,
                score,
            },
        );
    }
}

/// Lowercase and strip `_`, `-` and whitespace.
pub fn normalize_header(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .filter(|c| !(c.is_whitespace() || *c == '_' || *c == '-'))
        .collect()
}

/// Length of the longest common subsequence of `a` and `b`.
fn lcs_len(a: &[char], b: &[char]) -> usize {
    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];
    for ca in a {
        for (j, cb) in b.iter().enumerate() {
            curr[j + 1] = if ca == cb {
                prev[j] + 1
            } else {
                prev[j + 1].max(curr[j])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// Token-order-insensitive similarity in [0, 1]: tokens are sorted, then
/// compared by normalized indel similarity (2 * LCS / total length).
pub fn token_sort_ratio(a: &str, b: &str) -> f64 {
    let sort = |s: &str| s.split_whitespace().sorted().join(" ");
    let a: Vec<char> = sort(a).chars().collect();
    let b: Vec<char> = sort(b).chars().collect();
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    2.0 * lcs_len(&a, &b) as f64 / (a.len() + b.len()) as f64
}

pub struct RoleResolver {
    config: ResolverConfig,
    overrides: Vec<(Role, String)>,
}

impl Default for RoleResolver {
    fn default() -> Self {
        Self::new(ResolverConfig::default())
    }
}

impl RoleResolver {
    pub fn new(config: ResolverConfig) -> Self {
        Self {
            config,
            overrides: Vec::new(),
        }
    }

    /// Pin roles to explicit headers; these win over every tier.
    pub fn with_overrides(mut self, overrides: Vec<(Role, String)>) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn similarity(&self, header: &str, pattern: &str) -> f64 {
        let header = normalize_header(header);
        let pattern = normalize_header(pattern);
        match self.config.metric {
            SimilarityMetric::TokenSort => token_sort_ratio(&header, &pattern),
            SimilarityMetric::JaroWinkler => jaro_winkler(&header, &pattern),
        }
    }

    pub fn resolve(&self, headers: &[String]) -> Result<RoleMap> {
        let mut map = RoleMap::default();

        for (role, column) in &self.overrides {
            if !headers.iter().any(|h| h == column) {
                return Err(QaError::Config(format!(
                    "Override for role '{}' names unknown header '{}'",
                    role, column
                )));
            }
            map.assign(*role, column, Tier::Override, 1.0);
        }

        debug!("Attempting exact pattern matching over {:?}", headers);
        self.resolve_exact(headers, &mut map);

        if map.has_mandatory() {
            info!("Exact pattern matching resolved {} roles", map.len());
            return Ok(map);
        }

        warn!("Exact pattern matching incomplete; trying fuzzy matching");
        self.resolve_fuzzy(headers, &mut map, self.config.fuzzy_threshold);
        if !map.has_mandatory() {
            info!(
                "Retrying fuzzy matching with relaxed threshold {}",
                self.config.relaxed_threshold
            );
            self.resolve_fuzzy(headers, &mut map, self.config.relaxed_threshold);
        }

        if map.has_mandatory() {
            for (role, m) in map.iter() {
                debug!("   {} -> {} ({:?}, {:.2})", role, m.column, m.tier, m.score);
            }
            return Ok(map);
        }

        let missing = Role::ALL
            .iter()
            .filter(|r| r.is_mandatory() && !map.contains(**r))
            .map(|r| r.as_str().to_string())
            .collect::<Vec<_>>();
        Err(QaError::UnresolvedRole {
            missing,
            available: headers.to_vec(),
        })
    }

    /// Tier 1. Patterns are tried in order; the first unclaimed header containing one wins.
    fn resolve_exact(&self, headers: &[String], map: &mut RoleMap) {
        let lowered: Vec<String> = headers.iter().map(|h| h.trim().to_lowercase()).collect();

        for role in Role::ALL {
            if map.contains(role) {
                continue;
            }
            let claimed: HashSet<String> = map.claimed().into_iter().map(String::from).collect();

            let hit = role.exact_patterns().iter().find_map(|pattern| {
                headers
                    .iter()
                    .zip(&lowered)
                    .find(|(header, low)| !claimed.contains(header.as_str()) && low.contains(pattern))
                    .map(|(header, _)| header.clone())
            });

            if let Some(header) = hit {
                debug!("Exact match: {} -> {}", role, header);
                map.assign(role, &header, Tier::Exact, 1.0);
            }
        }
    }

    /// Tier 2. Greedy assignment of the best-scoring (role, header) pairs.
    fn resolve_fuzzy(&self, headers: &[String], map: &mut RoleMap, threshold: f64) {
        let claimed: HashSet<String> = map.claimed().into_iter().map(String::from).collect();

        let mut candidates: Vec<(f64, Role, &String)> = Vec::new();
        for role in Role::ALL.iter().filter(|r| !map.contains(**r)) {
            for header in headers.iter().filter(|h| !claimed.contains(h.as_str())) {
                let score = role
                    .fuzzy_patterns()
                    .iter()
                    .map(|pattern| self.similarity(header, pattern))
                    .fold(0.0, f64::max);
                if score >= threshold {
                    candidates.push((score, *role, header));
                }
            }
        }

        // stable: ties keep role order, then header order
        candidates.sort_by(|a, b| b.0.total_cmp(&a.0));

        let mut used: HashSet<&str> = HashSet::new();
        for (score, role, header) in candidates {
            if map.contains(role) || used.contains(header.as_str()) {
                continue;
            }
            info!("Fuzzy matched '{}' -> '{}' (confidence: {:.2})", role, header, score);
            map.assign(role, header, Tier::Fuzzy, score);
            used.insert(header.as_str());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_explicit_headers_resolve_in_tier_one() {
        let map = RoleResolver::default()
            .resolve(&headers(&["Source Field", "Target Field", "Transformation Logic"]))
            .unwrap();

        assert_eq!(map.get(Role::Source), Some("Source Field"));
        assert_eq!(map.get(Role::Target), Some("Target Field"));
        assert_eq!(map.get(Role::Transformation), Some("Transformation Logic"));
        assert!(map.iter().all(|(_, m)| m.tier == Tier::Exact));
    }

    #[test]
    fn test_pattern_order_beats_header_order() {
        // "input" precedes "original" in the source vocabulary
        let map = RoleResolver::default()
            .resolve(&headers(&["Original Name", "Input Column", "Target"]))
            .unwrap();
        assert_eq!(map.get(Role::Source), Some("Input Column"));
    }

    #[test]
    fn test_header_claimed_by_one_role_only() {
        let map = RoleResolver::default()
            .resolve(&headers(&["Source", "Target", "Rule"]))
            .unwrap();
        // "Rule" goes to transformation (earlier role) and is not reused
        assert_eq!(map.get(Role::Transformation), Some("Rule"));
        assert_eq!(map.get(Role::ConditionalMapping), None);
    }

    #[test]
    fn test_synonym_headers_need_fuzzy_tier() {
        let input = headers(&["Beginning", "Ending"]);
        let resolver = RoleResolver::default();

        let mut exact_only = RoleMap::default();
        resolver.resolve_exact(&input, &mut exact_only);
        assert_eq!(exact_only.get(Role::Source), Some("Beginning"));
        assert!(!exact_only.contains(Role::Target));

        let map = resolver.resolve(&input).unwrap();
        let target = map.get_match(Role::Target).unwrap();
        assert_eq!(target.column, "Ending");
        assert_eq!(target.tier, Tier::Fuzzy);
        assert!(target.score >= 0.6, "score was {}", target.score);
    }

    #[test]
    fn test_unresolvable_headers_error() {
        let err = RoleResolver::default()
            .resolve(&headers(&["123", "456"]))
            .unwrap_err();
        match err {
            QaError::UnresolvedRole { missing, available } => {
                assert_eq!(missing, vec!["source", "target"]);
                assert_eq!(available, vec!["123", "456"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_overrides_pin_roles() {
        let map = RoleResolver::default()
            .with_overrides(vec![
                (Role::Source, "123".to_string()),
                (Role::Target, "456".to_string()),
            ])
            .resolve(&headers(&["123", "456"]))
            .unwrap();
        assert_eq!(map.get_match(Role::Source).unwrap().tier, Tier::Override);

        let err = RoleResolver::default()
            .with_overrides(vec![(Role::Source, "nope".to_string())])
            .resolve(&headers(&["123"]));
        assert!(matches!(err, Err(QaError::Config(_))));
    }

    #[test]
    fn test_similarity_metrics() {
        assert_eq!(token_sort_ratio("end", "end"), 1.0);
        assert_eq!(token_sort_ratio("abc", ""), 0.0);
        assert!((token_sort_ratio("ending", "end") - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(token_sort_ratio("b a", "a b"), 1.0);
        assert_eq!(normalize_header("Target_Field-Name x"), "targetfieldnamex");

        let jw = RoleResolver::new(ResolverConfig {
            metric: SimilarityMetric::JaroWinkler,
            ..ResolverConfig::default()
        });
        assert!(jw.similarity("Destination", "dest") > 0.8);
    }
}
