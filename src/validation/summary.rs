//! Aggregates over a run's rule results.

use super::{round2, Dimension, RuleResult};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DimensionScore {
    pub dimension: Dimension,
    pub rules: usize,
    pub mean_passed_score: f64,
}

/// Headline numbers for a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Kpis {
    pub total_rules: usize,
    /// Rules with no failed rows.
    pub clean_rules: usize,
    pub columns: usize,
    pub average_score: f64,
}

fn mean(scores: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = scores.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        0.0
    } else {
        round2(sum / n as f64)
    }
}

/// Mean passed score per dimension, for dimensions that have results.
pub fn dimension_scores(results: &[RuleResult]) -> Vec<DimensionScore> {
    Dimension::ALL
        .iter()
        .filter_map(|dimension| {
            let scores: Vec<f64> = results
                .iter()
                .filter(|r| r.dimension == *dimension)
                .map(|r| r.passed_score)
                .collect();
            (!scores.is_empty()).then(|| DimensionScore {
                dimension: *dimension,
                rules: scores.len(),
                mean_passed_score: mean(scores.into_iter()),
            })
        })
        .collect()
}

pub fn kpis(results: &[RuleResult]) -> Kpis {
    let mut columns: Vec<&str> = results.iter().map(|r| r.column_name.as_str()).collect();
    columns.sort_unstable();
    columns.dedup();

    Kpis {
        total_rules: results.len(),
        clean_rules: results.iter().filter(|r| r.failed_count == 0).count(),
        columns: columns.len(),
        average_score: mean(results.iter().map(|r| r.passed_score)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dimension_means_and_kpis() {
        let results = vec![
            RuleResult::scored("a", "r1", "R1", Dimension::Completeness, 9, 1),
            RuleResult::scored("b", "r1", "R1", Dimension::Completeness, 10, 0),
            RuleResult::scored("a", "r2", "R2", Dimension::Accuracy, 1, 3),
        ];

        let scores = dimension_scores(&results);
        assert_eq!(scores.len(), 2);
        assert_eq!(scores[0].dimension, Dimension::Completeness);
        assert_eq!(scores[0].mean_passed_score, 95.0);
        assert_eq!(scores[1].mean_passed_score, 25.0);

        let k = kpis(&results);
        assert_eq!(k.total_rules, 3);
        assert_eq!(k.clean_rules, 1);
        assert_eq!(k.columns, 2);
        assert_eq!(k.average_score, 71.67);
    }

    #[test]
    fn test_empty_results() {
        assert!(dimension_scores(&[]).is_empty());
        assert_eq!(kpis(&[]).average_score, 0.0);
    }
}
