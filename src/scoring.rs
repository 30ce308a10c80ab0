use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Criterion weights must sum to 100 within this tolerance.
pub const WEIGHT_SUM_TOLERANCE: f64 = 0.01;

/// One rubric criterion as seen by the scorer: its share of the total grade
/// and the percentage of the performance level the grader selected
/// (a level worth 3 of 4 max points carries 75.0).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CriterionScore {
    pub weight_percentage: f64,
    pub selected_level_percentage: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoreError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ScoreError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Round-half-away-from-zero to 2 decimal places:
/// `(100*x).round() / 100` (`f64::round` rounds halves away from zero).
pub fn round_to_2dp(x: f64) -> f64 {
    (100.0 * x).round() / 100.0
}

/// Percentage a performance level is worth, derived from its points against
/// the highest points among the criterion's levels. A criterion whose levels
/// carry no positive points yields 0.
pub fn level_percent(points: f64, max_points: f64) -> f64 {
    if max_points > 0.0 {
        100.0 * points / max_points
    } else {
        0.0
    }
}

/// Checks that weights sum to 100 within [`WEIGHT_SUM_TOLERANCE`] and returns
/// the actual total. An empty iterator sums to 0 and fails like any other
/// short total.
pub fn validate_weight_sum<I>(weights: I) -> Result<f64, ScoreError>
where
    I: IntoIterator<Item = f64>,
{
    let total: f64 = weights.into_iter().sum();
    if (total - 100.0).abs() > WEIGHT_SUM_TOLERANCE {
        return Err(ScoreError::new(
            "weight_sum_invalid",
            format!("criterion weights must sum to 100, got {}", total),
        )
        .with_details(serde_json::json!({ "totalWeight": total })));
    }
    Ok(total)
}

/// Marks one criterion contributes to the total:
/// `total_marks * (weight/100) * (level/100)`, unrounded.
pub fn weighted_contribution(total_marks: f64, criterion: &CriterionScore) -> f64 {
    total_marks * (criterion.weight_percentage / 100.0) * (criterion.selected_level_percentage / 100.0)
}

/// Computes the weighted rubric score for one graded response.
///
/// Validates only the weight-sum invariant; level percentages outside
/// [0, 100] and non-positive `total_marks` are caller errors and are
/// rejected where the data is authored, not here. The returned score is
/// rounded per [`round_to_2dp`] and lies in `[0, total_marks]` whenever
/// every selected level percentage lies in `[0, 100]`.
pub fn compute_rubric_score(
    total_marks: f64,
    criteria: &[CriterionScore],
) -> Result<f64, ScoreError> {
    validate_weight_sum(criteria.iter().map(|c| c.weight_percentage))?;

    let sum: f64 = criteria
        .iter()
        .map(|c| weighted_contribution(total_marks, c))
        .sum();
    Ok(round_to_2dp(sum))
}

pub fn compute_median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[(n / 2) - 1] + sorted[n / 2]) / 2.0
    }
}
