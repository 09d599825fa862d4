use std::cmp::Ordering;

use crate::models::RecommendationRecord;
use crate::policy::round_to;

pub const STRESS_DROP_PCT: f64 = -10.0;

/// Confidence-weighted crop demand. Uses the pre-rain, pre-efficiency ETc so
/// ranking follows crop need rather than today's rain or system losses.
pub fn priority_score(etc: f64, confidence: f64) -> f64 {
    round_to(etc * confidence / 100.0, 2)
}

/// Percent change of ndvi against the last recorded value, zero when there is
/// no usable prior reading.
pub fn ndvi_change_pct(ndvi: Option<f64>, last_ndvi: Option<f64>) -> f64 {
    match (ndvi, last_ndvi) {
        (Some(current), Some(last)) if last != 0.0 && last.is_finite() => {
            round_to((current - last) / last * 100.0, 1)
        }
        _ => 0.0,
    }
}

pub fn is_stressed(change_pct: f64) -> bool {
    change_pct <= STRESS_DROP_PCT
}

/// Applied minus recommended; informational only.
pub fn irrigation_gap(actual_mm: Option<f64>, recommended_mm: f64) -> Option<f64> {
    actual_mm.map(|actual| round_to(actual - recommended_mm, 2))
}

/// Records ordered by descending priority, ties by block id.
pub fn rank_by_priority(records: &[RecommendationRecord]) -> Vec<&RecommendationRecord> {
    let mut ranked: Vec<&RecommendationRecord> = records.iter().collect();
    ranked.sort_by(|a, b| {
        b.priority_score
            .partial_cmp(&a.priority_score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.block.cmp(&b.block))
    });
    ranked
}
