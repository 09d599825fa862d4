use std::collections::BTreeMap;

use crate::models::IndexWeights;

/// Scaling applied to the index-weighted kc for a family of crops.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CropClassPolicy {
    pub name: &'static str,
    pub crops: &'static [&'static str],
    pub multiplier: f64,
    pub cap: f64,
}

pub const CROP_CLASSES: &[CropClassPolicy] = &[
    CropClassPolicy {
        name: "high-value-annual",
        crops: &["beans", "broccoli"],
        multiplier: 1.25,
        cap: 1.25,
    },
    CropClassPolicy {
        name: "perennial-fruit",
        crops: &["citrus", "grapes", "almonds"],
        multiplier: 1.10,
        cap: 1.20,
    },
];

pub const DEFAULT_CROP_CLASS: CropClassPolicy = CropClassPolicy {
    name: "default",
    crops: &[],
    multiplier: 1.25,
    cap: 1.20,
};

pub fn crop_class(crop: &str) -> &'static CropClassPolicy {
    CROP_CLASSES
        .iter()
        .find(|class| class.crops.iter().any(|c| c.eq_ignore_ascii_case(crop)))
        .unwrap_or(&DEFAULT_CROP_CLASS)
}

/// Weight vector for a crop: its own entry, then the table's "default"
/// entry, then ndvi alone.
pub fn index_weights(table: &BTreeMap<String, IndexWeights>, crop: &str) -> IndexWeights {
    table
        .get(crop)
        .or_else(|| table.get("default"))
        .copied()
        .unwrap_or(IndexWeights::NDVI_ONLY)
}

pub const SPLIT_THREE_ABOVE_MINUTES: f64 = 30.0;
pub const SPLIT_TWO_ABOVE_MINUTES: f64 = 15.0;

/// Number of equal pulses a run of `minutes` should be divided into.
/// Thresholds are strict: exactly 15 or 30 minutes stays in the lower tier.
pub fn split_count(minutes: Option<f64>) -> usize {
    match minutes {
        Some(m) if m > SPLIT_THREE_ABOVE_MINUTES => 3,
        Some(m) if m > SPLIT_TWO_ABOVE_MINUTES => 2,
        _ => 1,
    }
}

/// Equal pulse durations for a run, empty when no split applies.
pub fn split_schedule(minutes: Option<f64>) -> Vec<f64> {
    let count = split_count(minutes);
    match minutes {
        Some(m) if count > 1 => vec![round_to(m / count as f64, 1); count],
        _ => Vec::new(),
    }
}

/// Rounds half away from zero to `places` decimals.
pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}
