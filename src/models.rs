use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub type NdviHistory = BTreeMap<String, f64>;
pub type ActualIrrigationLog = BTreeMap<NaiveDate, BTreeMap<String, f64>>;

/// Which ndvi statistic drives the recommendation for a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum NdviDisplayMode {
    #[default]
    Average,
    P80,
}

impl From<String> for NdviDisplayMode {
    fn from(value: String) -> Self {
        if value.eq_ignore_ascii_case("p80") {
            NdviDisplayMode::P80
        } else {
            NdviDisplayMode::Average
        }
    }
}

/// Agronomic configuration of one block. Every field has a default so a
/// partial (or absent) file still resolves to a complete config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockConfig {
    pub block: String,
    pub crop: String,
    pub crop_stage: String,
    pub irrigation_type: String,
    pub application_rate_mm_hr: f64,
    pub efficiency: f64,
    pub soil_type: String,
    pub raw_mm_per_m: f64,
    pub ndvi_display_mode: NdviDisplayMode,
    pub features: serde_json::Map<String, serde_json::Value>,
    pub notes: Vec<String>,
}

pub const UNSPECIFIED_STAGE: &str = "unspecified";

impl Default for BlockConfig {
    fn default() -> Self {
        BlockConfig {
            block: String::new(),
            crop: "unknown".to_string(),
            crop_stage: UNSPECIFIED_STAGE.to_string(),
            irrigation_type: "unknown".to_string(),
            application_rate_mm_hr: 10.0,
            efficiency: 0.95,
            soil_type: "loam".to_string(),
            raw_mm_per_m: 55.0,
            ndvi_display_mode: NdviDisplayMode::Average,
            features: serde_json::Map::new(),
            notes: Vec::new(),
        }
    }
}

impl BlockConfig {
    pub fn for_block(block: &str) -> Self {
        BlockConfig {
            block: block.to_string(),
            ..BlockConfig::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VegetationIndexSummary {
    pub block: String,
    #[serde(default)]
    pub date: Option<NaiveDate>,
    #[serde(default)]
    pub ndvi: Option<f64>,
    #[serde(default)]
    pub ndvi_p80: Option<f64>,
    #[serde(default)]
    pub evi: Option<f64>,
    #[serde(default)]
    pub gndvi: Option<f64>,
    #[serde(default)]
    pub ndre: Option<f64>,
    #[serde(default = "full_confidence")]
    pub confidence_score: f64,
    #[serde(default)]
    pub fallback_used: bool,
}

fn full_confidence() -> f64 {
    100.0
}

impl VegetationIndexSummary {
    /// Confidence clamped into [0, 100]; NaN counts as no confidence.
    pub fn confidence(&self) -> f64 {
        if self.confidence_score.is_nan() {
            0.0
        } else {
            self.confidence_score.clamp(0.0, 100.0)
        }
    }

    /// The ndvi value selected by the block's display mode. P80 falls back to
    /// the mean when the provider did not report a percentile.
    pub fn selected_ndvi(&self, mode: NdviDisplayMode) -> Option<f64> {
        match (mode, self.ndvi_p80) {
            (NdviDisplayMode::P80, Some(p80)) => Some(p80),
            _ => self.ndvi,
        }
    }
}

pub const DEFAULT_ETO_MM: f64 = 5.5;
pub const DEFAULT_TEMP_MIN: f64 = 10.0;
pub const DEFAULT_TEMP_MAX: f64 = 30.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherRecord {
    pub date: NaiveDate,
    #[serde(default = "default_eto")]
    pub eto_estimated: f64,
    #[serde(default)]
    pub precip_mm: f64,
    #[serde(default)]
    pub rain_yesterday: f64,
    #[serde(default)]
    pub rain_forecast: f64,
    #[serde(default = "default_temp_min")]
    pub temp_min: f64,
    #[serde(default = "default_temp_max")]
    pub temp_max: f64,
}

fn default_eto() -> f64 {
    DEFAULT_ETO_MM
}

fn default_temp_min() -> f64 {
    DEFAULT_TEMP_MIN
}

fn default_temp_max() -> f64 {
    DEFAULT_TEMP_MAX
}

impl WeatherRecord {
    /// Constants used for the whole run when the weather provider fails.
    pub fn fallback(date: NaiveDate) -> Self {
        WeatherRecord {
            date,
            eto_estimated: DEFAULT_ETO_MM,
            precip_mm: 0.0,
            rain_yesterday: 0.0,
            rain_forecast: 0.0,
            temp_min: DEFAULT_TEMP_MIN,
            temp_max: DEFAULT_TEMP_MAX,
        }
    }

    pub fn rain_72h(&self) -> f64 {
        self.rain_yesterday + self.precip_mm + self.rain_forecast
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexWeights {
    pub ndvi: f64,
    pub evi: f64,
    pub gndvi: f64,
    pub ndre: f64,
}

impl IndexWeights {
    pub const NDVI_ONLY: IndexWeights = IndexWeights {
        ndvi: 1.0,
        evi: 0.0,
        gndvi: 0.0,
        ndre: 0.0,
    };
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default)]
    pub default_index_weights: BTreeMap<String, IndexWeights>,
    #[serde(default = "enabled")]
    pub rain_override_enabled: bool,
    #[serde(default = "enabled")]
    pub auto_sync_dashboard: bool,
}

fn enabled() -> bool {
    true
}

impl Default for GlobalConfig {
    fn default() -> Self {
        GlobalConfig {
            default_index_weights: BTreeMap::new(),
            rain_override_enabled: true,
            auto_sync_dashboard: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KcComponents {
    pub crop_class: String,
    pub weights: IndexWeights,
    pub raw_kc: f64,
    pub multiplier: f64,
    pub cap: f64,
    pub final_kc: f64,
}

/// One block's recommendation for one day. Written once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendationRecord {
    pub block: String,
    pub date: NaiveDate,
    pub ndvi: f64,
    pub ndvi_avg: Option<f64>,
    pub ndvi_p80: Option<f64>,
    pub ndvi_display_mode: NdviDisplayMode,
    pub evi: f64,
    pub gndvi: f64,
    pub ndre: f64,
    pub kc: f64,
    pub kc_components: KcComponents,
    pub eto: f64,
    pub etc: f64,
    pub etc_adjusted: f64,
    pub efficiency: f64,
    pub irrigation_type: String,
    pub application_rate_mm_hr: f64,
    pub irrigation_mm: f64,
    pub irrigation_minutes: Option<f64>,
    pub confidence_score: f64,
    pub fallback_used: bool,
    pub rain_mm: f64,
    pub effective_rain_mm: f64,
    pub rain_72h_mm: f64,
    pub crop: String,
    pub crop_stage: String,
    pub soil_type: String,
    pub raw_mm_per_m: f64,
    pub features: serde_json::Map<String, serde_json::Value>,
    pub notes: Vec<String>,
    pub priority_score: f64,
    pub ndvi_change: f64,
    pub stress_flag: bool,
    pub split_recommended: bool,
    pub split_into: Vec<f64>,
    pub actual_irrigation_mm: Option<f64>,
    pub irrigation_gap: Option<f64>,
    pub explanation: String,
}
