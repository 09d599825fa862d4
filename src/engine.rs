use std::collections::BTreeMap;

use chrono::NaiveDate;

use crate::error::{AdvisorError, Result};
use crate::models::{
    BlockConfig, GlobalConfig, IndexWeights, KcComponents, RecommendationRecord,
    VegetationIndexSummary, WeatherRecord, UNSPECIFIED_STAGE,
};
use crate::policy::{self, round_to};
use crate::ranking;

/// Inputs shared by every block of one run.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub date: NaiveDate,
    pub weather: WeatherRecord,
    /// ETo used for the run, after any operator override.
    pub eto: f64,
    pub global: GlobalConfig,
}

/// Everything one block needs besides the run context. Owned so a block can
/// be evaluated on its own task.
#[derive(Debug, Clone)]
pub struct BlockInputs {
    pub config: BlockConfig,
    pub summary: VegetationIndexSummary,
    pub last_ndvi: Option<f64>,
    pub actual_mm: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexValues {
    pub ndvi: f64,
    pub evi: f64,
    pub gndvi: f64,
    pub ndre: f64,
}

pub fn crop_coefficient(
    values: IndexValues,
    crop: &str,
    weight_table: &BTreeMap<String, IndexWeights>,
) -> KcComponents {
    let weights = policy::index_weights(weight_table, crop);
    let raw_kc = values.ndvi * weights.ndvi
        + values.evi * weights.evi
        + values.gndvi * weights.gndvi
        + values.ndre * weights.ndre;
    let class = policy::crop_class(crop);
    let final_kc = round_to(raw_kc * class.multiplier, 3).min(class.cap);

    KcComponents {
        crop_class: class.name.to_string(),
        weights,
        raw_kc: round_to(raw_kc, 3),
        multiplier: class.multiplier,
        cap: class.cap,
        final_kc,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WaterBalance {
    pub etc: f64,
    pub etc_adjusted: f64,
    pub effective_rain_mm: f64,
    pub irrigation_mm: f64,
    pub irrigation_minutes: Option<f64>,
}

pub fn water_balance(
    kc: f64,
    eto: f64,
    efficiency: f64,
    precip_mm: f64,
    rain_override_enabled: bool,
    application_rate_mm_hr: f64,
) -> WaterBalance {
    let etc = round_to(kc * eto, 2);
    let etc_adjusted = round_to(etc / efficiency, 2);
    let effective_rain_mm = if rain_override_enabled {
        precip_mm.max(0.0).min(etc_adjusted)
    } else {
        0.0
    };
    let irrigation_mm = round_to((etc_adjusted - effective_rain_mm).max(0.0), 2);
    let irrigation_minutes = (application_rate_mm_hr > 0.0 && application_rate_mm_hr.is_finite())
        .then(|| round_to(irrigation_mm / application_rate_mm_hr * 60.0, 1));

    WaterBalance {
        etc,
        etc_adjusted,
        effective_rain_mm,
        irrigation_mm,
        irrigation_minutes,
    }
}

pub fn explanation(eto: f64, ndvi_change: f64, crop_stage: &str, effective_rain_mm: f64) -> String {
    let mut parts = vec![
        format!("ETo = {eto:?} mm"),
        format!("NDVI change: {ndvi_change}%"),
    ];
    if crop_stage != UNSPECIFIED_STAGE {
        parts.push(format!("Crop stage: {crop_stage}"));
    }
    if effective_rain_mm > 0.0 {
        parts.push(format!("Rainfall override applied ({effective_rain_mm} mm)"));
    } else {
        parts.push("No rainfall applied".to_string());
    }
    parts.join(" | ")
}

/// Runs the full decision pipeline for one block.
pub fn recommend(ctx: &RunContext, inputs: &BlockInputs) -> Result<RecommendationRecord> {
    let config = &inputs.config;
    let summary = &inputs.summary;
    let block = config.block.as_str();

    if !(config.efficiency > 0.0 && config.efficiency.is_finite()) {
        return Err(AdvisorError::ConfigurationInvalid {
            block: block.to_string(),
            reason: format!("efficiency must be positive, got {}", config.efficiency),
        });
    }

    let ndvi = summary
        .selected_ndvi(config.ndvi_display_mode)
        .ok_or_else(|| AdvisorError::ProviderDataUnavailable {
            provider: "vegetation index",
            reason: format!("summary for block {block} has no ndvi value"),
        })?;
    let values = IndexValues {
        ndvi,
        evi: summary.evi.unwrap_or(ndvi),
        gndvi: summary.gndvi.unwrap_or(ndvi),
        ndre: summary.ndre.unwrap_or(ndvi),
    };

    let kc_components = crop_coefficient(values, &config.crop, &ctx.global.default_index_weights);
    let kc = kc_components.final_kc;
    let balance = water_balance(
        kc,
        ctx.eto,
        config.efficiency,
        ctx.weather.precip_mm,
        ctx.global.rain_override_enabled,
        config.application_rate_mm_hr,
    );

    let split_into = policy::split_schedule(balance.irrigation_minutes);
    let confidence = summary.confidence();
    let ndvi_change = ranking::ndvi_change_pct(Some(ndvi), inputs.last_ndvi);

    Ok(RecommendationRecord {
        block: block.to_string(),
        date: ctx.date,
        ndvi,
        ndvi_avg: summary.ndvi,
        ndvi_p80: summary.ndvi_p80,
        ndvi_display_mode: config.ndvi_display_mode,
        evi: values.evi,
        gndvi: values.gndvi,
        ndre: values.ndre,
        kc,
        kc_components,
        eto: ctx.eto,
        etc: balance.etc,
        etc_adjusted: balance.etc_adjusted,
        efficiency: config.efficiency,
        irrigation_type: config.irrigation_type.clone(),
        application_rate_mm_hr: config.application_rate_mm_hr,
        irrigation_mm: balance.irrigation_mm,
        irrigation_minutes: balance.irrigation_minutes,
        confidence_score: confidence,
        fallback_used: summary.fallback_used,
        rain_mm: ctx.weather.precip_mm,
        effective_rain_mm: balance.effective_rain_mm,
        rain_72h_mm: round_to(ctx.weather.rain_72h(), 2),
        crop: config.crop.clone(),
        crop_stage: config.crop_stage.clone(),
        soil_type: config.soil_type.clone(),
        raw_mm_per_m: config.raw_mm_per_m,
        features: config.features.clone(),
        notes: config.notes.clone(),
        priority_score: ranking::priority_score(balance.etc, confidence),
        ndvi_change,
        stress_flag: ranking::is_stressed(ndvi_change),
        split_recommended: !split_into.is_empty(),
        split_into,
        actual_irrigation_mm: inputs.actual_mm,
        irrigation_gap: ranking::irrigation_gap(inputs.actual_mm, balance.irrigation_mm),
        explanation: explanation(
            ctx.eto,
            ndvi_change,
            &config.crop_stage,
            balance.effective_rain_mm,
        ),
    })
}
