//! Boundary readers for the materialized provider outputs: vegetation-index
//! summaries, the weather window and the operator ETo override.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use tracing::{debug, warn};

use crate::error::{AdvisorError, Result};
use crate::layout::{DataLayout, SUMMARY_SUFFIX};
use crate::models::{VegetationIndexSummary, WeatherRecord};

const INDEX_PROVIDER: &str = "vegetation index";
const WEATHER_PROVIDER: &str = "weather";

/// Reads every `<block>_summary.json` for the run date, sorted by file name.
/// Unreadable files are skipped and reported; a missing directory yields an
/// empty set.
pub fn load_index_summaries(
    layout: &DataLayout,
) -> (Vec<VegetationIndexSummary>, Vec<AdvisorError>) {
    let dir = layout.index_dir();
    let mut issues = Vec::new();

    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(path = %dir.display(), error = %err, "no vegetation index summaries for run date");
            issues.push(AdvisorError::ProviderDataUnavailable {
                provider: INDEX_PROVIDER,
                reason: format!("{}: {err}", dir.display()),
            });
            return (Vec::new(), issues);
        }
    };

    let mut paths: Vec<_> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.ends_with(SUMMARY_SUFFIX))
        })
        .collect();
    paths.sort();

    let mut summaries: Vec<VegetationIndexSummary> = Vec::with_capacity(paths.len());
    for path in paths {
        match read_summary(&path) {
            Ok(summary) if summaries.iter().any(|s| s.block == summary.block) => {
                warn!(block = %summary.block, path = %path.display(), "duplicate index summary ignored");
                issues.push(AdvisorError::ProviderDataUnavailable {
                    provider: INDEX_PROVIDER,
                    reason: format!("duplicate summary for block {} in {}", summary.block, path.display()),
                });
            }
            Ok(summary) => summaries.push(summary),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "skipping unreadable index summary");
                issues.push(AdvisorError::ProviderDataUnavailable {
                    provider: INDEX_PROVIDER,
                    reason: err.to_string(),
                });
            }
        }
    }

    debug!(count = summaries.len(), "loaded vegetation index summaries");
    (summaries, issues)
}

fn read_summary(path: &Path) -> Result<VegetationIndexSummary> {
    let raw = fs::read_to_string(path).map_err(|e| AdvisorError::io(path, e))?;
    serde_json::from_str(&raw).map_err(|e| AdvisorError::json(path, e))
}

/// Today's weather record, or the fallback constants when the file is
/// missing, unparseable, or has no entry for the run date.
pub fn load_weather(layout: &DataLayout) -> (WeatherRecord, Option<AdvisorError>) {
    let path = layout.weather_file();
    let date = layout.date();

    let window: Result<Vec<WeatherRecord>> = fs::read_to_string(&path)
        .map_err(|e| AdvisorError::io(&path, e))
        .and_then(|raw| serde_json::from_str(&raw).map_err(|e| AdvisorError::json(&path, e)));

    let reason = match window {
        Ok(records) => match records.into_iter().find(|r| r.date == date) {
            Some(record) => return (record, None),
            None => format!("{} has no entry for {date}", path.display()),
        },
        Err(err) => err.to_string(),
    };

    warn!(%reason, "weather load failed, falling back to ETo 5.5 mm and no rain");
    (
        WeatherRecord::fallback(date),
        Some(AdvisorError::ProviderDataUnavailable {
            provider: WEATHER_PROVIDER,
            reason,
        }),
    )
}

pub fn parse_eto_override(raw: &str) -> Result<f64> {
    let trimmed = raw.trim();
    let invalid = |reason: &str| AdvisorError::OverrideInvalid {
        value: trimmed.to_string(),
        reason: reason.to_string(),
    };
    let value: f64 = trimmed.parse().map_err(|_| invalid("not a number"))?;
    if !value.is_finite() || value < 0.0 {
        return Err(invalid("must be a finite, non-negative number of mm"));
    }
    Ok(value)
}

/// Raw contents of the side-channel override file, if one exists.
pub fn read_eto_override_file(layout: &DataLayout) -> Result<Option<String>> {
    let path = layout.eto_override_file();
    match fs::read_to_string(&path) {
        Ok(raw) => Ok(Some(raw)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(AdvisorError::OverrideInvalid {
            value: path.display().to_string(),
            reason: err.to_string(),
        }),
    }
}
