use std::fmt::Write;
use std::fs;
use std::path::Path;

use chrono::NaiveDate;

use crate::error::{AdvisorError, Result};
use crate::models::RecommendationRecord;
use crate::ranking;

pub fn load_dashboard(path: &Path) -> Result<Vec<RecommendationRecord>> {
    let raw = fs::read_to_string(path).map_err(|e| AdvisorError::io(path, e))?;
    serde_json::from_str(&raw).map_err(|e| AdvisorError::json(path, e))
}

pub fn build_report(date: NaiveDate, records: &[RecommendationRecord], limit: usize) -> String {
    let ranked = ranking::rank_by_priority(records);
    let total_mm: f64 = records.iter().map(|r| r.irrigation_mm).sum();

    let mut output = String::new();
    let _ = writeln!(output, "# Irrigation Recommendations");
    let _ = writeln!(
        output,
        "Generated for {} ({} blocks, {:.2} mm recommended in total)",
        date,
        records.len(),
        total_mm
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Highest Priority Blocks");

    if ranked.is_empty() {
        let _ = writeln!(output, "No recommendations recorded for this date.");
    } else {
        for record in ranked.iter().take(limit) {
            let minutes = record
                .irrigation_minutes
                .map(|m| format!("{m:.1} min"))
                .unwrap_or_else(|| "no application rate".to_string());
            let _ = writeln!(
                output,
                "- {} ({}, {}) priority {:.2}: {:.2} mm, {} (confidence {:.0})",
                record.block,
                record.crop,
                record.crop_stage,
                record.priority_score,
                record.irrigation_mm,
                minutes,
                record.confidence_score
            );
        }
    }

    let stressed: Vec<_> = ranked.iter().filter(|r| r.stress_flag).collect();
    let _ = writeln!(output);
    let _ = writeln!(output, "## Vegetation Stress");

    if stressed.is_empty() {
        let _ = writeln!(output, "No blocks dropped 10% or more in ndvi.");
    } else {
        for record in stressed {
            let _ = writeln!(
                output,
                "- {}: ndvi {:.3} ({:+.1}%)",
                record.block, record.ndvi, record.ndvi_change
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Split Schedules");
    let split: Vec<_> = ranked.iter().filter(|r| r.split_recommended).collect();

    if split.is_empty() {
        let _ = writeln!(output, "No runs long enough to split.");
    } else {
        for record in split {
            let pulses: Vec<String> = record.split_into.iter().map(|m| format!("{m:.1}")).collect();
            let _ = writeln!(
                output,
                "- {}: {} pulses of {} min",
                record.block,
                record.split_into.len(),
                pulses.join(" / ")
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Applied vs Recommended");
    let reported: Vec<_> = ranked
        .iter()
        .filter_map(|r| r.actual_irrigation_mm.zip(r.irrigation_gap).map(|v| (r, v)))
        .collect();

    if reported.is_empty() {
        let _ = writeln!(output, "No applications reported for this date.");
    } else {
        for (record, (actual, gap)) in reported {
            let _ = writeln!(
                output,
                "- {}: applied {:.2} mm vs {:.2} mm recommended (gap {:+.2} mm)",
                record.block, actual, record.irrigation_mm, gap
            );
        }
    }

    output
}
