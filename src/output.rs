use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, warn};

use crate::error::{AdvisorError, Result};
use crate::layout::{write_json_atomic, DataLayout, BLOCK_OUTPUT_SUFFIX};
use crate::models::RecommendationRecord;

pub const CSV_HEADER: [&str; 10] = [
    "block",
    "date",
    "ndvi",
    "kc",
    "eto",
    "irrigation_mm",
    "irrigation_minutes",
    "confidence",
    "efficiency",
    "rain_mm",
];

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WrittenOutputs {
    pub block_files: Vec<PathBuf>,
    pub summary_csv: Option<PathBuf>,
    pub dashboard_json: Option<PathBuf>,
    pub mirror: Option<PathBuf>,
    /// Per-block files from an earlier run of the same date whose block
    /// produced no record this time.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub removed: Vec<PathBuf>,
}

/// Serializes a run's records to the artifacts downstream readers consume.
pub struct OutputAssembler<'a> {
    layout: &'a DataLayout,
}

impl<'a> OutputAssembler<'a> {
    pub fn new(layout: &'a DataLayout) -> Self {
        OutputAssembler { layout }
    }

    /// Writes per-block files, the CSV and the dashboard array. A failed
    /// mirror copy is returned as a warning; primary artifacts are already
    /// on disk by then.
    pub fn write_all(
        &self,
        records: &[RecommendationRecord],
        mirror_enabled: bool,
    ) -> Result<(WrittenOutputs, Option<AdvisorError>)> {
        let dir = self.layout.output_dir();
        fs::create_dir_all(&dir).map_err(|e| AdvisorError::io(&dir, e))?;

        let mut written = WrittenOutputs::default();
        for record in records {
            let path = self.layout.block_output(&record.block);
            write_json_atomic(&path, record)?;
            written.block_files.push(path);
        }
        written.removed = self.prune_block_files(records)?;

        let csv_path = self.layout.summary_csv();
        write_summary_csv(&csv_path, records)?;
        written.summary_csv = Some(csv_path);

        let dashboard = self.layout.dashboard_json();
        write_json_atomic(&dashboard, records)?;
        info!(path = %dashboard.display(), blocks = records.len(), "dashboard JSON saved");
        written.dashboard_json = Some(dashboard.clone());

        let mut degraded = None;
        if mirror_enabled {
            let mirror = self.layout.dashboard_mirror();
            match mirror_file(&dashboard, &mirror) {
                Ok(()) => {
                    info!(path = %mirror.display(), "dashboard data synced");
                    written.mirror = Some(mirror);
                }
                Err(reason) => {
                    warn!(path = %mirror.display(), %reason, "dashboard sync failed");
                    degraded = Some(AdvisorError::PersistenceDegraded {
                        path: mirror,
                        reason,
                    });
                }
            }
        }

        Ok((written, degraded))
    }

    /// Deletes `<block>_irrigation.json` files left in the date's output
    /// directory for blocks absent from `records`.
    fn prune_block_files(&self, records: &[RecommendationRecord]) -> Result<Vec<PathBuf>> {
        let dir = self.layout.output_dir();
        let dashboard = self.layout.dashboard_json();
        let current: BTreeSet<&str> = records.iter().map(|r| r.block.as_str()).collect();

        let mut removed = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|e| AdvisorError::io(&dir, e))? {
            let path = entry.map_err(|e| AdvisorError::io(&dir, e))?.path();
            if path == dashboard {
                continue;
            }
            let Some(block) = path
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(|name| name.strip_suffix(BLOCK_OUTPUT_SUFFIX))
            else {
                continue;
            };
            if current.contains(block) {
                continue;
            }
            fs::remove_file(&path).map_err(|e| AdvisorError::io(&path, e))?;
            info!(block, path = %path.display(), "stale block output removed");
            removed.push(path);
        }
        Ok(removed)
    }
}

fn mirror_file(source: &Path, target: &Path) -> std::result::Result<(), String> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(|e| e.to_string())?;
    }
    fs::copy(source, target).map(|_| ()).map_err(|e| e.to_string())
}

fn write_summary_csv(path: &Path, records: &[RecommendationRecord]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(CSV_HEADER)?;
    for record in records {
        writer.write_record([
            record.block.clone(),
            record.date.to_string(),
            record.ndvi.to_string(),
            record.kc.to_string(),
            record.eto.to_string(),
            record.irrigation_mm.to_string(),
            record
                .irrigation_minutes
                .map(|m| m.to_string())
                .unwrap_or_default(),
            record.confidence_score.to_string(),
            record.efficiency.to_string(),
            record.rain_mm.to_string(),
        ])?;
    }
    writer.flush().map_err(|e| AdvisorError::io(path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::{citrus_inputs, context, run_date};
    use crate::engine::recommend;
    use crate::error::IssueKind;

    fn records() -> Vec<RecommendationRecord> {
        let ctx = context(2.0, true);
        let first = recommend(&ctx, &citrus_inputs()).unwrap();
        let mut inputs = citrus_inputs();
        inputs.config.block = "B2".to_string();
        inputs.config.application_rate_mm_hr = 0.0;
        let second = recommend(&ctx, &inputs).unwrap();
        vec![first, second]
    }

    #[test]
    fn writes_every_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let layout = DataLayout::new(dir.path(), run_date());
        let (written, degraded) = OutputAssembler::new(&layout)
            .write_all(&records(), true)
            .unwrap();

        assert!(degraded.is_none());
        assert_eq!(written.block_files.len(), 2);
        assert!(layout.block_output("A1").exists());
        assert!(layout.dashboard_mirror().exists());

        let raw = fs::read_to_string(layout.block_output("A1")).unwrap();
        let parsed: RecommendationRecord = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.irrigation_mm, 1.82);

        let dashboard = fs::read_to_string(layout.dashboard_json()).unwrap();
        let all: Vec<RecommendationRecord> = serde_json::from_str(&dashboard).unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn csv_has_header_and_blank_minutes_for_null() {
        let dir = tempfile::tempdir().unwrap();
        let layout = DataLayout::new(dir.path(), run_date());
        OutputAssembler::new(&layout)
            .write_all(&records(), false)
            .unwrap();

        let csv = fs::read_to_string(layout.summary_csv()).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(
            lines[0],
            "block,date,ndvi,kc,eto,irrigation_mm,irrigation_minutes,confidence,efficiency,rain_mm"
        );
        assert_eq!(lines[1], "A1,2025-05-17,0.6,0.66,5.5,1.82,10.9,100,0.95,2");
        assert_eq!(lines[2], "B2,2025-05-17,0.6,0.66,5.5,1.82,,100,0.95,2");
        assert!(!layout.dashboard_mirror().exists());
    }

    #[test]
    fn rerun_removes_outputs_of_blocks_without_a_record() {
        let dir = tempfile::tempdir().unwrap();
        let layout = DataLayout::new(dir.path(), run_date());
        let assembler = OutputAssembler::new(&layout);
        let all = records();
        assembler.write_all(&all, false).unwrap();
        assert!(layout.block_output("B2").exists());

        let (written, _) = assembler.write_all(&all[..1], false).unwrap();
        assert!(layout.block_output("A1").exists());
        assert!(!layout.block_output("B2").exists());
        assert!(layout.dashboard_json().exists());
        assert_eq!(written.removed, vec![layout.block_output("B2")]);
    }

    #[test]
    fn mirror_failure_is_only_a_warning() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not_a_dir");
        fs::write(&blocker, "file in the way").unwrap();
        let layout = DataLayout::new(dir.path(), run_date())
            .with_mirror(Some(blocker.join("block_irrigation.json")));

        let (written, degraded) = OutputAssembler::new(&layout)
            .write_all(&records(), true)
            .unwrap();
        assert_eq!(
            degraded.map(|e| e.kind()),
            Some(IssueKind::PersistenceDegraded)
        );
        assert!(written.mirror.is_none());
        assert!(layout.dashboard_json().exists());
    }
}
