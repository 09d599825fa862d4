use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ConfigStore;
use crate::engine::{self, BlockInputs, RunContext};
use crate::error::{AdvisorError, Result, RunIssue};
use crate::history::{HistorySnapshot, HistoryStore};
use crate::layout::{write_json_atomic, DataLayout};
use crate::models::RecommendationRecord;
use crate::output::{OutputAssembler, WrittenOutputs};
use crate::providers;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Init,
    LoadInputs,
    PerBlockCompute,
    PersistHistory,
    AssembleOutputs,
    Done,
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Raw operator ETo override; takes precedence over the weather value
    /// for every block when it parses.
    pub eto_override: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub date: NaiveDate,
    pub eto: f64,
    pub eto_override_applied: bool,
    pub weather_fallback: bool,
    pub blocks_processed: usize,
    pub blocks_failed: usize,
    pub warnings: Vec<RunIssue>,
    pub errors: Vec<RunIssue>,
    pub outputs: WrittenOutputs,
}

impl RunSummary {
    pub fn succeeded(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub summary: RunSummary,
    pub records: Vec<RecommendationRecord>,
}

struct LoadedInputs {
    ctx: RunContext,
    snapshot: HistorySnapshot,
    blocks: Vec<BlockInputs>,
    eto_override_applied: bool,
    weather_fallback: bool,
}

type BlockEvaluator = fn(&RunContext, &BlockInputs) -> Result<RecommendationRecord>;

struct Pipeline<'a> {
    layout: &'a DataLayout,
    state: RunState,
    run_id: Uuid,
    warnings: Vec<RunIssue>,
    errors: Vec<RunIssue>,
}

/// Executes one daily pass over every block with an index summary. Only a
/// failure to write the primary output artifacts is returned as an error;
/// everything else is scoped to a block or downgraded to a warning.
pub async fn run(layout: &DataLayout, options: RunOptions) -> Result<RunOutcome> {
    let mut pipeline = Pipeline {
        layout,
        state: RunState::Init,
        run_id: Uuid::new_v4(),
        warnings: Vec::new(),
        errors: Vec::new(),
    };
    info!(run_id = %pipeline.run_id, date = %layout.date(), "irrigation run started");

    pipeline.advance(RunState::LoadInputs);
    let inputs = pipeline.load_inputs(&options);

    pipeline.advance(RunState::PerBlockCompute);
    let ctx = Arc::new(inputs.ctx);
    let (records, updates) = pipeline
        .compute(Arc::clone(&ctx), inputs.blocks, engine::recommend)
        .await;

    pipeline.advance(RunState::PersistHistory);
    if let Err(err) = HistoryStore::new(layout).commit_ndvi(&inputs.snapshot.ndvi, &updates) {
        warn!(error = %err, "ndvi history not persisted");
        pipeline.warnings.push(err.into_issue(None));
    }

    pipeline.advance(RunState::AssembleOutputs);
    let (outputs, degraded) =
        OutputAssembler::new(layout).write_all(&records, ctx.global.auto_sync_dashboard)?;
    if let Some(err) = degraded {
        pipeline.warnings.push(err.into_issue(None));
    }

    pipeline.advance(RunState::Done);
    let summary = RunSummary {
        run_id: pipeline.run_id,
        date: ctx.date,
        eto: ctx.eto,
        eto_override_applied: inputs.eto_override_applied,
        weather_fallback: inputs.weather_fallback,
        blocks_processed: records.len(),
        blocks_failed: pipeline.errors.len(),
        warnings: pipeline.warnings,
        errors: pipeline.errors,
        outputs,
    };
    if let Err(err) = write_json_atomic(&layout.run_summary(), &summary) {
        warn!(error = %err, "run summary not written");
    }
    info!(
        run_id = %summary.run_id,
        processed = summary.blocks_processed,
        failed = summary.blocks_failed,
        warnings = summary.warnings.len(),
        "irrigation run complete"
    );

    Ok(RunOutcome { summary, records })
}

impl<'a> Pipeline<'a> {
    fn advance(&mut self, next: RunState) {
        debug!(run_id = %self.run_id, from = ?self.state, to = ?next, "pipeline transition");
        self.state = next;
    }

    fn record_warning(&mut self, issue: Option<AdvisorError>, block: Option<&str>) {
        if let Some(err) = issue {
            self.warnings.push(err.into_issue(block));
        }
    }

    fn load_inputs(&mut self, options: &RunOptions) -> LoadedInputs {
        let layout = self.layout;
        let configs = ConfigStore::new(layout);

        let (global, issue) = configs.global_config();
        self.record_warning(issue, None);

        let (weather, issue) = providers::load_weather(layout);
        let weather_fallback = issue.is_some();
        self.record_warning(issue, None);

        let mut eto = weather.eto_estimated;
        let mut eto_override_applied = false;
        if let Some(raw) = &options.eto_override {
            match providers::parse_eto_override(raw) {
                Ok(value) => {
                    warn!(eto = value, "ETo override active");
                    eto = value;
                    eto_override_applied = true;
                }
                Err(err) => {
                    warn!(error = %err, eto, "ETo override unreadable, using weather value");
                    self.record_warning(Some(err), None);
                }
            }
        }

        let (snapshot, issues) = HistoryStore::new(layout).snapshot(layout.date());
        for err in issues {
            self.record_warning(Some(err), None);
        }

        let (summaries, issues) = providers::load_index_summaries(layout);
        for err in issues {
            self.record_warning(Some(err), None);
        }

        let blocks = summaries
            .into_iter()
            .map(|summary| {
                let (config, issue) = configs.block_config(&summary.block);
                self.record_warning(issue, Some(&summary.block));
                BlockInputs {
                    last_ndvi: snapshot.ndvi.get(&summary.block).copied(),
                    actual_mm: snapshot.actual_today.get(&summary.block).copied(),
                    config,
                    summary,
                }
            })
            .collect();

        LoadedInputs {
            ctx: RunContext {
                date: layout.date(),
                weather,
                eto,
                global,
            },
            snapshot,
            blocks,
            eto_override_applied,
            weather_fallback,
        }
    }

    /// Evaluates every block on its own blocking task and joins them all.
    /// History updates are buffered here and committed by the caller.
    async fn compute(
        &mut self,
        ctx: Arc<RunContext>,
        blocks: Vec<BlockInputs>,
        evaluate: BlockEvaluator,
    ) -> (Vec<RecommendationRecord>, Vec<(String, f64)>) {
        let mut tasks = JoinSet::new();
        let mut task_blocks = HashMap::new();
        for inputs in blocks {
            let ctx = Arc::clone(&ctx);
            let block = inputs.config.block.clone();
            let handle = tasks.spawn_blocking(move || {
                let result = evaluate(&ctx, &inputs);
                (inputs.config.block, result)
            });
            task_blocks.insert(handle.id(), block);
        }

        let mut records = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(record))) => {
                    info!(
                        block = %record.block,
                        irrigation_mm = record.irrigation_mm,
                        minutes = ?record.irrigation_minutes,
                        etc_adjusted = record.etc_adjusted,
                        efficiency = record.efficiency,
                        rain_mm = record.rain_mm,
                        "recommendation computed"
                    );
                    records.push(record);
                }
                Ok((block, Err(err))) => {
                    error!(block = %block, error = %err, "block skipped");
                    self.errors.push(err.into_issue(Some(&block)));
                }
                Err(join_err) => {
                    let block = task_blocks.get(&join_err.id()).map(String::as_str);
                    error!(block = ?block, error = %join_err, "block task failed");
                    self.errors
                        .push(AdvisorError::TaskFailed(join_err.to_string()).into_issue(block));
                }
            }
        }

        records.sort_by(|a, b| a.block.cmp(&b.block));
        let updates = records.iter().map(|r| (r.block.clone(), r.ndvi)).collect();
        (records, updates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IssueKind;
    use std::fs;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 5, 17).unwrap()
    }

    fn write(path: &std::path::Path, body: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
    }

    /// Data directory with a citrus block A1 and a default-config block B2.
    fn seeded() -> (tempfile::TempDir, DataLayout) {
        let dir = tempfile::tempdir().unwrap();
        let layout = DataLayout::new(dir.path(), date());
        write(
            &layout.global_config(),
            r#"{"default_index_weights": {"default": {"ndvi": 1, "evi": 0, "gndvi": 0, "ndre": 0}},
                "rain_override_enabled": true, "auto_sync_dashboard": true}"#,
        );
        write(
            &layout.block_config("A1"),
            r#"{"crop": "citrus", "application_rate_mm_hr": 10}"#,
        );
        write(
            &layout.index_dir().join("A1_summary.json"),
            r#"{"block": "A1", "date": "2025-05-17", "ndvi": 0.60, "evi": 0.55, "gndvi": 0.50,
                "confidence_score": 100, "fallback_used": false}"#,
        );
        write(
            &layout.index_dir().join("B2_summary.json"),
            r#"{"block": "B2", "date": "2025-05-17", "ndvi": 0.40, "confidence_score": 80}"#,
        );
        write(
            &layout.weather_file(),
            r#"[{"date": "2025-05-17", "eto_estimated": 5.5, "precip_mm": 2,
                 "rain_yesterday": 0, "rain_forecast": 0, "temp_min": 12, "temp_max": 31}]"#,
        );
        (dir, layout)
    }

    fn record<'r>(outcome: &'r RunOutcome, block: &str) -> &'r RecommendationRecord {
        outcome.records.iter().find(|r| r.block == block).unwrap()
    }

    #[tokio::test]
    async fn citrus_scenario_runs_end_to_end() {
        let (_dir, layout) = seeded();
        let outcome = run(&layout, RunOptions::default()).await.unwrap();

        assert_eq!(outcome.summary.blocks_processed, 2);
        assert!(outcome.summary.succeeded());
        assert!(!outcome.summary.weather_fallback);

        let a1 = record(&outcome, "A1");
        assert_eq!(a1.kc, 0.66);
        assert_eq!(a1.etc, 3.63);
        assert_eq!(a1.etc_adjusted, 3.82);
        assert_eq!(a1.irrigation_mm, 1.82);
        assert_eq!(a1.irrigation_minutes, Some(10.9));
        assert_eq!(a1.priority_score, 3.63);

        assert!(layout.block_output("A1").exists());
        assert!(layout.summary_csv().exists());
        assert!(layout.dashboard_json().exists());
        assert!(layout.dashboard_mirror().exists());
        assert!(layout.run_summary().exists());

        let history: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(layout.ndvi_history()).unwrap()).unwrap();
        assert_eq!(history["A1"], 0.6);
        assert_eq!(history["B2"], 0.4);
    }

    #[tokio::test]
    async fn second_identical_run_only_resets_trend() {
        let (_dir, layout) = seeded();
        write(&layout.ndvi_history(), r#"{"A1": 0.75}"#);

        let first = run(&layout, RunOptions::default()).await.unwrap();
        assert_eq!(record(&first, "A1").ndvi_change, -20.0);
        assert!(record(&first, "A1").stress_flag);

        let second = run(&layout, RunOptions::default()).await.unwrap();
        let (a, b) = (record(&first, "A1"), record(&second, "A1"));
        assert_eq!(b.ndvi_change, 0.0);
        assert!(!b.stress_flag);

        let mut normalized = a.clone();
        normalized.ndvi_change = 0.0;
        normalized.stress_flag = false;
        normalized.explanation = b.explanation.clone();
        assert_eq!(&normalized, b);
        assert_eq!(record(&first, "B2"), record(&second, "B2"));
    }

    #[tokio::test]
    async fn missing_weather_uses_defaults_for_all_blocks() {
        let (_dir, layout) = seeded();
        fs::remove_file(layout.weather_file()).unwrap();

        let outcome = run(&layout, RunOptions::default()).await.unwrap();
        assert!(outcome.summary.weather_fallback);
        assert_eq!(outcome.records.len(), 2);
        for record in &outcome.records {
            assert_eq!(record.eto, 5.5);
            assert_eq!(record.rain_mm, 0.0);
            assert_eq!(record.effective_rain_mm, 0.0);
        }
        assert!(outcome
            .summary
            .warnings
            .iter()
            .any(|w| w.kind == IssueKind::ProviderDataUnavailable));
    }

    #[tokio::test]
    async fn zero_efficiency_skips_only_that_block() {
        let (_dir, layout) = seeded();
        write(&layout.block_config("B2"), r#"{"efficiency": 0}"#);

        let outcome = run(&layout, RunOptions::default()).await.unwrap();
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.records[0].block, "A1");
        assert_eq!(outcome.summary.blocks_failed, 1);
        assert_eq!(outcome.summary.errors[0].block.as_deref(), Some("B2"));
        assert_eq!(outcome.summary.errors[0].kind, IssueKind::ConfigurationInvalid);
        assert!(!layout.block_output("B2").exists());
    }

    #[tokio::test]
    async fn eto_override_applies_to_every_block() {
        let (_dir, layout) = seeded();
        let options = RunOptions {
            eto_override: Some("7.0\n".to_string()),
        };
        let outcome = run(&layout, options).await.unwrap();
        assert!(outcome.summary.eto_override_applied);
        assert!(outcome.records.iter().all(|r| r.eto == 7.0));
        assert_eq!(record(&outcome, "A1").etc, 4.62);
    }

    #[tokio::test]
    async fn unparseable_override_falls_back_with_warning() {
        let (_dir, layout) = seeded();
        let options = RunOptions {
            eto_override: Some("high".to_string()),
        };
        let outcome = run(&layout, options).await.unwrap();
        assert!(!outcome.summary.eto_override_applied);
        assert_eq!(outcome.summary.eto, 5.5);
        assert!(outcome
            .summary
            .warnings
            .iter()
            .any(|w| w.kind == IssueKind::OverrideInvalid));
    }

    #[tokio::test]
    async fn reported_actual_shows_up_as_gap() {
        let (_dir, layout) = seeded();
        HistoryStore::new(&layout)
            .record_actual(date(), "A1", 2.5)
            .unwrap();

        let outcome = run(&layout, RunOptions::default()).await.unwrap();
        let a1 = record(&outcome, "A1");
        assert_eq!(a1.actual_irrigation_mm, Some(2.5));
        assert_eq!(a1.irrigation_gap, Some(0.68));
        assert_eq!(record(&outcome, "B2").irrigation_gap, None);
    }

    #[tokio::test]
    async fn history_commits_past_a_lock_left_by_a_crash() {
        let (_dir, layout) = seeded();
        write(&layout.ndvi_history(), r#"{"A1": 0.75}"#);
        write(&layout.ndvi_history().with_extension("json.lock"), "");

        let first = run(&layout, RunOptions::default()).await.unwrap();
        assert_eq!(record(&first, "A1").ndvi_change, -20.0);
        assert!(first
            .summary
            .warnings
            .iter()
            .all(|w| w.kind != IssueKind::StoreLocked));

        let history: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(layout.ndvi_history()).unwrap()).unwrap();
        assert_eq!(history["A1"], 0.6);

        let second = run(&layout, RunOptions::default()).await.unwrap();
        assert_eq!(record(&second, "A1").ndvi_change, 0.0);
    }

    #[tokio::test]
    async fn rerun_drops_output_of_newly_failing_block() {
        let (_dir, layout) = seeded();
        run(&layout, RunOptions::default()).await.unwrap();
        assert!(layout.block_output("B2").exists());

        write(&layout.block_config("B2"), r#"{"efficiency": 0}"#);
        let outcome = run(&layout, RunOptions::default()).await.unwrap();
        assert_eq!(outcome.summary.errors[0].block.as_deref(), Some("B2"));
        assert!(layout.block_output("A1").exists());
        assert!(!layout.block_output("B2").exists());
        assert_eq!(outcome.summary.outputs.removed, vec![layout.block_output("B2")]);
    }

    #[tokio::test]
    async fn panicked_block_task_is_reported_against_its_block() {
        let (_dir, layout) = seeded();
        let mut pipeline = Pipeline {
            layout: &layout,
            state: RunState::PerBlockCompute,
            run_id: Uuid::new_v4(),
            warnings: Vec::new(),
            errors: Vec::new(),
        };
        let inputs = pipeline.load_inputs(&RunOptions::default());

        fn panics_on_b2(
            ctx: &RunContext,
            inputs: &BlockInputs,
        ) -> Result<RecommendationRecord> {
            if inputs.config.block == "B2" {
                panic!("evaluator blew up");
            }
            engine::recommend(ctx, inputs)
        }

        let (records, updates) = pipeline
            .compute(Arc::new(inputs.ctx), inputs.blocks, panics_on_b2)
            .await;
        assert_eq!(records.len(), 1);
        assert_eq!(updates, vec![("A1".to_string(), 0.6)]);
        assert_eq!(pipeline.errors.len(), 1);
        assert_eq!(pipeline.errors[0].kind, IssueKind::Internal);
        assert_eq!(pipeline.errors[0].block.as_deref(), Some("B2"));
    }

    #[tokio::test]
    async fn block_without_summary_is_omitted() {
        let (_dir, layout) = seeded();
        write(&layout.block_config("C3"), r#"{"crop": "grapes"}"#);
        let outcome = run(&layout, RunOptions::default()).await.unwrap();
        assert!(outcome.records.iter().all(|r| r.block != "C3"));
        assert!(outcome.summary.errors.is_empty());
    }
}
