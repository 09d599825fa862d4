use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use chrono::{Local, NaiveDate};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod engine;
mod error;
mod history;
mod layout;
mod models;
mod output;
mod pipeline;
mod policy;
mod providers;
mod ranking;
mod report;

use config::{ConfigEdit, ConfigStore};
use history::HistoryStore;
use layout::DataLayout;
use models::NdviDisplayMode;
use pipeline::{RunOptions, RunOutcome};

#[derive(Parser)]
#[command(name = "irrigation-advisor")]
#[command(about = "Daily per-block irrigation recommendations from vegetation indices and weather", long_about = None)]
struct Cli {
    /// Root of the data directory (configs, indices, weather, state, outputs)
    #[arg(long, global = true, env = "IRRIGATION_DATA_DIR", default_value = ".")]
    data_dir: PathBuf,

    /// Destination for the mirrored dashboard file
    #[arg(long, global = true, env = "IRRIGATION_MIRROR_PATH")]
    mirror_path: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the data directory skeleton and default global settings
    Init,
    /// Compute today's recommendations for every block with an index summary
    Run {
        #[arg(long)]
        date: Option<NaiveDate>,
        /// ETo in mm for the whole run, overriding the weather provider
        #[arg(long)]
        eto_override: Option<String>,
    },
    /// Edit a block's configuration, then rerun the engine
    Configure {
        block: String,
        #[command(flatten)]
        edit: EditArgs,
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Record irrigation actually applied to a block
    ReportActual {
        #[arg(long)]
        block: String,
        #[arg(long)]
        mm: f64,
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Import applied irrigation from a CSV with block,date,mm columns
    ImportActuals {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Generate a markdown report from a run's dashboard file
    Report {
        #[arg(long)]
        date: Option<NaiveDate>,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

#[derive(Args)]
struct EditArgs {
    #[arg(long)]
    crop: Option<String>,
    #[arg(long)]
    crop_stage: Option<String>,
    #[arg(long)]
    irrigation_type: Option<String>,
    #[arg(long)]
    application_rate: Option<f64>,
    #[arg(long)]
    efficiency: Option<f64>,
    #[arg(long, value_enum)]
    ndvi_mode: Option<NdviModeArg>,
}

#[derive(Clone, Copy, ValueEnum)]
enum NdviModeArg {
    Average,
    P80,
}

impl From<EditArgs> for ConfigEdit {
    fn from(args: EditArgs) -> Self {
        ConfigEdit {
            crop: args.crop,
            crop_stage: args.crop_stage,
            irrigation_type: args.irrigation_type,
            application_rate_mm_hr: args.application_rate,
            efficiency: args.efficiency,
            ndvi_display_mode: args.ndvi_mode.map(|mode| match mode {
                NdviModeArg::Average => NdviDisplayMode::Average,
                NdviModeArg::P80 => NdviDisplayMode::P80,
            }),
        }
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "irrigation_advisor=info".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}

async fn run_engine(
    layout: &DataLayout,
    eto_override: Option<String>,
) -> anyhow::Result<RunOutcome> {
    let eto_override = match eto_override {
        Some(value) => Some(value),
        None => providers::read_eto_override_file(layout).unwrap_or_else(|err| {
            tracing::warn!(error = %err, "ETo override file unreadable, ignoring");
            None
        }),
    };
    let outcome = pipeline::run(layout, RunOptions { eto_override })
        .await
        .context("irrigation run failed to write its outputs")?;
    Ok(outcome)
}

fn print_outcome(outcome: &RunOutcome) -> anyhow::Result<()> {
    for record in ranking::rank_by_priority(&outcome.records) {
        println!(
            "{}: {} mm -> {} min (priority {:.2}, ETc adj {}, eff {}, rain {})",
            record.block,
            record.irrigation_mm,
            record
                .irrigation_minutes
                .map(|m| m.to_string())
                .unwrap_or_else(|| "-".to_string()),
            record.priority_score,
            record.etc_adjusted,
            record.efficiency,
            record.rain_mm
        );
    }
    println!("{}", serde_json::to_string_pretty(&outcome.summary)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let layout_for = |date: Option<NaiveDate>| {
        DataLayout::new(&cli.data_dir, date.unwrap_or_else(today))
            .with_mirror(cli.mirror_path.clone())
    };

    match cli.command {
        Commands::Init => {
            let layout = layout_for(None);
            for dir in [
                layout.config_dir(),
                layout.index_dir(),
                layout.weather_dir(),
                layout.state_dir(),
                layout.output_dir(),
            ] {
                fs::create_dir_all(&dir)
                    .with_context(|| format!("failed to create {}", dir.display()))?;
            }
            let created = ConfigStore::new(&layout).ensure_global_config()?;
            if created {
                println!(
                    "Default global settings written to {}.",
                    layout.global_config().display()
                );
            }
            println!("Data directory ready at {}.", layout.root().display());
        }
        Commands::Run { date, eto_override } => {
            let layout = layout_for(date);
            let outcome = run_engine(&layout, eto_override).await?;
            print_outcome(&outcome)?;
            if !outcome.summary.succeeded() {
                anyhow::bail!("{} block(s) failed", outcome.summary.blocks_failed);
            }
        }
        Commands::Configure { block, edit, date } => {
            let layout = layout_for(date);
            let edit = ConfigEdit::from(edit);
            if edit.is_empty() {
                anyhow::bail!("no configuration fields supplied for {block}");
            }
            let config = ConfigStore::new(&layout)
                .apply_edit(&block, &edit)
                .with_context(|| format!("failed to save config for {block}"))?;
            info!(block = %block, crop = %config.crop, "config updated, running engine");

            let outcome = run_engine(&layout, None).await?;
            print_outcome(&outcome)?;
            if !outcome.summary.succeeded() {
                anyhow::bail!("{} block(s) failed", outcome.summary.blocks_failed);
            }
        }
        Commands::ReportActual { block, mm, date } => {
            let layout = layout_for(date);
            HistoryStore::new(&layout).record_actual(layout.date(), &block, mm)?;
            println!("Recorded {mm} mm applied to {block} on {}.", layout.date());
        }
        Commands::ImportActuals { csv } => {
            let layout = layout_for(None);
            let imported = HistoryStore::new(&layout).import_actuals(&csv)?;
            println!("Imported {imported} applications from {}.", csv.display());
        }
        Commands::Report { date, out, limit } => {
            let layout = layout_for(date);
            let records = report::load_dashboard(&layout.dashboard_json())
                .with_context(|| format!("no recommendations found for {}", layout.date()))?;
            let report = report::build_report(layout.date(), &records, limit);
            fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
    }

    Ok(())
}
