use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::Serialize;

use crate::error::{AdvisorError, Result};

pub const GLOBAL_SETTINGS_FILE: &str = "global_settings.json";
pub const SUMMARY_SUFFIX: &str = "_summary.json";
pub const BLOCK_OUTPUT_SUFFIX: &str = "_irrigation.json";

/// Paths of every file the advisor reads or writes for one run date.
#[derive(Debug, Clone)]
pub struct DataLayout {
    root: PathBuf,
    date: NaiveDate,
    mirror: Option<PathBuf>,
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>, date: NaiveDate) -> Self {
        DataLayout {
            root: root.into(),
            date,
            mirror: None,
        }
    }

    pub fn with_mirror(mut self, mirror: Option<PathBuf>) -> Self {
        self.mirror = mirror;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    fn dated(&self, dir: &str) -> PathBuf {
        self.root.join(dir).join(self.date.to_string())
    }

    pub fn config_dir(&self) -> PathBuf {
        self.root.join("configs")
    }

    pub fn block_config(&self, block: &str) -> PathBuf {
        self.config_dir().join(format!("{block}.json"))
    }

    pub fn global_config(&self) -> PathBuf {
        self.config_dir().join(GLOBAL_SETTINGS_FILE)
    }

    pub fn index_dir(&self) -> PathBuf {
        self.dated("indices")
    }

    pub fn weather_dir(&self) -> PathBuf {
        self.dated("weather")
    }

    pub fn weather_file(&self) -> PathBuf {
        self.weather_dir().join("weather_data.json")
    }

    pub fn eto_override_file(&self) -> PathBuf {
        self.root.join("weather").join("daily_eto_override.txt")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    pub fn ndvi_history(&self) -> PathBuf {
        self.state_dir().join("ndvi_history.json")
    }

    pub fn actual_log(&self) -> PathBuf {
        self.state_dir().join("actual_irrigation_log.json")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.dated("outputs")
    }

    pub fn block_output(&self, block: &str) -> PathBuf {
        self.output_dir().join(format!("{block}{BLOCK_OUTPUT_SUFFIX}"))
    }

    pub fn summary_csv(&self) -> PathBuf {
        self.output_dir().join("irrigation_summary.csv")
    }

    pub fn dashboard_json(&self) -> PathBuf {
        self.output_dir().join("block_irrigation.json")
    }

    pub fn run_summary(&self) -> PathBuf {
        self.output_dir().join("run_summary.json")
    }

    /// Where the dashboard file is mirrored when auto-sync is on.
    pub fn dashboard_mirror(&self) -> PathBuf {
        self.mirror.clone().unwrap_or_else(|| {
            self.root
                .join("dashboard")
                .join("public")
                .join("data")
                .join("block_irrigation.json")
        })
    }
}

/// Writes `value` as pretty JSON through a temp file in the same directory
/// and renames it into place, so readers never observe a partial file.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).map_err(|e| AdvisorError::io(dir, e))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| AdvisorError::io(dir, e))?;
    serde_json::to_writer_pretty(&mut tmp, value).map_err(|e| AdvisorError::json(path, e))?;
    tmp.write_all(b"\n").map_err(|e| AdvisorError::io(path, e))?;
    tmp.persist(path).map_err(|e| AdvisorError::io(path, e.error))?;
    Ok(())
}
