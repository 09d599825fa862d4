use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::error::{AdvisorError, Result};
use crate::layout::{write_json_atomic, DataLayout};
use crate::models::{ActualIrrigationLog, NdviHistory};

const NDVI_STORE: &str = "ndvi history";
const ACTUAL_STORE: &str = "actual irrigation log";

/// Read-only view of the cross-run state taken at the start of a run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistorySnapshot {
    pub ndvi: NdviHistory,
    /// Actual applications reported for the run date only.
    pub actual_today: BTreeMap<String, f64>,
}

/// The two persistent key-value stores: last-seen ndvi per block and the
/// actual-applied log per date and block.
pub struct HistoryStore {
    ndvi_path: PathBuf,
    actual_path: PathBuf,
}

impl HistoryStore {
    pub fn new(layout: &DataLayout) -> Self {
        HistoryStore {
            ndvi_path: layout.ndvi_history(),
            actual_path: layout.actual_log(),
        }
    }

    /// Snapshot both stores for `date`. Corrupt stores read as empty and are
    /// reported; they get overwritten on the next commit.
    pub fn snapshot(&self, date: NaiveDate) -> (HistorySnapshot, Vec<AdvisorError>) {
        let mut issues = Vec::new();

        let (ndvi, issue) = load_store::<NdviHistory>(&self.ndvi_path, NDVI_STORE);
        issues.extend(issue);
        let (mut log, issue) = load_store::<ActualIrrigationLog>(&self.actual_path, ACTUAL_STORE);
        issues.extend(issue);

        let actual_today = log.remove(&date).unwrap_or_default();
        debug!(
            blocks_with_history = ndvi.len(),
            actuals_today = actual_today.len(),
            "history snapshot taken"
        );
        (HistorySnapshot { ndvi, actual_today }, issues)
    }

    /// Merges the run's ndvi updates over the snapshot and writes the result
    /// in one atomic replace.
    pub fn commit_ndvi(&self, snapshot: &NdviHistory, updates: &[(String, f64)]) -> Result<()> {
        let _lock = StoreLock::acquire(&self.ndvi_path)?;
        let mut merged = snapshot.clone();
        merged.extend(updates.iter().cloned());
        write_json_atomic(&self.ndvi_path, &merged)?;
        info!(blocks = merged.len(), path = %self.ndvi_path.display(), "ndvi history persisted");
        Ok(())
    }

    /// Records one reported application under an exclusive lock, re-reading
    /// the log so concurrent reports for other blocks or dates survive.
    pub fn record_actual(&self, date: NaiveDate, block: &str, mm: f64) -> Result<()> {
        validate_actual(block, mm)?;
        let _lock = StoreLock::acquire(&self.actual_path)?;
        let (mut log, _) = load_store::<ActualIrrigationLog>(&self.actual_path, ACTUAL_STORE);
        log.entry(date).or_default().insert(block.to_string(), mm);
        write_json_atomic(&self.actual_path, &log)?;
        info!(%date, block, mm, "actual irrigation recorded");
        Ok(())
    }

    /// Bulk import of `block,date,mm` rows under a single lock. Returns the
    /// number of entries written.
    pub fn import_actuals(&self, csv_path: &Path) -> Result<usize> {
        #[derive(serde::Deserialize)]
        struct CsvRow {
            block: String,
            date: NaiveDate,
            mm: f64,
        }

        let mut reader = csv::Reader::from_path(csv_path)?;
        let mut rows = Vec::new();
        for result in reader.deserialize::<CsvRow>() {
            let row = result?;
            validate_actual(&row.block, row.mm)?;
            rows.push(row);
        }

        let _lock = StoreLock::acquire(&self.actual_path)?;
        let (mut log, _) = load_store::<ActualIrrigationLog>(&self.actual_path, ACTUAL_STORE);
        for row in &rows {
            log.entry(row.date).or_default().insert(row.block.clone(), row.mm);
        }
        write_json_atomic(&self.actual_path, &log)?;
        info!(rows = rows.len(), source = %csv_path.display(), "actual irrigation imported");
        Ok(rows.len())
    }
}

fn validate_actual(block: &str, mm: f64) -> Result<()> {
    if block.trim().is_empty() {
        return Err(AdvisorError::ConfigurationInvalid {
            block: block.to_string(),
            reason: "block id is empty".to_string(),
        });
    }
    if !mm.is_finite() || mm < 0.0 {
        return Err(AdvisorError::ConfigurationInvalid {
            block: block.to_string(),
            reason: format!("applied depth must be a non-negative number of mm, got {mm}"),
        });
    }
    Ok(())
}

fn load_store<T: DeserializeOwned + Default>(
    path: &Path,
    store: &'static str,
) -> (T, Option<AdvisorError>) {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return (T::default(), None),
        Err(err) => {
            warn!(store, error = %err, "state store unreadable, starting empty");
            return (
                T::default(),
                Some(AdvisorError::StateCorrupt {
                    store,
                    reason: err.to_string(),
                }),
            );
        }
    };

    match serde_json::from_str(&raw) {
        Ok(value) => (value, None),
        Err(err) => {
            warn!(store, error = %err, "state store corrupt, starting empty");
            (
                T::default(),
                Some(AdvisorError::StateCorrupt {
                    store,
                    reason: err.to_string(),
                }),
            )
        }
    }
}

/// Age after which a lock is reclaimed even if its holder still appears
/// to be running.
const STALE_LOCK_AFTER_MINUTES: i64 = 10;

/// Contents of a lock file: who took it and when.
#[derive(Debug, Serialize, Deserialize)]
struct LockHolder {
    pid: u32,
    acquired_at: DateTime<Utc>,
}

impl LockHolder {
    fn current() -> Self {
        LockHolder {
            pid: std::process::id(),
            acquired_at: Utc::now(),
        }
    }

    fn is_stale(&self, now: DateTime<Utc>) -> bool {
        let expired = now - self.acquired_at > Duration::minutes(STALE_LOCK_AFTER_MINUTES);
        expired || process_alive(self.pid) == Some(false)
    }
}

/// `None` when liveness cannot be checked on this platform.
fn process_alive(pid: u32) -> Option<bool> {
    let proc_root = Path::new("/proc");
    if cfg!(target_os = "linux") && proc_root.is_dir() {
        Some(proc_root.join(pid.to_string()).exists())
    } else {
        None
    }
}

/// Exclusive-writer lock file next to a store. The holder record is written
/// before the file appears, so an unreadable lock was left by a crash.
/// Acquisition reclaims stale locks once and otherwise fails fast; the file
/// is removed on drop.
struct StoreLock {
    path: PathBuf,
}

impl StoreLock {
    fn acquire(store: &Path) -> Result<Self> {
        let path = store.with_extension("json.lock");
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).map_err(|e| AdvisorError::io(parent, e))?;

        if Self::try_create(&path, parent)? {
            return Ok(StoreLock { path });
        }
        if Self::reclaim_if_stale(&path)? && Self::try_create(&path, parent)? {
            return Ok(StoreLock { path });
        }
        Err(AdvisorError::StoreLocked {
            path: store.to_path_buf(),
        })
    }

    /// Returns false when another lock file is already in place.
    fn try_create(path: &Path, parent: &Path) -> Result<bool> {
        let mut staged = NamedTempFile::new_in(parent).map_err(|e| AdvisorError::io(parent, e))?;
        serde_json::to_writer(&mut staged, &LockHolder::current())
            .map_err(|e| AdvisorError::json(path, e))?;
        staged.flush().map_err(|e| AdvisorError::io(path, e))?;

        match staged.persist_noclobber(path) {
            Ok(_) => Ok(true),
            Err(err) if err.error.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(err) => Err(AdvisorError::io(path, err.error)),
        }
    }

    fn reclaim_if_stale(path: &Path) -> Result<bool> {
        let holder = match fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str::<LockHolder>(&raw).ok(),
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(true),
            Err(err) => return Err(AdvisorError::io(path, err)),
        };
        let stale = holder.as_ref().map_or(true, |h| h.is_stale(Utc::now()));
        if !stale {
            return Ok(false);
        }

        warn!(
            path = %path.display(),
            holder_pid = ?holder.as_ref().map(|h| h.pid),
            acquired_at = ?holder.as_ref().map(|h| h.acquired_at),
            "reclaiming stale store lock"
        );
        match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(true),
            Err(err) => Err(AdvisorError::io(path, err)),
        }
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %err, "failed to release store lock");
        }
    }
}
