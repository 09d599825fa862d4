use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum AdvisorError {
    #[error("no configuration for block {block} at {path}, using defaults")]
    ConfigurationMissing { block: String, path: PathBuf },

    #[error("invalid configuration for block {block}: {reason}")]
    ConfigurationInvalid { block: String, reason: String },

    #[error("{provider} data unavailable: {reason}")]
    ProviderDataUnavailable {
        provider: &'static str,
        reason: String,
    },

    #[error("ETo override {value:?} ignored: {reason}")]
    OverrideInvalid { value: String, reason: String },

    #[error("{store} is unreadable, starting empty: {reason}")]
    StateCorrupt { store: &'static str, reason: String },

    #[error("could not write {path}: {reason}")]
    PersistenceDegraded { path: PathBuf, reason: String },

    #[error("{path} is locked by another writer")]
    StoreLocked { path: PathBuf },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error on {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("block task failed: {0}")]
    TaskFailed(String),
}

impl AdvisorError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        AdvisorError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        AdvisorError::Json {
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> IssueKind {
        match self {
            AdvisorError::ConfigurationMissing { .. } => IssueKind::ConfigurationMissing,
            AdvisorError::ConfigurationInvalid { .. } => IssueKind::ConfigurationInvalid,
            AdvisorError::ProviderDataUnavailable { .. } => IssueKind::ProviderDataUnavailable,
            AdvisorError::OverrideInvalid { .. } => IssueKind::OverrideInvalid,
            AdvisorError::StateCorrupt { .. } => IssueKind::StateCorrupt,
            AdvisorError::PersistenceDegraded { .. } => IssueKind::PersistenceDegraded,
            AdvisorError::StoreLocked { .. } => IssueKind::StoreLocked,
            AdvisorError::Io { .. } | AdvisorError::Json { .. } | AdvisorError::Csv(_) => {
                IssueKind::Io
            }
            AdvisorError::TaskFailed(_) => IssueKind::Internal,
        }
    }

    /// Converts the error into the record that lands in a run summary.
    pub fn into_issue(self, block: Option<&str>) -> RunIssue {
        RunIssue {
            kind: self.kind(),
            block: block.map(str::to_string),
            message: self.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AdvisorError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    ConfigurationMissing,
    ConfigurationInvalid,
    ProviderDataUnavailable,
    OverrideInvalid,
    StateCorrupt,
    PersistenceDegraded,
    StoreLocked,
    Io,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunIssue {
    pub kind: IssueKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block: Option<String>,
    pub message: String,
}
