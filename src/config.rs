use std::fs;
use std::io::ErrorKind;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{AdvisorError, Result};
use crate::layout::{write_json_atomic, DataLayout};
use crate::models::{BlockConfig, GlobalConfig, IndexWeights, NdviDisplayMode};

/// Read side of the per-block and global configuration files. Loading never
/// fails: anything missing or malformed resolves to documented defaults and
/// the problem is handed back for the run summary.
pub struct ConfigStore<'a> {
    layout: &'a DataLayout,
}

impl<'a> ConfigStore<'a> {
    pub fn new(layout: &'a DataLayout) -> Self {
        ConfigStore { layout }
    }

    pub fn block_config(&self, block: &str) -> (BlockConfig, Option<AdvisorError>) {
        let path = self.layout.block_config(block);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(block, path = %path.display(), "no block config, using defaults");
                let missing = AdvisorError::ConfigurationMissing {
                    block: block.to_string(),
                    path,
                };
                return (BlockConfig::for_block(block), Some(missing));
            }
            Err(err) => {
                return (
                    BlockConfig::for_block(block),
                    Some(AdvisorError::ConfigurationInvalid {
                        block: block.to_string(),
                        reason: err.to_string(),
                    }),
                );
            }
        };

        match serde_json::from_str::<BlockConfig>(&raw) {
            Ok(mut config) => {
                config.block = block.to_string();
                (config, None)
            }
            Err(err) => {
                warn!(block, error = %err, "block config unparseable, using defaults");
                (
                    BlockConfig::for_block(block),
                    Some(AdvisorError::ConfigurationInvalid {
                        block: block.to_string(),
                        reason: err.to_string(),
                    }),
                )
            }
        }
    }

    pub fn global_config(&self) -> (GlobalConfig, Option<AdvisorError>) {
        let path = self.layout.global_config();
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "global settings unavailable, using defaults");
                let issue = if err.kind() == ErrorKind::NotFound {
                    AdvisorError::ConfigurationMissing {
                        block: "global".to_string(),
                        path,
                    }
                } else {
                    AdvisorError::ConfigurationInvalid {
                        block: "global".to_string(),
                        reason: err.to_string(),
                    }
                };
                return (GlobalConfig::default(), Some(issue));
            }
        };

        match serde_json::from_str::<GlobalConfig>(&raw) {
            Ok(config) => (config, None),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "global settings unparseable, using defaults");
                (
                    GlobalConfig::default(),
                    Some(AdvisorError::ConfigurationInvalid {
                        block: "global".to_string(),
                        reason: err.to_string(),
                    }),
                )
            }
        }
    }

    /// Applies an operator edit to a block's config file, keeping every key
    /// the edit does not touch.
    pub fn apply_edit(&self, block: &str, edit: &ConfigEdit) -> Result<BlockConfig> {
        edit.validate(block)?;
        let path = self.layout.block_config(block);
        let mut document: Map<String, Value> = match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).map_err(|e| AdvisorError::json(&path, e))?,
            Err(err) if err.kind() == ErrorKind::NotFound => Map::new(),
            Err(err) => return Err(AdvisorError::io(&path, err)),
        };

        edit.merge_into(&mut document);
        write_json_atomic(&path, &document)?;

        let mut config: BlockConfig = serde_json::from_value(Value::Object(document))
            .map_err(|e| AdvisorError::json(&path, e))?;
        config.block = block.to_string();
        Ok(config)
    }

    /// Writes default global settings unless a file already exists.
    pub fn ensure_global_config(&self) -> Result<bool> {
        let path = self.layout.global_config();
        if path.exists() {
            return Ok(false);
        }
        let mut defaults = GlobalConfig::default();
        defaults
            .default_index_weights
            .insert("default".to_string(), IndexWeights::NDVI_ONLY);
        write_json_atomic(&path, &defaults)?;
        Ok(true)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigEdit {
    pub crop: Option<String>,
    pub crop_stage: Option<String>,
    pub irrigation_type: Option<String>,
    pub application_rate_mm_hr: Option<f64>,
    pub efficiency: Option<f64>,
    pub ndvi_display_mode: Option<NdviDisplayMode>,
}

impl ConfigEdit {
    pub fn is_empty(&self) -> bool {
        *self == ConfigEdit::default()
    }

    fn validate(&self, block: &str) -> Result<()> {
        let invalid = |reason: &str| AdvisorError::ConfigurationInvalid {
            block: block.to_string(),
            reason: reason.to_string(),
        };
        if let Some(rate) = self.application_rate_mm_hr {
            if !rate.is_finite() {
                return Err(invalid("application_rate_mm_hr must be a finite number"));
            }
        }
        if let Some(efficiency) = self.efficiency {
            if !(efficiency > 0.0 && efficiency <= 1.0) {
                return Err(invalid("efficiency must be in (0, 1]"));
            }
        }
        Ok(())
    }

    fn merge_into(&self, document: &mut Map<String, Value>) {
        let mut set = |key: &str, value: Value| {
            document.insert(key.to_string(), value);
        };
        if let Some(crop) = &self.crop {
            set("crop", Value::from(crop.as_str()));
        }
        if let Some(stage) = &self.crop_stage {
            set("crop_stage", Value::from(stage.as_str()));
        }
        if let Some(kind) = &self.irrigation_type {
            set("irrigation_type", Value::from(kind.as_str()));
        }
        if let Some(rate) = self.application_rate_mm_hr {
            set("application_rate_mm_hr", Value::from(rate));
        }
        if let Some(efficiency) = self.efficiency {
            set("efficiency", Value::from(efficiency));
        }
        if let Some(mode) = self.ndvi_display_mode {
            let name = match mode {
                NdviDisplayMode::Average => "average",
                NdviDisplayMode::P80 => "p80",
            };
            set("ndvi_display_mode", Value::from(name));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IssueKind;
    use chrono::NaiveDate;

    fn layout(dir: &tempfile::TempDir) -> DataLayout {
        DataLayout::new(dir.path(), NaiveDate::from_ymd_opt(2025, 5, 17).unwrap())
    }

    #[test]
    fn missing_block_config_resolves_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout(&dir);
        let (config, issue) = ConfigStore::new(&layout).block_config("A1");
        assert_eq!(config, BlockConfig::for_block("A1"));
        assert_eq!(issue.map(|e| e.kind()), Some(IssueKind::ConfigurationMissing));
    }

    #[test]
    fn malformed_block_config_is_reported_and_defaulted() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout(&dir);
        fs::create_dir_all(layout.config_dir()).unwrap();
        fs::write(layout.block_config("A1"), "{not json").unwrap();
        let (config, issue) = ConfigStore::new(&layout).block_config("A1");
        assert_eq!(config.efficiency, 0.95);
        assert_eq!(issue.map(|e| e.kind()), Some(IssueKind::ConfigurationInvalid));
    }

    #[test]
    fn missing_global_config_keeps_rain_override_on() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout(&dir);
        let (config, issue) = ConfigStore::new(&layout).global_config();
        assert!(config.rain_override_enabled);
        assert_eq!(issue.map(|e| e.kind()), Some(IssueKind::ConfigurationMissing));
    }

    #[test]
    fn edit_preserves_untouched_keys() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout(&dir);
        fs::create_dir_all(layout.config_dir()).unwrap();
        fs::write(
            layout.block_config("A1"),
            r#"{"crop": "grapes", "soil_type": "clay", "custom_tag": "north"}"#,
        )
        .unwrap();

        let edit = ConfigEdit {
            crop_stage: Some("veraison".to_string()),
            application_rate_mm_hr: Some(4.0),
            ..ConfigEdit::default()
        };
        let config = ConfigStore::new(&layout).apply_edit("A1", &edit).unwrap();
        assert_eq!(config.crop, "grapes");
        assert_eq!(config.crop_stage, "veraison");
        assert_eq!(config.soil_type, "clay");
        assert_eq!(config.application_rate_mm_hr, 4.0);

        let raw = fs::read_to_string(layout.block_config("A1")).unwrap();
        let document: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(document["custom_tag"], "north");
    }

    #[test]
    fn edit_rejects_zero_efficiency() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout(&dir);
        let edit = ConfigEdit {
            efficiency: Some(0.0),
            ..ConfigEdit::default()
        };
        let err = ConfigStore::new(&layout).apply_edit("A1", &edit).unwrap_err();
        assert_eq!(err.kind(), IssueKind::ConfigurationInvalid);
        assert!(!layout.block_config("A1").exists());
    }

    #[test]
    fn ensure_global_config_does_not_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout(&dir);
        let store = ConfigStore::new(&layout);
        assert!(store.ensure_global_config().unwrap());
        assert!(!store.ensure_global_config().unwrap());
        let (config, issue) = store.global_config();
        assert!(issue.is_none());
        assert_eq!(
            config.default_index_weights.get("default"),
            Some(&IndexWeights::NDVI_ONLY)
        );
    }
}
