use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf, sync::RwLock};

use crate::classifier::evaluator::ConfidenceThresholds;
use crate::classifier::http::ClassifierSettings;
use crate::events::config::MergeConfig;
use crate::queue::backoff::QueueSettings;
use crate::sensing::context::ContextSettings;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct CaptureSettings {
    pub interval_secs: u64,
    pub timeout_secs: u64,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            timeout_secs: 10,
        }
    }
}

/// Everything tunable about the pipeline, persisted as one JSON document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct PipelineSettings {
    pub capture: CaptureSettings,
    pub merge: MergeConfig,
    pub queue: QueueSettings,
    pub thresholds: ConfidenceThresholds,
    pub context: ContextSettings,
    pub classifier: ClassifierSettings,
}

pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<PipelineSettings>,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let mut data: PipelineSettings = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            serde_json::from_str(&contents).unwrap_or_else(|err| {
                log::warn!(
                    "Ignoring malformed settings at {}: {err}; using defaults",
                    path.display()
                );
                PipelineSettings::default()
            })
        } else {
            PipelineSettings::default()
        };

        apply_env_overrides(&mut data);

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn snapshot(&self) -> PipelineSettings {
        self.data.read().unwrap().clone()
    }

    pub fn capture(&self) -> CaptureSettings {
        self.data.read().unwrap().capture.clone()
    }

    /// Applies `f` to the settings and writes the result to disk.
    pub fn update<F>(&self, f: F) -> Result<PipelineSettings>
    where
        F: FnOnce(&mut PipelineSettings),
    {
        let mut guard = self.data.write().unwrap();
        f(&mut guard);
        self.persist(&guard)?;
        Ok(guard.clone())
    }

    pub fn reload(&self) -> Result<()> {
        let contents = fs::read_to_string(&self.path)?;
        let mut data: PipelineSettings = serde_json::from_str(&contents)?;
        apply_env_overrides(&mut data);
        let mut guard = self.data.write().unwrap();
        *guard = data;
        Ok(())
    }

    fn persist(&self, data: &PipelineSettings) -> Result<()> {
        // never write the api key back out; it comes from the environment
        let mut on_disk = data.clone();
        if std::env::var("SCREENTRAIL_API_KEY").is_ok() {
            on_disk.classifier.api_key.clear();
        }
        let serialized = serde_json::to_string_pretty(&on_disk)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }
}

fn apply_env_overrides(data: &mut PipelineSettings) {
    if let Ok(key) = std::env::var("SCREENTRAIL_API_KEY") {
        if !key.is_empty() {
            data.classifier.api_key = key;
        }
    }
}

/// Directory holding the database, settings and frames.
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("SCREENTRAIL_DATA_DIR") {
        return PathBuf::from(dir);
    }
    match std::env::var("HOME") {
        Ok(home) => PathBuf::from(home).join(".screentrail"),
        Err(_) => PathBuf::from(".screentrail"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let store = SettingsStore::new(dir.path().join("settings.json")).unwrap();
        let settings = store.snapshot();
        assert_eq!(settings.capture.interval_secs, 5);
        assert_eq!(settings.merge.lookback_secs, 180);
        assert_eq!(settings.queue.max_attempts, 5);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{ "merge": { "hammingTolerance": 3 } }"#).unwrap();

        let store = SettingsStore::new(path).unwrap();
        let settings = store.snapshot();
        assert_eq!(settings.merge.hamming_tolerance, 3);
        assert_eq!(settings.merge.lookback_secs, 180);
        assert_eq!(settings.thresholds.auto_track, 0.8);
    }

    #[test]
    fn test_update_persists_and_reloads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        let store = SettingsStore::new(path.clone()).unwrap();

        store.update(|s| s.capture.interval_secs = 12).unwrap();
        store.reload().unwrap();
        assert_eq!(store.capture().interval_secs, 12);

        let reopened = SettingsStore::new(path).unwrap();
        assert_eq!(reopened.capture().interval_secs, 12);
    }

    #[test]
    fn test_malformed_file_falls_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{not json").unwrap();
        let store = SettingsStore::new(path).unwrap();
        assert_eq!(store.snapshot(), PipelineSettings::default());
    }
}
