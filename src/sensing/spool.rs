use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::bridge::{CaptureSource, CapturedFrame, WindowMetadata};
use crate::error::{PipelineError, PipelineResult};

const ENABLE_LOGS: bool = true;

use crate::log_warn;

pub const DEFAULT_DISPLAY_ID: &str = "main";

/// Optional `<name>.json` written next to `<name>.png`.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct Sidecar {
    display_id: Option<String>,
    is_primary: Option<bool>,
    captured_at: Option<DateTime<Utc>>,
    window: Option<WindowMetadata>,
}

/// Frames handed out per trigger; the rest wait for the next one.
pub const BATCH_LIMIT: usize = 16;

/// Frames dropped into a directory by an external capturer. Each trigger
/// reads up to `BATCH_LIMIT` of them, oldest first. A frame stays on disk
/// until the pipeline acknowledges it, so a failed or interrupted ingest
/// picks it up again on the next trigger.
#[derive(Debug, Clone)]
pub struct SpoolCaptureSource {
    dir: PathBuf,
}

impl SpoolCaptureSource {
    pub fn new(dir: PathBuf) -> PipelineResult<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn pending_frames(&self) -> PipelineResult<Vec<PathBuf>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut frames: Vec<(SystemTime, PathBuf)> = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("png") {
                continue;
            }
            let modified = entry
                .metadata()
                .await
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            frames.push((modified, path));
        }
        frames.sort();
        Ok(frames
            .into_iter()
            .take(BATCH_LIMIT)
            .map(|(_, path)| path)
            .collect())
    }

    async fn read_sidecar(&self, path: &Path) -> Sidecar {
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(_) => return Sidecar::default(),
        };
        serde_json::from_str(&raw).unwrap_or_else(|err| {
            log_warn!("ignoring malformed sidecar {}: {err}", path.display());
            Sidecar::default()
        })
    }
}

async fn remove_if_present(path: &Path) -> PipelineResult<()> {
    match tokio::fs::remove_file(path).await {
        Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err.into()),
        _ => Ok(()),
    }
}

#[async_trait]
impl CaptureSource for SpoolCaptureSource {
    async fn capture(&self) -> PipelineResult<Vec<CapturedFrame>> {
        let mut frames = Vec::new();
        for png_path in self.pending_frames().await? {
            let png_bytes = match tokio::fs::read(&png_path).await {
                Ok(bytes) => bytes,
                // consumed by a concurrent acknowledge
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            let sidecar = self.read_sidecar(&png_path.with_extension("json")).await;

            let display_id = sidecar
                .display_id
                .filter(|d| !d.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_DISPLAY_ID.to_string());
            frames.push(CapturedFrame {
                is_primary: sidecar
                    .is_primary
                    .unwrap_or(display_id == DEFAULT_DISPLAY_ID),
                display_id,
                captured_at: sidecar.captured_at,
                png_bytes,
                window: sidecar.window,
                receipt: Some(png_path.to_string_lossy().into_owned()),
            });
        }
        Ok(frames)
    }

    async fn acknowledge(&self, receipt: &str) -> PipelineResult<()> {
        let png_path = PathBuf::from(receipt);
        if png_path.parent() != Some(self.dir.as_path())
            || png_path.extension().and_then(|e| e.to_str()) != Some("png")
        {
            return Err(PipelineError::validation(format!(
                "{receipt} is not a frame in {}",
                self.dir.display()
            )));
        }
        remove_if_present(&png_path).await?;
        remove_if_present(&png_path.with_extension("json")).await
    }
}
