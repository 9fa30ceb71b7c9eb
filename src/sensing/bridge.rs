//! Boundary with the platform: what a capture delivers and the services the
//! pipeline calls out to. Concrete screen grabbing and OCR live outside this
//! crate and plug in through these traits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PipelineResult;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct WindowMetadata {
    pub bundle_id: String,
    pub title: String,
    pub owner_name: String,
    /// Present when the foreground window is a browser tab.
    pub url: Option<String>,
}

/// A single raw frame for one display.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub display_id: String,
    pub is_primary: bool,
    /// When the capturer knows the exact capture time; otherwise the pipeline clock is used.
    pub captured_at: Option<DateTime<Utc>>,
    pub png_bytes: Vec<u8>,
    pub window: Option<WindowMetadata>,
    /// Handle passed back to `CaptureSource::acknowledge` once the frame is
    /// recorded. `None` when the source hands frames over by value.
    pub receipt: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TextRegion {
    pub text: String,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OcrResult {
    pub text: String,
    pub confidence: f64,
    pub word_count: u64,
    #[serde(default)]
    pub regions: Vec<TextRegion>,
}

#[async_trait]
pub trait OcrEngine: Send + Sync {
    /// May fail or come back empty; neither is fatal to the pipeline.
    async fn recognize(&self, image: &[u8]) -> PipelineResult<OcrResult>;
}

#[async_trait]
pub trait CaptureSource: Send + Sync {
    /// Frames for every display captured by this trigger. Empty means nothing new.
    async fn capture(&self) -> PipelineResult<Vec<CapturedFrame>>;

    /// The frame behind `receipt` is stored or was rejected as malformed.
    /// Until this is called the source keeps it and may hand it out again.
    async fn acknowledge(&self, _receipt: &str) -> PipelineResult<()> {
        Ok(())
    }
}

/// OCR engine for hosts without text recognition.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopOcr;

#[async_trait]
impl OcrEngine for NoopOcr {
    async fn recognize(&self, _image: &[u8]) -> PipelineResult<OcrResult> {
        Ok(OcrResult::default())
    }
}
