//! Event data model.
//!
//! An event is a merged, time-bounded span of captures that gets one
//! classification. List-like columns (tags, subcategories, evidence) and the
//! context payload are typed here and only become JSON in the repository.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::sensing::context::ContextPayload;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Processing => "processing",
            EventStatus::Completed => "completed",
            EventStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: String,
    pub display_id: String,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub stable_hash: String,
    pub detail_hash: String,
    pub merged_count: u32,
    pub status: EventStatus,
    pub dismissed: bool,

    pub category: Option<String>,
    pub subcategories: Vec<String>,
    pub caption: Option<String>,
    pub tags: Vec<String>,
    pub confidence: Option<f64>,

    pub tracked_addiction: Option<String>,
    pub addiction_candidate: Option<String>,
    pub addiction_confidence: Option<f64>,
    pub addiction_prompt: Option<String>,

    pub project: Option<String>,
    pub project_progress: bool,
    pub project_progress_confidence: Option<f64>,
    pub project_progress_evidence: Vec<String>,

    pub context_provider: Option<String>,
    pub context_confidence: Option<f64>,
    pub context_key: Option<String>,
    pub context_json: Option<ContextPayload>,
    pub ocr_text: Option<String>,
    /// OCR was wanted but produced nothing; classifier confidences are capped.
    pub ocr_degraded: bool,

    /// Set by user edits; reclassification leaves these fields alone.
    pub category_overridden: bool,
    pub caption_overridden: bool,
    pub project_overridden: bool,

    pub requeue_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Event {
    pub fn duration_secs(&self) -> i64 {
        (self.end_at - self.start_at).num_seconds()
    }
}

/// Classification fields written in one shot when the worker succeeds.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventClassification {
    pub category: Option<String>,
    pub subcategories: Vec<String>,
    pub caption: Option<String>,
    pub tags: Vec<String>,
    pub confidence: Option<f64>,

    pub tracked_addiction: Option<String>,
    pub addiction_candidate: Option<String>,
    pub addiction_confidence: Option<f64>,
    pub addiction_prompt: Option<String>,

    pub project: Option<String>,
    pub project_progress: bool,
    pub project_progress_confidence: Option<f64>,
    pub project_progress_evidence: Vec<String>,
}
