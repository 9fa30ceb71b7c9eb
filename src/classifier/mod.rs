//! Classifier gateway: the seam between the pipeline and whatever backend
//! labels an event, plus the pure evaluation of what it returns.

pub mod evaluator;
pub mod http;
pub mod prompt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::PipelineResult;
use crate::sensing::context::ContextPayload;

pub use evaluator::{evaluate, plan_project_normalization, ConfidenceThresholds};
pub use http::{ClassifierSettings, HttpClassifier};

/// Evidence for one event.
#[derive(Debug, Clone, Default)]
pub struct ClassificationRequest {
    pub event_id: String,
    /// Encoded PNG of the event's latest frame.
    pub image: Option<Vec<u8>>,
    pub ocr_text: Option<String>,
    pub context_key: Option<String>,
    pub context: Option<ContextPayload>,
    /// Seconds the event has spanned so far.
    pub duration_secs: i64,
}

/// Normalized backend reply, before thresholds are applied.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ClassifierOutput {
    pub category: Option<String>,
    pub subcategories: Vec<String>,
    pub caption: Option<String>,
    pub tags: Vec<String>,
    pub confidence: Option<f64>,
    pub addiction_candidate: Option<String>,
    pub addiction_confidence: Option<f64>,
    pub project: Option<String>,
    pub project_progress: Option<bool>,
    pub project_progress_confidence: Option<f64>,
    pub evidence: Vec<String>,
}

impl ClassifierOutput {
    /// Caps every confidence the evaluator reads at `ceiling`.
    pub fn capped(mut self, ceiling: f64) -> Self {
        let cap = |value: Option<f64>| value.map(|v| v.min(ceiling));
        self.confidence = cap(self.confidence);
        self.addiction_confidence = cap(self.addiction_confidence);
        self.project_progress_confidence = cap(self.project_progress_confidence);
        self
    }
}

#[async_trait]
pub trait ClassifierGateway: Send + Sync {
    async fn classify(&self, request: &ClassificationRequest) -> PipelineResult<ClassifierOutput>;

    /// Cheap round trip used by tooling to check credentials and reachability.
    async fn test_connection(&self) -> PipelineResult<String>;
}
