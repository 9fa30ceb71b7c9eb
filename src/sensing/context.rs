//! Context attribution: which app, window or web content a capture belongs to.
//!
//! Attribution is a pure function of the window metadata that arrives with
//! the frame, so the merge engine can compare context keys before deciding.
//! OCR is a separate, optional enrichment step that runs once an event exists.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use super::bridge::{OcrEngine, WindowMetadata};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ContextProvider {
    Browser,
    App,
    None,
}

impl ContextProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextProvider::Browser => "browser",
            ContextProvider::App => "app",
            ContextProvider::None => "none",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "browser" => ContextProvider::Browser,
            "app" => ContextProvider::App,
            _ => ContextProvider::None,
        }
    }
}

/// Stored as the event's `context_json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ContextPayload {
    pub bundle_id: Option<String>,
    pub app_name: Option<String>,
    pub window_title: Option<String>,
    pub url_host: Option<String>,
    pub canonical_url: Option<String>,
    pub content_kind: Option<String>,
    pub content_id: Option<String>,
    pub content_title: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContextAttribution {
    pub provider: ContextProvider,
    pub key: Option<String>,
    pub confidence: f64,
    pub payload: ContextPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ContextSettings {
    /// Attributions below this confidence get OCR.
    pub ocr_confidence_floor: f64,
    /// Confidence cap applied when OCR was wanted but failed.
    pub ocr_failure_confidence_ceiling: f64,
    pub ocr_timeout_secs: u64,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            ocr_confidence_floor: 0.7,
            ocr_failure_confidence_ceiling: 0.5,
            ocr_timeout_secs: 10,
        }
    }
}

/// Outcome of the OCR step.
#[derive(Debug, Clone, PartialEq)]
pub struct OcrEnrichment {
    pub ocr_text: Option<String>,
    pub confidence: f64,
    /// OCR failed or timed out; downstream confidences stay under the ceiling.
    pub degraded: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ContextExtractor {
    settings: ContextSettings,
}

impl ContextExtractor {
    pub fn new(settings: ContextSettings) -> Self {
        Self { settings }
    }

    pub fn attribute(&self, window: Option<&WindowMetadata>) -> ContextAttribution {
        let Some(window) = window else {
            return unattributed(ContextPayload::default());
        };

        let title = non_empty(&window.title);
        let base = ContextPayload {
            bundle_id: non_empty(&window.bundle_id),
            app_name: non_empty(&window.owner_name),
            window_title: title.clone(),
            ..ContextPayload::default()
        };

        if let Some(parsed) = window.url.as_deref().and_then(parse_web_url) {
            let WebIdentity {
                host,
                canonical_url,
                kind,
                id,
            } = parsed;
            let key = match &id {
                Some(id) => format!("web:{host}:{kind}:{id}"),
                None => format!("web:{}", canonical_url.split_once("://").map_or(canonical_url.as_str(), |(_, rest)| rest)),
            };
            let confidence = if id.is_some() { 0.95 } else { 0.85 };
            return ContextAttribution {
                provider: ContextProvider::Browser,
                key: Some(key),
                confidence,
                payload: ContextPayload {
                    url_host: Some(host),
                    canonical_url: Some(canonical_url),
                    content_kind: Some(kind.to_string()),
                    content_id: id,
                    content_title: title,
                    ..base
                },
            };
        }

        let app_identity = base.bundle_id.clone().or_else(|| base.app_name.clone());
        match app_identity {
            Some(identity) => {
                let confidence = if base.window_title.is_some() { 0.8 } else { 0.6 };
                ContextAttribution {
                    provider: ContextProvider::App,
                    key: Some(format!("app:{identity}")),
                    confidence,
                    payload: base,
                }
            }
            None => unattributed(base),
        }
    }

    /// Browser content is text-heavy; weak attributions need the text to classify at all.
    pub fn needs_ocr(&self, attribution: &ContextAttribution) -> bool {
        self.needs_ocr_for(attribution.provider, attribution.confidence)
    }

    pub fn needs_ocr_for(&self, provider: ContextProvider, confidence: f64) -> bool {
        provider == ContextProvider::Browser || confidence < self.settings.ocr_confidence_floor
    }

    /// Runs OCR with a timeout. `confidence` is the attribution confidence,
    /// returned as-is on success and capped on failure.
    pub async fn enrich_with_ocr(
        &self,
        ocr: &dyn OcrEngine,
        image: &[u8],
        confidence: f64,
    ) -> OcrEnrichment {
        let timeout = Duration::from_secs(self.settings.ocr_timeout_secs.max(1));

        match tokio::time::timeout(timeout, ocr.recognize(image)).await {
            Ok(Ok(result)) => {
                let text = result.text.trim();
                log_debug!(
                    "OCR returned {} words (confidence {:.2})",
                    result.word_count,
                    result.confidence
                );
                OcrEnrichment {
                    ocr_text: (!text.is_empty()).then(|| text.to_string()),
                    confidence,
                    degraded: false,
                }
            }
            Ok(Err(err)) => {
                log_warn!("OCR failed, continuing with context only: {err}");
                self.degraded(confidence)
            }
            Err(_) => {
                log_warn!("OCR timed out after {}s, continuing with context only", timeout.as_secs());
                self.degraded(confidence)
            }
        }
    }

    /// Enrichment for an event whose OCR was wanted but could not run.
    pub fn degraded(&self, confidence: f64) -> OcrEnrichment {
        OcrEnrichment {
            ocr_text: None,
            confidence: confidence.min(self.settings.ocr_failure_confidence_ceiling),
            degraded: true,
        }
    }

    pub fn ocr_failure_ceiling(&self) -> f64 {
        self.settings.ocr_failure_confidence_ceiling
    }
}

fn unattributed(payload: ContextPayload) -> ContextAttribution {
    ContextAttribution {
        provider: ContextProvider::None,
        key: None,
        confidence: 0.0,
        payload,
    }
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

struct WebIdentity {
    host: String,
    canonical_url: String,
    kind: &'static str,
    id: Option<String>,
}

fn parse_web_url(raw: &str) -> Option<WebIdentity> {
    let url = Url::parse(raw.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    let host = url.host_str()?.to_ascii_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host).to_string();
    let path = url.path().trim_end_matches('/');
    let path = if path.is_empty() { "/" } else { path };

    let (kind, id) = match host.as_str() {
        "youtube.com" | "m.youtube.com" if path == "/watch" => (
            "video",
            url.query_pairs()
                .find(|(k, _)| k == "v")
                .map(|(_, v)| v.into_owned()),
        ),
        "youtu.be" => ("video", path.strip_prefix('/').map(str::to_string)),
        "github.com" => {
            let parts: Vec<&str> = path.trim_start_matches('/').split('/').collect();
            if parts.len() >= 2 && !parts[0].is_empty() && !parts[1].is_empty() {
                ("repository", Some(format!("{}/{}", parts[0], parts[1])))
            } else {
                ("page", None)
            }
        }
        _ => ("page", None),
    };

    log_debug!("web identity host={host} kind={kind} id={id:?}");

    Some(WebIdentity {
        canonical_url: format!("{}://{}{}", url.scheme(), host, path),
        host,
        kind,
        id: id.filter(|v| !v.is_empty()),
    })
}
