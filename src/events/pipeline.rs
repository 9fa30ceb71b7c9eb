//! The capture side of the pipeline and the user-facing operations on events.
//!
//! `Pipeline` is built once by the entry point and shared behind an `Arc`.
//! A capture goes hash → attribute → persist frame → merge (one transaction)
//! → notify. Classification happens later, on the worker.

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, RwLock};

use crate::clock::Clock;
use crate::db::{
    Database, Event, EventFilter, EventStatus, MergeOutcome, NewCapture, NormalizationReport,
    QueueEntry, Screenshot,
};
use crate::error::{PipelineError, PipelineResult};
use crate::notify::{ChangeNotification, Notifier};
use crate::sensing::bridge::{CaptureSource, CapturedFrame};
use crate::sensing::context::ContextExtractor;
use crate::sensing::frame_store::FrameStore;
use crate::sensing::hasher::hash_frame;
use crate::settings::SettingsStore;

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

/// What one capture trigger did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureReport {
    /// Another capture held the slot; nothing was read.
    pub skipped: bool,
    pub created: usize,
    pub merged: usize,
    pub exact_repeats: usize,
    /// Frames rejected as malformed.
    pub dropped: usize,
}

pub struct Pipeline {
    db: Database,
    frames: FrameStore,
    settings: Arc<SettingsStore>,
    source: Arc<dyn CaptureSource>,
    notifier: Notifier,
    clock: Arc<dyn Clock>,
    capture_slot: Mutex<()>,
    /// Ingest holds it shared from frame write to commit; frame cleanup holds
    /// it exclusively so a file is never removed under a capture reusing it.
    frame_gate: RwLock<()>,
}

impl Pipeline {
    pub fn new(
        db: Database,
        frames: FrameStore,
        settings: Arc<SettingsStore>,
        source: Arc<dyn CaptureSource>,
        notifier: Notifier,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            db,
            frames,
            settings,
            source,
            notifier,
            clock,
            capture_slot: Mutex::new(()),
            frame_gate: RwLock::new(()),
        }
    }

    pub fn settings(&self) -> &Arc<SettingsStore> {
        &self.settings
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// The capture trigger. Pulls the pending frames from the source and
    /// ingests them in order, acknowledging each one once it is recorded. A
    /// storage error stops the batch and leaves the rest with the source. A
    /// trigger that finds a capture already running does nothing.
    pub async fn capture_now(&self) -> PipelineResult<CaptureReport> {
        let Ok(_slot) = self.capture_slot.try_lock() else {
            log_debug!("capture already in flight, skipping trigger");
            return Ok(CaptureReport {
                skipped: true,
                ..CaptureReport::default()
            });
        };

        let frames = self.source.capture().await?;
        let mut report = CaptureReport::default();
        for frame in frames {
            let receipt = frame.receipt.clone();
            match self.ingest(frame).await {
                Ok(MergeOutcome::Created(_)) => report.created += 1,
                Ok(MergeOutcome::Extended { .. }) => report.merged += 1,
                Ok(MergeOutcome::ExactRepeat(_)) => report.exact_repeats += 1,
                Err(PipelineError::Validation(msg)) => {
                    log_warn!("dropping malformed frame: {msg}");
                    report.dropped += 1;
                }
                Err(err) => return Err(err),
            }
            if let Some(receipt) = receipt {
                self.source.acknowledge(&receipt).await?;
            }
        }
        Ok(report)
    }

    /// Hashes, attributes and merges one frame.
    pub async fn ingest(&self, frame: CapturedFrame) -> PipelineResult<MergeOutcome> {
        let settings = self.settings.snapshot();
        let CapturedFrame {
            display_id,
            is_primary,
            captured_at,
            png_bytes,
            window,
            receipt: _,
        } = frame;

        let (png_bytes, hashes) = tokio::task::spawn_blocking(move || {
            let hashes = hash_frame(&png_bytes);
            (png_bytes, hashes)
        })
        .await
        .map_err(|err| PipelineError::storage(format!("hash worker failed: {err}")))?;
        let hashes = hashes?;

        let timestamp = captured_at.unwrap_or_else(|| self.clock.now());
        let attribution = ContextExtractor::new(settings.context).attribute(window.as_ref());

        let gate = self.frame_gate.read().await;
        let (image_path, wrote) = self.frames.persist(&hashes.detail, &png_bytes).await?;
        log_debug!(
            "frame {} on {display_id}: {}x{} written={wrote}",
            hashes.detail,
            hashes.width,
            hashes.height
        );

        let capture = NewCapture {
            display_id,
            is_primary,
            timestamp,
            hashes,
            image_path: image_path.to_string_lossy().into_owned(),
            attribution,
        };
        let outcome = self
            .db
            .record_capture(capture, settings.merge, self.clock.now())
            .await?;
        drop(gate);

        match &outcome {
            MergeOutcome::Created(event) => {
                log_info!(
                    "event {} created on {} (context {:?})",
                    event.id,
                    event.display_id,
                    event.context_key
                );
                self.notifier.event_created(&event.id);
            }
            MergeOutcome::Extended { event, requeued } => {
                log_info!(
                    "event {} extended to {} captures{}",
                    event.id,
                    event.merged_count,
                    if *requeued { ", requeued for low confidence" } else { "" }
                );
                self.notifier.event_updated(&event.id);
            }
            MergeOutcome::ExactRepeat(event) => {
                log_debug!("event {} exact repeat ({})", event.id, event.merged_count);
                self.notifier.event_updated(&event.id);
            }
        }

        Ok(outcome)
    }

    pub async fn get_event(&self, event_id: &str) -> PipelineResult<Event> {
        self.db
            .get_event(event_id)
            .await?
            .ok_or_else(|| missing(event_id))
    }

    pub async fn list_events(&self, filter: EventFilter) -> PipelineResult<Vec<Event>> {
        Ok(self.db.list_events(filter).await?)
    }

    pub async fn get_screenshots_for_event(&self, event_id: &str) -> PipelineResult<Vec<Screenshot>> {
        Ok(self.db.get_screenshots_for_event(event_id).await?)
    }

    pub async fn get_queue_entry(&self, event_id: &str) -> PipelineResult<Option<QueueEntry>> {
        Ok(self.db.get_queue_entry(event_id).await?)
    }

    pub async fn relabel(
        &self,
        event_id: &str,
        category: &str,
        subcategories: Vec<String>,
    ) -> PipelineResult<Event> {
        let category = category.trim();
        if category.is_empty() {
            return Err(PipelineError::validation("category must not be empty"));
        }
        let subcategories = subcategories
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        let event = self
            .db
            .relabel_event(event_id, category.to_string(), subcategories, self.clock.now())
            .await?;
        self.updated(event_id, event)
    }

    pub async fn set_caption(&self, event_id: &str, caption: Option<String>) -> PipelineResult<Event> {
        let caption = caption
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty());
        let event = self
            .db
            .set_event_caption(event_id, caption, self.clock.now())
            .await?;
        self.updated(event_id, event)
    }

    /// Overrides the project, then reconciles spellings across events.
    pub async fn set_project(&self, event_id: &str, project: Option<String>) -> PipelineResult<Event> {
        let event = self
            .db
            .set_event_project(event_id, project, self.clock.now())
            .await?;
        let event = self.updated(event_id, event)?;
        if event.project.is_some() {
            self.normalize_projects().await?;
            return self.get_event(event_id).await;
        }
        Ok(event)
    }

    pub async fn set_dismissed(&self, event_id: &str, dismissed: bool) -> PipelineResult<Event> {
        let event = self
            .db
            .set_event_dismissed(event_id, dismissed, self.clock.now())
            .await?;
        self.updated(event_id, event)
    }

    pub async fn confirm_addiction(&self, event_id: &str) -> PipelineResult<Event> {
        let current = self.get_event(event_id).await?;
        if current.addiction_candidate.is_none() {
            return Err(PipelineError::validation(format!(
                "event {event_id} has no addiction candidate"
            )));
        }
        let event = self.db.confirm_addiction(event_id, self.clock.now()).await?;
        self.updated(event_id, event)
    }

    pub async fn reject_addiction(&self, event_id: &str) -> PipelineResult<Event> {
        let event = self.db.reject_addiction(event_id, self.clock.now()).await?;
        self.updated(event_id, event)
    }

    /// Manual retry of a failed event with a fresh attempt budget.
    pub async fn retry_event(&self, event_id: &str) -> PipelineResult<Event> {
        let current = self.get_event(event_id).await?;
        if current.status != EventStatus::Failed {
            return Err(PipelineError::validation(format!(
                "event {event_id} is {}, only failed events can be retried",
                current.status.as_str()
            )));
        }
        let event = self.db.retry_failed_event(event_id, self.clock.now()).await?;
        log_info!("event {event_id} requeued by user");
        self.updated(event_id, event)
    }

    /// Deletes the event and any frame file nothing else points at.
    pub async fn delete_event(&self, event_id: &str) -> PipelineResult<()> {
        let gate = self.frame_gate.write().await;
        let orphaned = self
            .db
            .delete_event(event_id)
            .await?
            .ok_or_else(|| missing(event_id))?;

        for path in &orphaned {
            if let Err(err) = self.frames.remove(Path::new(path)).await {
                log_warn!("failed to remove frame {path}: {err:#}");
            }
        }
        drop(gate);

        log_info!("event {event_id} deleted ({} frames released)", orphaned.len());
        self.notifier.emit(ChangeNotification::EventsChanged {
            event_ids: vec![event_id.to_string()],
        });
        Ok(())
    }

    pub async fn normalize_projects(&self) -> PipelineResult<NormalizationReport> {
        let report = self.db.normalize_projects(self.clock.now()).await?;
        if report.updated_rows > 0 {
            log_info!(
                "normalized {} project labels across {} groups",
                report.updated_rows,
                report.groups
            );
            self.notifier.emit(ChangeNotification::ProjectsNormalized {
                updated_rows: report.updated_rows,
                groups: report.groups,
            });
        }
        Ok(report)
    }

    fn updated(&self, event_id: &str, event: Option<Event>) -> PipelineResult<Event> {
        let event = event.ok_or_else(|| missing(event_id))?;
        self.notifier.event_updated(&event.id);
        Ok(event)
    }
}

fn missing(event_id: &str) -> PipelineError {
    PipelineError::not_found(format!("event {event_id} does not exist"))
}
