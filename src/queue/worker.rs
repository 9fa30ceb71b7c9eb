use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::info;
use serde::Serialize;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::classifier::{evaluate, ClassificationRequest, ClassifierGateway};
use crate::clock::Clock;
use crate::db::{AttemptOutcome, ClaimedWork, Database};
use crate::error::{PipelineError, PipelineResult};
use crate::notify::{ChangeNotification, Notifier};
use crate::sensing::bridge::OcrEngine;
use crate::sensing::context::{ContextExtractor, ContextProvider};
use crate::sensing::frame_store::FrameStore;
use crate::settings::SettingsStore;

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemOutcome {
    Completed { wrote_project: bool },
    Rescheduled,
    Failed,
    Gone,
}

/// Tally of one worker tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerReport {
    pub claimed: usize,
    pub completed: usize,
    pub rescheduled: usize,
    pub failed: usize,
}

/// Pulls due queue entries and drives them through OCR, the classifier and
/// the evaluator. Cheap to clone; every clone shares the same backends.
#[derive(Clone)]
pub struct ClassificationWorker {
    db: Database,
    frames: FrameStore,
    settings: Arc<SettingsStore>,
    classifier: Arc<dyn ClassifierGateway>,
    ocr: Arc<dyn OcrEngine>,
    notifier: Notifier,
    clock: Arc<dyn Clock>,
}

impl ClassificationWorker {
    pub fn new(
        db: Database,
        frames: FrameStore,
        settings: Arc<SettingsStore>,
        classifier: Arc<dyn ClassifierGateway>,
        ocr: Arc<dyn OcrEngine>,
        notifier: Notifier,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            db,
            frames,
            settings,
            classifier,
            ocr,
            notifier,
            clock,
        }
    }

    /// One batch: claim up to `concurrency` due entries, classify them in
    /// parallel and wait for every call to settle.
    pub async fn run_once(&self) -> PipelineResult<WorkerReport> {
        let concurrency = self.settings.snapshot().queue.concurrency.max(1);
        let claimed = self
            .db
            .claim_due_entries(self.clock.now(), concurrency)
            .await?;

        let mut report = WorkerReport {
            claimed: claimed.len(),
            ..WorkerReport::default()
        };
        if claimed.is_empty() {
            return Ok(report);
        }

        let mut set = JoinSet::new();
        for work in claimed {
            let worker = self.clone();
            set.spawn(async move { worker.process_claimed(work).await });
        }

        let mut wrote_any_project = false;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(ItemOutcome::Completed { wrote_project }) => {
                    report.completed += 1;
                    wrote_any_project |= wrote_project;
                }
                Ok(ItemOutcome::Rescheduled) => report.rescheduled += 1,
                Ok(ItemOutcome::Failed) => report.failed += 1,
                Ok(ItemOutcome::Gone) => {}
                Err(err) => log_error!("classification task panicked: {err}"),
            }
        }

        if wrote_any_project {
            self.normalize_projects().await?;
        }

        Ok(report)
    }

    pub async fn normalize_projects(&self) -> PipelineResult<()> {
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
        Ok(())
    }

    /// Storage trouble mid-attempt hands the claim back so the entry is
    /// picked up again instead of sitting in `processing`.
    async fn process_claimed(&self, work: ClaimedWork) -> ItemOutcome {
        let event_id = work.event.id.clone();
        match self.process(work).await {
            Ok(outcome) => outcome,
            Err(err) => {
                log_error!("classification of event {event_id} aborted: {err}");
                if let Err(release_err) = self.db.release_claim(&event_id, self.clock.now()).await {
                    log_error!("failed to release event {event_id}: {release_err:#}");
                }
                ItemOutcome::Gone
            }
        }
    }

    async fn process(&self, work: ClaimedWork) -> PipelineResult<ItemOutcome> {
        let settings = self.settings.snapshot();
        let ClaimedWork {
            entry,
            mut event,
            image_path,
        } = work;

        let image = match &image_path {
            Some(path) => match self.frames.read(Path::new(path)).await {
                Ok(bytes) => Some(bytes),
                Err(err) => {
                    log_warn!("event {}: frame unavailable, classifying without it: {err:#}", event.id);
                    None
                }
            },
            None => None,
        };

        // OCR once per queue entry; retries reuse what the first attempt stored
        let extractor = ContextExtractor::new(settings.context.clone());
        let provider = ContextProvider::parse(event.context_provider.as_deref().unwrap_or("none"));
        let attribution_confidence = event.context_confidence.unwrap_or(0.0);
        if entry.attempts == 0 && extractor.needs_ocr_for(provider, attribution_confidence) {
            let enrichment = match &image {
                Some(bytes) => {
                    extractor
                        .enrich_with_ocr(self.ocr.as_ref(), bytes, attribution_confidence)
                        .await
                }
                None => extractor.degraded(attribution_confidence),
            };
            if let Some(updated) = self
                .db
                .apply_ocr_enrichment(
                    &event.id,
                    enrichment.ocr_text,
                    enrichment.confidence,
                    enrichment.degraded,
                    self.clock.now(),
                )
                .await?
            {
                event = updated;
            }
        }

        let request = ClassificationRequest {
            event_id: event.id.clone(),
            image,
            ocr_text: event.ocr_text.clone(),
            context_key: event.context_key.clone(),
            context: event.context_json.clone(),
            duration_secs: event.duration_secs(),
        };

        let limit = gateway_deadline(settings.classifier.timeout_secs);
        let result = match tokio::time::timeout(limit, self.classifier.classify(&request)).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::transient(format!(
                "classifier did not answer within {}s",
                limit.as_secs()
            ))),
        };

        let now = self.clock.now();
        match result {
            Ok(output) => {
                let output = if event.ocr_degraded {
                    output.capped(extractor.ocr_failure_ceiling())
                } else {
                    output
                };
                let classification = evaluate(&output, &settings.thresholds);
                let wrote_project = classification.project.is_some();
                match self
                    .db
                    .complete_classification(&event.id, classification, now)
                    .await?
                {
                    Some(done) => {
                        log_info!(
                            "event {} completed: {:?} (confidence {:?})",
                            done.id,
                            done.category,
                            done.confidence
                        );
                        self.notifier.event_updated(&done.id);
                        Ok(ItemOutcome::Completed { wrote_project })
                    }
                    None => {
                        log_debug!("event {} vanished before its result landed", event.id);
                        Ok(ItemOutcome::Gone)
                    }
                }
            }
            Err(PipelineError::TransientService(msg)) => {
                let policy = settings.queue.backoff();
                let outcome = self
                    .db
                    .record_transient_failure(&event.id, msg.clone(), now, policy)
                    .await?;
                Ok(self.report_attempt(&event.id, &msg, outcome))
            }
            Err(err) => {
                let outcome = self.db.mark_failed(&event.id, now).await?;
                log_warn!("event {} rejected by classifier: {err}", event.id);
                Ok(self.report_attempt(&event.id, &err.to_string(), outcome))
            }
        }
    }

    fn report_attempt(&self, event_id: &str, error: &str, outcome: AttemptOutcome) -> ItemOutcome {
        match outcome {
            AttemptOutcome::Rescheduled {
                attempts,
                next_attempt_at,
            } => {
                log_warn!(
                    "event {event_id} attempt {attempts} failed ({error}); next try at {next_attempt_at}"
                );
                self.notifier.event_updated(event_id);
                ItemOutcome::Rescheduled
            }
            AttemptOutcome::Exhausted { attempts } => {
                log_warn!("event {event_id} failed after {attempts} attempts: {error}");
                self.notifier.event_updated(event_id);
                ItemOutcome::Failed
            }
            AttemptOutcome::Rejected => {
                self.notifier.event_updated(event_id);
                ItemOutcome::Failed
            }
            AttemptOutcome::Gone => ItemOutcome::Gone,
        }
    }

    /// Polls until cancelled. Cancellation is only observed between batches,
    /// so calls already in flight always commit their outcome.
    pub async fn run(self, cancel_token: CancellationToken) {
        let queue = self.settings.snapshot().queue;
        let mut poll = tokio::time::interval(queue.poll_interval());
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut normalize = tokio::time::interval(queue.normalize_interval());
        normalize.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    log_info!("classification worker shutting down");
                    break;
                }
                _ = poll.tick() => {
                    match self.run_once().await {
                        Ok(report) if report.claimed > 0 => log_debug!("worker tick: {report:?}"),
                        Ok(_) => {}
                        Err(err) => log_error!("worker tick failed: {err}"),
                    }
                }
                _ = normalize.tick() => {
                    if let Err(err) = self.normalize_projects().await {
                        log_error!("project normalization failed: {err}");
                    }
                }
            }
        }
    }
}

pub struct ClassificationController {
    handle: Option<JoinHandle<()>>,
    cancel_token: Option<CancellationToken>,
}

impl ClassificationController {
    pub fn new() -> Self {
        Self {
            handle: None,
            cancel_token: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    pub fn start(&mut self, worker: ClassificationWorker) -> Result<()> {
        if self.handle.is_some() {
            bail!("classification worker already running");
        }

        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(worker.run(cancel_token.clone()));
        self.handle = Some(handle);
        self.cancel_token = Some(cancel_token);
        info!("classification worker started");
        Ok(())
    }

    pub async fn stop(&mut self) -> Result<()> {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }

        if let Some(handle) = self.handle.take() {
            handle
                .await
                .context("classification worker task failed to join")
        } else {
            Ok(())
        }
    }
}

impl Default for ClassificationController {
    fn default() -> Self {
        Self::new()
    }
}

/// Outer bound on one gateway call. The HTTP backend has its own timeout;
/// this covers any gateway.
fn gateway_deadline(timeout_secs: u64) -> Duration {
    Duration::from_secs(timeout_secs.max(1).saturating_add(5))
}
