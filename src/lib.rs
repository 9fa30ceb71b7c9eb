pub mod classifier;
pub mod clock;
pub mod db;
pub mod error;
pub mod events;
pub mod notify;
pub mod queue;
pub mod sensing;
pub mod settings;
pub mod utils;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use log::{info, warn};

use classifier::{ClassifierGateway, HttpClassifier};
use clock::{Clock, SystemClock};
use db::Database;
use events::Pipeline;
use notify::Notifier;
use queue::{ClassificationController, ClassificationWorker};
use sensing::{CaptureController, CaptureSource, FrameStore, NoopOcr, OcrEngine, SpoolCaptureSource};
use settings::SettingsStore;

/// The long-lived objects of one running instance, built once at startup
/// and handed to whoever needs them.
pub struct AppState {
    pub db: Database,
    pub settings: Arc<SettingsStore>,
    pub notifier: Notifier,
    pub pipeline: Arc<Pipeline>,
    pub worker: ClassificationWorker,
}

impl AppState {
    /// Opens the store under `data_dir`, wires the pipeline and worker, and
    /// returns events a crash left in `processing` to the queue.
    pub async fn bootstrap(
        data_dir: &Path,
        source: Arc<dyn CaptureSource>,
        classifier: Arc<dyn ClassifierGateway>,
        ocr: Arc<dyn OcrEngine>,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

        let db = Database::new(data_dir.join("screentrail.sqlite3"))?;
        let settings = Arc::new(SettingsStore::new(data_dir.join("settings.json"))?);
        let frames = FrameStore::new(data_dir.join("frames"))?;
        let notifier = Notifier::default();

        let recovered = db.recover_processing_events(clock.now()).await?;
        for event_id in &recovered {
            warn!("Recovered event {event_id} left in processing; back to pending");
        }

        let pipeline = Arc::new(Pipeline::new(
            db.clone(),
            frames.clone(),
            Arc::clone(&settings),
            source,
            notifier.clone(),
            Arc::clone(&clock),
        ));
        let worker = ClassificationWorker::new(
            db.clone(),
            frames,
            Arc::clone(&settings),
            classifier,
            ocr,
            notifier.clone(),
            clock,
        );

        Ok(Self {
            db,
            settings,
            notifier,
            pipeline,
            worker,
        })
    }
}

/// Process entry point: capture from the spool directory, classify over
/// HTTP, run until interrupted.
pub async fn run() -> anyhow::Result<()> {
    utils::init_logging();
    info!("screentrail starting up...");

    let data_dir = settings::data_dir();
    let classifier_settings = SettingsStore::new(data_dir.join("settings.json"))?
        .snapshot()
        .classifier;
    let classifier = Arc::new(HttpClassifier::new(classifier_settings)?);

    if std::env::args().nth(1).as_deref() == Some("test-connection") {
        let message = classifier.test_connection().await?;
        info!("{message}");
        return Ok(());
    }

    let source = Arc::new(SpoolCaptureSource::new(data_dir.join("spool"))?);
    let state = AppState::bootstrap(
        &data_dir,
        source,
        classifier,
        Arc::new(NoopOcr),
        Arc::new(SystemClock),
    )
    .await?;

    tokio::spawn(notify::follow(state.notifier.subscribe(), |change| {
        log::debug!("change: {}", change.name());
    }));

    let mut capture = CaptureController::new();
    let mut classification = ClassificationController::new();
    capture.start(Arc::clone(&state.pipeline))?;
    classification.start(state.worker.clone())?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutting down");

    capture.stop().await?;
    classification.stop().await?;
    Ok(())
}
