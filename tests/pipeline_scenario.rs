use std::io::Cursor;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use tempfile::TempDir;

use screentrail_lib::classifier::{ClassificationRequest, ClassifierGateway, ClassifierOutput};
use screentrail_lib::clock::{Clock, ManualClock};
use screentrail_lib::db::{EventFilter, EventStatus};
use screentrail_lib::error::{PipelineError, PipelineResult};
use screentrail_lib::sensing::{CaptureSource, CapturedFrame, NoopOcr, WindowMetadata};
use screentrail_lib::AppState;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 5, 4, 9, 0, 0).unwrap()
}

fn encode(img: RgbImage) -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img)
        .write_to(&mut out, ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

fn screen() -> RgbImage {
    let mut img = RgbImage::from_fn(128, 96, |x, y| {
        let v = ((x + y) * 255 / (128 + 96)) as u8;
        Rgb([v, v / 2, 255 - v])
    });
    for x in 0..24 {
        for y in 10..40 {
            img.put_pixel(x, y, Rgb([255, 255, 255]));
        }
    }
    img
}

fn noisy_screen() -> RgbImage {
    let mut img = screen();
    img.put_pixel(100, 80, Rgb([0, 0, 0]));
    img
}

fn frame(img: RgbImage, app: &str) -> CapturedFrame {
    CapturedFrame {
        display_id: "main".into(),
        is_primary: true,
        captured_at: None,
        png_bytes: encode(img),
        window: Some(WindowMetadata {
            bundle_id: app.into(),
            title: format!("{app} - window"),
            owner_name: app.into(),
            url: None,
        }),
        receipt: None,
    }
}

#[derive(Default)]
struct QueuedFrames {
    frames: Mutex<Vec<CapturedFrame>>,
}

impl QueuedFrames {
    fn push(&self, frame: CapturedFrame) {
        self.frames.lock().unwrap().push(frame);
    }
}

#[async_trait]
impl CaptureSource for QueuedFrames {
    async fn capture(&self) -> PipelineResult<Vec<CapturedFrame>> {
        Ok(std::mem::take(&mut *self.frames.lock().unwrap()))
    }
}

#[derive(Clone)]
enum Reply {
    Label(&'static str, f64),
    Timeout,
}

struct FakeClassifier {
    reply: Mutex<Reply>,
    calls: Mutex<Vec<String>>,
}

impl FakeClassifier {
    fn new(reply: Reply) -> Self {
        Self {
            reply: Mutex::new(reply),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn set(&self, reply: Reply) {
        *self.reply.lock().unwrap() = reply;
    }

    fn calls_for(&self, event_id: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|id| id.as_str() == event_id)
            .count()
    }
}

#[async_trait]
impl ClassifierGateway for FakeClassifier {
    async fn classify(&self, request: &ClassificationRequest) -> PipelineResult<ClassifierOutput> {
        self.calls.lock().unwrap().push(request.event_id.clone());
        let reply = self.reply.lock().unwrap().clone();
        match reply {
            Reply::Label(category, confidence) => Ok(ClassifierOutput {
                category: Some(category.to_string()),
                caption: Some(format!("{category} session")),
                confidence: Some(confidence),
                ..ClassifierOutput::default()
            }),
            Reply::Timeout => Err(PipelineError::transient("request timed out")),
        }
    }

    async fn test_connection(&self) -> PipelineResult<String> {
        Ok("fake".into())
    }
}

struct Scenario {
    _dir: TempDir,
    clock: Arc<ManualClock>,
    source: Arc<QueuedFrames>,
    classifier: Arc<FakeClassifier>,
    state: AppState,
}

async fn scenario(reply: Reply) -> Scenario {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(t0()));
    let source = Arc::new(QueuedFrames::default());
    let classifier = Arc::new(FakeClassifier::new(reply));
    let state = AppState::bootstrap(
        dir.path(),
        source.clone(),
        classifier.clone(),
        Arc::new(NoopOcr),
        clock.clone(),
    )
    .await
    .unwrap();
    Scenario {
        _dir: dir,
        clock,
        source,
        classifier,
        state,
    }
}

#[tokio::test]
async fn merge_classify_and_exhaust_retries() {
    let s = scenario(Reply::Label("Work", 0.9)).await;
    let pipeline = &s.state.pipeline;
    let worker = &s.state.worker;
    let mut changes = s.state.notifier.subscribe();

    // capture A creates E1
    s.source.push(frame(screen(), "Editor"));
    let report = pipeline.capture_now().await.unwrap();
    assert_eq!(report.created, 1);
    let events = pipeline.list_events(EventFilter::default()).await.unwrap();
    let e1 = events[0].clone();
    assert_eq!(e1.status, EventStatus::Pending);
    assert_eq!(e1.context_key.as_deref(), Some("app:Editor"));
    assert_eq!(changes.recv().await.unwrap().name(), "event-created");

    // classifier labels it
    let tick = worker.run_once().await.unwrap();
    assert_eq!(tick.completed, 1);
    let e1 = pipeline.get_event(&e1.id).await.unwrap();
    assert_eq!(e1.status, EventStatus::Completed);
    assert_eq!(e1.category.as_deref(), Some("Work"));
    assert_eq!(e1.confidence, Some(0.9));

    // capture B: same scene with a little noise, same context
    s.clock.advance(Duration::seconds(5));
    s.source.push(frame(noisy_screen(), "Editor"));
    let report = pipeline.capture_now().await.unwrap();
    assert_eq!(report.merged, 1);
    let e1 = pipeline.get_event(&e1.id).await.unwrap();
    assert_eq!(e1.merged_count, 2);
    assert_eq!(e1.end_at, t0() + Duration::seconds(5));
    assert_eq!(e1.status, EventStatus::Completed);
    assert!(pipeline.get_queue_entry(&e1.id).await.unwrap().is_none());
    assert_eq!(worker.run_once().await.unwrap().claimed, 0);
    assert_eq!(s.classifier.calls_for(&e1.id), 1);

    // capture C: context switches
    s.clock.advance(Duration::seconds(5));
    s.source.push(frame(screen(), "Browser"));
    assert_eq!(pipeline.capture_now().await.unwrap().created, 1);
    let e2 = pipeline
        .list_events(EventFilter::default())
        .await
        .unwrap()
        .into_iter()
        .find(|e| e.id != e1.id)
        .unwrap();
    assert_eq!(e2.context_key.as_deref(), Some("app:Browser"));

    // E2 keeps timing out
    s.classifier.set(Reply::Timeout);
    let max_attempts = s.state.settings.snapshot().queue.max_attempts;
    let mut previous_delay = Duration::zero();
    for attempt in 1..max_attempts {
        let now = s.clock.now();
        assert_eq!(worker.run_once().await.unwrap().rescheduled, 1);

        let entry = pipeline.get_queue_entry(&e2.id).await.unwrap().unwrap();
        assert_eq!(entry.attempts, attempt);
        let delay = entry.next_attempt_at - now;
        assert!(delay > previous_delay, "delay must grow at attempt {attempt}");
        previous_delay = delay;
        assert_eq!(
            pipeline.get_event(&e2.id).await.unwrap().status,
            EventStatus::Pending
        );

        s.clock.set(entry.next_attempt_at);
    }

    assert_eq!(worker.run_once().await.unwrap().failed, 1);
    let e2 = pipeline.get_event(&e2.id).await.unwrap();
    assert_eq!(e2.status, EventStatus::Failed);
    assert!(!e2.dismissed);
    assert!(pipeline.get_queue_entry(&e2.id).await.unwrap().is_none());

    // terminal: nothing more is attempted
    s.clock.advance(Duration::hours(2));
    assert_eq!(worker.run_once().await.unwrap().claimed, 0);
    assert_eq!(s.classifier.calls_for(&e2.id), max_attempts as usize);

    // a manual retry puts it back with a fresh budget
    s.classifier.set(Reply::Label("Research", 0.85));
    pipeline.retry_event(&e2.id).await.unwrap();
    assert_eq!(worker.run_once().await.unwrap().completed, 1);
    let e2 = pipeline.get_event(&e2.id).await.unwrap();
    assert_eq!(e2.status, EventStatus::Completed);
    assert_eq!(e2.category.as_deref(), Some("Research"));
}

#[tokio::test]
async fn low_confidence_event_is_requeued_once_when_it_grows() {
    let s = scenario(Reply::Label("Unclear", 0.3)).await;
    let pipeline = &s.state.pipeline;
    let worker = &s.state.worker;

    s.source.push(frame(screen(), "Editor"));
    pipeline.capture_now().await.unwrap();
    worker.run_once().await.unwrap();
    let event = pipeline
        .list_events(EventFilter::default())
        .await
        .unwrap()
        .remove(0);
    assert_eq!(event.status, EventStatus::Completed);

    s.clock.advance(Duration::seconds(5));
    s.source.push(frame(noisy_screen(), "Editor"));
    pipeline.capture_now().await.unwrap();
    let requeued = pipeline.get_event(&event.id).await.unwrap();
    assert_eq!(requeued.status, EventStatus::Pending);
    assert_eq!(requeued.requeue_count, 1);
    assert!(pipeline.get_queue_entry(&event.id).await.unwrap().is_some());

    worker.run_once().await.unwrap();
    assert_eq!(s.classifier.calls_for(&event.id), 2);

    // the cap stops further billing for this event
    s.clock.advance(Duration::seconds(5));
    s.source.push(frame(screen(), "Editor"));
    pipeline.capture_now().await.unwrap();
    let settled = pipeline.get_event(&event.id).await.unwrap();
    assert_eq!(settled.status, EventStatus::Completed);
    assert_eq!(settled.merged_count, 3);
    assert!(pipeline.get_queue_entry(&event.id).await.unwrap().is_none());
}

#[tokio::test]
async fn restart_returns_processing_events_to_the_queue() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(t0()));
    let classifier = Arc::new(FakeClassifier::new(Reply::Label("Work", 0.9)));

    let event_id = {
        let source = Arc::new(QueuedFrames::default());
        let state = AppState::bootstrap(
            dir.path(),
            source.clone(),
            classifier.clone(),
            Arc::new(NoopOcr),
            clock.clone(),
        )
        .await
        .unwrap();
        source.push(frame(screen(), "Editor"));
        state.pipeline.capture_now().await.unwrap();

        // simulate a crash mid-classification
        let claimed = state.db.claim_due_entries(clock.now(), 1).await.unwrap();
        assert_eq!(claimed[0].event.status, EventStatus::Processing);
        claimed[0].event.id.clone()
    };

    let state = AppState::bootstrap(
        dir.path(),
        Arc::new(QueuedFrames::default()),
        classifier.clone(),
        Arc::new(NoopOcr),
        clock.clone(),
    )
    .await
    .unwrap();
    assert_eq!(
        state.pipeline.get_event(&event_id).await.unwrap().status,
        EventStatus::Pending
    );
    assert_eq!(state.worker.run_once().await.unwrap().completed, 1);
}
