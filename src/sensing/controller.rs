use std::sync::Arc;

use anyhow::{bail, Context, Result};
use log::info;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::events::pipeline::Pipeline;

use super::loop_worker::capture_loop;

pub struct CaptureController {
    handle: Option<JoinHandle<()>>,
    cancel_token: Option<CancellationToken>,
    interval_tx: Option<watch::Sender<u64>>,
    pipeline: Option<Arc<Pipeline>>,
}

impl CaptureController {
    pub fn new() -> Self {
        Self {
            handle: None,
            cancel_token: None,
            interval_tx: None,
            pipeline: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    pub fn start(&mut self, pipeline: Arc<Pipeline>) -> Result<()> {
        if self.handle.is_some() {
            bail!("capture already active");
        }

        let interval_secs = pipeline.settings().capture().interval_secs;
        let cancel_token = CancellationToken::new();
        let (interval_tx, interval_rx) = watch::channel(interval_secs);

        let handle = tokio::spawn(capture_loop(
            Arc::clone(&pipeline),
            interval_rx,
            cancel_token.clone(),
        ));

        self.handle = Some(handle);
        self.cancel_token = Some(cancel_token);
        self.interval_tx = Some(interval_tx);
        self.pipeline = Some(pipeline);
        info!("capture started every {interval_secs}s");
        Ok(())
    }

    /// Persists the new interval and, when running, retimes the loop.
    pub fn set_interval(&mut self, interval_secs: u64) -> Result<()> {
        if interval_secs == 0 {
            bail!("capture interval must be at least one second");
        }

        if let Some(pipeline) = &self.pipeline {
            pipeline
                .settings()
                .update(|s| s.capture.interval_secs = interval_secs)
                .context("failed to persist capture interval")?;
        }
        if let Some(tx) = &self.interval_tx {
            // only fails when the loop already exited
            let _ = tx.send(interval_secs);
        }
        Ok(())
    }

    pub async fn stop(&mut self) -> Result<()> {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }
        self.interval_tx = None;

        if let Some(handle) = self.handle.take() {
            handle.await.context("capture loop task failed to join")
        } else {
            Ok(())
        }
    }
}

impl Default for CaptureController {
    fn default() -> Self {
        Self::new()
    }
}
