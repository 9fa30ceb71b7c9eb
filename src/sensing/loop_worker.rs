use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::{Duration, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::events::pipeline::Pipeline;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

fn new_ticker(interval_secs: u64) -> Interval {
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Triggers a capture every tick until cancelled. A new value on
/// `interval_rx` restarts the ticker at that period.
pub async fn capture_loop(
    pipeline: Arc<Pipeline>,
    mut interval_rx: watch::Receiver<u64>,
    cancel_token: CancellationToken,
) {
    let mut ticker = new_ticker(*interval_rx.borrow());

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let timeout_secs = pipeline.settings().capture().timeout_secs.max(1);
                let started = Instant::now();

                match tokio::time::timeout(Duration::from_secs(timeout_secs), pipeline.capture_now()).await {
                    Ok(Ok(report)) if report.skipped => log_debug!("capture skipped, previous one still running"),
                    Ok(Ok(report)) => {
                        if report.created + report.merged + report.exact_repeats + report.dropped > 0 {
                            log_debug!(
                                "capture took {}ms: {} created, {} merged, {} repeats, {} dropped",
                                started.elapsed().as_millis(),
                                report.created,
                                report.merged,
                                report.exact_repeats,
                                report.dropped
                            );
                        }
                    }
                    Ok(Err(err)) => log_error!("capture failed: {err}"),
                    Err(_) => log_warn!("capture timeout (> {}s), unrecorded frames stay with the source", timeout_secs),
                }
            }
            changed = interval_rx.changed() => {
                if changed.is_err() {
                    log_info!("capture interval sender dropped, stopping loop");
                    break;
                }
                let secs = *interval_rx.borrow_and_update();
                log_info!("capture interval changed to {secs}s");
                ticker = new_ticker(secs);
                // skip the immediate first tick of the new ticker
                ticker.reset();
            }
            _ = cancel_token.cancelled() => {
                log_info!("capture loop shutting down");
                break;
            }
        }
    }
}
