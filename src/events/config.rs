use serde::{Deserialize, Serialize};

/// Tunable thresholds for the dedup/merge engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct MergeConfig {
    /// A capture may extend an event whose `end_at` is at most this far behind it.
    pub lookback_secs: u64,

    /// Maximum Hamming distance between stable hashes that still counts as the same scene.
    pub hamming_tolerance: u32,

    /// Completed events below this confidence are reclassified when they grow.
    pub requeue_below_confidence: f64,

    /// Cap on low-confidence requeues per event.
    pub max_low_confidence_requeues: u32,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            lookback_secs: 180,
            hamming_tolerance: 6,
            requeue_below_confidence: 0.5,
            max_low_confidence_requeues: 1,
        }
    }
}

impl MergeConfig {
    pub fn lookback(&self) -> chrono::Duration {
        i64::try_from(self.lookback_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX)
    }
}
