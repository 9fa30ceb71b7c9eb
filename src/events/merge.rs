use chrono::{DateTime, Utc};

use crate::db::models::EventStatus;
use crate::events::config::MergeConfig;
use crate::sensing::hasher::compute_hamming_distance;

/// What the store knows about the latest mergeable event on a display.
#[derive(Debug, Clone)]
pub struct MergeCandidate {
    pub event_id: String,
    pub end_at: DateTime<Utc>,
    pub status: EventStatus,
    pub confidence: Option<f64>,
    pub context_key: Option<String>,
    pub requeue_count: u32,
    /// Hashes of the event's latest screenshot.
    pub latest_stable_hash: String,
    pub latest_detail_hash: String,
}

#[derive(Debug, Clone, Copy)]
pub struct IncomingFrame<'a> {
    pub timestamp: DateTime<Utc>,
    pub stable_hash: &'a str,
    pub detail_hash: &'a str,
    pub context_key: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeDecision {
    /// Byte-identical to the latest screenshot: count it, nothing else.
    ExactRepeat { event_id: String },
    /// Same scene, same context: append and extend.
    Extend { event_id: String, requeue: bool },
    Create,
}

/// Decides whether a capture extends `candidate` or starts a new event.
pub fn decide_merge(
    candidate: Option<&MergeCandidate>,
    incoming: &IncomingFrame<'_>,
    config: &MergeConfig,
) -> MergeDecision {
    let Some(candidate) = candidate else {
        return MergeDecision::Create;
    };

    if !within_lookback(candidate.end_at, incoming.timestamp, config) {
        return MergeDecision::Create;
    }

    if candidate.latest_detail_hash == incoming.detail_hash {
        return MergeDecision::ExactRepeat {
            event_id: candidate.event_id.clone(),
        };
    }

    let distance = compute_hamming_distance(&candidate.latest_stable_hash, incoming.stable_hash);
    let same_context = candidate.context_key.as_deref() == incoming.context_key;
    if distance <= config.hamming_tolerance && same_context {
        return MergeDecision::Extend {
            event_id: candidate.event_id.clone(),
            requeue: should_requeue(candidate, config),
        };
    }

    MergeDecision::Create
}

/// Out-of-order captures (timestamp before `end_at`) count as inside the window.
pub fn within_lookback(end_at: DateTime<Utc>, timestamp: DateTime<Utc>, config: &MergeConfig) -> bool {
    timestamp - end_at <= config.lookback()
}

fn should_requeue(candidate: &MergeCandidate, config: &MergeConfig) -> bool {
    if candidate.status != EventStatus::Completed {
        return false;
    }
    if candidate.requeue_count >= config.max_low_confidence_requeues {
        return false;
    }
    candidate
        .confidence
        .map_or(true, |confidence| confidence < config.requeue_below_confidence)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensing::hasher::{
        compute_hamming_distance, hash_frame,
        tests::{encode, sample_png},
    };
    use chrono::{Duration, TimeZone};

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 4, 10, 0, 0).unwrap()
    }

    fn candidate(stable: &str, detail: &str) -> MergeCandidate {
        MergeCandidate {
            event_id: "e1".into(),
            end_at: base_time(),
            status: EventStatus::Pending,
            confidence: None,
            context_key: Some("app:Editor".into()),
            requeue_count: 0,
            latest_stable_hash: stable.into(),
            latest_detail_hash: detail.into(),
        }
    }

    #[test]
    fn test_no_candidate_creates() {
        let incoming = IncomingFrame {
            timestamp: base_time(),
            stable_hash: "x",
            detail_hash: "y",
            context_key: None,
        };
        assert_eq!(
            decide_merge(None, &incoming, &MergeConfig::default()),
            MergeDecision::Create
        );
    }

    #[test]
    fn test_exact_repeat_wins_even_if_context_changed() {
        let hashes = hash_frame(&sample_png(0)).unwrap();
        let cand = candidate(&hashes.stable, &hashes.detail);
        let incoming = IncomingFrame {
            timestamp: base_time() + Duration::seconds(5),
            stable_hash: &hashes.stable,
            detail_hash: &hashes.detail,
            context_key: Some("app:Other"),
        };
        assert_eq!(
            decide_merge(Some(&cand), &incoming, &MergeConfig::default()),
            MergeDecision::ExactRepeat {
                event_id: "e1".into()
            }
        );
    }

    #[test]
    fn test_similar_frame_same_context_extends() {
        let hashes = hash_frame(&sample_png(0)).unwrap();
        let cand = candidate(&hashes.stable, "older-detail");
        let incoming = IncomingFrame {
            timestamp: base_time() + Duration::seconds(5),
            stable_hash: &hashes.stable,
            detail_hash: &hashes.detail,
            context_key: Some("app:Editor"),
        };
        assert_eq!(
            decide_merge(Some(&cand), &incoming, &MergeConfig::default()),
            MergeDecision::Extend {
                event_id: "e1".into(),
                requeue: false
            }
        );
    }

    #[test]
    fn test_context_change_creates() {
        let hashes = hash_frame(&sample_png(0)).unwrap();
        let cand = candidate(&hashes.stable, "older-detail");
        let incoming = IncomingFrame {
            timestamp: base_time() + Duration::seconds(5),
            stable_hash: &hashes.stable,
            detail_hash: &hashes.detail,
            context_key: Some("app:Browser"),
        };
        assert_eq!(
            decide_merge(Some(&cand), &incoming, &MergeConfig::default()),
            MergeDecision::Create
        );
    }

    #[test]
    fn test_zero_tolerance_and_unreadable_hash() {
        let hashes = hash_frame(&sample_png(0)).unwrap();
        let cand = candidate(&hashes.stable, "older-detail");
        let incoming = IncomingFrame {
            timestamp: base_time() + Duration::seconds(5),
            stable_hash: &hashes.stable,
            detail_hash: &hashes.detail,
            context_key: Some("app:Editor"),
        };
        let strict = MergeConfig {
            hamming_tolerance: 0,
            ..MergeConfig::default()
        };
        // identical stable hash is distance 0, still inside a zero tolerance
        assert!(matches!(
            decide_merge(Some(&cand), &incoming, &strict),
            MergeDecision::Extend { .. }
        ));

        let unreadable = IncomingFrame {
            stable_hash: "!!",
            ..incoming
        };
        assert_eq!(
            decide_merge(Some(&cand), &unreadable, &MergeConfig::default()),
            MergeDecision::Create
        );
    }

    #[test]
    fn test_different_scene_same_context_creates() {
        let before = hash_frame(&sample_png(0)).unwrap();
        let mut inverted = image::load_from_memory(&sample_png(0)).unwrap().to_rgb8();
        image::imageops::invert(&mut inverted);
        let after = hash_frame(&encode(inverted)).unwrap();

        let config = MergeConfig::default();
        assert!(compute_hamming_distance(&before.stable, &after.stable) > config.hamming_tolerance);

        let cand = candidate(&before.stable, &before.detail);
        let incoming = IncomingFrame {
            timestamp: base_time() + Duration::seconds(5),
            stable_hash: &after.stable,
            detail_hash: &after.detail,
            context_key: Some("app:Editor"),
        };
        assert_eq!(decide_merge(Some(&cand), &incoming, &config), MergeDecision::Create);
    }

    #[test]
    fn test_lookback_window_elapsed_creates() {
        let hashes = hash_frame(&sample_png(0)).unwrap();
        let cand = candidate(&hashes.stable, &hashes.detail);
        let config = MergeConfig::default();
        let late = IncomingFrame {
            timestamp: base_time() + config.lookback() + Duration::seconds(1),
            stable_hash: &hashes.stable,
            detail_hash: &hashes.detail,
            context_key: Some("app:Editor"),
        };
        assert_eq!(decide_merge(Some(&cand), &late, &config), MergeDecision::Create);

        let edge = IncomingFrame {
            timestamp: base_time() + config.lookback(),
            ..late
        };
        assert!(matches!(
            decide_merge(Some(&cand), &edge, &config),
            MergeDecision::ExactRepeat { .. }
        ));
    }

    #[test]
    fn test_low_confidence_completed_event_requeues_once() {
        let hashes = hash_frame(&sample_png(0)).unwrap();
        let mut cand = candidate(&hashes.stable, "older-detail");
        cand.status = EventStatus::Completed;
        cand.confidence = Some(0.3);
        let incoming = IncomingFrame {
            timestamp: base_time() + Duration::seconds(5),
            stable_hash: &hashes.stable,
            detail_hash: &hashes.detail,
            context_key: Some("app:Editor"),
        };
        let config = MergeConfig::default();
        assert_eq!(
            decide_merge(Some(&cand), &incoming, &config),
            MergeDecision::Extend {
                event_id: "e1".into(),
                requeue: true
            }
        );

        cand.requeue_count = 1;
        assert_eq!(
            decide_merge(Some(&cand), &incoming, &config),
            MergeDecision::Extend {
                event_id: "e1".into(),
                requeue: false
            }
        );
    }

    #[test]
    fn test_failed_event_extends_without_retry() {
        let hashes = hash_frame(&sample_png(0)).unwrap();
        let mut cand = candidate(&hashes.stable, "older-detail");
        cand.status = EventStatus::Failed;
        let incoming = IncomingFrame {
            timestamp: base_time() + Duration::seconds(5),
            stable_hash: &hashes.stable,
            detail_hash: &hashes.detail,
            context_key: Some("app:Editor"),
        };
        assert_eq!(
            decide_merge(Some(&cand), &incoming, &MergeConfig::default()),
            MergeDecision::Extend {
                event_id: "e1".into(),
                requeue: false
            }
        );
    }
}
