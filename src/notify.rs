use log::{debug, warn};
use serde::Serialize;
use tokio::sync::broadcast;

/// Fired after every committed state transition so dependent views can refresh.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ChangeNotification {
    EventCreated { event_id: String },
    EventUpdated { event_id: String },
    EventsChanged { event_ids: Vec<String> },
    ProjectsNormalized { updated_rows: usize, groups: usize },
}

impl ChangeNotification {
    pub fn name(&self) -> &'static str {
        match self {
            ChangeNotification::EventCreated { .. } => "event-created",
            ChangeNotification::EventUpdated { .. } => "event-updated",
            ChangeNotification::EventsChanged { .. } => "events-changed",
            ChangeNotification::ProjectsNormalized { .. } => "projects-normalized",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Notifier {
    sender: broadcast::Sender<ChangeNotification>,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeNotification> {
        self.sender.subscribe()
    }

    /// Nobody listening is not an error.
    pub fn emit(&self, notification: ChangeNotification) {
        debug!("notify {}: {:?}", notification.name(), notification);
        let _ = self.sender.send(notification);
    }

    pub fn event_created(&self, event_id: &str) {
        self.emit(ChangeNotification::EventCreated {
            event_id: event_id.to_string(),
        });
    }

    pub fn event_updated(&self, event_id: &str) {
        self.emit(ChangeNotification::EventUpdated {
            event_id: event_id.to_string(),
        });
    }
}

/// Feeds every notification to `on_change` until all senders are gone. A
/// receiver that falls behind skips what it missed and keeps going.
/// Returns how many notifications were skipped.
pub async fn follow(
    mut changes: broadcast::Receiver<ChangeNotification>,
    mut on_change: impl FnMut(&ChangeNotification),
) -> u64 {
    let mut skipped = 0;
    loop {
        match changes.recv().await {
            Ok(change) => on_change(&change),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!("change listener fell behind, skipped {missed} notifications");
                skipped += missed;
            }
            Err(broadcast::error::RecvError::Closed) => return skipped,
        }
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_in_order() {
        let notifier = Notifier::default();
        let mut rx = notifier.subscribe();

        notifier.event_created("e1");
        notifier.emit(ChangeNotification::ProjectsNormalized {
            updated_rows: 3,
            groups: 1,
        });

        assert_eq!(rx.recv().await.unwrap().name(), "event-created");
        assert_eq!(
            rx.recv().await.unwrap(),
            ChangeNotification::ProjectsNormalized {
                updated_rows: 3,
                groups: 1
            }
        );
    }

    #[test]
    fn test_serialized_shape() {
        let json = serde_json::to_value(ChangeNotification::EventUpdated {
            event_id: "e1".into(),
        })
        .unwrap();
        assert_eq!(json["kind"], "event-updated");
        assert_eq!(json["eventId"], "e1");
    }

    #[test]
    fn test_emit_without_subscribers() {
        Notifier::new(1).event_updated("e1");
    }

    #[tokio::test]
    async fn test_follow_survives_falling_behind() {
        let notifier = Notifier::new(2);
        let rx = notifier.subscribe();
        for id in ["e1", "e2", "e3", "e4", "e5"] {
            notifier.event_created(id);
        }
        drop(notifier);

        let mut seen = Vec::new();
        let skipped = follow(rx, |change| {
            if let ChangeNotification::EventCreated { event_id } = change {
                seen.push(event_id.clone());
            }
        })
        .await;
        assert_eq!(skipped, 3);
        assert_eq!(seen, vec!["e4".to_string(), "e5".to_string()]);
    }
}
