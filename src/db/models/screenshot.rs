use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One capture, owned by exactly one event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Screenshot {
    pub id: String,
    pub event_id: String,
    pub display_id: String,
    pub is_primary: bool,
    pub stable_hash: String,
    pub detail_hash: String,
    pub width: u32,
    pub height: u32,
    pub timestamp: DateTime<Utc>,
    /// Content-addressed frame file; exact repeats share one path.
    pub image_path: String,
}
