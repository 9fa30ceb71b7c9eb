use anyhow::{Context, Result};
use rusqlite::{params, Row};

use crate::db::{
    helpers::{invalid_data, parse_datetime},
    models::Screenshot,
    Database,
};

fn row_to_screenshot(row: &Row) -> Result<Screenshot, rusqlite::Error> {
    let timestamp: String = row.get("timestamp")?;
    Ok(Screenshot {
        id: row.get("id")?,
        event_id: row.get("event_id")?,
        display_id: row.get("display_id")?,
        is_primary: row.get("is_primary")?,
        stable_hash: row.get("stable_hash")?,
        detail_hash: row.get("detail_hash")?,
        width: row.get("width")?,
        height: row.get("height")?,
        timestamp: parse_datetime(&timestamp, "timestamp").map_err(invalid_data)?,
        image_path: row.get("image_path")?,
    })
}

impl Database {
    /// Screenshots of one event, oldest first.
    pub async fn get_screenshots_for_event(&self, event_id: &str) -> Result<Vec<Screenshot>> {
        let event_id = event_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, event_id, display_id, is_primary, stable_hash, detail_hash,
                        width, height, timestamp, image_path
                 FROM screenshots
                 WHERE event_id = ?1
                 ORDER BY timestamp ASC, rowid ASC",
            )?;
            let shots = stmt
                .query_map(params![event_id], row_to_screenshot)?
                .collect::<Result<Vec<_>, _>>()
                .context("failed to load screenshots")?;
            Ok(shots)
        })
        .await
    }

    /// Number of screenshots, across all events, that point at a frame file.
    pub async fn count_image_references(&self, image_path: &str) -> Result<u64> {
        let image_path = image_path.to_string();
        self.execute(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM screenshots WHERE image_path = ?1",
                params![image_path],
                |row| row.get(0),
            )?;
            Ok(u64::try_from(count).unwrap_or(0))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use crate::db::repositories::events::tests::{capture, open_db, t0};
    use crate::events::config::MergeConfig;
    use crate::sensing::hasher::tests::sample_png;
    use chrono::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_screenshots_are_ordered_and_counted() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        let png = sample_png(1);

        let event = db
            .record_capture(capture(&png, "Editor", t0()), MergeConfig::default(), t0())
            .await
            .unwrap()
            .into_event();
        let later = t0() + Duration::seconds(5);
        db.record_capture(capture(&png, "Editor", later), MergeConfig::default(), later)
            .await
            .unwrap();

        let shots = db.get_screenshots_for_event(&event.id).await.unwrap();
        assert_eq!(shots.len(), 2);
        assert!(shots[0].timestamp < shots[1].timestamp);
        assert_eq!((shots[0].width, shots[0].height), (128, 96));

        let refs = db.count_image_references(&shots[0].image_path).await.unwrap();
        assert_eq!(refs, 2);
        assert_eq!(db.count_image_references("/nowhere.png").await.unwrap(), 0);
    }
}
