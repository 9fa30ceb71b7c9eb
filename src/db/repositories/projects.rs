use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, TransactionBehavior};
use serde::Serialize;

use crate::classifier::evaluator::plan_project_normalization;
use crate::db::{helpers::format_datetime, Database};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizationReport {
    pub updated_rows: usize,
    pub groups: usize,
}

impl Database {
    /// Re-points every project label to its group's canonical spelling in one
    /// transaction. Running it again right away updates nothing.
    pub async fn normalize_projects(&self, now: DateTime<Utc>) -> Result<NormalizationReport> {
        self.execute(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let rows = {
                let mut stmt = tx.prepare(
                    "SELECT id, project FROM events
                     WHERE project IS NOT NULL
                     ORDER BY start_at ASC, created_at ASC, id ASC",
                )?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            };

            let plan = plan_project_normalization(&rows);
            let now = format_datetime(&now);
            for (event_id, label) in &plan.updates {
                tx.execute(
                    "UPDATE events SET project = ?1, updated_at = ?2 WHERE id = ?3",
                    params![label, now, event_id],
                )
                .context("failed to update project label")?;
            }

            tx.commit().context("failed to commit project normalization")?;
            Ok(NormalizationReport {
                updated_rows: plan.updates.len(),
                groups: plan.groups,
            })
        })
        .await
    }

    /// Distinct project labels currently in use, sorted.
    pub async fn list_projects(&self) -> Result<Vec<String>> {
        self.execute(|conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT project FROM events WHERE project IS NOT NULL ORDER BY project",
            )?;
            let projects = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(projects)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repositories::events::tests::{capture, open_db, t0};
    use crate::events::config::MergeConfig;
    use crate::sensing::hasher::tests::sample_png;
    use chrono::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_normalization_is_idempotent_in_store() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);

        let spellings = ["Screen Trail", "screen trail", "Screen Trail", "Other"];
        for (i, name) in spellings.iter().enumerate() {
            let at = t0() + Duration::minutes(i as i64 * 10);
            let event = db
                .record_capture(
                    capture(&sample_png(0), &format!("App{i}"), at),
                    MergeConfig::default(),
                    at,
                )
                .await
                .unwrap()
                .into_event();
            db.set_event_project(&event.id, Some(name.to_string()), at)
                .await
                .unwrap();
        }

        let first = db.normalize_projects(t0()).await.unwrap();
        assert_eq!(first, NormalizationReport { updated_rows: 1, groups: 1 });
        assert_eq!(
            db.list_projects().await.unwrap(),
            vec!["Other".to_string(), "Screen Trail".to_string()]
        );

        let second = db.normalize_projects(t0()).await.unwrap();
        assert_eq!(second, NormalizationReport::default());
    }
}
