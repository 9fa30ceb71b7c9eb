use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{
    params, params_from_iter, types::Value, Connection, OptionalExtension, Row,
    TransactionBehavior,
};
use uuid::Uuid;

use crate::db::{
    helpers::{format_datetime, from_json, invalid_data, parse_datetime, parse_status, to_json, to_u32},
    models::{Event, EventStatus},
    repositories::queue::enqueue,
    Database,
};
use crate::events::config::MergeConfig;
use crate::events::merge::{decide_merge, IncomingFrame, MergeCandidate, MergeDecision};
use crate::sensing::context::{ContextAttribution, ContextPayload};
use crate::sensing::hasher::FrameHashes;

pub(crate) const EVENT_COLUMNS: &str = "id, display_id, start_at, end_at, stable_hash, detail_hash,
    merged_count, status, dismissed, category, subcategories_json, caption, tags_json, confidence,
    tracked_addiction, addiction_candidate, addiction_confidence, addiction_prompt,
    project, project_progress, project_progress_confidence, project_progress_evidence_json,
    context_provider, context_confidence, context_key, context_json, ocr_text, ocr_degraded,
    category_overridden, caption_overridden, project_overridden,
    requeue_count, created_at, updated_at";

pub(crate) fn row_to_event(row: &Row) -> Result<Event, rusqlite::Error> {
    let start_at: String = row.get("start_at")?;
    let end_at: String = row.get("end_at")?;
    let status: String = row.get("status")?;
    let subcategories: String = row.get("subcategories_json")?;
    let tags: String = row.get("tags_json")?;
    let evidence: String = row.get("project_progress_evidence_json")?;
    let context_json: Option<String> = row.get("context_json")?;
    let merged_count: i64 = row.get("merged_count")?;
    let requeue_count: i64 = row.get("requeue_count")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;

    Ok(Event {
        id: row.get("id")?,
        display_id: row.get("display_id")?,
        start_at: parse_datetime(&start_at, "start_at").map_err(invalid_data)?,
        end_at: parse_datetime(&end_at, "end_at").map_err(invalid_data)?,
        stable_hash: row.get("stable_hash")?,
        detail_hash: row.get("detail_hash")?,
        merged_count: to_u32(merged_count, "merged_count").map_err(invalid_data)?,
        status: parse_status(&status).map_err(invalid_data)?,
        dismissed: row.get("dismissed")?,
        category: row.get("category")?,
        subcategories: from_json(&subcategories, "subcategories").map_err(invalid_data)?,
        caption: row.get("caption")?,
        tags: from_json(&tags, "tags").map_err(invalid_data)?,
        confidence: row.get("confidence")?,
        tracked_addiction: row.get("tracked_addiction")?,
        addiction_candidate: row.get("addiction_candidate")?,
        addiction_confidence: row.get("addiction_confidence")?,
        addiction_prompt: row.get("addiction_prompt")?,
        project: row.get("project")?,
        project_progress: row.get("project_progress")?,
        project_progress_confidence: row.get("project_progress_confidence")?,
        project_progress_evidence: from_json(&evidence, "project_progress_evidence")
            .map_err(invalid_data)?,
        context_provider: row.get("context_provider")?,
        context_confidence: row.get("context_confidence")?,
        context_key: row.get("context_key")?,
        context_json: context_json
            .map(|raw| from_json::<ContextPayload>(&raw, "context_json"))
            .transpose()
            .map_err(invalid_data)?,
        ocr_text: row.get("ocr_text")?,
        ocr_degraded: row.get("ocr_degraded")?,
        category_overridden: row.get("category_overridden")?,
        caption_overridden: row.get("caption_overridden")?,
        project_overridden: row.get("project_overridden")?,
        requeue_count: to_u32(requeue_count, "requeue_count").map_err(invalid_data)?,
        created_at: parse_datetime(&created_at, "created_at").map_err(invalid_data)?,
        updated_at: parse_datetime(&updated_at, "updated_at").map_err(invalid_data)?,
    })
}

pub(crate) fn load_event(conn: &Connection, event_id: &str) -> Result<Option<Event>> {
    let sql = format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = ?1");
    let event = conn
        .query_row(&sql, params![event_id], row_to_event)
        .optional()
        .with_context(|| format!("failed to load event {event_id}"))?;
    Ok(event)
}

/// A hashed, attributed capture ready to be merged or turned into an event.
#[derive(Debug, Clone)]
pub struct NewCapture {
    pub display_id: String,
    pub is_primary: bool,
    pub timestamp: DateTime<Utc>,
    pub hashes: FrameHashes,
    pub image_path: String,
    pub attribution: ContextAttribution,
}

#[derive(Debug, Clone)]
pub enum MergeOutcome {
    ExactRepeat(Event),
    Extended { event: Event, requeued: bool },
    Created(Event),
}

impl MergeOutcome {
    pub fn event(&self) -> &Event {
        match self {
            MergeOutcome::ExactRepeat(event) => event,
            MergeOutcome::Extended { event, .. } => event,
            MergeOutcome::Created(event) => event,
        }
    }

    pub fn into_event(self) -> Event {
        match self {
            MergeOutcome::ExactRepeat(event) => event,
            MergeOutcome::Extended { event, .. } => event,
            MergeOutcome::Created(event) => event,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub category: Option<String>,
    /// Matched case-insensitively.
    pub project: Option<String>,
    pub status: Option<EventStatus>,
    pub include_dismissed: bool,
    pub limit: Option<u32>,
}

enum Applied {
    Repeat,
    Extended(bool),
    Created,
}

fn load_merge_candidate(conn: &Connection, display_id: &str) -> Result<Option<MergeCandidate>> {
    let row = conn
        .query_row(
            "SELECT e.id, e.end_at, e.status, e.confidence, e.context_key, e.requeue_count,
                    e.dismissed, s.stable_hash, s.detail_hash
             FROM events e
             JOIN screenshots s ON s.event_id = e.id
             WHERE e.display_id = ?1
             ORDER BY e.end_at DESC, s.timestamp DESC, s.rowid DESC
             LIMIT 1",
            params![display_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<f64>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, bool>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, String>(8)?,
                ))
            },
        )
        .optional()
        .context("failed to load merge candidate")?;

    let Some((event_id, end_at, status, confidence, context_key, requeue_count, dismissed, stable, detail)) =
        row
    else {
        return Ok(None);
    };

    // the user hid it; later captures start fresh
    if dismissed {
        return Ok(None);
    }

    Ok(Some(MergeCandidate {
        event_id,
        end_at: parse_datetime(&end_at, "end_at")?,
        status: parse_status(&status)?,
        confidence,
        context_key,
        requeue_count: to_u32(requeue_count, "requeue_count")?,
        latest_stable_hash: stable,
        latest_detail_hash: detail,
    }))
}

fn insert_screenshot(conn: &Connection, event_id: &str, capture: &NewCapture) -> Result<()> {
    conn.execute(
        "INSERT INTO screenshots (
            id, event_id, display_id, is_primary, stable_hash, detail_hash,
            width, height, timestamp, image_path
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            Uuid::new_v4().to_string(),
            event_id,
            capture.display_id,
            capture.is_primary,
            capture.hashes.stable,
            capture.hashes.detail,
            capture.hashes.width,
            capture.hashes.height,
            format_datetime(&capture.timestamp),
            capture.image_path,
        ],
    )
    .context("failed to insert screenshot")?;
    Ok(())
}

fn extend_event(conn: &Connection, event_id: &str, capture: &NewCapture, now: &str) -> Result<()> {
    conn.execute(
        "UPDATE events
         SET merged_count = merged_count + 1,
             end_at = MAX(end_at, ?1),
             stable_hash = ?2,
             detail_hash = ?3,
             updated_at = ?4
         WHERE id = ?5",
        params![
            format_datetime(&capture.timestamp),
            capture.hashes.stable,
            capture.hashes.detail,
            now,
            event_id,
        ],
    )
    .context("failed to extend event")?;
    Ok(())
}

fn insert_event(conn: &Connection, event_id: &str, capture: &NewCapture, now: &str) -> Result<()> {
    let timestamp = format_datetime(&capture.timestamp);
    let attribution = &capture.attribution;
    conn.execute(
        "INSERT INTO events (
            id, display_id, start_at, end_at, stable_hash, detail_hash, merged_count, status,
            context_provider, context_confidence, context_key, context_json,
            created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?3, ?4, ?5, 1, 'pending', ?6, ?7, ?8, ?9, ?10, ?10)",
        params![
            event_id,
            capture.display_id,
            timestamp,
            capture.hashes.stable,
            capture.hashes.detail,
            attribution.provider.as_str(),
            attribution.confidence,
            attribution.key,
            to_json(&attribution.payload, "context_json")?,
            now,
        ],
    )
    .context("failed to insert event")?;
    Ok(())
}

impl Database {
    /// Merge-or-create for one capture, as a single immediate transaction:
    /// the candidate is read, the decision made, and the rows written before
    /// any other capture can look at the same display.
    pub async fn record_capture(
        &self,
        capture: NewCapture,
        config: MergeConfig,
        now: DateTime<Utc>,
    ) -> Result<MergeOutcome> {
        self.execute(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .context("failed to open merge transaction")?;
            let now = format_datetime(&now);

            let candidate = load_merge_candidate(&tx, &capture.display_id)?;
            let incoming = IncomingFrame {
                timestamp: capture.timestamp,
                stable_hash: &capture.hashes.stable,
                detail_hash: &capture.hashes.detail,
                context_key: capture.attribution.key.as_deref(),
            };

            let (event_id, applied) = match decide_merge(candidate.as_ref(), &incoming, &config) {
                MergeDecision::ExactRepeat { event_id } => {
                    insert_screenshot(&tx, &event_id, &capture)?;
                    extend_event(&tx, &event_id, &capture, &now)?;
                    (event_id, Applied::Repeat)
                }
                MergeDecision::Extend { event_id, requeue } => {
                    insert_screenshot(&tx, &event_id, &capture)?;
                    extend_event(&tx, &event_id, &capture, &now)?;
                    let mut requeued = false;
                    if requeue {
                        let changed = tx.execute(
                            "UPDATE events
                             SET status = 'pending', requeue_count = requeue_count + 1, updated_at = ?1
                             WHERE id = ?2 AND status = 'completed'",
                            params![now, event_id],
                        )?;
                        if changed == 1 {
                            enqueue(&tx, &event_id, &now)?;
                            requeued = true;
                        }
                    }
                    (event_id, Applied::Extended(requeued))
                }
                MergeDecision::Create => {
                    let event_id = Uuid::new_v4().to_string();
                    insert_event(&tx, &event_id, &capture, &now)?;
                    insert_screenshot(&tx, &event_id, &capture)?;
                    enqueue(&tx, &event_id, &now)?;
                    (event_id, Applied::Created)
                }
            };

            let event = load_event(&tx, &event_id)?
                .with_context(|| format!("event {event_id} vanished during merge"))?;
            tx.commit().context("failed to commit merge transaction")?;

            Ok(match applied {
                Applied::Repeat => MergeOutcome::ExactRepeat(event),
                Applied::Extended(requeued) => MergeOutcome::Extended { event, requeued },
                Applied::Created => MergeOutcome::Created(event),
            })
        })
        .await
    }

    pub async fn get_event(&self, event_id: &str) -> Result<Option<Event>> {
        let event_id = event_id.to_string();
        self.execute(move |conn| load_event(conn, &event_id)).await
    }

    pub async fn list_events(&self, filter: EventFilter) -> Result<Vec<Event>> {
        self.execute(move |conn| {
            let mut sql = format!("SELECT {EVENT_COLUMNS} FROM events WHERE 1 = 1");
            let mut values: Vec<Value> = Vec::new();

            if let Some(from) = filter.from {
                values.push(Value::Text(format_datetime(&from)));
                sql.push_str(&format!(" AND end_at >= ?{}", values.len()));
            }
            if let Some(to) = filter.to {
                values.push(Value::Text(format_datetime(&to)));
                sql.push_str(&format!(" AND start_at <= ?{}", values.len()));
            }
            if let Some(category) = filter.category {
                values.push(Value::Text(category));
                sql.push_str(&format!(" AND category = ?{}", values.len()));
            }
            if let Some(project) = filter.project {
                values.push(Value::Text(project.trim().to_lowercase()));
                sql.push_str(&format!(" AND lower(trim(project)) = ?{}", values.len()));
            }
            if let Some(status) = filter.status {
                values.push(Value::Text(status.as_str().to_string()));
                sql.push_str(&format!(" AND status = ?{}", values.len()));
            }
            if !filter.include_dismissed {
                sql.push_str(" AND dismissed = 0");
            }
            sql.push_str(" ORDER BY start_at DESC, id ASC");
            if let Some(limit) = filter.limit {
                sql.push_str(&format!(" LIMIT {limit}"));
            }

            let mut stmt = conn.prepare(&sql)?;
            let events = stmt
                .query_map(params_from_iter(values), row_to_event)?
                .collect::<Result<Vec<_>, _>>()
                .context("failed to list events")?;
            Ok(events)
        })
        .await
    }

    /// Writes what OCR learned about a freshly created or requeued event.
    /// `degraded` marks an event whose OCR was wanted but failed.
    pub async fn apply_ocr_enrichment(
        &self,
        event_id: &str,
        ocr_text: Option<String>,
        context_confidence: f64,
        degraded: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<Event>> {
        let event_id = event_id.to_string();
        self.execute(move |conn| {
            conn.execute(
                "UPDATE events
                 SET ocr_text = COALESCE(?1, ocr_text),
                     context_confidence = ?2,
                     ocr_degraded = ?3,
                     updated_at = ?4
                 WHERE id = ?5",
                params![ocr_text, context_confidence, degraded, format_datetime(&now), event_id],
            )
            .context("failed to store OCR enrichment")?;
            load_event(conn, &event_id)
        })
        .await
    }

    /// Returns `processing` events left behind by a crash to `pending`.
    pub async fn recover_processing_events(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            let ids = {
                let mut stmt = tx.prepare("SELECT id FROM events WHERE status = 'processing'")?;
                let ids = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                ids
            };
            tx.execute(
                "UPDATE events SET status = 'pending', updated_at = ?1 WHERE status = 'processing'",
                params![format_datetime(&now)],
            )?;
            tx.commit().context("failed to commit processing recovery")?;
            Ok(ids)
        })
        .await
    }

    pub async fn relabel_event(
        &self,
        event_id: &str,
        category: String,
        subcategories: Vec<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<Event>> {
        let event_id = event_id.to_string();
        self.execute(move |conn| {
            conn.execute(
                "UPDATE events
                 SET category = ?1, subcategories_json = ?2, category_overridden = 1, updated_at = ?3
                 WHERE id = ?4",
                params![
                    category,
                    to_json(&subcategories, "subcategories")?,
                    format_datetime(&now),
                    event_id
                ],
            )?;
            load_event(conn, &event_id)
        })
        .await
    }

    pub async fn set_event_caption(
        &self,
        event_id: &str,
        caption: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<Event>> {
        let event_id = event_id.to_string();
        self.execute(move |conn| {
            conn.execute(
                "UPDATE events SET caption = ?1, caption_overridden = 1, updated_at = ?2 WHERE id = ?3",
                params![caption, format_datetime(&now), event_id],
            )?;
            load_event(conn, &event_id)
        })
        .await
    }

    pub async fn set_event_project(
        &self,
        event_id: &str,
        project: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<Event>> {
        let event_id = event_id.to_string();
        let project = project
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty());
        self.execute(move |conn| {
            conn.execute(
                "UPDATE events SET project = ?1, project_overridden = 1, updated_at = ?2 WHERE id = ?3",
                params![project, format_datetime(&now), event_id],
            )?;
            load_event(conn, &event_id)
        })
        .await
    }

    pub async fn set_event_dismissed(
        &self,
        event_id: &str,
        dismissed: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<Event>> {
        let event_id = event_id.to_string();
        self.execute(move |conn| {
            conn.execute(
                "UPDATE events SET dismissed = ?1, updated_at = ?2 WHERE id = ?3",
                params![dismissed, format_datetime(&now), event_id],
            )?;
            load_event(conn, &event_id)
        })
        .await
    }

    /// Promotes the addiction candidate to a tracked addiction.
    pub async fn confirm_addiction(&self, event_id: &str, now: DateTime<Utc>) -> Result<Option<Event>> {
        let event_id = event_id.to_string();
        self.execute(move |conn| {
            conn.execute(
                "UPDATE events
                 SET tracked_addiction = COALESCE(addiction_candidate, tracked_addiction),
                     addiction_candidate = NULL,
                     addiction_prompt = NULL,
                     updated_at = ?1
                 WHERE id = ?2",
                params![format_datetime(&now), event_id],
            )?;
            load_event(conn, &event_id)
        })
        .await
    }

    pub async fn reject_addiction(&self, event_id: &str, now: DateTime<Utc>) -> Result<Option<Event>> {
        let event_id = event_id.to_string();
        self.execute(move |conn| {
            conn.execute(
                "UPDATE events
                 SET addiction_candidate = NULL,
                     addiction_prompt = NULL,
                     addiction_confidence = NULL,
                     updated_at = ?1
                 WHERE id = ?2",
                params![format_datetime(&now), event_id],
            )?;
            load_event(conn, &event_id)
        })
        .await
    }

    /// Deletes an event with its screenshots and queue entry. Returns `None`
    /// when no such event exists, otherwise the frame paths that no remaining
    /// screenshot references.
    pub async fn delete_event(&self, event_id: &str) -> Result<Option<Vec<String>>> {
        let event_id = event_id.to_string();
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            let exists = tx
                .query_row("SELECT 1 FROM events WHERE id = ?1", params![event_id], |_| Ok(()))
                .optional()?
                .is_some();
            if !exists {
                return Ok(None);
            }

            let orphaned = {
                let mut stmt = tx.prepare(
                    "SELECT DISTINCT s.image_path FROM screenshots s
                     WHERE s.event_id = ?1
                       AND NOT EXISTS (
                           SELECT 1 FROM screenshots o
                           WHERE o.image_path = s.image_path AND o.event_id != ?1
                       )",
                )?;
                let paths = stmt
                    .query_map(params![event_id], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                paths
            };

            tx.execute("DELETE FROM events WHERE id = ?1", params![event_id])
                .context("failed to delete event")?;
            tx.commit().context("failed to commit event deletion")?;
            Ok(Some(orphaned))
        })
        .await
    }
}
