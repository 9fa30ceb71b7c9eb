use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use uuid::Uuid;

use crate::db::{
    helpers::{format_datetime, invalid_data, parse_datetime, to_json, to_u32},
    models::{Event, EventClassification, QueueEntry},
    repositories::events::load_event,
    Database,
};
use crate::queue::backoff::BackoffPolicy;

/// A queue entry claimed by the worker, with the event it classifies.
#[derive(Debug, Clone)]
pub struct ClaimedWork {
    pub entry: QueueEntry,
    pub event: Event,
    /// Frame of the event's most recent screenshot.
    pub image_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Rescheduled {
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
    },
    /// Attempts hit the cap; the event is now failed.
    Exhausted { attempts: u32 },
    /// A permanent error failed the event outright.
    Rejected,
    /// The event or its entry disappeared (deleted while in flight).
    Gone,
}

fn row_to_entry(row: &Row) -> Result<QueueEntry, rusqlite::Error> {
    let attempts: i64 = row.get("attempts")?;
    let created_at: String = row.get("created_at")?;
    let next_attempt_at: String = row.get("next_attempt_at")?;
    Ok(QueueEntry {
        id: row.get("id")?,
        event_id: row.get("event_id")?,
        attempts: to_u32(attempts, "attempts").map_err(invalid_data)?,
        created_at: parse_datetime(&created_at, "created_at")
            .map_err(invalid_data)?,
        next_attempt_at: parse_datetime(&next_attempt_at, "next_attempt_at")
            .map_err(invalid_data)?,
        last_error: row.get("last_error")?,
    })
}

/// Adds a fresh entry, due immediately. An existing entry for the event is
/// reset instead, so there is never more than one.
pub(crate) fn enqueue(conn: &Connection, event_id: &str, now: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO queue_entries (id, event_id, attempts, created_at, next_attempt_at, last_error)
         VALUES (?1, ?2, 0, ?3, ?3, NULL)
         ON CONFLICT(event_id) DO UPDATE SET
            attempts = 0,
            next_attempt_at = excluded.next_attempt_at,
            last_error = NULL",
        params![Uuid::new_v4().to_string(), event_id, now],
    )
    .context("failed to enqueue event")?;
    Ok(())
}

fn load_entry(conn: &Connection, event_id: &str) -> Result<Option<QueueEntry>> {
    conn.query_row(
        "SELECT id, event_id, attempts, created_at, next_attempt_at, last_error
         FROM queue_entries WHERE event_id = ?1",
        params![event_id],
        row_to_entry,
    )
    .optional()
    .context("failed to load queue entry")
}

fn latest_image_path(conn: &Connection, event_id: &str) -> Result<Option<String>> {
    conn.query_row(
        "SELECT image_path FROM screenshots WHERE event_id = ?1
         ORDER BY timestamp DESC, rowid DESC LIMIT 1",
        params![event_id],
        |row| row.get(0),
    )
    .optional()
    .context("failed to load latest screenshot path")
}

impl Database {
    pub async fn get_queue_entry(&self, event_id: &str) -> Result<Option<QueueEntry>> {
        let event_id = event_id.to_string();
        self.execute(move |conn| load_entry(conn, &event_id)).await
    }

    /// Claims up to `limit` due entries whose events are pending and moves
    /// those events to `processing`, all in one transaction. Entries stay in
    /// the table until the attempt resolves.
    pub async fn claim_due_entries(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ClaimedWork>> {
        self.execute(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let now = format_datetime(&now);

            let entries = {
                let mut stmt = tx.prepare(
                    "SELECT q.id, q.event_id, q.attempts, q.created_at, q.next_attempt_at, q.last_error
                     FROM queue_entries q
                     JOIN events e ON e.id = q.event_id
                     WHERE q.next_attempt_at <= ?1 AND e.status = 'pending'
                     ORDER BY q.next_attempt_at ASC, q.created_at ASC
                     LIMIT ?2",
                )?;
                let entries = stmt
                    .query_map(params![now, i64::try_from(limit).unwrap_or(i64::MAX)], row_to_entry)?
                    .collect::<Result<Vec<_>, _>>()?;
                entries
            };

            let mut claimed = Vec::with_capacity(entries.len());
            for entry in entries {
                tx.execute(
                    "UPDATE events SET status = 'processing', updated_at = ?1
                     WHERE id = ?2 AND status = 'pending'",
                    params![now, entry.event_id],
                )?;
                let Some(event) = load_event(&tx, &entry.event_id)? else {
                    continue;
                };
                let image_path = latest_image_path(&tx, &entry.event_id)?;
                claimed.push(ClaimedWork {
                    entry,
                    event,
                    image_path,
                });
            }

            tx.commit().context("failed to commit queue claim")?;
            Ok(claimed)
        })
        .await
    }

    /// Stores a successful classification and drops the entry. Returns `None`
    /// when the event is gone or no longer in `processing`.
    pub async fn complete_classification(
        &self,
        event_id: &str,
        classification: EventClassification,
        now: DateTime<Utc>,
    ) -> Result<Option<Event>> {
        let event_id = event_id.to_string();
        self.execute(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let c = classification;
            let changed = tx
                .execute(
                    "UPDATE events SET
                        status = 'completed',
                        category = CASE WHEN category_overridden THEN category ELSE ?1 END,
                        subcategories_json = CASE WHEN category_overridden THEN subcategories_json ELSE ?2 END,
                        caption = CASE WHEN caption_overridden THEN caption ELSE ?3 END,
                        tags_json = ?4,
                        confidence = ?5,
                        tracked_addiction = COALESCE(?6, tracked_addiction),
                        addiction_candidate = ?7,
                        addiction_confidence = ?8,
                        addiction_prompt = ?9,
                        project = CASE WHEN project_overridden THEN project ELSE ?10 END,
                        project_progress = CASE WHEN project_overridden THEN project_progress ELSE ?11 END,
                        project_progress_confidence =
                            CASE WHEN project_overridden THEN project_progress_confidence ELSE ?12 END,
                        project_progress_evidence_json =
                            CASE WHEN project_overridden THEN project_progress_evidence_json ELSE ?13 END,
                        updated_at = ?14
                     WHERE id = ?15 AND status = 'processing'",
                    params![
                        c.category,
                        to_json(&c.subcategories, "subcategories")?,
                        c.caption,
                        to_json(&c.tags, "tags")?,
                        c.confidence,
                        c.tracked_addiction,
                        c.addiction_candidate,
                        c.addiction_confidence,
                        c.addiction_prompt,
                        c.project,
                        c.project_progress,
                        c.project_progress_confidence,
                        to_json(&c.project_progress_evidence, "project_progress_evidence")?,
                        format_datetime(&now),
                        event_id,
                    ],
                )
                .context("failed to store classification")?;

            if changed == 0 {
                return Ok(None);
            }

            tx.execute("DELETE FROM queue_entries WHERE event_id = ?1", params![event_id])?;
            let event = load_event(&tx, &event_id)?;
            tx.commit().context("failed to commit classification")?;
            Ok(event)
        })
        .await
    }

    /// Counts a failed attempt. Below the cap the entry is pushed back by the
    /// backoff delay and the event returns to `pending`; at the cap the event
    /// fails and the entry is removed.
    pub async fn record_transient_failure(
        &self,
        event_id: &str,
        error: String,
        now: DateTime<Utc>,
        policy: BackoffPolicy,
    ) -> Result<AttemptOutcome> {
        let event_id = event_id.to_string();
        self.execute(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let Some(entry) = load_entry(&tx, &event_id)? else {
                return Ok(AttemptOutcome::Gone);
            };
            let now_str = format_datetime(&now);
            let attempts = entry.attempts.saturating_add(1);

            let outcome = if policy.is_exhausted(attempts) {
                tx.execute(
                    "UPDATE events SET status = 'failed', updated_at = ?1 WHERE id = ?2",
                    params![now_str, event_id],
                )?;
                tx.execute("DELETE FROM queue_entries WHERE event_id = ?1", params![event_id])?;
                AttemptOutcome::Exhausted { attempts }
            } else {
                let next_attempt_at = policy.next_attempt_at(now, attempts);
                tx.execute(
                    "UPDATE queue_entries
                     SET attempts = ?1, next_attempt_at = ?2, last_error = ?3
                     WHERE event_id = ?4",
                    params![attempts, format_datetime(&next_attempt_at), error, event_id],
                )?;
                tx.execute(
                    "UPDATE events SET status = 'pending', updated_at = ?1
                     WHERE id = ?2 AND status = 'processing'",
                    params![now_str, event_id],
                )?;
                AttemptOutcome::Rescheduled {
                    attempts,
                    next_attempt_at,
                }
            };

            tx.commit().context("failed to commit attempt failure")?;
            Ok(outcome)
        })
        .await
    }

    /// Permanent failure: no retry.
    pub async fn mark_failed(&self, event_id: &str, now: DateTime<Utc>) -> Result<AttemptOutcome> {
        let event_id = event_id.to_string();
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            let changed = tx.execute(
                "UPDATE events SET status = 'failed', updated_at = ?1 WHERE id = ?2",
                params![format_datetime(&now), event_id],
            )?;
            tx.execute("DELETE FROM queue_entries WHERE event_id = ?1", params![event_id])?;
            tx.commit()?;
            Ok(if changed == 0 {
                AttemptOutcome::Gone
            } else {
                AttemptOutcome::Rejected
            })
        })
        .await
    }

    /// Hands a claimed event back untouched, e.g. when its frame could not be read yet.
    pub async fn release_claim(&self, event_id: &str, now: DateTime<Utc>) -> Result<()> {
        let event_id = event_id.to_string();
        self.execute(move |conn| {
            conn.execute(
                "UPDATE events SET status = 'pending', updated_at = ?1
                 WHERE id = ?2 AND status = 'processing'",
                params![format_datetime(&now), event_id],
            )?;
            Ok(())
        })
        .await
    }

    /// Puts a failed event back on the queue with a fresh attempt budget.
    /// Events in any other state are returned unchanged.
    pub async fn retry_failed_event(&self, event_id: &str, now: DateTime<Utc>) -> Result<Option<Event>> {
        let event_id = event_id.to_string();
        self.execute(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let now = format_datetime(&now);
            let changed = tx.execute(
                "UPDATE events SET status = 'pending', updated_at = ?1
                 WHERE id = ?2 AND status = 'failed'",
                params![now, event_id],
            )?;
            if changed == 1 {
                enqueue(&tx, &event_id, &now)?;
            }
            let event = load_event(&tx, &event_id)?;
            tx.commit()?;
            Ok(event)
        })
        .await
    }
}
