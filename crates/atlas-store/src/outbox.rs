//! Outbox repositories: claim/ack/retry/dead with lease semantics.
//!
//! Claiming marks rows `processing` with `(locked_by, locked_at)` inside
//! a single transaction; rows whose lock is older than the TTL are
//! reclaimable (crash recovery). Every ack checks lock ownership — a
//! late ack from a worker that lost its lease is dropped.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use rusqlite::params;
use tracing::warn;
use uuid::Uuid;

use atlas_core::config::MAX_STORED_ERROR_CHARS;
use atlas_core::time::{from_db, to_db};
use atlas_core::types::{AttachmentOutbox, EntryIndexOutbox, OutboxOp, OutboxStatus};
use atlas_core::utc_now;

use crate::error::Result;
use crate::Store;

/// Exponential backoff with jitter. The exponent is clamped so huge
/// attempt counts cannot overflow the doubling.
pub fn compute_backoff(attempts: u32, base_sec: f64, cap_sec: f64) -> Duration {
    let exp = attempts.saturating_sub(1).min(10);
    let delay = cap_sec.min(base_sec * f64::powi(2.0, exp as i32));
    let jitter = rand::thread_rng().gen_range(0.0..=delay * 0.1);
    Duration::from_secs_f64(delay + jitter)
}

/// Per-pipeline backoff defaults.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base_sec: f64,
    pub cap_sec: f64,
}

impl BackoffPolicy {
    pub const ENTRY_INDEX: BackoffPolicy = BackoffPolicy {
        base_sec: 2.0,
        cap_sec: 60.0,
    };
    pub const ATTACHMENT: BackoffPolicy = BackoffPolicy {
        base_sec: 5.0,
        cap_sec: 300.0,
    };

    pub fn delay(&self, attempts: u32) -> Duration {
        compute_backoff(attempts, self.base_sec, self.cap_sec)
    }
}

/// Claim tuning shared by every pipeline.
#[derive(Debug, Clone)]
pub struct ClaimParams {
    pub now: DateTime<Utc>,
    pub batch_size: usize,
    pub worker_id: String,
    pub lock_ttl_sec: i64,
    pub max_attempts: u32,
}

/// Attachment pipelines share one lease schema across two tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentPipeline {
    Index,
    Parse,
}

impl AttachmentPipeline {
    fn table(self) -> &'static str {
        match self {
            AttachmentPipeline::Index => "attachment_index_outbox",
            AttachmentPipeline::Parse => "attachment_parse_outbox",
        }
    }
}

fn truncate_error(message: &str) -> String {
    if message.chars().count() <= MAX_STORED_ERROR_CHARS {
        return message.to_string();
    }
    message.chars().take(MAX_STORED_ERROR_CHARS).collect()
}

fn row_to_entry_outbox(row: &rusqlite::Row<'_>) -> rusqlite::Result<EntryIndexOutbox> {
    let op: String = row.get(2)?;
    let status: String = row.get(4)?;
    Ok(EntryIndexOutbox {
        id: row.get(0)?,
        entry_id: row.get(1)?,
        op: op.parse().unwrap_or(OutboxOp::Upsert),
        entry_updated_at: row
            .get::<_, Option<String>>(3)?
            .as_deref()
            .and_then(from_db),
        status: status.parse().unwrap_or(OutboxStatus::Pending),
        attempts: row.get(5)?,
        available_at: from_db(&row.get::<_, String>(6)?).unwrap_or_else(Utc::now),
        locked_at: row
            .get::<_, Option<String>>(7)?
            .as_deref()
            .and_then(from_db),
        locked_by: row.get(8)?,
        last_error: row.get(9)?,
        created_at: from_db(&row.get::<_, String>(10)?).unwrap_or_else(Utc::now),
        updated_at: from_db(&row.get::<_, String>(11)?).unwrap_or_else(Utc::now),
    })
}

fn row_to_attachment_outbox(row: &rusqlite::Row<'_>) -> rusqlite::Result<AttachmentOutbox> {
    let op: String = row.get(3)?;
    let status: String = row.get(4)?;
    Ok(AttachmentOutbox {
        id: row.get(0)?,
        attachment_id: row.get(1)?,
        entry_id: row.get(2)?,
        op: op.parse().unwrap_or(OutboxOp::Upsert),
        status: status.parse().unwrap_or(OutboxStatus::Pending),
        attempts: row.get(5)?,
        available_at: from_db(&row.get::<_, String>(6)?).unwrap_or_else(Utc::now),
        locked_at: row
            .get::<_, Option<String>>(7)?
            .as_deref()
            .and_then(from_db),
        locked_by: row.get(8)?,
        last_error: row.get(9)?,
        created_at: from_db(&row.get::<_, String>(10)?).unwrap_or_else(Utc::now),
        updated_at: from_db(&row.get::<_, String>(11)?).unwrap_or_else(Utc::now),
    })
}

const ENTRY_COLUMNS: &str = "id, entry_id, op, entry_updated_at, status, attempts, \
                             available_at, locked_at, locked_by, last_error, created_at, updated_at";

/// Coalescing enqueue, callable inside a caller-owned transaction so
/// the outbox write commits with the business write.
pub(crate) fn coalesce_upsert_on(
    conn: &rusqlite::Connection,
    entry_id: &str,
    entry_updated_at: DateTime<Utc>,
) -> rusqlite::Result<()> {
    let now = utc_now();
    let now_str = to_db(now);

    let existing: Option<(String, String, String)> = conn
        .query_row(
            "SELECT id, status, available_at FROM entry_index_outbox
             WHERE entry_id = ?1 AND op = 'upsert' AND status IN ('pending','processing')
             ORDER BY created_at DESC LIMIT 1",
            [entry_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .ok();

    if let Some((id, status, available_at)) = existing {
        conn.execute(
            "UPDATE entry_index_outbox
             SET entry_updated_at = ?1, last_error = NULL, updated_at = ?2
             WHERE id = ?3",
            params![to_db(entry_updated_at), now_str, id],
        )?;
        if status == "pending" && available_at > now_str {
            conn.execute(
                "UPDATE entry_index_outbox SET available_at = ?1 WHERE id = ?2",
                params![now_str, id],
            )?;
        }
        return Ok(());
    }

    insert_upsert_row(conn, entry_id, entry_updated_at)
}

pub(crate) fn insert_upsert_row(
    conn: &rusqlite::Connection,
    entry_id: &str,
    entry_updated_at: DateTime<Utc>,
) -> rusqlite::Result<()> {
    let now_str = to_db(utc_now());
    conn.execute(
        "INSERT INTO entry_index_outbox
         (id, entry_id, op, entry_updated_at, status, attempts, available_at,
          created_at, updated_at)
         VALUES (?1, ?2, 'upsert', ?3, 'pending', 0, ?4, ?4, ?4)",
        params![
            Uuid::new_v4().to_string(),
            entry_id,
            to_db(entry_updated_at),
            now_str
        ],
    )?;
    Ok(())
}
const ATTACHMENT_COLUMNS: &str = "id, attachment_id, entry_id, op, status, attempts, \
                                  available_at, locked_at, locked_by, last_error, created_at, updated_at";

impl Store {
    // --- entry index outbox -------------------------------------------------

    /// Enqueue an upsert, coalescing into an existing active row.
    ///
    /// While a pending/processing upsert exists for the entry, no second
    /// active row may appear; the existing row's `entry_updated_at` is
    /// advanced instead, its error cleared, and any future backoff
    /// collapsed to "now".
    pub fn coalesce_entry_upsert(
        &self,
        entry_id: &str,
        entry_updated_at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        coalesce_upsert_on(&conn, entry_id, entry_updated_at)?;
        Ok(())
    }

    /// Enqueue a delete event (entry removed or cleanup requested).
    pub fn enqueue_entry_delete(&self, entry_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let now_str = to_db(utc_now());
        conn.execute(
            "INSERT INTO entry_index_outbox
             (id, entry_id, op, status, attempts, available_at, created_at, updated_at)
             VALUES (?1, ?2, 'delete', 'pending', 0, ?3, ?3, ?3)",
            params![Uuid::new_v4().to_string(), entry_id, now_str],
        )?;
        Ok(())
    }

    /// Claim up to `batch_size` eligible entry index events.
    pub fn claim_entry_index_batch(&self, p: &ClaimParams) -> Result<Vec<EntryIndexOutbox>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let now_str = to_db(p.now);
        let lock_deadline = to_db(p.now - chrono::Duration::seconds(p.lock_ttl_sec));

        let ids: Vec<String> = {
            let mut stmt = tx.prepare_cached(
                "SELECT id FROM entry_index_outbox
                 WHERE attempts < ?1 AND available_at <= ?2
                   AND (status = 'pending'
                        OR (status = 'processing'
                            AND (locked_at IS NULL OR locked_at <= ?3)))
                 ORDER BY available_at ASC, created_at ASC
                 LIMIT ?4",
            )?;
            let ids: Vec<String> = stmt
                .query_map(
                    params![p.max_attempts, now_str, lock_deadline, p.batch_size as i64],
                    |row| row.get::<_, String>(0),
                )?
                .filter_map(|r| r.ok())
                .collect();
            ids
        };

        let mut claimed = Vec::with_capacity(ids.len());
        for id in &ids {
            tx.execute(
                "UPDATE entry_index_outbox
                 SET status = 'processing', locked_at = ?1, locked_by = ?2,
                     attempts = attempts + 1, updated_at = ?1
                 WHERE id = ?3",
                params![now_str, p.worker_id, id],
            )?;
            let row = tx.query_row(
                &format!("SELECT {ENTRY_COLUMNS} FROM entry_index_outbox WHERE id = ?1"),
                [id],
                row_to_entry_outbox,
            )?;
            claimed.push(row);
        }
        tx.commit()?;
        Ok(claimed)
    }

    pub fn mark_entry_outbox_succeeded(&self, outbox_id: &str, worker_id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE entry_index_outbox
             SET status = 'succeeded', locked_at = NULL, locked_by = NULL,
                 last_error = NULL, updated_at = ?1
             WHERE id = ?2 AND status = 'processing' AND locked_by = ?3",
            params![to_db(utc_now()), outbox_id, worker_id],
        )?;
        if n == 0 {
            warn!(outbox_id, worker_id, "mark_succeeded dropped: lock lost");
        }
        Ok(n > 0)
    }

    pub fn mark_entry_outbox_retry(
        &self,
        outbox_id: &str,
        worker_id: &str,
        next_available_at: DateTime<Utc>,
        error_message: &str,
    ) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE entry_index_outbox
             SET status = 'pending', locked_at = NULL, locked_by = NULL,
                 available_at = ?1, last_error = ?2, updated_at = ?3
             WHERE id = ?4 AND status = 'processing' AND locked_by = ?5",
            params![
                to_db(next_available_at),
                truncate_error(error_message),
                to_db(utc_now()),
                outbox_id,
                worker_id
            ],
        )?;
        if n == 0 {
            warn!(outbox_id, worker_id, "mark_retry dropped: lock lost");
        }
        Ok(n > 0)
    }

    /// Requeue without recording an error. Resets attempts so a
    /// coalescing re-queue is never throttled by max_attempts.
    pub fn mark_entry_outbox_pending(
        &self,
        outbox_id: &str,
        worker_id: &str,
        next_available_at: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE entry_index_outbox
             SET status = 'pending', locked_at = NULL, locked_by = NULL,
                 available_at = ?1, attempts = 0, last_error = NULL, updated_at = ?2
             WHERE id = ?3 AND status = 'processing' AND locked_by = ?4",
            params![
                to_db(next_available_at),
                to_db(utc_now()),
                outbox_id,
                worker_id
            ],
        )?;
        if n == 0 {
            warn!(outbox_id, worker_id, "mark_pending dropped: lock lost");
        }
        Ok(n > 0)
    }

    pub fn mark_entry_outbox_dead(
        &self,
        outbox_id: &str,
        worker_id: &str,
        error_message: &str,
    ) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE entry_index_outbox
             SET status = 'dead', locked_at = NULL, locked_by = NULL,
                 last_error = ?1, updated_at = ?2
             WHERE id = ?3 AND status = 'processing' AND locked_by = ?4",
            params![
                truncate_error(error_message),
                to_db(utc_now()),
                outbox_id,
                worker_id
            ],
        )?;
        if n == 0 {
            warn!(outbox_id, worker_id, "mark_dead dropped: lock lost");
        }
        Ok(n > 0)
    }

    /// Staleness guard helper: is there a newer active upsert for the
    /// same entry than the given row?
    pub fn newer_active_upsert_exists(
        &self,
        entry_id: &str,
        excluding_outbox_id: &str,
        created_after: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM entry_index_outbox
             WHERE entry_id = ?1 AND id != ?2 AND op = 'upsert'
               AND status IN ('pending','processing') AND created_at > ?3",
            params![entry_id, excluding_outbox_id, to_db(created_after)],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn find_entry_outbox(&self, outbox_id: &str) -> Result<Option<EntryIndexOutbox>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                &format!("SELECT {ENTRY_COLUMNS} FROM entry_index_outbox WHERE id = ?1"),
                [outbox_id],
                row_to_entry_outbox,
            )
            .ok();
        Ok(row)
    }

    /// Most relevant outbox row for an entry: processing first, then
    /// pending, then whatever is newest.
    pub fn entry_index_status(&self, entry_id: &str) -> Result<Option<EntryIndexOutbox>> {
        let conn = self.conn.lock().unwrap();
        for filter in [
            "AND status = 'processing'",
            "AND status = 'pending'",
            "",
        ] {
            let sql = format!(
                "SELECT {ENTRY_COLUMNS} FROM entry_index_outbox
                 WHERE entry_id = ?1 {filter}
                 ORDER BY created_at DESC LIMIT 1"
            );
            if let Ok(row) = conn.query_row(&sql, [entry_id], row_to_entry_outbox) {
                return Ok(Some(row));
            }
        }
        Ok(None)
    }

    // --- attachment outboxes (index + parse) --------------------------------

    pub fn enqueue_attachment_outbox(
        &self,
        pipeline: AttachmentPipeline,
        attachment_id: &str,
        entry_id: &str,
        op: OutboxOp,
    ) -> Result<String> {
        let conn = self.conn.lock().unwrap();
        let id = Uuid::new_v4().to_string();
        let now_str = to_db(utc_now());
        conn.execute(
            &format!(
                "INSERT INTO {} (id, attachment_id, entry_id, op, status, attempts,
                                 available_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5, ?5, ?5)",
                pipeline.table()
            ),
            params![id, attachment_id, entry_id, op.to_string(), now_str],
        )?;
        Ok(id)
    }

    pub fn claim_attachment_batch(
        &self,
        pipeline: AttachmentPipeline,
        p: &ClaimParams,
    ) -> Result<Vec<AttachmentOutbox>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let table = pipeline.table();
        let now_str = to_db(p.now);
        let lock_deadline = to_db(p.now - chrono::Duration::seconds(p.lock_ttl_sec));

        let ids: Vec<String> = {
            let mut stmt = tx.prepare(&format!(
                "SELECT id FROM {table}
                 WHERE attempts < ?1 AND available_at <= ?2
                   AND (status = 'pending'
                        OR (status = 'processing'
                            AND (locked_at IS NULL OR locked_at <= ?3)))
                 ORDER BY available_at ASC, created_at ASC
                 LIMIT ?4"
            ))?;
            let ids: Vec<String> = stmt
                .query_map(
                    params![p.max_attempts, now_str, lock_deadline, p.batch_size as i64],
                    |row| row.get::<_, String>(0),
                )?
                .filter_map(|r| r.ok())
                .collect();
            ids
        };

        let mut claimed = Vec::with_capacity(ids.len());
        for id in &ids {
            tx.execute(
                &format!(
                    "UPDATE {table}
                     SET status = 'processing', locked_at = ?1, locked_by = ?2,
                         attempts = attempts + 1, updated_at = ?1
                     WHERE id = ?3"
                ),
                params![now_str, p.worker_id, id],
            )?;
            let row = tx.query_row(
                &format!("SELECT {ATTACHMENT_COLUMNS} FROM {table} WHERE id = ?1"),
                [id],
                row_to_attachment_outbox,
            )?;
            claimed.push(row);
        }
        tx.commit()?;
        Ok(claimed)
    }

    pub fn mark_attachment_outbox_succeeded(
        &self,
        pipeline: AttachmentPipeline,
        outbox_id: &str,
        worker_id: &str,
    ) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            &format!(
                "UPDATE {} SET status = 'succeeded', locked_at = NULL, locked_by = NULL,
                               last_error = NULL, updated_at = ?1
                 WHERE id = ?2 AND status = 'processing' AND locked_by = ?3",
                pipeline.table()
            ),
            params![to_db(utc_now()), outbox_id, worker_id],
        )?;
        if n == 0 {
            warn!(outbox_id, worker_id, "attachment mark_succeeded dropped: lock lost");
        }
        Ok(n > 0)
    }

    pub fn mark_attachment_outbox_retry(
        &self,
        pipeline: AttachmentPipeline,
        outbox_id: &str,
        worker_id: &str,
        next_available_at: DateTime<Utc>,
        error_message: &str,
    ) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            &format!(
                "UPDATE {} SET status = 'pending', locked_at = NULL, locked_by = NULL,
                               available_at = ?1, last_error = ?2, updated_at = ?3
                 WHERE id = ?4 AND status = 'processing' AND locked_by = ?5",
                pipeline.table()
            ),
            params![
                to_db(next_available_at),
                truncate_error(error_message),
                to_db(utc_now()),
                outbox_id,
                worker_id
            ],
        )?;
        if n == 0 {
            warn!(outbox_id, worker_id, "attachment mark_retry dropped: lock lost");
        }
        Ok(n > 0)
    }

    pub fn mark_attachment_outbox_dead(
        &self,
        pipeline: AttachmentPipeline,
        outbox_id: &str,
        worker_id: &str,
        error_message: &str,
    ) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            &format!(
                "UPDATE {} SET status = 'dead', locked_at = NULL, locked_by = NULL,
                               last_error = ?1, updated_at = ?2
                 WHERE id = ?3 AND status = 'processing' AND locked_by = ?4",
                pipeline.table()
            ),
            params![
                truncate_error(error_message),
                to_db(utc_now()),
                outbox_id,
                worker_id
            ],
        )?;
        if n == 0 {
            warn!(outbox_id, worker_id, "attachment mark_dead dropped: lock lost");
        }
        Ok(n > 0)
    }

    pub fn find_attachment_outbox(
        &self,
        pipeline: AttachmentPipeline,
        outbox_id: &str,
    ) -> Result<Option<AttachmentOutbox>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                &format!(
                    "SELECT {ATTACHMENT_COLUMNS} FROM {} WHERE id = ?1",
                    pipeline.table()
                ),
                [outbox_id],
                row_to_attachment_outbox,
            )
            .ok();
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claim_params(worker: &str) -> ClaimParams {
        ClaimParams {
            now: utc_now(),
            batch_size: 10,
            worker_id: worker.to_string(),
            lock_ttl_sec: 300,
            max_attempts: 6,
        }
    }

    fn store_with_entry_upsert(entry_id: &str) -> Store {
        let store = Store::open_in_memory().unwrap();
        store.coalesce_entry_upsert(entry_id, utc_now()).unwrap();
        store
    }

    #[test]
    fn claim_marks_processing_and_increments_attempts() {
        let store = store_with_entry_upsert("e1");
        let claimed = store.claim_entry_index_batch(&claim_params("w1")).unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].status, OutboxStatus::Processing);
        assert_eq!(claimed[0].attempts, 1);
        assert_eq!(claimed[0].locked_by.as_deref(), Some("w1"));

        // A second worker sees nothing while the lease is fresh.
        let other = store.claim_entry_index_batch(&claim_params("w2")).unwrap();
        assert!(other.is_empty());
    }

    #[test]
    fn expired_lock_is_reclaimable() {
        let store = store_with_entry_upsert("e1");
        let row = store.claim_entry_index_batch(&claim_params("w1")).unwrap()[0].clone();

        // Advance the clock past the TTL for the second worker.
        let mut p = claim_params("w2");
        p.now = utc_now() + chrono::Duration::seconds(301);
        let reclaimed = store.claim_entry_index_batch(&p).unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].id, row.id);
        assert_eq!(reclaimed[0].locked_by.as_deref(), Some("w2"));
        assert_eq!(reclaimed[0].attempts, 2);
    }

    #[test]
    fn ack_by_non_owner_is_noop() {
        let store = store_with_entry_upsert("e1");
        let row = store.claim_entry_index_batch(&claim_params("w1")).unwrap()[0].clone();

        assert!(!store.mark_entry_outbox_succeeded(&row.id, "w2").unwrap());
        let current = store.find_entry_outbox(&row.id).unwrap().unwrap();
        assert_eq!(current.status, OutboxStatus::Processing);
        assert_eq!(current.locked_by.as_deref(), Some("w1"));

        assert!(store.mark_entry_outbox_succeeded(&row.id, "w1").unwrap());
        let done = store.find_entry_outbox(&row.id).unwrap().unwrap();
        assert_eq!(done.status, OutboxStatus::Succeeded);
        assert!(done.locked_by.is_none());
    }

    #[test]
    fn coalesce_never_duplicates_active_rows() {
        let store = Store::open_in_memory().unwrap();
        let t0 = utc_now();
        store.coalesce_entry_upsert("e1", t0).unwrap();
        let t1 = t0 + chrono::Duration::seconds(1);
        store.coalesce_entry_upsert("e1", t1).unwrap();

        let conn = store.conn.lock().unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM entry_index_outbox WHERE entry_id = 'e1'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        drop(conn);
        assert_eq!(count, 1);

        let row = store.entry_index_status("e1").unwrap().unwrap();
        assert_eq!(row.entry_updated_at.map(to_db), Some(to_db(t1)));
        assert!(row.last_error.is_none());
    }

    #[test]
    fn coalesce_clears_future_backoff() {
        let store = store_with_entry_upsert("e1");
        let row = store.claim_entry_index_batch(&claim_params("w1")).unwrap()[0].clone();
        let later = utc_now() + chrono::Duration::seconds(120);
        store
            .mark_entry_outbox_retry(&row.id, "w1", later, "boom")
            .unwrap();

        store.coalesce_entry_upsert("e1", utc_now()).unwrap();
        let current = store.find_entry_outbox(&row.id).unwrap().unwrap();
        assert_eq!(current.status, OutboxStatus::Pending);
        assert!(current.available_at <= utc_now());
        assert!(current.last_error.is_none());
    }

    #[test]
    fn mark_pending_resets_attempts() {
        let store = store_with_entry_upsert("e1");
        let row = store.claim_entry_index_batch(&claim_params("w1")).unwrap()[0].clone();
        assert!(store
            .mark_entry_outbox_pending(&row.id, "w1", utc_now())
            .unwrap());
        let current = store.find_entry_outbox(&row.id).unwrap().unwrap();
        assert_eq!(current.attempts, 0);
        assert_eq!(current.status, OutboxStatus::Pending);
    }

    #[test]
    fn max_attempts_stops_claims() {
        let store = store_with_entry_upsert("e1");
        let mut p = claim_params("w1");
        p.max_attempts = 2;
        for _ in 0..2 {
            let rows = store.claim_entry_index_batch(&p).unwrap();
            assert_eq!(rows.len(), 1);
            store
                .mark_entry_outbox_retry(&rows[0].id, "w1", p.now, "transient")
                .unwrap();
        }
        assert!(store.claim_entry_index_batch(&p).unwrap().is_empty());
    }

    #[test]
    fn backoff_is_exponential_capped_and_jittered() {
        for attempts in 1..=12u32 {
            let base = 2.0f64;
            let cap = 60.0f64;
            let expected = cap.min(base * f64::powi(2.0, attempts.saturating_sub(1).min(10) as i32));
            let d = compute_backoff(attempts, base, cap).as_secs_f64();
            assert!(d >= expected, "attempt {attempts}: {d} < {expected}");
            assert!(d <= expected * 1.1 + 1e-9, "attempt {attempts}: {d} too large");
        }
        // Non-decreasing up to the cap.
        let d1 = compute_backoff(1, 2.0, 60.0).as_secs_f64();
        let d4 = compute_backoff(4, 2.0, 60.0).as_secs_f64();
        assert!(d4 > d1);
    }

    #[test]
    fn error_messages_are_truncated() {
        let store = store_with_entry_upsert("e1");
        let row = store.claim_entry_index_batch(&claim_params("w1")).unwrap()[0].clone();
        let long = "x".repeat(9000);
        store
            .mark_entry_outbox_retry(&row.id, "w1", utc_now(), &long)
            .unwrap();
        let current = store.find_entry_outbox(&row.id).unwrap().unwrap();
        assert_eq!(current.last_error.unwrap().len(), MAX_STORED_ERROR_CHARS);
    }

    #[test]
    fn attachment_pipelines_are_independent() {
        let store = Store::open_in_memory().unwrap();
        store
            .enqueue_attachment_outbox(AttachmentPipeline::Parse, "a1", "e1", OutboxOp::Upsert)
            .unwrap();

        let parse = store
            .claim_attachment_batch(AttachmentPipeline::Parse, &claim_params("w1"))
            .unwrap();
        assert_eq!(parse.len(), 1);
        let index = store
            .claim_attachment_batch(AttachmentPipeline::Index, &claim_params("w1"))
            .unwrap();
        assert!(index.is_empty());

        assert!(store
            .mark_attachment_outbox_succeeded(AttachmentPipeline::Parse, &parse[0].id, "w1")
            .unwrap());
    }
}
