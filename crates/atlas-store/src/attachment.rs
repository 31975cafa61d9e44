//! Attachment rows and their parse lifecycle.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use atlas_core::config::MAX_STORED_ERROR_CHARS;
use atlas_core::time::{from_db, to_db};
use atlas_core::types::{Attachment, OutboxOp, ParseStatus};
use atlas_core::utc_now;

use crate::error::{Result, StoreError};
use crate::outbox::AttachmentPipeline;
use crate::Store;

const ATTACHMENT_COLUMNS: &str =
    "id, entry_id, file_path, original_filename, content_type, size, parse_status, \
     parsed_text, parse_last_error, index_to_knowledge_graph, created_at, updated_at";

fn row_to_attachment(row: &rusqlite::Row<'_>) -> rusqlite::Result<Attachment> {
    let status: String = row.get(6)?;
    Ok(Attachment {
        id: row.get(0)?,
        entry_id: row.get(1)?,
        file_path: row.get(2)?,
        original_filename: row.get(3)?,
        content_type: row.get(4)?,
        size: row.get::<_, i64>(5)? as u64,
        parse_status: status.parse().unwrap_or(ParseStatus::Pending),
        parsed_text: row.get(7)?,
        parse_last_error: row.get(8)?,
        index_to_knowledge_graph: row.get(9)?,
        created_at: from_db(&row.get::<_, String>(10)?).unwrap_or_else(Utc::now),
        updated_at: from_db(&row.get::<_, String>(11)?).unwrap_or_else(Utc::now),
    })
}

impl Store {
    /// Insert an attachment row and enqueue its parse event in the same
    /// transaction. The ingest layer has already validated and uploaded
    /// the object; on failure here it deletes that object again.
    pub fn create_attachment(
        &self,
        entry_id: &str,
        file_path: &str,
        original_filename: &str,
        content_type: &str,
        size: u64,
        index_to_knowledge_graph: bool,
    ) -> Result<Attachment> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let id = Uuid::new_v4().to_string();
        let now_str = to_db(utc_now());

        tx.execute(
            "INSERT INTO attachments
             (id, entry_id, file_path, original_filename, content_type, size,
              parse_status, index_to_knowledge_graph, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7, ?8, ?8)",
            params![
                id,
                entry_id,
                file_path,
                original_filename,
                content_type,
                size as i64,
                index_to_knowledge_graph,
                now_str
            ],
        )?;
        tx.execute(
            "INSERT INTO attachment_parse_outbox
             (id, attachment_id, entry_id, op, status, attempts, available_at,
              created_at, updated_at)
             VALUES (?1, ?2, ?3, 'upsert', 'pending', 0, ?4, ?4, ?4)",
            params![Uuid::new_v4().to_string(), id, entry_id, now_str],
        )?;
        tx.commit()?;
        drop(conn);

        self.find_attachment(&id)?
            .ok_or_else(|| StoreError::NotFound(format!("attachment vanished after create: {id}")))
    }

    pub fn find_attachment(&self, id: &str) -> Result<Option<Attachment>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                &format!("SELECT {ATTACHMENT_COLUMNS} FROM attachments WHERE id = ?1"),
                [id],
                row_to_attachment,
            )
            .optional()?;
        Ok(row)
    }

    /// All attachments under an entry, e.g. for delete-cascade storage
    /// cleanup.
    pub fn list_attachments_by_entry(&self, entry_id: &str) -> Result<Vec<Attachment>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ATTACHMENT_COLUMNS} FROM attachments WHERE entry_id = ?1 ORDER BY created_at"
        ))?;
        let rows = stmt
            .query_map([entry_id], row_to_attachment)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Parse-state transition, visible in the UI while a worker holds
    /// the row.
    pub fn set_attachment_parse_status(&self, id: &str, status: ParseStatus) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE attachments SET parse_status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.to_string(), to_db(utc_now()), id],
        )?;
        Ok(n > 0)
    }

    /// Successful parse: store the text and flip to completed.
    pub fn store_parsed_text(&self, id: &str, text: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let now_str = to_db(utc_now());
        let n = conn.execute(
            "UPDATE attachments
             SET parsed_text = ?1, parse_status = 'completed', parsed_at = ?2,
                 parse_last_error = NULL, updated_at = ?2
             WHERE id = ?3",
            params![text, now_str, id],
        )?;
        Ok(n > 0)
    }

    /// Failed parse: record the (truncated) error; `permanent` selects
    /// `failed` over `pending`.
    pub fn record_parse_error(&self, id: &str, error: &str, permanent: bool) -> Result<bool> {
        let truncated: String = error.chars().take(MAX_STORED_ERROR_CHARS).collect();
        let status = if permanent {
            ParseStatus::Failed
        } else {
            ParseStatus::Pending
        };
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE attachments
             SET parse_last_error = ?1, parse_status = ?2, updated_at = ?3
             WHERE id = ?4",
            params![truncated, status.to_string(), to_db(utc_now()), id],
        )?;
        Ok(n > 0)
    }

    /// Delete an attachment row and enqueue KG cleanup for its doc.
    pub fn delete_attachment(&self, id: &str) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let entry_id: Option<String> = tx
            .query_row(
                "SELECT entry_id FROM attachments WHERE id = ?1",
                [id],
                |row| row.get(0),
            )
            .optional()?;
        let entry_id =
            entry_id.ok_or_else(|| StoreError::NotFound(format!("attachment not found: {id}")))?;

        tx.execute("DELETE FROM attachments WHERE id = ?1", [id])?;
        tx.execute(
            "INSERT INTO attachment_index_outbox
             (id, attachment_id, entry_id, op, status, attempts, available_at,
              created_at, updated_at)
             VALUES (?1, ?2, ?3, 'delete', 'pending', 0, ?4, ?4, ?4)",
            params![Uuid::new_v4().to_string(), id, entry_id, to_db(utc_now())],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Hand-off from the parse pipeline into the index pipeline.
    pub fn enqueue_attachment_index_upsert(&self, attachment_id: &str, entry_id: &str) -> Result<String> {
        self.enqueue_attachment_outbox(
            AttachmentPipeline::Index,
            attachment_id,
            entry_id,
            OutboxOp::Upsert,
        )
    }

    pub fn count_attachments(&self) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row("SELECT COUNT(*) FROM attachments", [], |r| r.get(0))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::test_support::{entry_input, seed_type};
    use crate::outbox::ClaimParams;

    fn seeded() -> (Store, Attachment) {
        let store = Store::open_in_memory().unwrap();
        seed_type(&store, "t1", true);
        let entry = store.create_entry(&entry_input("t1", "A", "x")).unwrap();
        let att = store
            .create_attachment(&entry.id, "p/a.pdf", "a.pdf", "application/pdf", 42, true)
            .unwrap();
        (store, att)
    }

    #[test]
    fn create_enqueues_parse_event() {
        let (store, att) = seeded();
        let claimed = store
            .claim_attachment_batch(
                AttachmentPipeline::Parse,
                &ClaimParams {
                    now: utc_now(),
                    batch_size: 5,
                    worker_id: "w".into(),
                    lock_ttl_sec: 600,
                    max_attempts: 3,
                },
            )
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].attachment_id, att.id);
    }

    #[test]
    fn parse_lifecycle_transitions() {
        let (store, att) = seeded();
        assert!(store
            .set_attachment_parse_status(&att.id, ParseStatus::Processing)
            .unwrap());
        assert!(store.store_parsed_text(&att.id, "extracted").unwrap());
        let current = store.find_attachment(&att.id).unwrap().unwrap();
        assert_eq!(current.parse_status, ParseStatus::Completed);
        assert_eq!(current.parsed_text.as_deref(), Some("extracted"));
        assert!(current.parse_last_error.is_none());
    }

    #[test]
    fn permanent_parse_error_marks_failed() {
        let (store, att) = seeded();
        store.record_parse_error(&att.id, "bad file", true).unwrap();
        let current = store.find_attachment(&att.id).unwrap().unwrap();
        assert_eq!(current.parse_status, ParseStatus::Failed);
        assert_eq!(current.parse_last_error.as_deref(), Some("bad file"));
    }

    #[test]
    fn delete_enqueues_index_cleanup() {
        let (store, att) = seeded();
        store.delete_attachment(&att.id).unwrap();
        assert!(store.find_attachment(&att.id).unwrap().is_none());
        let conn = store.conn.lock().unwrap();
        let deletes: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM attachment_index_outbox
                 WHERE attachment_id = ?1 AND op = 'delete'",
                [&att.id],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(deletes, 1);
    }
}
