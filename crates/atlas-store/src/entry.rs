//! Entry / entry-type / tag / relation persistence.
//!
//! The write paths own the indexing policy: creates enqueue an upsert
//! in the same transaction, updates enqueue only when the index
//! signature (title, summary, content) changed, deletes enqueue KG
//! cleanup for the entry and every attachment under it.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use atlas_core::time::{from_db, to_db};
use atlas_core::types::{Entry, EntryType, Relation, RelationType, Tag, TimeMode};
use atlas_core::utc_now;

use crate::error::{Result, StoreError};
use crate::outbox;
use crate::Store;

/// Input for entry create/update.
#[derive(Debug, Clone)]
pub struct EntryInput {
    pub title: String,
    pub summary: Option<String>,
    pub content: Option<String>,
    pub type_id: String,
    pub time_mode: TimeMode,
    pub time_at: Option<DateTime<Utc>>,
    pub time_from: Option<DateTime<Utc>>,
    pub time_to: Option<DateTime<Utc>>,
    pub tag_ids: Vec<String>,
}

impl EntryInput {
    fn validate(&self) -> Result<()> {
        if self.title.trim().is_empty() {
            return Err(StoreError::Validation("title must not be empty".into()));
        }
        match self.time_mode {
            TimeMode::Point => {
                if self.time_at.is_none() {
                    return Err(StoreError::Validation(
                        "time_mode=POINT requires time_at".into(),
                    ));
                }
            }
            TimeMode::Range => match (self.time_from, self.time_to) {
                (Some(from), Some(to)) if from <= to => {}
                _ => {
                    return Err(StoreError::Validation(
                        "time_mode=RANGE requires time_from <= time_to".into(),
                    ))
                }
            },
            TimeMode::None => {}
        }
        Ok(())
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<Entry> {
    let time_mode: String = row.get(5)?;
    Ok(Entry {
        id: row.get(0)?,
        title: row.get(1)?,
        summary: row.get(2)?,
        content: row.get(3)?,
        type_id: row.get(4)?,
        time_mode: time_mode.parse().unwrap_or(TimeMode::None),
        time_at: row.get::<_, Option<String>>(6)?.as_deref().and_then(from_db),
        time_from: row.get::<_, Option<String>>(7)?.as_deref().and_then(from_db),
        time_to: row.get::<_, Option<String>>(8)?.as_deref().and_then(from_db),
        tags: Vec::new(),
        created_at: from_db(&row.get::<_, String>(9)?).unwrap_or_else(Utc::now),
        updated_at: from_db(&row.get::<_, String>(10)?).unwrap_or_else(Utc::now),
    })
}

const ENTRY_COLUMNS: &str =
    "id, title, summary, content, type_id, time_mode, time_at, time_from, time_to, \
     created_at, updated_at";

fn load_tags(conn: &Connection, entry_id: &str) -> rusqlite::Result<Vec<Tag>> {
    let mut stmt = conn.prepare_cached(
        "SELECT t.id, t.name, t.color, t.description
         FROM tags t JOIN entry_tags et ON et.tag_id = t.id
         WHERE et.entry_id = ?1
         ORDER BY t.name COLLATE NOCASE",
    )?;
    let tags = stmt
        .query_map([entry_id], |row| {
            Ok(Tag {
                id: row.get(0)?,
                name: row.get(1)?,
                color: row.get(2)?,
                description: row.get(3)?,
            })
        })?
        .filter_map(|r| r.ok())
        .collect();
    Ok(tags)
}

impl Store {
    // --- entry types --------------------------------------------------------

    pub fn upsert_entry_type(&self, et: &EntryType) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let now_str = to_db(utc_now());
        conn.execute(
            "INSERT INTO entry_types
             (id, code, name, color, icon, graph_enabled, ai_enabled, enabled,
              created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
             ON CONFLICT(id) DO UPDATE SET
               code = excluded.code, name = excluded.name, color = excluded.color,
               icon = excluded.icon, graph_enabled = excluded.graph_enabled,
               ai_enabled = excluded.ai_enabled, enabled = excluded.enabled,
               updated_at = excluded.updated_at",
            params![
                et.id,
                et.code,
                et.name,
                et.color,
                et.icon,
                et.graph_enabled,
                et.ai_enabled,
                et.enabled,
                now_str
            ],
        )?;
        Ok(())
    }

    pub fn find_entry_type(&self, type_id: &str) -> Result<Option<EntryType>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, code, name, color, icon, graph_enabled, ai_enabled, enabled
                 FROM entry_types WHERE id = ?1",
                [type_id],
                |row| {
                    Ok(EntryType {
                        id: row.get(0)?,
                        code: row.get(1)?,
                        name: row.get(2)?,
                        color: row.get(3)?,
                        icon: row.get(4)?,
                        graph_enabled: row.get(5)?,
                        ai_enabled: row.get(6)?,
                        enabled: row.get(7)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_entry_types(&self) -> Result<Vec<EntryType>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, code, name, color, icon, graph_enabled, ai_enabled, enabled
             FROM entry_types ORDER BY code",
        )?;
        let types = stmt
            .query_map([], |row| {
                Ok(EntryType {
                    id: row.get(0)?,
                    code: row.get(1)?,
                    name: row.get(2)?,
                    color: row.get(3)?,
                    icon: row.get(4)?,
                    graph_enabled: row.get(5)?,
                    ai_enabled: row.get(6)?,
                    enabled: row.get(7)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(types)
    }

    // --- tags ---------------------------------------------------------------

    pub fn create_tag(
        &self,
        name: &str,
        color: Option<&str>,
        description: Option<&str>,
    ) -> Result<Tag> {
        if name.trim().is_empty() {
            return Err(StoreError::Validation("tag name must not be empty".into()));
        }
        let conn = self.conn.lock().unwrap();
        let id = Uuid::new_v4().to_string();
        let now_str = to_db(utc_now());
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO tags (id, name, color, description, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![id, name.trim(), color, description, now_str],
        )?;
        if inserted == 0 {
            return Err(StoreError::Conflict(format!("tag already exists: {name}")));
        }
        Ok(Tag {
            id,
            name: name.trim().to_string(),
            color: color.map(String::from),
            description: description.map(String::from),
        })
    }

    pub fn list_tags(&self) -> Result<Vec<Tag>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT id, name, color, description FROM tags ORDER BY name COLLATE NOCASE")?;
        let tags = stmt
            .query_map([], |row| {
                Ok(Tag {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    color: row.get(2)?,
                    description: row.get(3)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(tags)
    }

    // --- entries ------------------------------------------------------------

    /// Create an entry and enqueue its upsert event in one transaction.
    pub fn create_entry(&self, input: &EntryInput) -> Result<Entry> {
        input.validate()?;
        self.require_type_and_tags(&input.type_id, &input.tag_ids)?;

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let id = Uuid::new_v4().to_string();
        let now = utc_now();
        let now_str = to_db(now);

        tx.execute(
            "INSERT INTO entries
             (id, title, summary, content, type_id, time_mode, time_at, time_from, time_to,
              created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
            params![
                id,
                input.title,
                input.summary,
                input.content,
                input.type_id,
                input.time_mode.to_string(),
                input.time_at.map(to_db),
                input.time_from.map(to_db),
                input.time_to.map(to_db),
                now_str
            ],
        )?;
        for tag_id in &input.tag_ids {
            tx.execute(
                "INSERT OR IGNORE INTO entry_tags (entry_id, tag_id) VALUES (?1, ?2)",
                params![id, tag_id],
            )?;
        }
        outbox::insert_upsert_row(&tx, &id, now)?;
        tx.commit()?;
        drop(conn);

        self.find_entry(&id)?
            .ok_or_else(|| StoreError::NotFound(format!("entry vanished after create: {id}")))
    }

    /// Update an entry. Only a changed index signature (title, summary,
    /// content) enqueues re-indexing; type/tag/time churn does not.
    pub fn update_entry(&self, id: &str, input: &EntryInput) -> Result<Entry> {
        input.validate()?;
        self.require_type_and_tags(&input.type_id, &input.tag_ids)?;

        let current = self
            .find_entry(id)?
            .ok_or_else(|| StoreError::NotFound(format!("entry not found: {id}")))?;
        let should_enqueue = current.title != input.title
            || current.summary != input.summary
            || current.content != input.content;

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let now = utc_now();

        tx.execute(
            "UPDATE entries SET title = ?1, summary = ?2, content = ?3, type_id = ?4,
                    time_mode = ?5, time_at = ?6, time_from = ?7, time_to = ?8, updated_at = ?9
             WHERE id = ?10",
            params![
                input.title,
                input.summary,
                input.content,
                input.type_id,
                input.time_mode.to_string(),
                input.time_at.map(to_db),
                input.time_from.map(to_db),
                input.time_to.map(to_db),
                to_db(now),
                id
            ],
        )?;
        tx.execute("DELETE FROM entry_tags WHERE entry_id = ?1", [id])?;
        for tag_id in &input.tag_ids {
            tx.execute(
                "INSERT OR IGNORE INTO entry_tags (entry_id, tag_id) VALUES (?1, ?2)",
                params![id, tag_id],
            )?;
        }
        if should_enqueue {
            outbox::coalesce_upsert_on(&tx, id, now)?;
        }
        tx.commit()?;
        drop(conn);

        self.find_entry(id)?
            .ok_or_else(|| StoreError::NotFound(format!("entry vanished after update: {id}")))
    }

    /// Delete an entry: cascades tags/relations/attachments and enqueues
    /// KG cleanup for the entry and each of its attachments.
    pub fn delete_entry(&self, id: &str) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let now_str = to_db(utc_now());

        let attachment_ids: Vec<String> = {
            let mut stmt = tx.prepare("SELECT id FROM attachments WHERE entry_id = ?1")?;
            let ids: Vec<String> = stmt
                .query_map([id], |row| row.get::<_, String>(0))?
                .filter_map(|r| r.ok())
                .collect();
            ids
        };

        let n = tx.execute("DELETE FROM entries WHERE id = ?1", [id])?;
        if n == 0 {
            return Err(StoreError::NotFound(format!("entry not found: {id}")));
        }

        tx.execute(
            "INSERT INTO entry_index_outbox
             (id, entry_id, op, status, attempts, available_at, created_at, updated_at)
             VALUES (?1, ?2, 'delete', 'pending', 0, ?3, ?3, ?3)",
            params![Uuid::new_v4().to_string(), id, now_str],
        )?;
        for attachment_id in &attachment_ids {
            tx.execute(
                "INSERT INTO attachment_index_outbox
                 (id, attachment_id, entry_id, op, status, attempts, available_at,
                  created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'delete', 'pending', 0, ?4, ?4, ?4)",
                params![Uuid::new_v4().to_string(), attachment_id, id, now_str],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn find_entry(&self, id: &str) -> Result<Option<Entry>> {
        let conn = self.conn.lock().unwrap();
        let entry = conn
            .query_row(
                &format!("SELECT {ENTRY_COLUMNS} FROM entries WHERE id = ?1"),
                [id],
                row_to_entry,
            )
            .optional()?;
        match entry {
            Some(mut e) => {
                e.tags = load_tags(&conn, id)?;
                Ok(Some(e))
            }
            None => Ok(None),
        }
    }

    pub fn search_entries(&self, keyword: &str, limit: usize) -> Result<Vec<Entry>> {
        let conn = self.conn.lock().unwrap();
        let pattern = format!("%{}%", keyword.trim());
        let mut stmt = conn.prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM entries
             WHERE title LIKE ?1 OR summary LIKE ?1 OR content LIKE ?1
             ORDER BY updated_at DESC LIMIT ?2"
        ))?;
        let mut entries: Vec<Entry> = stmt
            .query_map(params![pattern, limit as i64], row_to_entry)?
            .filter_map(|r| r.ok())
            .collect();
        for e in &mut entries {
            e.tags = load_tags(&conn, &e.id)?;
        }
        Ok(entries)
    }

    pub fn entry_titles_by_ids(&self, ids: &[String]) -> Result<HashMap<String, String>> {
        let conn = self.conn.lock().unwrap();
        let mut out = HashMap::new();
        let mut stmt = conn.prepare_cached("SELECT title FROM entries WHERE id = ?1")?;
        for id in ids {
            if let Some(title) = stmt
                .query_row([id], |row| row.get::<_, String>(0))
                .optional()?
            {
                out.insert(id.clone(), title);
            }
        }
        Ok(out)
    }

    pub fn existing_entry_ids(&self, ids: &[String]) -> Result<HashSet<String>> {
        let conn = self.conn.lock().unwrap();
        let mut out = HashSet::new();
        let mut stmt = conn.prepare_cached("SELECT 1 FROM entries WHERE id = ?1")?;
        for id in ids {
            if stmt.query_row([id], |_| Ok(())).optional()?.is_some() {
                out.insert(id.clone());
            }
        }
        Ok(out)
    }

    pub fn count_entries(&self) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row("SELECT COUNT(*) FROM entries", [], |r| r.get(0))?)
    }

    // --- relations ----------------------------------------------------------

    pub fn upsert_relation_type(&self, rt: &RelationType) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let now_str = to_db(utc_now());
        conn.execute(
            "INSERT INTO relation_types (id, code, name, directed, enabled, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
             ON CONFLICT(id) DO UPDATE SET
               code = excluded.code, name = excluded.name, directed = excluded.directed,
               enabled = excluded.enabled, updated_at = excluded.updated_at",
            params![rt.id, rt.code, rt.name, rt.directed, rt.enabled, now_str],
        )?;
        Ok(())
    }

    /// Enabled relation-type codes, sorted, for recommendation prompts.
    pub fn enabled_relation_type_codes(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT code FROM relation_types WHERE enabled = 1 ORDER BY code ASC")?;
        let codes = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .filter_map(|r| r.ok())
            .filter(|c| !c.trim().is_empty())
            .collect();
        Ok(codes)
    }

    pub fn create_relation(
        &self,
        source_entry_id: &str,
        target_entry_id: &str,
        relation_type_id: &str,
    ) -> Result<Relation> {
        let conn = self.conn.lock().unwrap();
        let id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO relations (id, source_entry_id, target_entry_id, relation_type_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, source_entry_id, target_entry_id, relation_type_id, to_db(utc_now())],
        )?;
        Ok(Relation {
            id,
            source_entry_id: source_entry_id.to_string(),
            target_entry_id: target_entry_id.to_string(),
            relation_type_id: relation_type_id.to_string(),
        })
    }

    /// Relations touching an entry from either end.
    pub fn relations_by_entry(&self, entry_id: &str) -> Result<Vec<Relation>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, source_entry_id, target_entry_id, relation_type_id
             FROM relations WHERE source_entry_id = ?1 OR target_entry_id = ?1",
        )?;
        let relations = stmt
            .query_map([entry_id], |row| {
                Ok(Relation {
                    id: row.get(0)?,
                    source_entry_id: row.get(1)?,
                    target_entry_id: row.get(2)?,
                    relation_type_id: row.get(3)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(relations)
    }

    fn require_type_and_tags(&self, type_id: &str, tag_ids: &[String]) -> Result<()> {
        if self.find_entry_type(type_id)?.is_none() {
            return Err(StoreError::Validation(format!(
                "entry type does not exist: {type_id}"
            )));
        }
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached("SELECT 1 FROM tags WHERE id = ?1")?;
        for tag_id in tag_ids {
            if stmt.query_row([tag_id], |_| Ok(())).optional()?.is_none() {
                return Err(StoreError::Validation(format!("invalid tag id: {tag_id}")));
            }
        }
        Ok(())
    }
}

/// Seeding helpers shared by tests across the workspace.
#[doc(hidden)]
pub mod test_support {
    use super::*;

    /// A default indexable type plus one entry input, for pipeline tests.
    pub fn seed_type(store: &Store, id: &str, indexable: bool) {
        store
            .upsert_entry_type(&EntryType {
                id: id.to_string(),
                code: format!("code-{id}"),
                name: format!("Type {id}"),
                color: None,
                icon: None,
                graph_enabled: indexable,
                ai_enabled: indexable,
                enabled: true,
            })
            .unwrap();
    }

    pub fn entry_input(type_id: &str, title: &str, content: &str) -> EntryInput {
        EntryInput {
            title: title.to_string(),
            summary: None,
            content: Some(content.to_string()),
            type_id: type_id.to_string(),
            time_mode: TimeMode::None,
            time_at: None,
            time_from: None,
            time_to: None,
            tag_ids: Vec::new(),
        }
    }
}
