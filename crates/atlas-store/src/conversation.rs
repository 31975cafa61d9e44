//! Conversations and messages, including the tool/skill/analysis replay
//! arrays the UI uses to reconstruct a turn.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use atlas_core::time::{from_db, to_db};
use atlas_core::utc_now;

use crate::error::{Result, StoreError};
use crate::Store;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: Option<String>,
    pub is_archived: bool,
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub conversation_id: String,
    pub role: String,
    pub content: String,
    pub tool_calls: Option<serde_json::Value>,
    pub tool_results: Option<serde_json::Value>,
    pub skill_calls: Option<serde_json::Value>,
    pub analysis: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        title: row.get(1)?,
        is_archived: row.get(2)?,
        last_message_at: row
            .get::<_, Option<String>>(3)?
            .as_deref()
            .and_then(from_db),
        created_at: from_db(&row.get::<_, String>(4)?).unwrap_or_else(Utc::now),
        updated_at: from_db(&row.get::<_, String>(5)?).unwrap_or_else(Utc::now),
    })
}

fn parse_json_column(raw: Option<String>) -> Option<serde_json::Value> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    Ok(StoredMessage {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        role: row.get(2)?,
        content: row.get(3)?,
        tool_calls: parse_json_column(row.get(4)?),
        tool_results: parse_json_column(row.get(5)?),
        skill_calls: parse_json_column(row.get(6)?),
        analysis: parse_json_column(row.get(7)?),
        created_at: from_db(&row.get::<_, String>(8)?).unwrap_or_else(Utc::now),
    })
}

const MESSAGE_COLUMNS: &str =
    "id, conversation_id, role, content, tool_calls, tool_results, skill_calls, analysis, created_at";

impl Store {
    pub fn create_conversation(&self, title: Option<&str>) -> Result<Conversation> {
        let conn = self.conn.lock().unwrap();
        let id = Uuid::new_v4().to_string();
        let now_str = to_db(utc_now());
        conn.execute(
            "INSERT INTO conversations (id, title, is_archived, created_at, updated_at)
             VALUES (?1, ?2, 0, ?3, ?3)",
            params![id, title, now_str],
        )?;
        drop(conn);
        self.get_conversation(&id)
    }

    pub fn get_conversation(&self, id: &str) -> Result<Conversation> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, title, is_archived, last_message_at, created_at, updated_at
             FROM conversations WHERE id = ?1",
            [id],
            row_to_conversation,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("conversation not found: {id}")))
    }

    pub fn list_conversations(&self, archived: Option<bool>) -> Result<Vec<Conversation>> {
        let conn = self.conn.lock().unwrap();
        let sql = "SELECT id, title, is_archived, last_message_at, created_at, updated_at
                   FROM conversations
                   ORDER BY last_message_at IS NULL, last_message_at DESC, updated_at DESC";
        let mut stmt = conn.prepare(sql)?;
        let rows: Vec<Conversation> = stmt
            .query_map([], row_to_conversation)?
            .filter_map(|r| r.ok())
            .filter(|c| archived.map(|a| c.is_archived == a).unwrap_or(true))
            .collect();
        Ok(rows)
    }

    pub fn delete_conversation(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute("DELETE FROM conversations WHERE id = ?1", [id])?;
        if n == 0 {
            return Err(StoreError::NotFound(format!("conversation not found: {id}")));
        }
        Ok(())
    }

    pub fn set_conversation_title(&self, id: &str, title: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE conversations SET title = ?1, updated_at = ?2 WHERE id = ?3",
            params![title, to_db(utc_now()), id],
        )?;
        Ok(())
    }

    pub fn add_message(
        &self,
        conversation_id: &str,
        role: &str,
        content: &str,
    ) -> Result<StoredMessage> {
        let conn = self.conn.lock().unwrap();
        let id = Uuid::new_v4().to_string();
        let now_str = to_db(utc_now());
        conn.execute(
            "INSERT INTO messages (id, conversation_id, role, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, conversation_id, role, content, now_str],
        )?;
        conn.execute(
            "UPDATE conversations SET last_message_at = ?1, updated_at = ?1 WHERE id = ?2",
            params![now_str, conversation_id],
        )?;
        drop(conn);
        self.get_message(&id)
    }

    /// Write the final assistant message body plus replay arrays after a
    /// stream completes.
    pub fn finalize_assistant_message(
        &self,
        message_id: &str,
        content: &str,
        tool_calls: Option<&serde_json::Value>,
        tool_results: Option<&serde_json::Value>,
        skill_calls: Option<&serde_json::Value>,
        analysis: Option<&serde_json::Value>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE messages
             SET content = ?1, tool_calls = ?2, tool_results = ?3, skill_calls = ?4, analysis = ?5
             WHERE id = ?6",
            params![
                content,
                tool_calls.map(|v| v.to_string()),
                tool_results.map(|v| v.to_string()),
                skill_calls.map(|v| v.to_string()),
                analysis.map(|v| v.to_string()),
                message_id
            ],
        )?;
        Ok(())
    }

    pub fn get_message(&self, id: &str) -> Result<StoredMessage> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
            [id],
            row_to_message,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("message not found: {id}")))
    }

    /// Last `limit` messages in chronological order.
    pub fn recent_messages(&self, conversation_id: &str, limit: usize) -> Result<Vec<StoredMessage>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE conversation_id = ?1
             ORDER BY created_at DESC LIMIT ?2"
        ))?;
        let mut msgs: Vec<StoredMessage> = stmt
            .query_map(params![conversation_id, limit as i64], row_to_message)?
            .filter_map(|r| r.ok())
            .collect();
        msgs.reverse();
        Ok(msgs)
    }
}
