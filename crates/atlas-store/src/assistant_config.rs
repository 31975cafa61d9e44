//! Assistant tool and skill configuration rows.
//!
//! Tools come in two kinds: `local` rows shadow the compile-time
//! catalogue (their `enabled` flag hides a built-in), `remote` rows
//! describe outbound HTTP tools. System rows cannot be edited or
//! deleted through the normal paths.

use std::collections::HashSet;

use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use atlas_core::time::to_db;
use atlas_core::utc_now;

use crate::error::{Result, StoreError};
use crate::Store;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRow {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub kind: String,
    pub is_system: bool,
    pub enabled: bool,
    pub input_params: Option<serde_json::Value>,
    pub endpoint_url: Option<String>,
    pub http_method: Option<String>,
    pub headers: Option<serde_json::Value>,
    pub query_params: Option<serde_json::Value>,
    pub body_type: Option<String>,
    pub body_content: Option<String>,
    pub auth_type: Option<String>,
    pub auth_header_name: Option<String>,
    pub auth_scheme: Option<String>,
    pub api_key_encrypted: Option<String>,
    pub timeout_seconds: Option<i64>,
    pub payload_wrapper: Option<String>,
}

/// Input for a user-configured remote tool.
#[derive(Debug, Clone, Default)]
pub struct RemoteToolInput {
    pub name: String,
    pub description: Option<String>,
    pub input_params: Option<serde_json::Value>,
    pub endpoint_url: String,
    pub http_method: String,
    pub headers: Option<serde_json::Value>,
    pub query_params: Option<serde_json::Value>,
    pub body_type: Option<String>,
    pub body_content: Option<String>,
    pub auth_type: Option<String>,
    pub auth_header_name: Option<String>,
    pub auth_scheme: Option<String>,
    pub api_key_encrypted: Option<String>,
    pub timeout_seconds: Option<i64>,
    pub payload_wrapper: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillStepRow {
    pub step_order: i64,
    pub step_type: String,
    pub instruction: Option<String>,
    pub tool_name: Option<String>,
    pub args_from: Option<String>,
    pub args_template: Option<String>,
    pub output_mode: Option<String>,
    pub output_fields: Option<Vec<String>>,
    pub include_in_summary: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillRow {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub intent_examples: Vec<String>,
    pub tools: Vec<String>,
    pub mode: String,
    pub system_prompt: Option<String>,
    pub kb_enabled: bool,
    pub is_system: bool,
    pub enabled: bool,
    pub steps: Vec<SkillStepRow>,
}

fn json_column(raw: Option<String>) -> Option<serde_json::Value> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
}

fn string_list_column(raw: Option<String>) -> Vec<String> {
    json_column(raw)
        .and_then(|v| {
            v.as_array().map(|arr| {
                arr.iter()
                    .filter_map(|x| x.as_str().map(String::from))
                    .collect()
            })
        })
        .unwrap_or_default()
}

const TOOL_COLUMNS: &str =
    "id, name, description, kind, is_system, enabled, input_params, endpoint_url, http_method, \
     headers, query_params, body_type, body_content, auth_type, auth_header_name, auth_scheme, \
     api_key_encrypted, timeout_seconds, payload_wrapper";

fn row_to_tool(row: &rusqlite::Row<'_>) -> rusqlite::Result<ToolRow> {
    Ok(ToolRow {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        kind: row.get(3)?,
        is_system: row.get(4)?,
        enabled: row.get(5)?,
        input_params: json_column(row.get(6)?),
        endpoint_url: row.get(7)?,
        http_method: row.get(8)?,
        headers: json_column(row.get(9)?),
        query_params: json_column(row.get(10)?),
        body_type: row.get(11)?,
        body_content: row.get(12)?,
        auth_type: row.get(13)?,
        auth_header_name: row.get(14)?,
        auth_scheme: row.get(15)?,
        api_key_encrypted: row.get(16)?,
        timeout_seconds: row.get(17)?,
        payload_wrapper: row.get(18)?,
    })
}

impl Store {
    // --- tools --------------------------------------------------------------

    /// Seed or refresh the marker row for a built-in tool. Never
    /// clobbers a user's `enabled` choice.
    pub fn upsert_system_tool(&self, name: &str, description: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let now_str = to_db(utc_now());
        conn.execute(
            "INSERT INTO assistant_tools
             (id, name, description, kind, is_system, enabled, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'local', 1, 1, ?4, ?4)
             ON CONFLICT(name) DO UPDATE SET
               description = excluded.description, is_system = 1, kind = 'local',
               updated_at = excluded.updated_at",
            params![Uuid::new_v4().to_string(), name, description, now_str],
        )?;
        Ok(())
    }

    pub fn create_remote_tool(&self, input: &RemoteToolInput) -> Result<ToolRow> {
        if input.name.trim().is_empty() {
            return Err(StoreError::Validation("tool name must not be empty".into()));
        }
        let conn = self.conn.lock().unwrap();
        let id = Uuid::new_v4().to_string();
        let now_str = to_db(utc_now());
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO assistant_tools
             (id, name, description, kind, is_system, enabled, input_params, endpoint_url,
              http_method, headers, query_params, body_type, body_content, auth_type,
              auth_header_name, auth_scheme, api_key_encrypted, timeout_seconds,
              payload_wrapper, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'remote', 0, 1, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                     ?14, ?15, ?16, ?17, ?17)",
            params![
                id,
                input.name.trim(),
                input.description,
                input.input_params.as_ref().map(|v| v.to_string()),
                input.endpoint_url.trim(),
                input.http_method.trim().to_uppercase(),
                input.headers.as_ref().map(|v| v.to_string()),
                input.query_params.as_ref().map(|v| v.to_string()),
                input.body_type,
                input.body_content,
                input.auth_type,
                input.auth_header_name,
                input.auth_scheme,
                input.api_key_encrypted,
                input.timeout_seconds,
                input.payload_wrapper,
                now_str
            ],
        )?;
        if inserted == 0 {
            return Err(StoreError::Conflict(format!(
                "tool already exists: {}",
                input.name
            )));
        }
        drop(conn);
        self.find_tool(input.name.trim())?
            .ok_or_else(|| StoreError::NotFound("tool vanished after create".into()))
    }

    pub fn find_tool(&self, name: &str) -> Result<Option<ToolRow>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                &format!("SELECT {TOOL_COLUMNS} FROM assistant_tools WHERE name = ?1"),
                [name],
                row_to_tool,
            )
            .optional()?;
        Ok(row)
    }

    pub fn set_tool_enabled(&self, name: &str, enabled: bool) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE assistant_tools SET enabled = ?1, updated_at = ?2 WHERE name = ?3",
            params![enabled, to_db(utc_now()), name],
        )?;
        Ok(n > 0)
    }

    pub fn delete_tool(&self, name: &str) -> Result<()> {
        let tool = self
            .find_tool(name)?
            .ok_or_else(|| StoreError::NotFound(format!("tool not found: {name}")))?;
        if tool.is_system {
            return Err(StoreError::Conflict(format!(
                "system tool cannot be deleted: {name}"
            )));
        }
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM assistant_tools WHERE name = ?1", [name])?;
        Ok(())
    }

    /// Names of rows with enabled=false — these hide built-ins.
    pub fn disabled_tool_names(&self) -> Result<HashSet<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT name FROM assistant_tools WHERE enabled = 0")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(names)
    }

    pub fn list_enabled_remote_tools(&self) -> Result<Vec<ToolRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TOOL_COLUMNS} FROM assistant_tools
             WHERE kind = 'remote' AND enabled = 1 ORDER BY name"
        ))?;
        let tools = stmt
            .query_map([], row_to_tool)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(tools)
    }

    // --- skills -------------------------------------------------------------

    /// Create a user-defined skill with ordered steps.
    pub fn create_skill(&self, skill: &SkillRow) -> Result<String> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let id = Uuid::new_v4().to_string();
        let now_str = to_db(utc_now());
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO assistant_skills
             (id, name, description, intent_examples, tools, mode, system_prompt,
              kb_enabled, is_system, enabled, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
            params![
                id,
                skill.name,
                skill.description,
                serde_json::to_string(&skill.intent_examples)?,
                serde_json::to_string(&skill.tools)?,
                skill.mode,
                skill.system_prompt,
                skill.kb_enabled,
                skill.is_system,
                skill.enabled,
                now_str
            ],
        )?;
        if inserted == 0 {
            return Err(StoreError::Conflict(format!(
                "skill already exists: {}",
                skill.name
            )));
        }
        for step in &skill.steps {
            tx.execute(
                "INSERT INTO assistant_skill_steps
                 (id, skill_id, step_order, step_type, instruction, tool_name, args_from,
                  args_template, output_mode, output_fields, include_in_summary)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    Uuid::new_v4().to_string(),
                    id,
                    step.step_order,
                    step.step_type,
                    step.instruction,
                    step.tool_name,
                    step.args_from,
                    step.args_template,
                    step.output_mode,
                    step
                        .output_fields
                        .as_ref()
                        .map(|f| serde_json::to_string(f))
                        .transpose()?,
                    step.include_in_summary
                ],
            )?;
        }
        tx.commit()?;
        Ok(id)
    }

    pub fn find_skill(&self, name: &str) -> Result<Option<SkillRow>> {
        let conn = self.conn.lock().unwrap();
        let skill = conn
            .query_row(
                "SELECT id, name, description, intent_examples, tools, mode, system_prompt,
                        kb_enabled, is_system, enabled
                 FROM assistant_skills WHERE name = ?1",
                [name],
                |row| {
                    Ok(SkillRow {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        description: row.get(2)?,
                        intent_examples: string_list_column(row.get(3)?),
                        tools: string_list_column(row.get(4)?),
                        mode: row.get(5)?,
                        system_prompt: row.get(6)?,
                        kb_enabled: row.get(7)?,
                        is_system: row.get(8)?,
                        enabled: row.get(9)?,
                        steps: Vec::new(),
                    })
                },
            )
            .optional()?;
        let Some(mut skill) = skill else {
            return Ok(None);
        };
        skill.steps = load_steps(&conn, &skill.id)?;
        Ok(Some(skill))
    }

    pub fn list_enabled_skills(&self, include_steps: bool) -> Result<Vec<SkillRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, description, intent_examples, tools, mode, system_prompt,
                    kb_enabled, is_system, enabled
             FROM assistant_skills WHERE enabled = 1 ORDER BY name",
        )?;
        let mut skills: Vec<SkillRow> = stmt
            .query_map([], |row| {
                Ok(SkillRow {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    description: row.get(2)?,
                    intent_examples: string_list_column(row.get(3)?),
                    tools: string_list_column(row.get(4)?),
                    mode: row.get(5)?,
                    system_prompt: row.get(6)?,
                    kb_enabled: row.get(7)?,
                    is_system: row.get(8)?,
                    enabled: row.get(9)?,
                    steps: Vec::new(),
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        if include_steps {
            for skill in &mut skills {
                skill.steps = load_steps(&conn, &skill.id)?;
            }
        }
        Ok(skills)
    }

    /// Skills explicitly disabled in the DB (their names hide system
    /// skills of the same name).
    pub fn disabled_skill_names(&self) -> Result<HashSet<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT name FROM assistant_skills WHERE enabled = 0")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(names)
    }

    pub fn set_skill_enabled(&self, name: &str, enabled: bool) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE assistant_skills SET enabled = ?1, updated_at = ?2 WHERE name = ?3",
            params![enabled, to_db(utc_now()), name],
        )?;
        Ok(n > 0)
    }
}

fn load_steps(conn: &rusqlite::Connection, skill_id: &str) -> Result<Vec<SkillStepRow>> {
    let mut stmt = conn.prepare_cached(
        "SELECT step_order, step_type, instruction, tool_name, args_from, args_template,
                output_mode, output_fields, include_in_summary
         FROM assistant_skill_steps WHERE skill_id = ?1 ORDER BY step_order",
    )?;
    let steps = stmt
        .query_map([skill_id], |row| {
            Ok(SkillStepRow {
                step_order: row.get(0)?,
                step_type: row.get(1)?,
                instruction: row.get(2)?,
                tool_name: row.get(3)?,
                args_from: row.get(4)?,
                args_template: row.get(5)?,
                output_mode: row.get(6)?,
                output_fields: row
                    .get::<_, Option<String>>(7)?
                    .and_then(|s| serde_json::from_str(&s).ok()),
                include_in_summary: row.get(8)?,
            })
        })?
        .filter_map(|r| r.ok())
        .collect();
    Ok(steps)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote_input(name: &str) -> RemoteToolInput {
        RemoteToolInput {
            name: name.to_string(),
            endpoint_url: "https://api.example.com/hook".to_string(),
            http_method: "post".to_string(),
            timeout_seconds: Some(15),
            ..Default::default()
        }
    }

    #[test]
    fn system_tools_cannot_be_deleted() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_system_tool("search_entries", "Search").unwrap();
        assert!(matches!(
            store.delete_tool("search_entries"),
            Err(StoreError::Conflict(_))
        ));
    }

    #[test]
    fn disabling_local_row_is_visible() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_system_tool("search_entries", "Search").unwrap();
        store.set_tool_enabled("search_entries", false).unwrap();
        assert!(store
            .disabled_tool_names()
            .unwrap()
            .contains("search_entries"));
    }

    #[test]
    fn remote_tool_round_trip_uppercases_method() {
        let store = Store::open_in_memory().unwrap();
        let tool = store.create_remote_tool(&remote_input("weather")).unwrap();
        assert_eq!(tool.kind, "remote");
        assert_eq!(tool.http_method.as_deref(), Some("POST"));
        assert_eq!(store.list_enabled_remote_tools().unwrap().len(), 1);
    }

    #[test]
    fn skill_with_steps_round_trips_in_order() {
        let store = Store::open_in_memory().unwrap();
        let skill = SkillRow {
            id: String::new(),
            name: "capture".to_string(),
            description: Some("capture notes".to_string()),
            intent_examples: vec!["记录一下".to_string()],
            tools: vec!["create_entry".to_string()],
            mode: "steps".to_string(),
            system_prompt: None,
            kb_enabled: false,
            is_system: false,
            enabled: true,
            steps: vec![
                SkillStepRow {
                    step_order: 1,
                    step_type: "analysis".to_string(),
                    instruction: Some("extract fields".to_string()),
                    tool_name: None,
                    args_from: None,
                    args_template: None,
                    output_mode: Some("json".to_string()),
                    output_fields: Some(vec!["title".to_string(), "content".to_string()]),
                    include_in_summary: true,
                },
                SkillStepRow {
                    step_order: 2,
                    step_type: "tool".to_string(),
                    instruction: None,
                    tool_name: Some("create_entry".to_string()),
                    args_from: Some("json".to_string()),
                    args_template: Some(r#"{"title": {{step_1_title}}}"#.to_string()),
                    output_mode: None,
                    output_fields: None,
                    include_in_summary: true,
                },
            ],
        };
        store.create_skill(&skill).unwrap();

        let loaded = store.find_skill("capture").unwrap().unwrap();
        assert_eq!(loaded.steps.len(), 2);
        assert_eq!(loaded.steps[0].step_type, "analysis");
        assert_eq!(
            loaded.steps[0].output_fields.as_deref(),
            Some(&["title".to_string(), "content".to_string()][..])
        );
        assert_eq!(loaded.steps[1].tool_name.as_deref(), Some("create_entry"));
    }

    #[test]
    fn disabled_skills_are_listed_by_name() {
        let store = Store::open_in_memory().unwrap();
        let mut skill = SkillRow {
            id: String::new(),
            name: "weekly_report".to_string(),
            description: None,
            intent_examples: vec![],
            tools: vec![],
            mode: "agent".to_string(),
            system_prompt: None,
            kb_enabled: true,
            is_system: false,
            enabled: true,
            steps: vec![],
        };
        store.create_skill(&skill).unwrap();
        store.set_skill_enabled("weekly_report", false).unwrap();
        assert!(store
            .disabled_skill_names()
            .unwrap()
            .contains("weekly_report"));
        skill.name = "other".to_string();
        store.create_skill(&skill).unwrap();
        assert_eq!(store.list_enabled_skills(false).unwrap().len(), 1);
    }
}
