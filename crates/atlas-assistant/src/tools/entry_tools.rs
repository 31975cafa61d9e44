//! Built-in tools over the entry store.

use async_trait::async_trait;
use serde_json::json;

use atlas_core::types::TimeMode;
use atlas_store::entry::EntryInput;
use atlas_store::Store;

use super::{Tool, ToolResult};

fn entry_brief(entry: &atlas_core::types::Entry) -> serde_json::Value {
    json!({
        "entryId": entry.id,
        "title": entry.title,
        "summary": entry.summary,
        "tags": entry.tags.iter().map(|t| t.name.clone()).collect::<Vec<_>>(),
        "updatedAt": entry.updated_at.to_rfc3339(),
    })
}

// ---------------------------------------------------------------------------
// search_entries
// ---------------------------------------------------------------------------

pub struct SearchEntriesTool {
    store: Store,
}

impl SearchEntriesTool {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for SearchEntriesTool {
    fn name(&self) -> &str {
        "search_entries"
    }

    fn description(&self) -> &str {
        "Search entries by keyword across title, summary and content. \
         Returns up to `limit` matches with id, title and tags."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "keyword": { "type": "string", "description": "Search keyword or phrase" },
                "limit": { "type": "integer", "description": "Max results (1-100), default 10" }
            },
            "required": ["keyword"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let keyword = match input.get("keyword").and_then(|v| v.as_str()) {
            Some(k) if !k.trim().is_empty() => k.trim().to_string(),
            _ => return ToolResult::error("missing required parameter: keyword"),
        };
        let limit = input
            .get("limit")
            .and_then(|v| v.as_u64())
            .map(|l| l.clamp(1, 100) as usize)
            .unwrap_or(10);

        match self.store.search_entries(&keyword, limit) {
            Ok(entries) => {
                let items: Vec<_> = entries.iter().map(entry_brief).collect();
                ToolResult::success(json!({ "count": items.len(), "items": items }).to_string())
            }
            Err(e) => ToolResult::error(format!("search_entries failed: {e}")),
        }
    }
}

// ---------------------------------------------------------------------------
// create_entry
// ---------------------------------------------------------------------------

pub struct CreateEntryTool {
    store: Store,
}

impl CreateEntryTool {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    fn resolve_type_id(&self, type_code: Option<&str>) -> Result<String, String> {
        let types = self
            .store
            .list_entry_types()
            .map_err(|e| format!("entry types unavailable: {e}"))?;
        if let Some(code) = type_code.map(str::trim).filter(|c| !c.is_empty()) {
            return types
                .iter()
                .find(|t| t.code == code && t.enabled)
                .map(|t| t.id.clone())
                .ok_or_else(|| format!("unknown entry type code: {code}"));
        }
        types
            .iter()
            .find(|t| t.enabled)
            .map(|t| t.id.clone())
            .ok_or_else(|| "no enabled entry types configured".to_string())
    }
}

#[async_trait]
impl Tool for CreateEntryTool {
    fn name(&self) -> &str {
        "create_entry"
    }

    fn description(&self) -> &str {
        "Create a new entry. Provide a short title; summary and content \
         are optional. The default entry type is used unless type_code is given."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "title": { "type": "string", "description": "Entry title (short)" },
                "summary": { "type": "string", "description": "One-line summary" },
                "content": { "type": "string", "description": "Full body text" },
                "type_code": { "type": "string", "description": "Entry type code, optional" }
            },
            "required": ["title"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let title = match input.get("title").and_then(|v| v.as_str()) {
            Some(t) if !t.trim().is_empty() => t.trim().to_string(),
            _ => return ToolResult::error("missing required parameter: title"),
        };
        let type_id = match self.resolve_type_id(input.get("type_code").and_then(|v| v.as_str())) {
            Ok(id) => id,
            Err(e) => return ToolResult::error(e),
        };

        let entry_input = EntryInput {
            title,
            summary: input
                .get("summary")
                .and_then(|v| v.as_str())
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from),
            content: input
                .get("content")
                .and_then(|v| v.as_str())
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from),
            type_id,
            time_mode: TimeMode::None,
            time_at: None,
            time_from: None,
            time_to: None,
            tag_ids: Vec::new(),
        };

        match self.store.create_entry(&entry_input) {
            Ok(entry) => ToolResult::success(
                json!({ "entryId": entry.id, "title": entry.title, "created": true }).to_string(),
            ),
            Err(e) => ToolResult::error(format!("create_entry failed: {e}")),
        }
    }
}

// ---------------------------------------------------------------------------
// get_entry_detail
// ---------------------------------------------------------------------------

pub struct GetEntryDetailTool {
    store: Store,
}

impl GetEntryDetailTool {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for GetEntryDetailTool {
    fn name(&self) -> &str {
        "get_entry_detail"
    }

    fn description(&self) -> &str {
        "Fetch one entry by id, including summary, content and tags."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "entry_id": { "type": "string", "description": "Entry UUID" }
            },
            "required": ["entry_id"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let entry_id = match input.get("entry_id").and_then(|v| v.as_str()) {
            Some(id) if !id.trim().is_empty() => id.trim(),
            _ => return ToolResult::error("missing required parameter: entry_id"),
        };
        match self.store.find_entry(entry_id) {
            Ok(Some(entry)) => {
                let mut detail = entry_brief(&entry);
                detail["content"] = json!(entry.content);
                ToolResult::success(detail.to_string())
            }
            Ok(None) => ToolResult::error(format!("entry not found: {entry_id}")),
            Err(e) => ToolResult::error(format!("get_entry_detail failed: {e}")),
        }
    }
}

// ---------------------------------------------------------------------------
// get_statistics / list_entry_types / list_tags
// ---------------------------------------------------------------------------

pub struct GetStatisticsTool {
    store: Store,
}

impl GetStatisticsTool {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for GetStatisticsTool {
    fn name(&self) -> &str {
        "get_statistics"
    }

    fn description(&self) -> &str {
        "Overall counts: entries, tags and attachments."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, _input: serde_json::Value) -> ToolResult {
        let entries = self.store.count_entries().unwrap_or(0);
        let tags = self.store.list_tags().map(|t| t.len()).unwrap_or(0);
        let attachments = self.store.count_attachments().unwrap_or(0);
        ToolResult::success(
            json!({ "entries": entries, "tags": tags, "attachments": attachments }).to_string(),
        )
    }
}

pub struct ListEntryTypesTool {
    store: Store,
}

impl ListEntryTypesTool {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for ListEntryTypesTool {
    fn name(&self) -> &str {
        "list_entry_types"
    }

    fn description(&self) -> &str {
        "List configured entry types with their codes and flags."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, _input: serde_json::Value) -> ToolResult {
        match self.store.list_entry_types() {
            Ok(types) => {
                let items: Vec<_> = types
                    .iter()
                    .map(|t| {
                        json!({
                            "code": t.code,
                            "name": t.name,
                            "enabled": t.enabled,
                            "indexable": t.indexable(),
                        })
                    })
                    .collect();
                ToolResult::success(json!({ "items": items }).to_string())
            }
            Err(e) => ToolResult::error(format!("list_entry_types failed: {e}")),
        }
    }
}

pub struct ListTagsTool {
    store: Store,
}

impl ListTagsTool {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for ListTagsTool {
    fn name(&self) -> &str {
        "list_tags"
    }

    fn description(&self) -> &str {
        "List all tags."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, _input: serde_json::Value) -> ToolResult {
        match self.store.list_tags() {
            Ok(tags) => {
                let items: Vec<_> = tags.iter().map(|t| json!({ "name": t.name })).collect();
                ToolResult::success(json!({ "items": items }).to_string())
            }
            Err(e) => ToolResult::error(format!("list_tags failed: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atlas_store::entry::test_support::{entry_input, seed_type};

    #[tokio::test]
    async fn create_then_search_round_trip() {
        let store = Store::open_in_memory().unwrap();
        seed_type(&store, "t1", true);

        let create = CreateEntryTool::new(store.clone());
        let result = create
            .execute(serde_json::json!({ "title": "Rust ownership", "content": "借用检查" }))
            .await;
        assert!(!result.is_error, "{}", result.content);

        let search = SearchEntriesTool::new(store.clone());
        let found = search
            .execute(serde_json::json!({ "keyword": "ownership" }))
            .await;
        assert!(!found.is_error);
        let parsed: serde_json::Value = serde_json::from_str(&found.content).unwrap();
        assert_eq!(parsed["count"], 1);
        assert_eq!(parsed["items"][0]["title"], "Rust ownership");
    }

    #[tokio::test]
    async fn missing_required_args_are_tool_errors() {
        let store = Store::open_in_memory().unwrap();
        seed_type(&store, "t1", true);
        store.create_entry(&entry_input("t1", "A", "x")).unwrap();

        let create = CreateEntryTool::new(store.clone());
        assert!(create.execute(serde_json::json!({})).await.is_error);

        let detail = GetEntryDetailTool::new(store);
        assert!(detail.execute(serde_json::json!({})).await.is_error);
    }

    #[tokio::test]
    async fn statistics_report_counts() {
        let store = Store::open_in_memory().unwrap();
        seed_type(&store, "t1", true);
        store.create_entry(&entry_input("t1", "A", "x")).unwrap();
        store.create_tag("rust", None, None).unwrap();

        let stats = GetStatisticsTool::new(store);
        let result = stats.execute(serde_json::json!({})).await;
        let parsed: serde_json::Value = serde_json::from_str(&result.content).unwrap();
        assert_eq!(parsed["entries"], 1);
        assert_eq!(parsed["tags"], 1);
    }
}
