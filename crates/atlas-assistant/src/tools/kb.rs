//! The internal `kb_search` tool: graph-aware knowledge-base recall.
//!
//! Returns a JSON document with pre-numbered `references` (entries,
//! then entities, then relationships — the numbering the citation
//! contract promises), recalled entry snippets, and the graph context.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use atlas_core::config::KbConfig;
use atlas_core::types::QueryMode;
use atlas_rag::service::build_references;
use atlas_rag::RetrievalService;
use atlas_store::Store;

use super::{Tool, ToolResult, KB_SEARCH_TOOL};

pub struct KbSearchTool {
    store: Store,
    retrieval: Arc<RetrievalService>,
    cfg: KbConfig,
}

impl KbSearchTool {
    pub fn new(store: Store, retrieval: Arc<RetrievalService>, cfg: KbConfig) -> Self {
        Self {
            store,
            retrieval,
            cfg,
        }
    }
}

#[async_trait]
impl Tool for KbSearchTool {
    fn name(&self) -> &str {
        KB_SEARCH_TOOL
    }

    fn description(&self) -> &str {
        "Recall related notes, entities and relationships from the \
         knowledge base for a query. Internal: results carry numbered \
         references for [^n] citations."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "What to look up" }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let query = match input.get("query").and_then(|v| v.as_str()) {
            Some(q) if !q.trim().is_empty() => q.trim().to_string(),
            _ => return ToolResult::error("missing required parameter: query"),
        };

        let mode: QueryMode = self
            .cfg
            .graph_recall_mode
            .parse()
            .unwrap_or(QueryMode::Mix);

        let context = match self
            .retrieval
            .graph_recall_with_context(
                &query,
                mode,
                self.cfg.graph_recall_top_k,
                self.cfg.graph_recall_chunk_top_k,
                self.cfg.graph_recall_max_tokens,
            )
            .await
        {
            Ok(c) => c,
            Err(e) => return ToolResult::error(format!("kb_search failed: {e}")),
        };

        // Score floor, then one entry card per distinct entry.
        let min_score = self.cfg.graph_recall_min_score;
        let mut seen: HashSet<String> = HashSet::new();
        let mut items: Vec<serde_json::Value> = Vec::new();
        for chunk in &context.chunks {
            if let Some(score) = chunk.score {
                if score < min_score {
                    continue;
                }
            }
            let Some(entry_id) = &chunk.entry_id else {
                continue;
            };
            if !seen.insert(entry_id.clone()) || items.len() >= self.cfg.graph_recall_max_entries {
                continue;
            }
            if let Ok(Some(entry)) = self.store.find_entry(entry_id) {
                let snippet: String = entry
                    .content
                    .as_deref()
                    .unwrap_or("")
                    .chars()
                    .take(self.cfg.graph_recall_max_chunk_chars)
                    .collect();
                items.push(json!({
                    "entryId": entry.id,
                    "title": entry.title,
                    "summary": entry.summary,
                    "content": snippet,
                }));
            }
        }

        let references = build_references(
            &context.chunks,
            &context.entities,
            &context.relationships,
            Some(&self.store),
        );

        let payload = json!({
            "references": references,
            "items": items,
            "graphContext": {
                "entities": context.entities.iter().map(|e| json!({
                    "name": e.name,
                    "type": e.entity_type,
                    "description": e.description,
                })).collect::<Vec<_>>(),
                "relationships": context.relationships.iter().map(|r| json!({
                    "source": r.source,
                    "target": r.target,
                    "description": r.description,
                })).collect::<Vec<_>>(),
            },
        });

        ToolResult::success(payload.to_string())
    }
}
