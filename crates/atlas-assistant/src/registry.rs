//! Tool and skill registries: compile-time catalogue layered under DB
//! overrides.
//!
//! A DB row with `enabled=false` hides the built-in of the same name
//! entirely — except `kb_search`, which is internal-only and always
//! resolvable. Remote rows materialise as [`RemoteTool`]s.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use atlas_core::config::KbConfig;
use atlas_core::crypto::KeyVault;
use atlas_core::AtlasError;
use atlas_rag::RetrievalService;
use atlas_store::assistant_config::RemoteToolInput;
use atlas_store::Store;

use crate::skills::{is_default_skill, skill_from_row, system_skills, SkillDefinition};
use crate::tools::entry_tools::{
    CreateEntryTool, GetEntryDetailTool, GetStatisticsTool, ListEntryTypesTool, ListTagsTool,
    SearchEntriesTool,
};
use crate::tools::kb::KbSearchTool;
use crate::tools::remote::{validate_url_static, RemoteTool};
use crate::tools::{Tool, KB_SEARCH_TOOL};

/// Static catalogue of built-in tools (name, description). `kb_search`
/// is deliberately absent: it is not user-configurable.
pub fn tool_catalog() -> Vec<(&'static str, &'static str)> {
    vec![
        ("search_entries", "Search entries by keyword"),
        ("create_entry", "Create a new entry"),
        ("get_entry_detail", "Fetch one entry by id"),
        ("get_statistics", "Overall entry/tag/attachment counts"),
        ("list_entry_types", "List configured entry types"),
        ("list_tags", "List all tags"),
    ]
}

/// Seed marker rows for built-ins so the UI can toggle them.
pub fn seed_system_tools(store: &Store) -> Result<(), AtlasError> {
    for (name, description) in tool_catalog() {
        store
            .upsert_system_tool(name, description)
            .map_err(AtlasError::from)?;
    }
    Ok(())
}

pub struct ToolRegistry {
    store: Store,
    vault: Option<Arc<KeyVault>>,
    local: HashMap<&'static str, Arc<dyn Tool>>,
    kb_search: Arc<dyn Tool>,
}

impl ToolRegistry {
    pub fn new(
        store: Store,
        retrieval: Arc<RetrievalService>,
        kb_cfg: KbConfig,
        vault: Option<Arc<KeyVault>>,
    ) -> Self {
        let mut local: HashMap<&'static str, Arc<dyn Tool>> = HashMap::new();
        local.insert(
            "search_entries",
            Arc::new(SearchEntriesTool::new(store.clone())),
        );
        local.insert("create_entry", Arc::new(CreateEntryTool::new(store.clone())));
        local.insert(
            "get_entry_detail",
            Arc::new(GetEntryDetailTool::new(store.clone())),
        );
        local.insert(
            "get_statistics",
            Arc::new(GetStatisticsTool::new(store.clone())),
        );
        local.insert(
            "list_entry_types",
            Arc::new(ListEntryTypesTool::new(store.clone())),
        );
        local.insert("list_tags", Arc::new(ListTagsTool::new(store.clone())));

        let kb_search: Arc<dyn Tool> = Arc::new(KbSearchTool::new(
            store.clone(),
            retrieval,
            kb_cfg,
        ));

        Self {
            store,
            vault,
            local,
            kb_search,
        }
    }

    /// Map a tool name onto a runnable tool, honouring DB overrides.
    pub fn resolve(&self, tool_name: &str) -> Option<Arc<dyn Tool>> {
        if tool_name == KB_SEARCH_TOOL {
            return Some(self.kb_search.clone());
        }

        match self.store.find_tool(tool_name) {
            Ok(Some(row)) => {
                if !row.enabled {
                    // Disabled override hides the built-in too.
                    return None;
                }
                if row.kind == "remote" {
                    return Some(Arc::new(RemoteTool::from_row(row, self.vault.clone())));
                }
                self.local.get(tool_name).cloned()
            }
            Ok(None) => self.local.get(tool_name).cloned(),
            Err(e) => {
                warn!(tool = tool_name, "tool row lookup failed: {e}");
                self.local.get(tool_name).cloned()
            }
        }
    }

    /// Validate and persist a remote tool. System names and the
    /// internal KB tool are refused.
    pub fn create_remote_tool(&self, input: &RemoteToolInput) -> Result<(), AtlasError> {
        if input.name == KB_SEARCH_TOOL {
            return Err(AtlasError::Validation(format!(
                "{KB_SEARCH_TOOL} is reserved"
            )));
        }
        if tool_catalog().iter().any(|(name, _)| *name == input.name) {
            return Err(AtlasError::Conflict(format!(
                "name shadows a system tool: {}",
                input.name
            )));
        }
        let method = input.http_method.trim().to_ascii_uppercase();
        if !matches!(
            method.as_str(),
            "GET" | "POST" | "PUT" | "PATCH" | "DELETE"
        ) {
            return Err(AtlasError::Validation(format!(
                "unsupported HTTP method: {}",
                input.http_method
            )));
        }
        validate_url_static(&input.endpoint_url)
            .map_err(|e| AtlasError::Validation(e.to_string()))?;

        self.store
            .create_remote_tool(input)
            .map(|_| ())
            .map_err(AtlasError::from)
    }
}

/// Active skill catalogue: system ∪ enabled DB skills, with an
/// explicitly disabled DB row hiding its system namesake — except the
/// default skill, which is always available.
pub struct SkillRegistry {
    store: Store,
}

impl SkillRegistry {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn list_active(&self, light: bool) -> Vec<SkillDefinition> {
        let mut merged: HashMap<String, SkillDefinition> = HashMap::new();
        let disabled = self.store.disabled_skill_names().unwrap_or_default();

        for skill in system_skills() {
            if disabled.contains(&skill.name) && !is_default_skill(&skill.name) {
                continue;
            }
            merged.insert(skill.name.clone(), skill);
        }
        if let Ok(rows) = self.store.list_enabled_skills(!light) {
            for row in rows {
                merged.insert(row.name.clone(), skill_from_row(&row, light));
            }
        }
        merged.into_values().collect()
    }

    /// Resolve a skill for execution: enabled DB version first, then
    /// the system catalogue. A disabled non-default DB row blocks both.
    pub fn resolve(&self, skill_name: &str) -> Option<SkillDefinition> {
        if let Ok(Some(row)) = self.store.find_skill(skill_name) {
            if row.enabled {
                return Some(skill_from_row(&row, false));
            }
            if !is_default_skill(skill_name) {
                return None;
            }
        }
        crate::skills::system_skill_by_name(skill_name)
    }
}
