//! Tool system for skill execution.
//!
//! A tool is either a built-in backed by the store ([`entry_tools`],
//! [`kb`]) or a user-configured remote HTTP endpoint ([`remote`]).
//! The registry layers DB overrides over the built-in catalogue.

pub mod entry_tools;
pub mod kb;
pub mod remote;

use async_trait::async_trait;

use atlas_llm::ToolDefinition;

/// The internal KB tool: never advertised to the model, never storable
/// as a user-configurable tool, always resolvable by the executor.
pub const KB_SEARCH_TOOL: &str = "kb_search";

/// Result of executing a tool.
#[derive(Debug, Clone)]
pub struct ToolResult {
    /// Text content returned to the LLM.
    pub content: String,
    /// Whether the tool execution failed.
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: message.into(),
            is_error: true,
        }
    }

    pub fn status(&self) -> &'static str {
        if self.is_error {
            "error"
        } else {
            "completed"
        }
    }
}

/// Trait all tools implement.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name (e.g. "search_entries").
    fn name(&self) -> &str;
    /// What this tool does, shown to the model.
    fn description(&self) -> &str;
    /// JSON Schema for the input parameters.
    fn input_schema(&self) -> serde_json::Value;
    /// Execute with the given input.
    async fn execute(&self, input: serde_json::Value) -> ToolResult;
}

/// Argument names accepted by a tool, from its schema.
pub fn schema_keys(tool: &dyn Tool) -> Option<Vec<String>> {
    let schema = tool.input_schema();
    let props = schema.get("properties")?.as_object()?;
    Some(props.keys().cloned().collect())
}

/// API-level definition for binding into an LLM request.
pub fn to_definition(tool: &dyn Tool) -> ToolDefinition {
    ToolDefinition {
        name: tool.name().to_string(),
        description: tool.description().to_string(),
        input_schema: tool.input_schema(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy;

    #[async_trait]
    impl Tool for Dummy {
        fn name(&self) -> &str {
            "dummy"
        }
        fn description(&self) -> &str {
            "does nothing"
        }
        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({
                "type": "object",
                "properties": {"a": {"type": "string"}, "b": {"type": "integer"}}
            })
        }
        async fn execute(&self, _input: serde_json::Value) -> ToolResult {
            ToolResult::success("ok")
        }
    }

    #[test]
    fn schema_keys_come_from_properties() {
        let keys = schema_keys(&Dummy).unwrap();
        assert!(keys.contains(&"a".to_string()));
        assert!(keys.contains(&"b".to_string()));
    }
}
