//! SSE events for the chat stream.
//!
//! Payloads go through `serde_json::Value`, so tool results carrying
//! UUIDs, timestamps, or arbitrary structures are stringified up front
//! and can never break the stream mid-flight.

use serde_json::json;

#[derive(Debug, Clone)]
pub enum ChatEvent {
    MessageStart {
        conversation_id: String,
        message_id: String,
    },
    ContentDelta {
        delta: String,
    },
    ToolCallStart {
        id: String,
        name: String,
        args: serde_json::Value,
        hidden: bool,
    },
    ToolCallEnd {
        id: String,
        status: String,
        result: String,
    },
    SkillStart {
        id: String,
        name: String,
        hidden: bool,
    },
    SkillEnd {
        id: String,
        status: String,
    },
    AnalysisStart {
        id: String,
    },
    AnalysisDelta {
        id: String,
        delta: String,
    },
    AnalysisEnd {
        id: String,
    },
    TitleUpdated {
        title: String,
    },
    Error {
        error: String,
    },
    MessageEnd {
        finish_reason: String,
    },
}

impl ChatEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ChatEvent::MessageStart { .. } => "message_start",
            ChatEvent::ContentDelta { .. } => "content_delta",
            ChatEvent::ToolCallStart { .. } => "tool_call_start",
            ChatEvent::ToolCallEnd { .. } => "tool_call_end",
            ChatEvent::SkillStart { .. } => "skill_start",
            ChatEvent::SkillEnd { .. } => "skill_end",
            ChatEvent::AnalysisStart { .. } => "analysis_start",
            ChatEvent::AnalysisDelta { .. } => "analysis_delta",
            ChatEvent::AnalysisEnd { .. } => "analysis_end",
            ChatEvent::TitleUpdated { .. } => "title_updated",
            ChatEvent::Error { .. } => "error",
            ChatEvent::MessageEnd { .. } => "message_end",
        }
    }

    pub fn payload(&self) -> serde_json::Value {
        match self {
            ChatEvent::MessageStart {
                conversation_id,
                message_id,
            } => json!({ "conversationId": conversation_id, "messageId": message_id }),
            ChatEvent::ContentDelta { delta } => json!({ "delta": delta }),
            ChatEvent::ToolCallStart {
                id,
                name,
                args,
                hidden,
            } => json!({ "toolCallId": id, "name": name, "args": args, "hidden": hidden }),
            ChatEvent::ToolCallEnd { id, status, result } => {
                json!({ "toolCallId": id, "status": status, "result": result })
            }
            ChatEvent::SkillStart { id, name, hidden } => {
                json!({ "id": id, "name": name, "hidden": hidden })
            }
            ChatEvent::SkillEnd { id, status } => json!({ "id": id, "status": status }),
            ChatEvent::AnalysisStart { id } => json!({ "id": id }),
            ChatEvent::AnalysisDelta { id, delta } => json!({ "id": id, "delta": delta }),
            ChatEvent::AnalysisEnd { id } => json!({ "id": id }),
            ChatEvent::TitleUpdated { title } => json!({ "title": title }),
            ChatEvent::Error { error } => json!({ "error": error }),
            ChatEvent::MessageEnd { finish_reason } => json!({ "finishReason": finish_reason }),
        }
    }

    /// Wire encoding: `event: <name>\ndata: <json>\n\n`.
    pub fn to_sse(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.name(), self.payload())
    }
}
