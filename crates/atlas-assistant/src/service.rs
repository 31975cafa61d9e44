//! Chat stream orchestration: conversation persistence, event
//! ordering, skill dispatch, replay arrays, and auto-titles.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use atlas_core::AtlasError;
use atlas_llm::{ChatApi, ChatRequest};
use atlas_store::Store;

use crate::events::ChatEvent;
use crate::executor::{HistoryMessage, SkillExecutor};
use crate::router::SkillRouter;

const MODERATION_MARKERS: &[&str] =
    &["blocked", "content_filter", "content filter", "policy", "safety"];
const MODERATION_REPLY: &str = "抱歉，您的请求被 AI 服务拒绝，请尝试换一种表达方式。";
const NO_PROVIDER_REPLY: &str = "抱歉，当前没有配置 AI 服务。请在设置中配置 AI Provider。";
const MAX_TITLE_CHARS: usize = 50;
const HISTORY_WINDOW: usize = 20;

/// A resolved chat model binding.
#[derive(Clone)]
pub struct ChatBinding {
    pub api: Arc<dyn ChatApi>,
    pub model: String,
}

pub struct AssistantService {
    store: Store,
    binding: Option<ChatBinding>,
    router: SkillRouter,
    executor: SkillExecutor,
}

/// Accumulated replay arrays for the assistant message row.
#[derive(Default)]
struct ReplayArrays {
    tool_calls: Vec<serde_json::Value>,
    tool_results: Vec<serde_json::Value>,
    skill_calls: Vec<serde_json::Value>,
    analysis: Vec<serde_json::Value>,
}

impl ReplayArrays {
    fn observe(&mut self, event: &ChatEvent) {
        match event {
            ChatEvent::ToolCallStart {
                id,
                name,
                args,
                hidden,
            } => self.tool_calls.push(serde_json::json!({
                "id": id, "name": name, "args": args, "hidden": hidden,
            })),
            ChatEvent::ToolCallEnd { id, status, result } => {
                self.tool_results.push(serde_json::json!({
                    "id": id, "status": status, "result": result,
                }))
            }
            ChatEvent::SkillStart { id, name, hidden } => {
                self.skill_calls.push(serde_json::json!({
                    "id": id, "name": name, "status": "running", "hidden": hidden,
                }))
            }
            ChatEvent::SkillEnd { id, status } => {
                for call in self.skill_calls.iter_mut() {
                    if call.get("id").and_then(|v| v.as_str()) == Some(id) {
                        call["status"] = serde_json::json!(status);
                    }
                }
            }
            ChatEvent::AnalysisStart { id } => self.analysis.push(serde_json::json!({
                "id": id, "content": "", "status": "running",
            })),
            ChatEvent::AnalysisDelta { id, delta } => {
                for step in self.analysis.iter_mut() {
                    if step.get("id").and_then(|v| v.as_str()) == Some(id) {
                        let current =
                            step.get("content").and_then(|v| v.as_str()).unwrap_or("");
                        step["content"] = serde_json::json!(format!("{current}{delta}"));
                    }
                }
            }
            ChatEvent::AnalysisEnd { id } => {
                for step in self.analysis.iter_mut() {
                    if step.get("id").and_then(|v| v.as_str()) == Some(id) {
                        step["status"] = serde_json::json!("completed");
                    }
                }
            }
            _ => {}
        }
    }

    fn non_empty(values: Vec<serde_json::Value>) -> Option<serde_json::Value> {
        if values.is_empty() {
            None
        } else {
            Some(serde_json::Value::Array(values))
        }
    }
}

impl AssistantService {
    pub fn new(
        store: Store,
        binding: Option<ChatBinding>,
        router: SkillRouter,
        executor: SkillExecutor,
    ) -> Self {
        Self {
            store,
            binding,
            router,
            executor,
        }
    }

    /// Run one chat turn, emitting SSE events into `sink`.
    ///
    /// Event order: `message_start`, interleaved skill/tool/analysis/
    /// content events, optional `title_updated`, finally `message_end`.
    /// On fatal error: `error` then `message_end{finishReason=error}`,
    /// and nothing already committed by tools is rolled back.
    pub async fn chat_stream(
        &self,
        conversation_id: &str,
        user_message: &str,
        sink: mpsc::Sender<ChatEvent>,
    ) -> Result<(), AtlasError> {
        let conversation = self
            .store
            .get_conversation(conversation_id)
            .map_err(AtlasError::from)?;

        self.store
            .add_message(conversation_id, "user", user_message)
            .map_err(AtlasError::from)?;
        let assistant_msg = self
            .store
            .add_message(conversation_id, "assistant", "")
            .map_err(AtlasError::from)?;

        let _ = sink
            .send(ChatEvent::MessageStart {
                conversation_id: conversation_id.to_string(),
                message_id: assistant_msg.id.clone(),
            })
            .await;

        let outcome = self
            .run_turn(conversation_id, user_message, &assistant_msg.id, &sink)
            .await;

        match outcome {
            Ok(content) => {
                if conversation.title.is_none() {
                    if let Some(title) = self.generate_title(user_message, &content).await {
                        if self.store.set_conversation_title(conversation_id, &title).is_ok() {
                            let _ = sink.send(ChatEvent::TitleUpdated { title }).await;
                        }
                    }
                }
                let _ = sink
                    .send(ChatEvent::MessageEnd {
                        finish_reason: "stop".to_string(),
                    })
                    .await;
                Ok(())
            }
            Err(e) => {
                warn!("chat stream error: {e}");
                // Tools may have committed; nothing is rolled back.
                let _ = sink
                    .send(ChatEvent::Error {
                        error: "Failed to generate response".to_string(),
                    })
                    .await;
                let _ = sink
                    .send(ChatEvent::MessageEnd {
                        finish_reason: "error".to_string(),
                    })
                    .await;
                Ok(())
            }
        }
    }

    /// The inner turn: route, execute, persist replay arrays. Returns
    /// the assistant content.
    async fn run_turn(
        &self,
        conversation_id: &str,
        user_message: &str,
        assistant_message_id: &str,
        sink: &mpsc::Sender<ChatEvent>,
    ) -> Result<String, AtlasError> {
        if self.binding.is_none() {
            // No provider configured: canned reply, chunked to mimic
            // streaming.
            let mut content = String::new();
            for chunk in chunk_text(NO_PROVIDER_REPLY, 16) {
                content.push_str(&chunk);
                let _ = sink.send(ChatEvent::ContentDelta { delta: chunk }).await;
            }
            self.persist_assistant_message(assistant_message_id, &content, ReplayArrays::default())?;
            return Ok(content);
        }

        let history = self.load_history(conversation_id, user_message)?;
        let skill_name = self.router.route(user_message).await;

        let skill_id = format!("skill_{}", Uuid::new_v4().simple());
        let mut replay = ReplayArrays::default();
        let skill_start = ChatEvent::SkillStart {
            id: skill_id.clone(),
            name: skill_name.clone(),
            hidden: false,
        };
        replay.observe(&skill_start);
        let _ = sink.send(skill_start).await;

        // Relay executor events so replay arrays accumulate while the
        // client sees them live.
        let (relay_tx, mut relay_rx) = mpsc::channel::<ChatEvent>(64);
        let result = {
            let executor_future =
                self.executor
                    .execute(&skill_name, user_message, &history, &relay_tx);
            tokio::pin!(executor_future);
            loop {
                tokio::select! {
                    outcome = &mut executor_future => break outcome,
                    Some(event) = relay_rx.recv() => {
                        replay.observe(&event);
                        let _ = sink.send(event).await;
                    }
                }
            }
        };
        drop(relay_tx);
        // Drain anything buffered after completion.
        while let Ok(event) = relay_rx.try_recv() {
            replay.observe(&event);
            let _ = sink.send(event).await;
        }
        let (content, status) = match result {
            Ok(content) => (content, "completed".to_string()),
            Err(e) => {
                let message = e.to_string().to_lowercase();
                if MODERATION_MARKERS.iter().any(|m| message.contains(m)) {
                    // Moderation rejection: surface, no fallback.
                    let _ = sink
                        .send(ChatEvent::ContentDelta {
                            delta: MODERATION_REPLY.to_string(),
                        })
                        .await;
                    (MODERATION_REPLY.to_string(), "error".to_string())
                } else {
                    let end = ChatEvent::SkillEnd {
                        id: skill_id.clone(),
                        status: "error".to_string(),
                    };
                    replay.observe(&end);
                    let _ = sink.send(end).await;
                    self.persist_assistant_message(assistant_message_id, "", replay)?;
                    return Err(e);
                }
            }
        };

        let skill_end = ChatEvent::SkillEnd {
            id: skill_id,
            status,
        };
        replay.observe(&skill_end);
        let _ = sink.send(skill_end).await;

        self.persist_assistant_message(assistant_message_id, &content, replay)?;
        Ok(content)
    }

    fn persist_assistant_message(
        &self,
        message_id: &str,
        content: &str,
        replay: ReplayArrays,
    ) -> Result<(), AtlasError> {
        self.store
            .finalize_assistant_message(
                message_id,
                content,
                ReplayArrays::non_empty(replay.tool_calls).as_ref(),
                ReplayArrays::non_empty(replay.tool_results).as_ref(),
                ReplayArrays::non_empty(replay.skill_calls).as_ref(),
                ReplayArrays::non_empty(replay.analysis).as_ref(),
            )
            .map_err(AtlasError::from)
    }

    /// Prior turns for context: last N messages minus the two rows this
    /// turn just inserted.
    fn load_history(
        &self,
        conversation_id: &str,
        _current_user_message: &str,
    ) -> Result<Vec<HistoryMessage>, AtlasError> {
        let mut messages = self
            .store
            .recent_messages(conversation_id, HISTORY_WINDOW + 2)
            .map_err(AtlasError::from)?;
        // Drop the freshly inserted user + empty assistant rows.
        messages.retain(|m| !(m.role == "assistant" && m.content.is_empty()));
        if let Some(last) = messages.last() {
            if last.role == "user" {
                messages.pop();
            }
        }
        Ok(messages
            .into_iter()
            .filter(|m| matches!(m.role.as_str(), "user" | "assistant"))
            .filter(|m| !m.content.trim().is_empty())
            .map(|m| HistoryMessage {
                role: m.role,
                content: m.content,
            })
            .collect())
    }

    /// One-shot title generation; anything over the cap is discarded.
    async fn generate_title(&self, user_message: &str, assistant_response: &str) -> Option<String> {
        let binding = self.binding.as_ref()?;
        let user_excerpt: String = user_message.chars().take(200).collect();
        let assistant_excerpt: String = assistant_response.chars().take(200).collect();
        let prompt = format!(
            "根据以下对话内容，生成一个简短的对话标题（不超过20个字）。\n只输出标题本身，不要加引号或其他标点。\n\n用户: {user_excerpt}\n助手: {assistant_excerpt}\n\n标题:"
        );

        let request = ChatRequest::new(
            binding.model.clone(),
            vec![serde_json::json!({ "role": "user", "content": prompt })],
        );
        match binding.api.send(&request).await {
            Ok(resp) => {
                let title = resp
                    .content
                    .trim()
                    .trim_matches(['"', '\'', '“', '”'])
                    .trim()
                    .to_string();
                if !title.is_empty() && title.chars().count() <= MAX_TITLE_CHARS {
                    info!(title = %title, "conversation title generated");
                    Some(title)
                } else {
                    None
                }
            }
            Err(e) => {
                warn!("failed to generate title: {e}");
                None
            }
        }
    }
}

fn chunk_text(text: &str, chunk_size: usize) -> Vec<String> {
    let chars: Vec<char> = text.trim().chars().collect();
    chars
        .chunks(chunk_size)
        .map(|c| c.iter().collect())
        .collect()
}
