//! Skill router: LLM-based intent classification onto exactly one
//! skill, with a hard fallback to the default skill.

use std::sync::Arc;

use tracing::{info, warn};

use atlas_llm::{ChatApi, ChatRequest};

use crate::registry::SkillRegistry;
use crate::skills::{SkillDefinition, DEFAULT_SKILL_NAME};

const ROUTER_PROMPT: &str = "你是一个意图分类器，判断用户输入需要使用哪个 Skill。

## 当前日期
今天是 {current_date}

## 可用的 Skills

{skills_list}

## 重要规则
- **每次只返回一个 Skill**，不要返回多个
- 优先选择最匹配用户意图的单个 Skill
- 只有当用户意图与某个 Skill 的描述/示例**一致**时，才选择该 Skill
- **闲聊、问候、知识问答、写作润色、翻译、泛化的“总结/介绍/分析”** → 返回 {\"skills\": [\"{default_skill_name}\"]}
- 如果不确定，返回 {\"skills\": [\"{default_skill_name}\"]}

## 输出格式

返回 JSON 对象：
{\"skills\": [\"skill_name\"]}

不需要 Skill 时：
{\"skills\": [\"{default_skill_name}\"]}
";

fn build_skills_list(skills: &[SkillDefinition]) -> String {
    let mut lines = Vec::new();
    for skill in skills {
        let examples: Vec<String> = skill
            .intent_examples
            .iter()
            .take(3)
            .map(|e| format!("\"{e}\""))
            .collect();
        lines.push(format!("- **{}**: {}", skill.name, skill.description));
        lines.push(format!("  示例: {}", examples.join(", ")));
    }
    lines.join("\n")
}

/// Best-effort JSON extraction from a model answer: code fences first,
/// then the outermost brace slice.
fn parse_router_json(content: &str) -> Option<serde_json::Value> {
    let mut raw = content.trim();
    if raw.is_empty() {
        return None;
    }
    if raw.starts_with("```") {
        let parts: Vec<&str> = raw.splitn(3, "```").collect();
        if parts.len() >= 2 {
            raw = parts[1].trim();
            raw = raw.strip_prefix("json").unwrap_or(raw).trim();
        }
    }
    if let Ok(v) = serde_json::from_str(raw) {
        return Some(v);
    }
    let (start, end) = (raw.find('{')?, raw.rfind('}')?);
    if start < end {
        serde_json::from_str(&raw[start..=end]).ok()
    } else {
        None
    }
}

pub struct SkillRouter {
    llm: Arc<dyn ChatApi>,
    model: String,
    skills: SkillRegistry,
}

impl SkillRouter {
    pub fn new(llm: Arc<dyn ChatApi>, model: impl Into<String>, skills: SkillRegistry) -> Self {
        Self {
            llm,
            model: model.into(),
            skills,
        }
    }

    /// Classify the utterance onto one skill name. Parse failures,
    /// unknown names and model errors all fall back to the default
    /// skill.
    pub async fn route(&self, user_input: &str) -> String {
        let all_skills = self.skills.list_active(true);
        // Hidden skills stay out of the candidate list so the model is
        // not nudged toward the default on every turn.
        let candidates: Vec<&SkillDefinition> =
            all_skills.iter().filter(|s| !s.hidden).collect();
        let candidate_list: Vec<SkillDefinition> =
            candidates.iter().map(|s| (*s).clone()).collect();

        let prompt = ROUTER_PROMPT
            .replace("{current_date}", &chrono::Utc::now().format("%Y-%m-%d").to_string())
            .replace("{skills_list}", &build_skills_list(&candidate_list))
            .replace("{default_skill_name}", DEFAULT_SKILL_NAME);

        let request = ChatRequest::new(
            self.model.clone(),
            vec![
                serde_json::json!({ "role": "system", "content": prompt }),
                serde_json::json!({ "role": "user", "content": user_input }),
            ],
        )
        .deterministic();

        let content = match self.llm.send(&request).await {
            Ok(resp) => resp.content,
            Err(e) => {
                warn!("router LLM failed: {e}");
                return DEFAULT_SKILL_NAME.to_string();
            }
        };

        let selected = parse_router_json(&content)
            .and_then(|v| v.get("skills").cloned())
            .and_then(|skills| skills.as_array().cloned())
            .unwrap_or_default();

        for name in selected.iter().filter_map(|v| v.as_str()) {
            if name == DEFAULT_SKILL_NAME {
                info!(skill = name, "routed to default skill");
                return DEFAULT_SKILL_NAME.to_string();
            }
            if candidate_list.iter().any(|s| s.name == name) {
                info!(skill = name, "routed to skill");
                return name.to_string();
            }
        }

        info!("no valid skill match, falling back to default");
        DEFAULT_SKILL_NAME.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use atlas_llm::{ChatResponse, LlmError};
    use atlas_store::Store;

    struct CannedRouterLlm {
        answer: String,
    }

    #[async_trait]
    impl ChatApi for CannedRouterLlm {
        async fn send(&self, req: &ChatRequest) -> Result<ChatResponse, LlmError> {
            assert_eq!(req.temperature, Some(0.0));
            Ok(ChatResponse {
                content: self.answer.clone(),
                model: req.model.clone(),
                tokens_in: 0,
                tokens_out: 0,
                finish_reason: "stop".into(),
                tool_calls: vec![],
            })
        }
    }

    struct BrokenLlm;

    #[async_trait]
    impl ChatApi for BrokenLlm {
        async fn send(&self, _req: &ChatRequest) -> Result<ChatResponse, LlmError> {
            Err(LlmError::Unavailable("down".into()))
        }
    }

    fn router_with(answer: &str) -> SkillRouter {
        let store = Store::open_in_memory().unwrap();
        SkillRouter::new(
            Arc::new(CannedRouterLlm {
                answer: answer.to_string(),
            }),
            "test-model",
            SkillRegistry::new(store),
        )
    }

    #[tokio::test]
    async fn capture_intent_routes_to_smart_capture() {
        let router = router_with(r#"{"skills": ["smart_capture"]}"#);
        assert_eq!(
            router.route("帮我记录一下今天学了 Python 装饰器").await,
            "smart_capture"
        );
    }

    #[tokio::test]
    async fn greeting_routes_to_general_chat() {
        let router = router_with(r#"{"skills": ["general_chat"]}"#);
        assert_eq!(router.route("你好").await, DEFAULT_SKILL_NAME);
    }

    #[tokio::test]
    async fn fenced_answers_still_parse() {
        let router = router_with("```json\n{\"skills\": [\"smart_capture\"]}\n```");
        assert_eq!(router.route("记一下").await, "smart_capture");
    }

    #[tokio::test]
    async fn unknown_names_and_garbage_fall_back() {
        for answer in [r#"{"skills": ["nonexistent"]}"#, "not json at all", ""] {
            let router = router_with(answer);
            assert_eq!(router.route("whatever").await, DEFAULT_SKILL_NAME);
        }
    }

    #[tokio::test]
    async fn model_errors_fall_back() {
        let store = Store::open_in_memory().unwrap();
        let router = SkillRouter::new(Arc::new(BrokenLlm), "m", SkillRegistry::new(store));
        assert_eq!(router.route("hi").await, DEFAULT_SKILL_NAME);
    }
}
