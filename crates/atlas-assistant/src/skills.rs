//! Skill definitions: the system catalogue plus conversion from DB rows.

use atlas_store::assistant_config::SkillRow;

/// The default skill is always available, even when a DB row tries to
/// disable it — without it the router would have nowhere to fall back.
pub const DEFAULT_SKILL_NAME: &str = "general_chat";

pub fn is_default_skill(name: &str) -> bool {
    name == DEFAULT_SKILL_NAME
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkillMode {
    Steps,
    Agent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepType {
    Analysis,
    Tool,
    Summary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgsFrom {
    Context,
    Previous,
    Custom,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Text,
    Json,
}

#[derive(Debug, Clone, Default)]
pub struct SkillKbConfig {
    pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct SkillStep {
    pub step_type: StepType,
    pub instruction: Option<String>,
    pub tool_name: Option<String>,
    pub args_from: Option<ArgsFrom>,
    pub args_template: Option<String>,
    pub output_mode: Option<OutputMode>,
    pub output_fields: Option<Vec<String>>,
    pub include_in_summary: bool,
}

#[derive(Debug, Clone)]
pub struct SkillDefinition {
    pub name: String,
    pub description: String,
    pub intent_examples: Vec<String>,
    pub tools: Vec<String>,
    pub mode: SkillMode,
    pub system_prompt: Option<String>,
    pub kb: SkillKbConfig,
    /// Hidden skills are excluded from the router candidate list but
    /// stay executable.
    pub hidden: bool,
    pub steps: Vec<SkillStep>,
}

/// Built-in skills. `general_chat` is the agent-mode default with KB
/// grounding; `smart_capture` turns an utterance into a stored entry.
pub fn system_skills() -> Vec<SkillDefinition> {
    vec![
        SkillDefinition {
            name: DEFAULT_SKILL_NAME.to_string(),
            description: "通用对话：闲聊、问答、写作、翻译，以及基于知识库的检索问答".to_string(),
            intent_examples: vec![
                "你好".to_string(),
                "帮我翻译这段话".to_string(),
                "我之前记录过哪些关于 Rust 的内容？".to_string(),
            ],
            tools: vec![
                "search_entries".to_string(),
                "get_entry_detail".to_string(),
                "get_statistics".to_string(),
            ],
            mode: SkillMode::Agent,
            system_prompt: None,
            kb: SkillKbConfig { enabled: true },
            hidden: true,
            steps: Vec::new(),
        },
        SkillDefinition {
            name: "smart_capture".to_string(),
            description: "把用户想记录的内容整理成一条新记录（标题、摘要、正文）并保存".to_string(),
            intent_examples: vec![
                "帮我记录一下今天学了 Python 装饰器".to_string(),
                "记一下：周五和李老师讨论论文".to_string(),
                "保存这个想法".to_string(),
            ],
            tools: vec!["create_entry".to_string()],
            mode: SkillMode::Steps,
            system_prompt: None,
            kb: SkillKbConfig::default(),
            hidden: false,
            steps: vec![
                SkillStep {
                    step_type: StepType::Analysis,
                    instruction: Some(
                        "从用户输入中提取要记录的内容，生成 title（不超过 50 字）、\
                         summary（一句话摘要）、content（完整正文，保留用户原意）。"
                            .to_string(),
                    ),
                    tool_name: None,
                    args_from: None,
                    args_template: None,
                    output_mode: Some(OutputMode::Json),
                    output_fields: Some(vec![
                        "title".to_string(),
                        "summary".to_string(),
                        "content".to_string(),
                    ]),
                    include_in_summary: true,
                },
                SkillStep {
                    step_type: StepType::Tool,
                    instruction: None,
                    tool_name: Some("create_entry".to_string()),
                    args_from: Some(ArgsFrom::Json),
                    args_template: Some(
                        r#"{"title": {{step_1_title}}, "summary": {{step_1_summary}}, "content": {{step_1_content}}}"#
                            .to_string(),
                    ),
                    output_mode: None,
                    output_fields: None,
                    include_in_summary: true,
                },
                SkillStep {
                    step_type: StepType::Summary,
                    instruction: Some("告诉用户记录是否保存成功，并给出标题。".to_string()),
                    tool_name: None,
                    args_from: None,
                    args_template: None,
                    output_mode: None,
                    output_fields: None,
                    include_in_summary: false,
                },
            ],
        },
    ]
}

pub fn system_skill_by_name(name: &str) -> Option<SkillDefinition> {
    system_skills().into_iter().find(|s| s.name == name)
}

fn parse_step_type(raw: &str) -> StepType {
    match raw {
        "tool" => StepType::Tool,
        "summary" => StepType::Summary,
        _ => StepType::Analysis,
    }
}

fn parse_args_from(raw: Option<&str>) -> Option<ArgsFrom> {
    match raw {
        Some("context") => Some(ArgsFrom::Context),
        Some("previous") => Some(ArgsFrom::Previous),
        Some("custom") => Some(ArgsFrom::Custom),
        Some("json") => Some(ArgsFrom::Json),
        _ => None,
    }
}

fn parse_output_mode(raw: Option<&str>) -> Option<OutputMode> {
    match raw {
        Some("text") => Some(OutputMode::Text),
        Some("json") => Some(OutputMode::Json),
        _ => None,
    }
}

/// Convert a DB row. `light` skips steps (router path, avoids loading
/// them for every candidate).
pub fn skill_from_row(row: &SkillRow, light: bool) -> SkillDefinition {
    let steps = if light {
        Vec::new()
    } else {
        row.steps
            .iter()
            .map(|s| SkillStep {
                step_type: parse_step_type(&s.step_type),
                instruction: s.instruction.clone(),
                tool_name: s.tool_name.clone(),
                args_from: parse_args_from(s.args_from.as_deref()),
                args_template: s.args_template.clone(),
                output_mode: parse_output_mode(s.output_mode.as_deref()),
                output_fields: s.output_fields.as_ref().map(|fields| {
                    fields
                        .iter()
                        .map(|f| f.trim().to_string())
                        .filter(|f| !f.is_empty())
                        .collect()
                }),
                include_in_summary: s.include_in_summary,
            })
            .collect()
    };

    SkillDefinition {
        name: row.name.clone(),
        description: row.description.clone().unwrap_or_default(),
        intent_examples: row.intent_examples.clone(),
        tools: row.tools.clone(),
        mode: if row.mode == "agent" {
            SkillMode::Agent
        } else {
            SkillMode::Steps
        },
        system_prompt: row.system_prompt.clone(),
        kb: SkillKbConfig {
            enabled: row.kb_enabled,
        },
        hidden: false,
        steps,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_catalogue_contains_default_and_capture() {
        let skills = system_skills();
        assert!(skills.iter().any(|s| s.name == DEFAULT_SKILL_NAME));
        let capture = skills.iter().find(|s| s.name == "smart_capture").unwrap();
        assert_eq!(capture.mode, SkillMode::Steps);
        assert_eq!(capture.steps.len(), 3);
        assert_eq!(capture.steps[0].step_type, StepType::Analysis);
        assert_eq!(capture.steps[1].args_from, Some(ArgsFrom::Json));
    }

    #[test]
    fn default_skill_is_hidden_but_kb_enabled() {
        let chat = system_skill_by_name(DEFAULT_SKILL_NAME).unwrap();
        assert!(chat.hidden);
        assert!(chat.kb.enabled);
        assert_eq!(chat.mode, SkillMode::Agent);
    }
}
