//! `atlas-assistant` — the skill engine behind the chat assistant.
//!
//! # Overview
//!
//! A user turn flows router → executor → SSE events:
//!
//! - [`router::SkillRouter`] classifies the utterance onto exactly one
//!   skill (LLM at temperature 0, hard fallback to `general_chat`)
//! - [`executor::SkillExecutor`] runs the skill: ordered
//!   analysis/tool/summary steps with a constrained template language,
//!   or an autonomous agent loop with bounded tool calling
//! - [`tools`] supplies the dispatch surface: built-in tools layered
//!   under DB overrides, plus SSRF-guarded remote HTTP tools
//! - [`service::AssistantService`] owns conversations, event ordering,
//!   persistence of replay arrays, and auto-titles

pub mod events;
pub mod executor;
pub mod registry;
pub mod router;
pub mod service;
pub mod skills;
pub mod template;
pub mod tools;

pub use events::ChatEvent;
pub use router::SkillRouter;
pub use service::AssistantService;
pub use skills::{SkillDefinition, DEFAULT_SKILL_NAME};
