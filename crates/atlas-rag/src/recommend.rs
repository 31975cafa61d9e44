//! Relation recommendation helpers: prompt construction, candidate
//! extraction from retrieval context, and LLM answer parsing.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use tracing::debug;

use atlas_core::types::Entry;

use crate::engine::QueryOutput;
use crate::source_ids::parse_entry_id_from_attachment_file_path;

/// Floor applied on top of the caller's `min_score`.
pub const MIN_RELEVANCE_FLOOR: f64 = 0.30;

const MAX_BASE_TEXT_CHARS: usize = 4000;

#[derive(Debug, Clone, Serialize)]
pub struct RelationRecommendation {
    pub target_entry_id: String,
    pub relation_type: Option<String>,
    pub score: f64,
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        return s.to_string();
    }
    s.chars().take(max_len).collect()
}

/// Query text for the source entry: title plus whatever body text it
/// has, bounded so the prompt stays sane.
pub fn build_entry_query_text(entry: &Entry) -> String {
    let mut parts: Vec<String> = vec![entry.title.trim().to_string()];
    if let Some(summary) = entry.summary.as_deref().map(str::trim) {
        if !summary.is_empty() {
            parts.push(summary.to_string());
        }
    }
    if let Some(content) = entry.content.as_deref().map(str::trim) {
        if !content.is_empty() {
            parts.push(content.to_string());
        }
    }
    truncate(parts.join("\n").trim(), MAX_BASE_TEXT_CHARS)
}

/// Single-stage prompt: retrieval context comes from the engine; the
/// answer must be a JSON array of {entryId, relationType, relevance}.
pub fn build_recommendation_prompt(
    base_text: &str,
    relation_type_codes: &[String],
    limit: usize,
) -> String {
    let mut lines: Vec<String> = Vec::new();
    lines.push("你是知识库的关系推荐器。根据检索到的上下文，找出与下面这条记录最相关的其他记录。".to_string());
    lines.push(String::new());
    lines.push("## 源记录".to_string());
    lines.push(base_text.to_string());
    lines.push(String::new());
    if !relation_type_codes.is_empty() {
        lines.push(format!(
            "## 可用关系类型\n{}",
            relation_type_codes.join(", ")
        ));
        lines.push(String::new());
    }
    lines.push("## 输出要求".to_string());
    lines.push(format!(
        "只输出一个 JSON 数组，最多 {limit} 项，每项形如："
    ));
    lines.push(r#"{"entryId": "<目标记录的 UUID>", "relationType": "<关系类型代码或 null>", "relevance": 0.0}"#.to_string());
    lines.push("relevance 取 0 到 1 之间的小数；不要输出任何解释文字或代码块围栏。".to_string());
    lines.join("\n")
}

/// All entry UUIDs reachable from the retrieval context: chunk
/// file_paths, entity file_paths, relationship file_paths.
pub fn extract_candidate_entry_ids(output: &QueryOutput) -> HashSet<String> {
    let mut out = HashSet::new();
    let mut push = |file_path: Option<&str>| {
        let Some(fp) = file_path else { return };
        for part in fp.split("<SEP>") {
            if let Some(entry_id) = parse_entry_id_from_attachment_file_path(part.trim()) {
                out.insert(entry_id);
            }
        }
    };
    for chunk in &output.chunks {
        push(chunk.file_path.as_deref());
        push(chunk.doc_id.as_deref());
    }
    for entity in &output.entities {
        push(entity.file_path.as_deref());
    }
    for rel in &output.relationships {
        push(rel.file_path.as_deref());
    }
    out
}

/// Pull a JSON value out of an LLM answer: strip code fences, then try
/// the whole string, then the outermost array/object slice.
pub fn parse_json_from_answer(answer: &str) -> Option<serde_json::Value> {
    let mut raw = answer.trim();
    if raw.starts_with("```") {
        let inner: Vec<&str> = raw.splitn(3, "```").collect();
        if inner.len() >= 2 {
            raw = inner[1].trim();
            raw = raw.strip_prefix("json").unwrap_or(raw).trim();
        }
    }
    if let Ok(v) = serde_json::from_str(raw) {
        return Some(v);
    }
    for (open, close) in [('[', ']'), ('{', '}')] {
        if let (Some(start), Some(end)) = (raw.find(open), raw.rfind(close)) {
            if start < end {
                if let Ok(v) = serde_json::from_str(&raw[start..=end]) {
                    return Some(v);
                }
            }
        }
    }
    None
}

/// Parse the recommendation payload. Items must point at known
/// candidates; relation types outside the whitelist are dropped to
/// `None`; duplicate targets keep their best relevance (max wins).
pub fn parse_recommendation_payload(
    answer: &str,
    allowed_relation_type_codes: &[String],
    candidate_ids: &HashSet<String>,
) -> Vec<RelationRecommendation> {
    let Some(value) = parse_json_from_answer(answer) else {
        debug!("recommendation answer is not parseable JSON");
        return Vec::new();
    };
    let items = match &value {
        serde_json::Value::Array(items) => items.clone(),
        serde_json::Value::Object(map) => map
            .get("items")
            .or_else(|| map.get("recommendations"))
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default(),
        _ => Vec::new(),
    };

    let allowed: HashSet<&str> = allowed_relation_type_codes
        .iter()
        .map(String::as_str)
        .collect();
    let mut best: HashMap<String, RelationRecommendation> = HashMap::new();

    for item in items {
        let Some(obj) = item.as_object() else { continue };
        let Some(target) = obj
            .get("entryId")
            .or_else(|| obj.get("entry_id"))
            .or_else(|| obj.get("targetEntryId"))
            .and_then(|v| v.as_str())
            .map(str::trim)
        else {
            continue;
        };
        if !candidate_ids.contains(target) {
            continue;
        }
        let relevance = obj
            .get("relevance")
            .or_else(|| obj.get("score"))
            .and_then(|v| match v {
                serde_json::Value::Number(n) => n.as_f64(),
                serde_json::Value::String(s) => s.trim().parse().ok(),
                _ => None,
            })
            .filter(|r| r.is_finite())
            .map(|r| r.clamp(0.0, 1.0))
            .unwrap_or(0.0);
        let relation_type = obj
            .get("relationType")
            .or_else(|| obj.get("relation_type"))
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|c| !c.is_empty() && (allowed.is_empty() || allowed.contains(c)))
            .map(String::from);

        match best.get_mut(target) {
            Some(existing) if existing.score >= relevance => {}
            Some(existing) => {
                existing.score = relevance;
                if relation_type.is_some() {
                    existing.relation_type = relation_type;
                }
            }
            None => {
                best.insert(
                    target.to_string(),
                    RelationRecommendation {
                        target_entry_id: target.to_string(),
                        relation_type,
                        score: relevance,
                    },
                );
            }
        }
    }

    best.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ChunkHit, GraphEntity};

    const E1: &str = "6f1f3a9a-88f7-4a2e-9d3b-52a5a6a1c001";
    const E2: &str = "6f1f3a9a-88f7-4a2e-9d3b-52a5a6a1c002";

    fn candidates() -> HashSet<String> {
        [E1.to_string(), E2.to_string()].into_iter().collect()
    }

    #[test]
    fn candidates_come_from_all_three_context_sources() {
        let output = QueryOutput {
            llm_response: String::new(),
            chunks: vec![ChunkHit {
                file_path: Some(E1.to_string()),
                ..Default::default()
            }],
            entities: vec![GraphEntity {
                name: "x".into(),
                file_path: Some(format!("{E2}<SEP>not-a-uuid")),
                ..Default::default()
            }],
            relationships: vec![],
        };
        let ids = extract_candidate_entry_ids(&output);
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(E1) && ids.contains(E2));
    }

    #[test]
    fn fenced_json_parses() {
        let answer = format!(
            "```json\n[{{\"entryId\": \"{E1}\", \"relationType\": \"related\", \"relevance\": 0.8}}]\n```"
        );
        let recs = parse_recommendation_payload(&answer, &["related".to_string()], &candidates());
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].target_entry_id, E1);
        assert_eq!(recs[0].relation_type.as_deref(), Some("related"));
    }

    #[test]
    fn max_relevance_wins_per_target() {
        let answer = format!(
            r#"[{{"entryId": "{E1}", "relevance": 0.4}},
                {{"entryId": "{E1}", "relevance": 0.9}},
                {{"entryId": "{E1}", "relevance": 0.5}}]"#
        );
        let recs = parse_recommendation_payload(&answer, &[], &candidates());
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].score, 0.9);
    }

    #[test]
    fn unknown_targets_and_relation_types_are_dropped() {
        let answer = format!(
            r#"[{{"entryId": "unknown-id", "relevance": 0.9}},
                {{"entryId": "{E2}", "relationType": "made_up", "relevance": 0.7}}]"#
        );
        let recs = parse_recommendation_payload(&answer, &["related".to_string()], &candidates());
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].target_entry_id, E2);
        assert!(recs[0].relation_type.is_none());
    }

    #[test]
    fn prompt_names_relation_types_and_limit() {
        let prompt = build_recommendation_prompt("base", &["related".to_string()], 5);
        assert!(prompt.contains("related"));
        assert!(prompt.contains("5"));
        assert!(prompt.contains("entryId"));
    }
}
