//! Knowledge-graph normalisation into the frontend GraphData shape.

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use atlas_store::Store;

use crate::engine::KnowledgeGraph;

#[derive(Debug, Clone, Serialize)]
pub struct GraphNode {
    pub id: String,
    pub label: String,
    pub type_id: String,
    pub type_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_title: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GraphLink {
    pub id: String,
    pub source: String,
    pub target: String,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keywords: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GraphData {
    pub nodes: Vec<GraphNode>,
    pub links: Vec<GraphLink>,
}

// Tableau 10 palette: stable, high-contrast node colors.
const TABLEAU10: [&str; 10] = [
    "#4E79A7", "#F28E2B", "#E15759", "#76B7B2", "#59A14F", "#EDC949", "#AF7AA1", "#FF9DA7",
    "#9C755F", "#BAB0AC",
];

/// Map a type name onto a stable palette color.
pub fn hash_to_color(s: &str) -> &'static str {
    let key = s.trim();
    if key.is_empty() {
        return TABLEAU10[0];
    }
    let digest = Sha256::digest(key.as_bytes());
    let idx = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]) as usize;
    TABLEAU10[idx % TABLEAU10.len()]
}

fn normalize_text(value: Option<&serde_json::Value>) -> Option<String> {
    let v = value?;
    let s = match v {
        serde_json::Value::String(s) => s.trim().to_string(),
        serde_json::Value::Null => return None,
        other => other.to_string().trim_matches('"').trim().to_string(),
    };
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

fn normalize_keywords(value: Option<&serde_json::Value>) -> Option<String> {
    match value? {
        serde_json::Value::Array(items) => {
            let parts: Vec<String> = items
                .iter()
                .filter_map(|v| normalize_text(Some(v)))
                .collect();
            if parts.is_empty() {
                None
            } else {
                Some(parts.join(", "))
            }
        }
        other => normalize_text(Some(other)),
    }
}

fn normalize_datetime(value: Option<&serde_json::Value>) -> Option<DateTime<Utc>> {
    match value? {
        serde_json::Value::Number(n) => {
            let mut ts = n.as_f64()?;
            // Large values are millisecond timestamps.
            if ts > 1e11 {
                ts /= 1000.0;
            }
            Utc.timestamp_opt(ts as i64, 0).single()
        }
        serde_json::Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                return None;
            }
            if let Ok(num) = s.parse::<f64>() {
                return normalize_datetime(Some(&serde_json::json!(num)));
            }
            DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        }
        _ => None,
    }
}

/// First UUID of a possibly `<SEP>`-joined entry reference.
fn normalize_entry_ref(raw: Option<String>) -> Option<String> {
    let raw = raw?;
    let first = match raw.split_once("<SEP>") {
        Some((head, _)) => head.trim().to_string(),
        None => raw.trim().to_string(),
    };
    if first.is_empty() {
        return None;
    }
    match uuid::Uuid::parse_str(&first) {
        Ok(u) => Some(u.to_string()),
        Err(_) => Some(first),
    }
}

fn prop<'a>(
    props: &'a serde_json::Map<String, serde_json::Value>,
    names: &[&str],
) -> Option<&'a serde_json::Value> {
    names.iter().find_map(|n| props.get(*n))
}

/// Convert the engine's raw graph into frontend GraphData. Entry titles
/// are back-filled in one batch lookup when a store is supplied.
pub fn knowledge_graph_to_graph_data(raw: &KnowledgeGraph, store: Option<&Store>) -> GraphData {
    let mut nodes = Vec::with_capacity(raw.nodes.len());
    let mut links = Vec::with_capacity(raw.edges.len());
    let mut entry_ids: Vec<String> = Vec::new();

    for n in &raw.nodes {
        if n.id.is_empty() {
            continue;
        }
        let props = &n.properties;
        let entity_id = normalize_text(prop(props, &["entity_id", "entityId"]));
        let entity_type = normalize_text(prop(props, &["entity_type", "entityType"]));
        let description = normalize_text(prop(props, &["description", "summary"]));
        let entry_id = normalize_entry_ref(normalize_text(prop(
            props,
            &["file_path", "filePath", "entry_id", "entryId"],
        )));
        if let Some(eid) = &entry_id {
            entry_ids.push(eid.clone());
        }
        let created_at = normalize_datetime(prop(props, &["created_at", "createdAt"]));

        let label = entity_id
            .clone()
            .or_else(|| normalize_text(prop(props, &["name", "title", "entity"])))
            .unwrap_or_else(|| n.id.clone());

        let type_name = entity_type
            .clone()
            .or_else(|| n.labels.first().cloned())
            .unwrap_or_else(|| "LightRAG".to_string());

        nodes.push(GraphNode {
            id: n.id.clone(),
            label,
            type_id: format!("lightrag:{type_name}"),
            color: Some(hash_to_color(&type_name).to_string()),
            type_name,
            created_at,
            summary: description.clone(),
            entity_id,
            entity_type,
            description,
            entry_id,
            entry_title: None,
        });
    }

    for e in &raw.edges {
        if e.source.is_empty() || e.target.is_empty() {
            continue;
        }
        let props = &e.properties;
        let description = normalize_text(prop(props, &["description"]));
        let keywords = normalize_keywords(prop(props, &["keywords"]));
        let entry_id = normalize_entry_ref(normalize_text(prop(
            props,
            &["file_path", "filePath", "entry_id", "entryId"],
        )));
        if let Some(eid) = &entry_id {
            entry_ids.push(eid.clone());
        }
        let created_at = normalize_datetime(prop(props, &["created_at", "createdAt"]));

        let edge_type = e
            .edge_type
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or("RELATED")
            .to_string();
        // Synthesise a stable id when the backend gives none.
        let id = e
            .id
            .clone()
            .filter(|i| !i.trim().is_empty())
            .unwrap_or_else(|| format!("{}|{}|{}", e.source, edge_type, e.target));

        links.push(GraphLink {
            id,
            source: e.source.clone(),
            target: e.target.clone(),
            label: edge_type,
            description,
            keywords,
            entry_id,
            entry_title: None,
            created_at,
        });
    }

    if let Some(store) = store {
        if let Ok(titles) = store.entry_titles_by_ids(&entry_ids) {
            for node in &mut nodes {
                if let Some(eid) = &node.entry_id {
                    node.entry_title = titles.get(eid).cloned();
                }
            }
            for link in &mut links {
                if let Some(eid) = &link.entry_id {
                    link.entry_title = titles.get(eid).cloned();
                }
            }
        }
    }

    GraphData { nodes, links }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{KgEdge, KgNode};

    fn props(pairs: &[(&str, serde_json::Value)]) -> serde_json::Map<String, serde_json::Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn missing_edge_id_is_synthesised() {
        let raw = KnowledgeGraph {
            nodes: vec![],
            edges: vec![KgEdge {
                id: None,
                source: "a".into(),
                target: "b".into(),
                edge_type: Some("KNOWS".into()),
                properties: Default::default(),
            }],
        };
        let data = knowledge_graph_to_graph_data(&raw, None);
        assert_eq!(data.links[0].id, "a|KNOWS|b");
        assert_eq!(data.links[0].label, "KNOWS");
    }

    #[test]
    fn sep_joined_entry_ids_keep_first_uuid() {
        let entry = "6f1f3a9a-88f7-4a2e-9d3b-52a5a6a1c000";
        let raw = KnowledgeGraph {
            nodes: vec![KgNode {
                id: "n1".into(),
                labels: vec!["Person".into()],
                properties: props(&[(
                    "file_path",
                    serde_json::json!(format!("{entry}<SEP>other-id")),
                )]),
            }],
            edges: vec![],
        };
        let data = knowledge_graph_to_graph_data(&raw, None);
        assert_eq!(data.nodes[0].entry_id.as_deref(), Some(entry));
    }

    #[test]
    fn node_label_prefers_entity_id_and_color_is_stable() {
        let raw = KnowledgeGraph {
            nodes: vec![KgNode {
                id: "n1".into(),
                labels: vec!["Concept".into()],
                properties: props(&[
                    ("entity_id", serde_json::json!("Rust")),
                    ("entity_type", serde_json::json!("Language")),
                    ("description", serde_json::json!("a systems language")),
                ]),
            }],
            edges: vec![],
        };
        let data = knowledge_graph_to_graph_data(&raw, None);
        let node = &data.nodes[0];
        assert_eq!(node.label, "Rust");
        assert_eq!(node.type_name, "Language");
        assert_eq!(node.type_id, "lightrag:Language");
        assert_eq!(node.color.as_deref(), Some(hash_to_color("Language")));
        assert_eq!(hash_to_color("Language"), hash_to_color("Language"));
    }

    #[test]
    fn keywords_arrays_join_with_commas() {
        let raw = KnowledgeGraph {
            nodes: vec![],
            edges: vec![KgEdge {
                id: Some("e1".into()),
                source: "a".into(),
                target: "b".into(),
                edge_type: None,
                properties: props(&[("keywords", serde_json::json!(["alpha", "beta"]))]),
            }],
        };
        let data = knowledge_graph_to_graph_data(&raw, None);
        assert_eq!(data.links[0].keywords.as_deref(), Some("alpha, beta"));
        assert_eq!(data.links[0].label, "RELATED");
    }

    #[test]
    fn millisecond_timestamps_are_recognised() {
        let raw = KnowledgeGraph {
            nodes: vec![KgNode {
                id: "n".into(),
                labels: vec![],
                properties: props(&[("created_at", serde_json::json!(1_700_000_000_000i64))]),
            }],
            edges: vec![],
        };
        let data = knowledge_graph_to_graph_data(&raw, None);
        assert_eq!(
            data.nodes[0].created_at.map(|d| d.timestamp()),
            Some(1_700_000_000)
        );
    }
}
