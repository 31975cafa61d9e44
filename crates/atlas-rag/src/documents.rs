//! Document payload building: the stable text template entries and
//! attachments are indexed under, plus the indexability predicate.

use chrono::{DateTime, Utc};

use atlas_core::types::{Entry, EntryType};

/// Worker → indexer payload for an entry upsert.
#[derive(Debug, Clone)]
pub struct DocumentPayload {
    pub entry_id: String,
    pub entry_updated_at: Option<DateTime<Utc>>,
    pub type_id: String,
    pub type_code: Option<String>,
    pub type_name: Option<String>,
    pub type_enabled: bool,
    pub graph_enabled: bool,
    pub ai_enabled: bool,
    pub tags: Vec<String>,
    pub text: String,
}

/// Whether the entry should be indexed. When this is false the worker
/// translates the event to a delete so stale residue gets cleaned up.
pub fn should_index(payload: &DocumentPayload) -> bool {
    payload.type_enabled && payload.graph_enabled && payload.ai_enabled
}

/// Render the fixed entry template:
///
/// ```text
/// Title: <title>
/// Type: <name> (<code>)
/// Tags: a, b, c
///
/// Summary:
/// <summary>
///
/// Content:
/// <content>
/// ```
///
/// Empty sections are omitted; tags are deduplicated and sorted.
pub fn render_entry_text(
    title: &str,
    summary: Option<&str>,
    content: Option<&str>,
    type_name: Option<&str>,
    type_code: Option<&str>,
    tags: &[String],
) -> String {
    let safe_title = title.trim();
    let safe_summary = summary.map(str::trim).filter(|s| !s.is_empty());
    let safe_content = content.map(str::trim).filter(|s| !s.is_empty());

    let mut safe_tags: Vec<&str> = tags
        .iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .collect();
    safe_tags.sort_unstable();
    safe_tags.dedup();

    let mut lines: Vec<String> = vec![format!("Title: {safe_title}")];

    match (type_name, type_code) {
        (Some(name), Some(code)) => lines.push(format!("Type: {name} ({code})")),
        (Some(name), None) => lines.push(format!("Type: {name}")),
        (None, Some(code)) => lines.push(format!("Type: {code}")),
        (None, None) => {}
    }

    if !safe_tags.is_empty() {
        lines.push(format!("Tags: {}", safe_tags.join(", ")));
    }

    if let Some(summary) = safe_summary {
        lines.push(String::new());
        lines.push("Summary:".to_string());
        lines.push(summary.to_string());
    }
    if let Some(content) = safe_content {
        lines.push(String::new());
        lines.push("Content:".to_string());
        lines.push(content.to_string());
    }

    lines.join("\n").trim().to_string()
}

/// Build the payload from an entry row and its (optional) type.
pub fn build_document_payload(
    entry: &Entry,
    entry_type: Option<&EntryType>,
    entry_updated_at: Option<DateTime<Utc>>,
) -> DocumentPayload {
    let tags: Vec<String> = entry.tags.iter().map(|t| t.name.clone()).collect();
    let text = render_entry_text(
        &entry.title,
        entry.summary.as_deref(),
        entry.content.as_deref(),
        entry_type.map(|t| t.name.as_str()),
        entry_type.map(|t| t.code.as_str()),
        &tags,
    );

    DocumentPayload {
        entry_id: entry.id.clone(),
        entry_updated_at,
        type_id: entry.type_id.clone(),
        type_code: entry_type.map(|t| t.code.clone()),
        type_name: entry_type.map(|t| t.name.clone()),
        type_enabled: entry_type.map(|t| t.enabled).unwrap_or(false),
        graph_enabled: entry_type.map(|t| t.graph_enabled).unwrap_or(false),
        ai_enabled: entry_type.map(|t| t.ai_enabled).unwrap_or(false),
        tags,
        text,
    }
}

/// Attachment documents carry their owning entry's identity so KG hits
/// can always be mapped back.
pub fn render_attachment_text(
    entry_id: &str,
    entry_title: Option<&str>,
    original_filename: &str,
    content_type: &str,
    parsed_text: &str,
) -> String {
    let mut lines: Vec<String> = vec![format!("Attachment: {}", original_filename.trim())];
    if !content_type.trim().is_empty() {
        lines.push(format!("Content-Type: {}", content_type.trim()));
    }
    match entry_title.map(str::trim).filter(|t| !t.is_empty()) {
        Some(title) => lines.push(format!("Entry: {title} ({entry_id})")),
        None => lines.push(format!("Entry: {entry_id}")),
    }
    let body = parsed_text.trim();
    if !body.is_empty() {
        lines.push(String::new());
        lines.push("Content:".to_string());
        lines.push(body.to_string());
    }
    lines.join("\n").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_renders_full_shape() {
        let text = render_entry_text(
            "Learn Rust",
            Some("ownership notes"),
            Some("borrow checker rules"),
            Some("Note"),
            Some("note"),
            &["systems".to_string(), "rust".to_string(), "rust".to_string()],
        );
        assert_eq!(
            text,
            "Title: Learn Rust\nType: Note (note)\nTags: rust, systems\n\nSummary:\nownership notes\n\nContent:\nborrow checker rules"
        );
    }

    #[test]
    fn empty_sections_are_omitted() {
        let text = render_entry_text("Just a title", Some("   "), None, None, None, &[]);
        assert_eq!(text, "Title: Just a title");
    }

    #[test]
    fn should_index_needs_all_flags() {
        let mut payload = DocumentPayload {
            entry_id: "e".into(),
            entry_updated_at: None,
            type_id: "t".into(),
            type_code: None,
            type_name: None,
            type_enabled: true,
            graph_enabled: true,
            ai_enabled: true,
            tags: vec![],
            text: String::new(),
        };
        assert!(should_index(&payload));
        payload.ai_enabled = false;
        assert!(!should_index(&payload));
    }

    #[test]
    fn attachment_text_names_the_entry() {
        let text = render_attachment_text(
            "entry-1",
            Some("Trip plan"),
            "itinerary.pdf",
            "application/pdf",
            "Day 1: fly out",
        );
        assert!(text.starts_with("Attachment: itinerary.pdf"));
        assert!(text.contains("Entry: Trip plan (entry-1)"));
        assert!(text.ends_with("Content:\nDay 1: fly out"));
    }
}
